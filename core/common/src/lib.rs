//! Common utilities and types shared across graphagent crates.
//!
//! This module provides the error taxonomy and the storage backend
//! descriptor that every transfer operation is addressed with.

pub mod backend;
pub mod error;

pub use backend::{
    Backend, BackendType, GsBackend, LocalBackend, S3Backend, Storage, GS_PREFIX, LOCAL_PREFIX,
    S3_PREFIX,
};
pub use error::{Error, ErrorExt, Result};
