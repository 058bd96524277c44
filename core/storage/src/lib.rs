//! External storage transfer engine for graphagent.
//!
//! This module provides a uniform directory-tree contract over the agent's
//! local filesystem, S3-compatible object stores and Google Cloud Storage,
//! with shared rate limiting and incremental upload of WAL segments.
//!
//! # Design Principles
//! - Backend isolation: callers only see the [`ExternalStorage`] traits
//! - Async operations: all I/O goes through tokio
//! - One rate limiter per process, shared by every storage
//! - Unified error semantics: backends report the same categories

pub mod config;
pub mod gs;
pub mod limiter;
pub mod local;
pub mod object;
pub mod provider;
pub mod registry;
pub mod s3;
pub mod service;
pub mod wal;
pub mod walk;

pub use config::StorageConfig;
pub use gs::GsStorage;
pub use limiter::RateLimiter;
pub use local::LocalStorage;
pub use object::{ObjectTransfer, WriteMode};
pub use provider::{Dir, Downloader, ExternalStorage, Uploader};
pub use registry::{create_default_registry, SessionCache, StorageFactory, StorageRegistry};
pub use s3::S3Storage;
pub use service::{
    DownloadFileRequest, ExistDirRequest, IncrUploadFileRequest, MoveDirRequest, RemoveDirRequest,
    StorageService, UploadFileRequest,
};
pub use wal::{select_incremental, WalSelection, COMMIT_LOG_FILE_NAME, WAL_EXT};
