//! External storage trait definitions.

use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use graphagent_common::{Backend, BackendType, Error, Result};

/// Copies data from external storage to the agent's filesystem.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download `external_uri` into `local_path`.
    ///
    /// A single object is written to `local_path` itself, replacing any file
    /// already there. A directory-like source is mirrored below `local_path`,
    /// creating intermediate directories as needed.
    ///
    /// # Preconditions
    /// - `external_uri` uses this storage's scheme
    ///
    /// # Postconditions
    /// - Every downloaded file is synced to disk
    /// - On error, files already written stay in place
    ///
    /// # Errors
    /// - Source not found
    /// - Source is directory-like and `recursive` is false
    /// - Network/I/O errors
    async fn download(
        &self,
        cancel: &CancellationToken,
        local_path: &Path,
        external_uri: &str,
        recursive: bool,
    ) -> Result<()>;
}

/// Copies data from the agent's filesystem to external storage.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload `local_path` to `external_uri`.
    ///
    /// With `recursive`, a directory is mirrored below `external_uri`. The
    /// first failure aborts the transfer; objects already written stay.
    ///
    /// # Preconditions
    /// - `external_uri` uses this storage's scheme
    /// - No symbolic link below `local_path`
    ///
    /// # Postconditions
    /// - Each source file exists at its mirrored location
    ///
    /// # Errors
    /// - Local path not found
    /// - Local path is a directory and `recursive` is false
    /// - Symbolic link encountered
    async fn upload(
        &self,
        cancel: &CancellationToken,
        external_uri: &str,
        local_path: &Path,
        recursive: bool,
    ) -> Result<()>;

    /// Upload only the WAL segments and commit marker of the partition
    /// directory `local_path` needed to extend a backup confirmed up to
    /// `commit_log_id`. See [`crate::wal::select_incremental`].
    ///
    /// # Preconditions
    /// - `local_path` is a partition WAL directory
    ///
    /// # Postconditions
    /// - The commit marker and the selected segments exist below `external_uri`
    ///
    /// # Errors
    /// - Local path not found or not a directory
    /// - No commit marker, or the WAL chain cannot be extended
    async fn incr_upload(
        &self,
        cancel: &CancellationToken,
        external_uri: &str,
        local_path: &Path,
        commit_log_id: u64,
        last_log_id: u64,
    ) -> Result<()>;
}

/// Directory semantics over the storage, normalized across real
/// filesystems and flat key namespaces.
#[async_trait]
pub trait Dir: Send + Sync {
    /// Whether anything exists at or below `uri`.
    async fn exist_dir(&self, uri: &str) -> Result<bool>;

    /// Make sure `uri` can be written below. Object stores have no
    /// directories, so this only validates the URI there.
    async fn ensure_dir(&self, uri: &str, recursive: bool) -> Result<()>;

    /// The storage's backend, with its credentials, pointed at `uri`.
    async fn get_dir(&self, uri: &str) -> Result<Backend>;

    /// Names of the immediate subdirectories of `uri`.
    async fn list_dir(&self, uri: &str) -> Result<Vec<String>>;

    /// Remove `uri` and everything below it.
    ///
    /// # Postconditions
    /// - `exist_dir(uri)` returns false
    ///
    /// # Errors
    /// - Local paths that do not exist fail with [`Error::NotFound`];
    ///   object stores treat an empty prefix as removed
    async fn remove_dir(&self, uri: &str) -> Result<()>;
}

/// A configured storage location supporting the full transfer contract.
///
/// Implementations keep authentication and client state, so every
/// operation only needs a URI.
pub trait ExternalStorage: Downloader + Uploader + Dir {
    /// Short provider name, e.g. "local", "s3", "gs".
    fn name(&self) -> &str;

    /// The backend type whose URIs this storage accepts.
    fn backend_type(&self) -> BackendType;
}

/// Fail with [`Error::Cancelled`] if the caller gave up.
pub(crate) fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}
