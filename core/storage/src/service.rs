//! Storage requests as received from the agent's RPC layer.
//!
//! Transfer requests carry a session id and a [`Backend`]; the storage for
//! the session is looked up in the [`SessionCache`] and reused across calls.
//! Directory housekeeping requests act on agent-local paths only.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::StorageConfig;
use crate::limiter::RateLimiter;
use crate::local::LocalStorage;
use crate::provider::{Dir, Downloader, ExternalStorage, Uploader};
use crate::registry::{create_default_registry, SessionCache, StorageRegistry};
use graphagent_common::{Backend, Error, Result, LOCAL_PREFIX};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFileRequest {
    pub session_id: String,
    pub source_path: String,
    pub target_backend: Backend,
    #[serde(default)]
    pub recursively: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadFileRequest {
    pub session_id: String,
    pub source_backend: Backend,
    pub target_path: String,
    #[serde(default)]
    pub recursively: bool,
}

/// Upload of the WAL delta of one partition directory.
///
/// Log ids are signed on the wire; negative values are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrUploadFileRequest {
    pub session_id: String,
    pub target_backend: Backend,
    pub source_path: String,
    pub commit_log_id: i64,
    pub last_log_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveDirRequest {
    pub src_path: String,
    pub dst_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveDirRequest {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistDirRequest {
    pub path: String,
}

fn log_id(name: &str, value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| Error::InvalidInput(format!("{} must not be negative, got {}", name, value)))
}

fn backend_uri(backend: &Backend) -> Result<String> {
    backend
        .uri()
        .ok_or_else(|| Error::InvalidUri("unknown storage backend type".to_string()))
}

fn local_uri(path: &str) -> String {
    format!("{}{}", LOCAL_PREFIX, path)
}

/// Entry point for storage requests.
pub struct StorageService {
    sessions: SessionCache,
    local: LocalStorage,
}

impl StorageService {
    /// Build the service and its shared rate limiter from `config`.
    pub fn new(config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::new(config.rate_limit_mbps));
        let registry = create_default_registry(limiter.clone(), config.walk_queue_depth);
        Self::with_registry(registry, config.session_cache_capacity, limiter)
    }

    pub fn with_registry(
        registry: StorageRegistry,
        session_cache_capacity: usize,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        Ok(Self {
            sessions: SessionCache::new(registry, session_cache_capacity)?,
            local: LocalStorage::new(limiter),
        })
    }

    /// The storage cached for `session_id`, created from `backend` if needed.
    pub fn storage(&self, session_id: &str, backend: &Backend) -> Result<Arc<dyn ExternalStorage>> {
        self.sessions.get_or_create(session_id, backend)
    }

    pub async fn upload_file(
        &self,
        cancel: &CancellationToken,
        req: &UploadFileRequest,
    ) -> Result<()> {
        let uri = backend_uri(&req.target_backend)?;
        debug!(
            "Upload file, session: {}, source: {}, target: {}, recursively: {}",
            req.session_id, req.source_path, uri, req.recursively
        );

        let storage = self.storage(&req.session_id, &req.target_backend)?;
        storage
            .upload(cancel, &uri, Path::new(&req.source_path), req.recursively)
            .await
    }

    pub async fn download_file(
        &self,
        cancel: &CancellationToken,
        req: &DownloadFileRequest,
    ) -> Result<()> {
        let uri = backend_uri(&req.source_backend)?;
        debug!(
            "Download file, session: {}, source: {}, target: {}, recursively: {}",
            req.session_id, uri, req.target_path, req.recursively
        );

        let storage = self.storage(&req.session_id, &req.source_backend)?;
        storage
            .download(cancel, Path::new(&req.target_path), &uri, req.recursively)
            .await
    }

    pub async fn incr_upload_file(
        &self,
        cancel: &CancellationToken,
        req: &IncrUploadFileRequest,
    ) -> Result<()> {
        let commit_log_id = log_id("commit_log_id", req.commit_log_id)?;
        let last_log_id = log_id("last_log_id", req.last_log_id)?;
        let uri = backend_uri(&req.target_backend)?;
        debug!(
            "Incremental upload, session: {}, source: {}, target: {}, commit log id: {}, last log id: {}",
            req.session_id, req.source_path, uri, commit_log_id, last_log_id
        );

        let storage = self.storage(&req.session_id, &req.target_backend)?;
        storage
            .incr_upload(
                cancel,
                &uri,
                Path::new(&req.source_path),
                commit_log_id,
                last_log_id,
            )
            .await
    }

    pub async fn move_dir(&self, req: &MoveDirRequest) -> Result<()> {
        debug!("Move dir, source: {}, target: {}", req.src_path, req.dst_path);
        self.local
            .move_dir(Path::new(&req.src_path), Path::new(&req.dst_path))
            .await
    }

    /// Remove a local directory. An absent path counts as removed.
    pub async fn remove_dir(&self, req: &RemoveDirRequest) -> Result<()> {
        debug!("Remove dir: {}", req.path);
        match self.local.remove_dir(&local_uri(&req.path)).await {
            Err(e) if e.root().is_not_found() => {
                debug!("{} already absent", req.path);
                Ok(())
            }
            other => other,
        }
    }

    pub async fn exist_dir(&self, req: &ExistDirRequest) -> Result<bool> {
        debug!("Exist dir: {}", req.path);
        self.local.exist_dir(&local_uri(&req.path)).await
    }
}
