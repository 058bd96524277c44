//! Google Cloud Storage.

use async_trait::async_trait;
use object_store::gcp::{GcpCredential, GoogleCloudStorageBuilder};
use object_store::{ObjectStore, StaticCredentialProvider};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::limiter::RateLimiter;
use crate::object::{ObjectTransfer, WriteMode};
use crate::provider::{Dir, Downloader, ExternalStorage, Uploader};
use graphagent_common::{Backend, BackendType, Error, ErrorExt, GsBackend, Result};

/// Path of a service account or user credentials file.
pub const CREDENTIALS_PATH_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";
/// Inline credentials JSON.
pub const CREDENTIALS_JSON_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS_JSON";
/// Pre-issued OAuth access token.
pub const ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// Where the client's credentials come from.
#[derive(Clone, PartialEq, Eq)]
pub enum GsCredentials {
    /// Service account key JSON.
    Json(String),
    /// Credentials file on disk.
    File(String),
    /// Static bearer token.
    AccessToken(String),
    /// Whatever the client finds on its own, e.g. instance metadata.
    Default,
}

impl std::fmt::Debug for GsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(_) => f.write_str("Json([REDACTED])"),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::AccessToken(_) => f.write_str("AccessToken([REDACTED])"),
            Self::Default => f.write_str("Default"),
        }
    }
}

/// Resolve credentials for `gs`, looking up environment variables with `env`.
///
/// The first non-empty source wins: the backend's inline JSON, then
/// `GOOGLE_APPLICATION_CREDENTIALS`, `GOOGLE_APPLICATION_CREDENTIALS_JSON`
/// and `GOOGLE_OAUTH_ACCESS_TOKEN`.
pub fn discover_credentials<F>(gs: &GsBackend, env: F) -> GsCredentials
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |key: &str| env(key).filter(|value| !value.is_empty());

    if !gs.credentials.is_empty() {
        GsCredentials::Json(gs.credentials.clone())
    } else if let Some(path) = lookup(CREDENTIALS_PATH_ENV) {
        GsCredentials::File(path)
    } else if let Some(json) = lookup(CREDENTIALS_JSON_ENV) {
        GsCredentials::Json(json)
    } else if let Some(token) = lookup(ACCESS_TOKEN_ENV) {
        GsCredentials::AccessToken(token)
    } else {
        GsCredentials::Default
    }
}

fn build_store(gs: &GsBackend) -> Result<Arc<dyn ObjectStore>> {
    let credentials = discover_credentials(gs, |key| std::env::var(key).ok());
    debug!("Using gs credentials {:?} for bucket {}", credentials, gs.bucket);

    let builder = GoogleCloudStorageBuilder::new().with_bucket_name(gs.bucket.as_str());
    let builder = match credentials {
        GsCredentials::Json(json) => builder.with_service_account_key(json),
        GsCredentials::File(path) => builder.with_application_credentials(path),
        GsCredentials::AccessToken(token) => builder.with_credentials(Arc::new(
            StaticCredentialProvider::new(GcpCredential { bearer: token }),
        )),
        GsCredentials::Default => builder,
    };

    let store = builder
        .build()
        .map_err(|e| Error::Storage(format!("create gs client for {}: {}", gs.bucket, e)))?;
    Ok(Arc::new(store))
}

/// Storage backed by one GCS bucket.
///
/// Writes are create-only: uploading to a key that already exists fails with
/// [`Error::AlreadyExists`] and leaves the stored object untouched.
pub struct GsStorage {
    backend: Backend,
    transfer: ObjectTransfer,
}

impl GsStorage {
    /// Connect to the bucket described by `backend`.
    pub fn new(backend: &Backend, limiter: Arc<RateLimiter>, queue_depth: usize) -> Result<Self> {
        let gs = backend
            .as_gs()
            .ok_or_else(|| Error::InvalidUri(format!("bad format gs backend: {}", backend)))?;
        let store = build_store(gs)?;
        info!("Created gs storage for bucket {}", gs.bucket);
        Self::with_store(backend.clone(), store, limiter, queue_depth)
    }

    /// Wrap an existing client, e.g. an in-memory store.
    pub fn with_store(
        backend: Backend,
        store: Arc<dyn ObjectStore>,
        limiter: Arc<RateLimiter>,
        queue_depth: usize,
    ) -> Result<Self> {
        let bucket = backend
            .as_gs()
            .map(|gs| gs.bucket.clone())
            .ok_or_else(|| Error::InvalidUri(format!("bad format gs backend: {}", backend)))?;
        let transfer = ObjectTransfer::new(
            store,
            BackendType::Gs,
            bucket,
            WriteMode::CreateOnly,
            limiter,
            queue_depth,
        );
        Ok(Self { backend, transfer })
    }

    fn resolve(&self, uri: &str) -> Result<Backend> {
        let backend = self.backend.repoint(uri)?;
        let bucket = backend.as_gs().map(|gs| gs.bucket.as_str()).unwrap_or_default();
        if bucket != self.transfer.bucket() {
            return Err(Error::InvalidUri(format!(
                "{} is outside bucket {}",
                uri,
                self.transfer.bucket()
            )));
        }
        Ok(backend)
    }

    fn key(&self, uri: &str) -> Result<String> {
        Ok(self.resolve(uri)?.path().unwrap_or_default().to_string())
    }
}

#[async_trait]
impl Downloader for GsStorage {
    async fn download(
        &self,
        cancel: &CancellationToken,
        local_path: &Path,
        external_uri: &str,
        recursive: bool,
    ) -> Result<()> {
        let key = self.key(external_uri)?;
        self.transfer
            .download(cancel, local_path, &key, recursive)
            .await
            .with_context(|| format!("download from {} failed", external_uri))
    }
}

#[async_trait]
impl Uploader for GsStorage {
    async fn upload(
        &self,
        cancel: &CancellationToken,
        external_uri: &str,
        local_path: &Path,
        recursive: bool,
    ) -> Result<()> {
        let key = self.key(external_uri)?;
        self.transfer
            .upload(cancel, &key, local_path, recursive)
            .await
            .with_context(|| format!("upload to {} failed", external_uri))
    }

    async fn incr_upload(
        &self,
        cancel: &CancellationToken,
        external_uri: &str,
        local_path: &Path,
        commit_log_id: u64,
        last_log_id: u64,
    ) -> Result<()> {
        let key = self.key(external_uri)?;
        self.transfer
            .incr_upload(cancel, &key, local_path, commit_log_id, last_log_id)
            .await
            .with_context(|| format!("incremental upload to {} failed", external_uri))
    }
}

#[async_trait]
impl Dir for GsStorage {
    async fn exist_dir(&self, uri: &str) -> Result<bool> {
        let key = self.key(uri)?;
        self.transfer.exists(&key).await
    }

    async fn ensure_dir(&self, uri: &str, _recursive: bool) -> Result<()> {
        self.resolve(uri).map(|_| ())
    }

    async fn get_dir(&self, uri: &str) -> Result<Backend> {
        self.resolve(uri)
    }

    async fn list_dir(&self, uri: &str) -> Result<Vec<String>> {
        let key = self.key(uri)?;
        self.transfer
            .list_dirs(&key)
            .await
            .with_context(|| format!("list {} failed", uri))
    }

    async fn remove_dir(&self, uri: &str) -> Result<()> {
        let key = self.key(uri)?;
        self.transfer
            .remove(&key)
            .await
            .with_context(|| format!("remove {} failed", uri))
    }
}

impl ExternalStorage for GsStorage {
    fn name(&self) -> &str {
        "gs"
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Gs
    }
}
