//! S3-compatible object storage.

use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::ObjectStore;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::limiter::RateLimiter;
use crate::object::{ObjectTransfer, WriteMode};
use crate::provider::{Dir, Downloader, ExternalStorage, Uploader};
use graphagent_common::{Backend, BackendType, Error, ErrorExt, Result, S3Backend};

/// Region used when the backend leaves it empty.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Whether `endpoint` needs path-style addressing.
///
/// Endpoints carrying an explicit port, such as a local MinIO, cannot serve
/// bucket subdomains.
pub fn uses_path_style(endpoint: &str) -> bool {
    strip_scheme(endpoint).contains(':')
}

fn strip_scheme(endpoint: &str) -> &str {
    endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint)
}

/// Normalize a configured endpoint into the URL handed to the client.
///
/// A missing scheme defaults to https. Virtual-hosted endpoints get the
/// bucket prepended to the host.
pub fn client_endpoint(endpoint: &str, bucket: &str) -> String {
    let (scheme, host) = match endpoint.split_once("://") {
        Some((scheme, host)) => (scheme, host),
        None => ("https", endpoint),
    };
    let host = host.trim_end_matches('/');
    if uses_path_style(endpoint) {
        format!("{}://{}", scheme, host)
    } else {
        format!("{}://{}.{}", scheme, bucket, host)
    }
}

fn build_store(s3: &S3Backend) -> Result<Arc<dyn ObjectStore>> {
    let region = if s3.region.is_empty() {
        DEFAULT_REGION
    } else {
        s3.region.as_str()
    };

    let mut builder = AmazonS3Builder::new()
        .with_bucket_name(s3.bucket.as_str())
        .with_region(region);
    if !s3.access_key.is_empty() {
        builder = builder
            .with_access_key_id(s3.access_key.as_str())
            .with_secret_access_key(s3.secret_key.as_str());
    }
    if !s3.endpoint.is_empty() {
        let endpoint = client_endpoint(&s3.endpoint, &s3.bucket);
        builder = builder
            .with_allow_http(endpoint.starts_with("http://"))
            .with_virtual_hosted_style_request(!uses_path_style(&s3.endpoint))
            .with_endpoint(endpoint);
    }

    let store = builder
        .build()
        .map_err(|e| Error::Storage(format!("create s3 client for {}: {}", s3.bucket, e)))?;
    Ok(Arc::new(store))
}

/// Storage backed by one S3 bucket.
///
/// Uploads overwrite existing keys.
pub struct S3Storage {
    backend: Backend,
    transfer: ObjectTransfer,
}

impl S3Storage {
    /// Connect to the bucket described by `backend`.
    pub fn new(backend: &Backend, limiter: Arc<RateLimiter>, queue_depth: usize) -> Result<Self> {
        let s3 = backend
            .as_s3()
            .ok_or_else(|| Error::InvalidUri(format!("bad format s3 backend: {}", backend)))?;
        let store = build_store(s3)?;
        info!(
            "Created s3 storage for bucket {}, endpoint {:?}, region {:?}",
            s3.bucket, s3.endpoint, s3.region
        );
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
            .as_s3()
            .map(|s3| s3.bucket.clone())
            .ok_or_else(|| Error::InvalidUri(format!("bad format s3 backend: {}", backend)))?;
        let transfer = ObjectTransfer::new(
            store,
            BackendType::S3,
            bucket,
            WriteMode::Overwrite,
            limiter,
            queue_depth,
        );
        Ok(Self { backend, transfer })
    }

    /// Parse `uri` against this storage and return the object key.
    fn key(&self, uri: &str) -> Result<String> {
        let backend = self.resolve(uri)?;
        Ok(backend.path().unwrap_or_default().to_string())
    }

    fn resolve(&self, uri: &str) -> Result<Backend> {
        let backend = self.backend.repoint(uri)?;
        let bucket = backend.as_s3().map(|s3| s3.bucket.as_str()).unwrap_or_default();
        if bucket != self.transfer.bucket() {
            return Err(Error::InvalidUri(format!(
                "{} is outside bucket {}",
                uri,
                self.transfer.bucket()
            )));
        }
        Ok(backend)
    }
}

#[async_trait]
impl Downloader for S3Storage {
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
impl Uploader for S3Storage {
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
impl Dir for S3Storage {
    async fn exist_dir(&self, uri: &str) -> Result<bool> {
        let key = self.key(uri)?;
        self.transfer.exists(&key).await
    }

    async fn ensure_dir(&self, uri: &str, _recursive: bool) -> Result<()> {
        self.resolve(uri)?;
        debug!("No directory to create for {}", uri);
        Ok(())
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

impl ExternalStorage for S3Storage {
    fn name(&self) -> &str {
        "s3"
    }

    fn backend_type(&self) -> BackendType {
        BackendType::S3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use tempfile::TempDir;

    fn storage() -> S3Storage {
        let backend = Backend::from(S3Backend {
            bucket: "backups".to_string(),
            path: String::new(),
            access_key: "AKID".to_string(),
            secret_key: "secret".to_string(),
            ..Default::default()
        });
        S3Storage::with_store(
            backend,
            Arc::new(InMemory::new()),
            Arc::new(RateLimiter::unlimited()),
            8,
        )
        .unwrap()
    }

    #[test]
    fn test_path_style_detection() {
        assert!(uses_path_style("http://127.0.0.1:9000"));
        assert!(uses_path_style("minio.local:9000"));
        assert!(!uses_path_style("https://s3.us-west-2.amazonaws.com"));
        assert!(!uses_path_style("oss-cn-hangzhou.aliyuncs.com"));
    }

    #[test]
    fn test_client_endpoint() {
        assert_eq!(
            client_endpoint("http://127.0.0.1:9000", "backups"),
            "http://127.0.0.1:9000"
        );
        assert_eq!(
            client_endpoint("127.0.0.1:9000/", "backups"),
            "https://127.0.0.1:9000"
        );
        assert_eq!(
            client_endpoint("s3.amazonaws.com", "backups"),
            "https://backups.s3.amazonaws.com"
        );
        assert_eq!(
            client_endpoint("http://storage.example.com", "b"),
            "http://b.storage.example.com"
        );
    }

    #[test]
    fn test_build_with_custom_endpoint() {
        let backend = Backend::from(S3Backend {
            bucket: "backups".to_string(),
            access_key: "AKID".to_string(),
            secret_key: "secret".to_string(),
            endpoint: "http://127.0.0.1:9000".to_string(),
            ..Default::default()
        });
        let storage = S3Storage::new(&backend, Arc::new(RateLimiter::unlimited()), 8).unwrap();
        assert_eq!(storage.name(), "s3");
    }

    #[test]
    fn test_rejects_non_s3_backend() {
        let err = S3Storage::new(
            &Backend::local("/tmp"),
            Arc::new(RateLimiter::unlimited()),
            8,
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::InvalidUri(_)));
    }

    #[tokio::test]
    async fn test_rejects_foreign_uris() {
        let storage = storage();
        for uri in ["s3://other/p", "gs://backups/p", "local:///tmp"] {
            let err = storage.exist_dir(uri).await.unwrap_err();
            assert!(matches!(err.root(), Error::InvalidUri(_)), "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_reupload_overwrites() {
        let storage = storage();
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("backup.meta");
        let cancel = CancellationToken::new();

        std::fs::write(&file, b"v1").unwrap();
        storage
            .upload(&cancel, "s3://backups/BACKUP_1/backup.meta", &file, false)
            .await
            .unwrap();
        std::fs::write(&file, b"v2").unwrap();
        storage
            .upload(&cancel, "s3://backups/BACKUP_1/backup.meta", &file, false)
            .await
            .unwrap();

        let out = temp.path().join("out.meta");
        storage
            .download(&cancel, &out, "s3://backups/BACKUP_1/backup.meta", false)
            .await
            .unwrap();
        assert_eq!(std::fs::read(out).unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_directory_lifecycle() {
        let storage = storage();
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("data/1")).unwrap();
        std::fs::write(temp.path().join("data/1/a.sst"), b"a").unwrap();
        let cancel = CancellationToken::new();

        storage
            .ensure_dir("s3://backups/root/BACKUP_1", true)
            .await
            .unwrap();
        storage
            .upload(&cancel, "s3://backups/root/BACKUP_1", temp.path(), true)
            .await
            .unwrap();

        assert!(storage.exist_dir("s3://backups/root/BACKUP_1").await.unwrap());
        assert_eq!(
            storage.list_dir("s3://backups/root").await.unwrap(),
            vec!["BACKUP_1"]
        );

        let err = storage
            .download(&cancel, &temp.path().join("x"), "s3://backups/root/BACKUP_1", false)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::NotRecursive(_)));

        storage.remove_dir("s3://backups/root/BACKUP_1").await.unwrap();
        assert!(!storage.exist_dir("s3://backups/root/BACKUP_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_dir_keeps_credentials() {
        let storage = storage();
        let backend = storage.get_dir("s3://backups/root/BACKUP_1").await.unwrap();
        let s3 = backend.as_s3().unwrap();
        assert_eq!(s3.path, "root/BACKUP_1");
        assert_eq!(s3.access_key, "AKID");
        assert_eq!(s3.secret_key, "secret");
    }
}
