//! Transfer core shared by the object store backends.
//!
//! Object stores have a flat key namespace. Directories are emulated by key
//! prefixes: a prefix "exists" if a delimiter-bounded listing under it
//! returns anything, and a recursive transfer maps every key below the
//! prefix onto a relative local path.

use futures::TryStreamExt;
use object_store::buffered::BufWriter;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::limiter::RateLimiter;
use crate::provider::check_cancelled;
use crate::{wal, walk};
use graphagent_common::{BackendType, Error, ErrorExt, Result};

/// Create-only uploads up to this size go out as one conditional put.
const SINGLE_PUT_LIMIT: u64 = 8 * 1024 * 1024;

/// How uploads treat a key that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace the existing object.
    Overwrite,
    /// Refuse to write; the upload fails with [`Error::AlreadyExists`].
    CreateOnly,
}

/// Uploads, downloads and prefix operations against one bucket.
pub struct ObjectTransfer {
    store: Arc<dyn ObjectStore>,
    scheme: BackendType,
    bucket: String,
    write_mode: WriteMode,
    limiter: Arc<RateLimiter>,
    queue_depth: usize,
    single_put_limit: u64,
}

impl ObjectTransfer {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        scheme: BackendType,
        bucket: impl Into<String>,
        write_mode: WriteMode,
        limiter: Arc<RateLimiter>,
        queue_depth: usize,
    ) -> Self {
        Self {
            store,
            scheme,
            bucket: bucket.into(),
            write_mode,
            limiter,
            queue_depth,
            single_put_limit: SINGLE_PUT_LIMIT,
        }
    }

    /// Largest file a create-only upload reads into one conditional put.
    pub fn with_single_put_limit(mut self, limit: u64) -> Self {
        self.single_put_limit = limit;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    fn display(&self, key: &str) -> String {
        format!("{}{}/{}", self.scheme.prefix(), self.bucket, key)
    }

    fn map_error(&self, err: object_store::Error, key: &str) -> Error {
        match err {
            object_store::Error::NotFound { .. } => Error::NotFound(self.display(key)),
            object_store::Error::AlreadyExists { .. } => Error::AlreadyExists(self.display(key)),
            other => Error::Storage(other.to_string()),
        }
    }

    /// Upload one local file to `key`.
    pub async fn upload_file(&self, key: &str, file: &Path) -> Result<()> {
        let size = fs::metadata(file)
            .await
            .with_context(|| format!("stat {}", file.display()))?
            .len();
        self.limiter.wait(size).await;

        let location = ObjectPath::from(key);
        match self.write_mode {
            WriteMode::Overwrite => self.put_streamed(key, file, location).await?,
            WriteMode::CreateOnly if size <= self.single_put_limit => {
                let data = fs::read(file)
                    .await
                    .with_context(|| format!("read {}", file.display()))?;
                let options = PutOptions::from(PutMode::Create);
                self.store
                    .put_opts(&location, PutPayload::from(data), options)
                    .await
                    .map_err(|e| self.map_error(e, key))?;
            }
            WriteMode::CreateOnly => {
                // Multipart uploads cannot be conditional. A writer racing
                // between this check and completion is overwritten.
                match self.store.head(&location).await {
                    Ok(_) => return Err(Error::AlreadyExists(self.display(key))),
                    Err(object_store::Error::NotFound { .. }) => {}
                    Err(e) => return Err(self.map_error(e, key)),
                }
                self.put_streamed(key, file, location).await?;
            }
        }

        debug!("Uploaded {} to {}, bytes={}", file.display(), self.display(key), size);
        Ok(())
    }

    /// Stream `file` to `location` through a buffered multipart writer.
    async fn put_streamed(&self, key: &str, file: &Path, location: ObjectPath) -> Result<()> {
        let mut src = fs::File::open(file)
            .await
            .with_context(|| format!("open file {} failed when upload", file.display()))?;
        let mut writer = BufWriter::new(self.store.clone(), location);
        if let Err(e) = tokio::io::copy(&mut src, &mut writer).await {
            let _ = writer.abort().await;
            return Err(Error::from(e).context(format!("upload to {}", self.display(key))));
        }
        writer
            .shutdown()
            .await
            .with_context(|| format!("complete upload to {}", self.display(key)))?;
        Ok(())
    }

    /// Download the object at `key` into the local file `file`.
    pub async fn download_object(&self, key: &str, file: &Path) -> Result<()> {
        let location = ObjectPath::from(key);
        let meta = self
            .store
            .head(&location)
            .await
            .map_err(|e| self.map_error(e, key))?;
        self.limiter.wait(meta.size as u64).await;

        if let Some(dir) = file.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("ensure dir {} failed", dir.display()))?;
            }
        }

        let mut stream = self
            .store
            .get(&location)
            .await
            .map_err(|e| self.map_error(e, key))?
            .into_stream();
        let mut dst = fs::File::create(file)
            .await
            .with_context(|| format!("create file {} failed", file.display()))?;
        while let Some(chunk) = stream.try_next().await.map_err(|e| self.map_error(e, key))? {
            dst.write_all(&chunk).await?;
        }
        dst.sync_all().await?;

        debug!(
            "Downloaded {} to {}, bytes={}",
            self.display(key),
            file.display(),
            meta.size
        );
        Ok(())
    }

    /// Whether anything is stored strictly below `key` treated as a prefix.
    async fn has_children(&self, key: &str) -> Result<bool> {
        let prefix = prefix_path(key);
        let listing = self
            .store
            .list_with_delimiter(prefix.as_ref())
            .await
            .map_err(|e| self.map_error(e, key))?;
        Ok(!listing.objects.is_empty() || !listing.common_prefixes.is_empty())
    }

    /// Download `key`, mirroring everything below it when `recursive`.
    pub async fn download(
        &self,
        cancel: &CancellationToken,
        local_path: &Path,
        key: &str,
        recursive: bool,
    ) -> Result<()> {
        if !recursive {
            check_cancelled(cancel)?;
            let result = self.download_object(key, local_path).await;
            if let Err(e) = &result {
                if e.is_not_found() && self.has_children(key).await? {
                    return Err(Error::NotRecursive(self.display(key)));
                }
            }
            return result;
        }

        let prefix = prefix_path(key);
        let mut objects = self.store.list(prefix.as_ref());
        let mut count = 0usize;
        while let Some(meta) = objects.try_next().await.map_err(|e| self.map_error(e, key))? {
            check_cancelled(cancel)?;

            let mut local_file = local_path.to_path_buf();
            match &prefix {
                Some(prefix) => match meta.location.prefix_match(prefix) {
                    Some(parts) => parts.for_each(|part| local_file.push(part.as_ref())),
                    None => continue,
                },
                None => meta
                    .location
                    .parts()
                    .for_each(|part| local_file.push(part.as_ref())),
            }

            self.download_object(meta.location.as_ref(), &local_file)
                .await
                .with_context(|| format!("download {} recursively failed", self.display(key)))?;
            count += 1;
        }

        if count == 0 {
            // Not a prefix; it may still be a single object.
            check_cancelled(cancel)?;
            self.download_object(key, local_path).await?;
            count = 1;
        }

        debug!(
            "Downloaded {} objects from {} to {}",
            count,
            self.display(key),
            local_path.display()
        );
        Ok(())
    }

    /// Upload `local_path` to `key`, mirroring a directory when `recursive`.
    pub async fn upload(
        &self,
        cancel: &CancellationToken,
        key: &str,
        local_path: &Path,
        recursive: bool,
    ) -> Result<()> {
        let meta = match fs::metadata(local_path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!(
                    "local path {} does not exist",
                    local_path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if !meta.is_dir() {
            check_cancelled(cancel)?;
            return self.upload_file(key, local_path).await;
        }
        if !recursive {
            return Err(Error::NotRecursive(local_path.display().to_string()));
        }

        let mut files = walk::walk_files(local_path, self.queue_depth);
        let mut count = 0usize;
        while let Some(file) = files.recv().await {
            check_cancelled(cancel)?;
            let file = file?;
            let file_key = walk::relative_key(key, local_path, &file)?;
            self.upload_file(&file_key, &file)
                .await
                .with_context(|| format!("upload from {} to {} failed", file.display(), file_key))?;
            count += 1;
        }

        debug!(
            "Uploaded {} files from {} to {} recursively",
            count,
            local_path.display(),
            self.display(key)
        );
        Ok(())
    }

    /// Upload the incremental WAL set of the partition dir `local_path`.
    pub async fn incr_upload(
        &self,
        cancel: &CancellationToken,
        key: &str,
        local_path: &Path,
        commit_log_id: u64,
        last_log_id: u64,
    ) -> Result<()> {
        let meta = fs::metadata(local_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("local path {} does not exist", local_path.display()))
            } else {
                Error::from(e)
            }
        })?;
        if !meta.is_dir() {
            return Err(Error::InvalidInput(format!(
                "{} is a file, must specify the partition dir",
                local_path.display()
            )));
        }

        let selection = wal::load_incremental_files(local_path, commit_log_id, last_log_id).await?;
        for name in &selection.files {
            check_cancelled(cancel)?;
            let file_key = join_key(key, name);
            self.upload_file(&file_key, &local_path.join(name)).await?;
        }

        debug!(
            "Incrementally uploaded {} files from {} to {}, split id {}",
            selection.files.len(),
            local_path.display(),
            self.display(key),
            selection.split_id
        );
        Ok(())
    }

    /// Whether an object or a non-empty prefix exists at `key`.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        if self.has_children(key).await? {
            return Ok(true);
        }
        if key.trim_matches('/').is_empty() {
            return Ok(false);
        }
        match self.store.head(&ObjectPath::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(self.map_error(e, key)),
        }
    }

    /// Names of the common prefixes directly below `key`.
    pub async fn list_dirs(&self, key: &str) -> Result<Vec<String>> {
        let prefix = prefix_path(key);
        let listing = self
            .store
            .list_with_delimiter(prefix.as_ref())
            .await
            .map_err(|e| self.map_error(e, key))?;

        let mut names: Vec<String> = listing
            .common_prefixes
            .iter()
            .filter_map(|p| p.filename().map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Delete every object at or below `key`.
    ///
    /// Not atomic: a failure leaves the remaining objects in place, and a
    /// retry picks up where it stopped.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let prefix = prefix_path(key);
        let locations: Vec<ObjectPath> = self
            .store
            .list(prefix.as_ref())
            .map_ok(|meta| meta.location)
            .try_collect()
            .await
            .map_err(|e| self.map_error(e, key))?;

        for location in &locations {
            match self.store.delete(location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(self.map_error(e, location.as_ref())),
            }
        }

        if prefix.is_some() {
            match self.store.delete(&ObjectPath::from(key)).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(self.map_error(e, key)),
            }
        }

        info!("Removed {} objects under {}", locations.len(), self.display(key));
        Ok(())
    }
}

/// Prefix for listing below `key`; `None` means the bucket root.
fn prefix_path(key: &str) -> Option<ObjectPath> {
    if key.trim_matches('/').is_empty() {
        None
    } else {
        Some(ObjectPath::from(key))
    }
}

/// Append `name` to the key prefix `key`.
pub(crate) fn join_key(key: &str, name: &str) -> String {
    let key = key.trim_end_matches('/');
    if key.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", key, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use std::time::Duration;
    use tempfile::TempDir;

    const MIB: usize = 1 << 20;

    fn transfer(write_mode: WriteMode) -> (ObjectTransfer, Arc<InMemory>) {
        limited_transfer(write_mode, RateLimiter::unlimited())
    }

    fn limited_transfer(
        write_mode: WriteMode,
        limiter: RateLimiter,
    ) -> (ObjectTransfer, Arc<InMemory>) {
        let store = Arc::new(InMemory::new());
        let transfer = ObjectTransfer::new(
            store.clone(),
            BackendType::S3,
            "bucket",
            write_mode,
            Arc::new(limiter),
            4,
        );
        (transfer, store)
    }

    async fn put(store: &InMemory, key: &str, data: &'static [u8]) {
        store
            .put(&ObjectPath::from(key), PutPayload::from_static(data))
            .await
            .unwrap();
    }

    async fn get(store: &InMemory, key: &str) -> Vec<u8> {
        store
            .get(&ObjectPath::from(key))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("backup/wal", "10.wal"), "backup/wal/10.wal");
        assert_eq!(join_key("backup/wal/", "10.wal"), "backup/wal/10.wal");
        assert_eq!(join_key("", "commitlog.id"), "commitlog.id");
    }

    #[tokio::test]
    async fn test_recursive_upload_then_download() {
        let (transfer, store) = transfer(WriteMode::Overwrite);
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        std::fs::create_dir_all(src.join("data/1/2")).unwrap();
        std::fs::write(src.join("data/1/2/000009.sst"), b"sst").unwrap();
        std::fs::write(src.join("meta.bin"), b"meta").unwrap();
        let cancel = CancellationToken::new();

        transfer.upload(&cancel, "BACKUP_1", &src, true).await.unwrap();
        assert_eq!(get(&store, "BACKUP_1/data/1/2/000009.sst").await, b"sst");
        assert_eq!(get(&store, "BACKUP_1/meta.bin").await, b"meta");

        let dst = temp.path().join("restore");
        transfer.download(&cancel, &dst, "BACKUP_1", true).await.unwrap();
        assert_eq!(std::fs::read(dst.join("data/1/2/000009.sst")).unwrap(), b"sst");
        assert_eq!(std::fs::read(dst.join("meta.bin")).unwrap(), b"meta");
    }

    #[tokio::test]
    async fn test_download_does_not_match_sibling_prefix() {
        let (transfer, store) = transfer(WriteMode::Overwrite);
        put(&store, "BACKUP_1/a", b"a").await;
        put(&store, "BACKUP_10/b", b"b").await;
        let temp = TempDir::new().unwrap();

        transfer
            .download(&CancellationToken::new(), temp.path(), "BACKUP_1", true)
            .await
            .unwrap();
        assert!(temp.path().join("a").exists());
        assert!(!temp.path().join("b").exists());
    }

    #[tokio::test]
    async fn test_recursive_download_of_single_object() {
        let (transfer, store) = transfer(WriteMode::Overwrite);
        put(&store, "meta/backup.meta", b"m").await;
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("backup.meta");

        transfer
            .download(&CancellationToken::new(), &file, "meta/backup.meta", true)
            .await
            .unwrap();
        assert_eq!(std::fs::read(file).unwrap(), b"m");
    }

    #[tokio::test]
    async fn test_directory_requires_recursive() {
        let (transfer, store) = transfer(WriteMode::Overwrite);
        put(&store, "dir/file", b"x").await;
        let temp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        let err = transfer
            .download(&cancel, &temp.path().join("out"), "dir", false)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::NotRecursive(_)));

        let err = transfer.upload(&cancel, "dir", temp.path(), false).await.unwrap_err();
        assert!(matches!(err.root(), Error::NotRecursive(_)));
    }

    #[tokio::test]
    async fn test_missing_source() {
        let (transfer, _store) = transfer(WriteMode::Overwrite);
        let temp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        for recursive in [false, true] {
            let err = transfer
                .download(&cancel, &temp.path().join("out"), "nothing/here", recursive)
                .await
                .unwrap_err();
            assert!(matches!(err.root(), Error::NotFound(_)));
        }

        let err = transfer
            .upload(&cancel, "k", &temp.path().join("absent"), false)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_overwrite_replaces_existing_key() {
        let (transfer, store) = transfer(WriteMode::Overwrite);
        put(&store, "k", b"old").await;
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("f");
        std::fs::write(&file, b"new").unwrap();

        transfer.upload_file("k", &file).await.unwrap();
        assert_eq!(get(&store, "k").await, b"new");
    }

    #[tokio::test]
    async fn test_create_only_rejects_existing_key() {
        let (transfer, store) = transfer(WriteMode::CreateOnly);
        put(&store, "k", b"old").await;
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("f");
        std::fs::write(&file, b"new").unwrap();

        let err = transfer.upload_file("k", &file).await.unwrap_err();
        assert!(matches!(err.root(), Error::AlreadyExists(_)));
        assert_eq!(get(&store, "k").await, b"old");

        transfer.upload_file("fresh", &file).await.unwrap();
        assert_eq!(get(&store, "fresh").await, b"new");
    }

    #[tokio::test]
    async fn test_create_only_streams_large_files() {
        let (transfer, store) = transfer(WriteMode::CreateOnly);
        let transfer = transfer.with_single_put_limit(16);
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("f");
        let data: Vec<u8> = (0..64u8).collect();
        std::fs::write(&file, &data).unwrap();

        transfer.upload_file("big", &file).await.unwrap();
        assert_eq!(get(&store, "big").await, data);

        std::fs::write(&file, b"replacement bytes beyond the limit").unwrap();
        let err = transfer.upload_file("big", &file).await.unwrap_err();
        assert!(matches!(err.root(), Error::AlreadyExists(_)));
        assert_eq!(get(&store, "big").await, data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfers_share_rate_limit() {
        // 8 Mbps is 1 MiB/s with a 3 MiB burst.
        let (transfer, _store) = limited_transfer(WriteMode::Overwrite, RateLimiter::new(8));
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        for i in 0..6 {
            std::fs::write(src.join(format!("{}.sst", i)), vec![0u8; MIB]).unwrap();
        }
        let cancel = CancellationToken::new();

        let start = tokio::time::Instant::now();
        transfer.upload(&cancel, "b", &src, true).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(2990));

        let start = tokio::time::Instant::now();
        let dst = temp.path().join("dst");
        transfer.download(&cancel, &dst, "b", true).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(2990));
        assert_eq!(std::fs::read(dst.join("5.sst")).unwrap().len(), MIB);
    }

    #[tokio::test]
    async fn test_first_upload_failure_aborts_walk() {
        let (transfer, store) = transfer(WriteMode::CreateOnly);
        let temp = TempDir::new().unwrap();
        for i in 0..8 {
            std::fs::write(temp.path().join(format!("{}.sst", i)), b"x").unwrap();
        }
        put(&store, "p/3.sst", b"taken").await;

        let err = transfer
            .upload(&CancellationToken::new(), "p", temp.path(), true)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_exists_and_list_dirs() {
        let (transfer, store) = transfer(WriteMode::Overwrite);
        put(&store, "root/BACKUP_1/meta", b"m").await;
        put(&store, "root/BACKUP_2/data/x", b"x").await;
        put(&store, "root/file", b"f").await;

        assert!(transfer.exists("root").await.unwrap());
        assert!(transfer.exists("root/BACKUP_1").await.unwrap());
        assert!(transfer.exists("root/file").await.unwrap());
        assert!(!transfer.exists("root/BACKUP_3").await.unwrap());
        assert!(!transfer.exists("missing").await.unwrap());

        assert_eq!(
            transfer.list_dirs("root").await.unwrap(),
            vec!["BACKUP_1", "BACKUP_2"]
        );
        assert_eq!(transfer.list_dirs("").await.unwrap(), vec!["root"]);
        assert!(transfer.list_dirs("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_prefix() {
        let (transfer, store) = transfer(WriteMode::Overwrite);
        put(&store, "root/BACKUP_1/a", b"a").await;
        put(&store, "root/BACKUP_1/b/c", b"c").await;
        put(&store, "root/BACKUP_2/a", b"a").await;

        transfer.remove("root/BACKUP_1").await.unwrap();
        assert!(!transfer.exists("root/BACKUP_1").await.unwrap());
        assert!(transfer.exists("root/BACKUP_2").await.unwrap());

        // Removing again is a no-op.
        transfer.remove("root/BACKUP_1").await.unwrap();
    }

    #[tokio::test]
    async fn test_incr_upload() {
        let (transfer, store) = transfer(WriteMode::Overwrite);
        let temp = TempDir::new().unwrap();
        for name in ["5.wal", "10.wal", "15.wal", "20.wal", "commitlog.id"] {
            std::fs::write(temp.path().join(name), name).unwrap();
        }

        transfer
            .incr_upload(&CancellationToken::new(), "wal/1/3", temp.path(), 12, 5)
            .await
            .unwrap();

        let mut keys: Vec<String> = store
            .list(Some(&ObjectPath::from("wal/1/3")))
            .map_ok(|m| m.location.to_string())
            .try_collect()
            .await
            .unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec!["wal/1/3/10.wal", "wal/1/3/15.wal", "wal/1/3/20.wal", "wal/1/3/commitlog.id"]
        );
    }

    #[tokio::test]
    async fn test_cancelled_upload() {
        let (transfer, _store) = transfer(WriteMode::Overwrite);
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a"), b"a").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = transfer.upload(&cancel, "p", temp.path(), true).await.unwrap_err();
        assert!(matches!(err.root(), Error::Cancelled));
    }
}
