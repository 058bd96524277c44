//! Local filesystem storage.
//!
//! Mirrors files and directory trees between two paths on the agent's own
//! filesystem. External URIs take the form `local://<path>`.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::limiter::RateLimiter;
use crate::provider::{check_cancelled, Dir, Downloader, ExternalStorage, Uploader};
use crate::wal;
use graphagent_common::{Backend, BackendType, Error, ErrorExt, Result, LOCAL_PREFIX};

/// Local filesystem storage.
///
/// Copies are durable once an operation returns: every file is synced
/// after its bytes are written. Owner, group and mode bits of the source
/// entries are carried over. Symbolic links are never followed; meeting
/// one aborts the copy with [`Error::Unsupported`].
pub struct LocalStorage {
    limiter: Arc<RateLimiter>,
}

impl LocalStorage {
    /// Create a local storage throttled by `limiter`.
    ///
    /// # Postconditions
    /// - Every byte copied by this storage is charged to `limiter`
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }

    /// Filesystem path named by a `local://` URI.
    fn to_fs_path(uri: &str) -> Result<PathBuf> {
        match uri.strip_prefix(LOCAL_PREFIX) {
            Some(path) => Ok(PathBuf::from(path)),
            None => Err(Error::InvalidUri(format!("invalid local uri: {}", uri))),
        }
    }

    /// Rename `src` to `dst` on the agent's filesystem.
    pub async fn move_dir(&self, src: &Path, dst: &Path) -> Result<()> {
        fs::rename(src, dst)
            .await
            .with_context(|| format!("move {} to {}", src.display(), dst.display()))?;
        debug!("Moved {} to {}", src.display(), dst.display());
        Ok(())
    }

    async fn copy_file(&self, cancel: &CancellationToken, dst: &Path, src: &Path) -> Result<()> {
        check_cancelled(cancel)?;

        let mut src_file = fs::File::open(src)
            .await
            .with_context(|| format!("open {}", src.display()))?;
        let size = src_file.metadata().await?.len();
        self.limiter.wait(size).await;

        let mut dst_file = fs::File::create(dst)
            .await
            .with_context(|| format!("create {}", dst.display()))?;
        tokio::io::copy(&mut src_file, &mut dst_file)
            .await
            .with_context(|| format!("copy {} to {}", src.display(), dst.display()))?;
        dst_file
            .sync_all()
            .await
            .with_context(|| format!("sync {}", dst.display()))?;
        Ok(())
    }

    /// Copy a single regular file along with its ownership and mode.
    async fn copy_entry(&self, cancel: &CancellationToken, dst: &Path, src: &Path) -> Result<()> {
        let meta = fs::symlink_metadata(src).await?;
        self.copy_file(cancel, dst, src).await?;
        preserve_attributes(dst, &meta)
    }

    fn copy_dir<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        dst: &'a Path,
        src: &'a Path,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            check_cancelled(cancel)?;

            fs::create_dir_all(dst)
                .await
                .with_context(|| format!("failed to create directory {}", dst.display()))?;

            let mut entries = fs::read_dir(src)
                .await
                .with_context(|| format!("read dir {}", src.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let src_path = entry.path();
                let dst_path = dst.join(entry.file_name());
                let meta = fs::symlink_metadata(&src_path).await?;
                let file_type = meta.file_type();

                if file_type.is_symlink() {
                    return Err(Error::Unsupported(format!(
                        "{} is symbolic link",
                        src_path.display()
                    )));
                } else if file_type.is_dir() {
                    self.copy_dir(cancel, &dst_path, &src_path).await?;
                } else if file_type.is_file() {
                    self.copy_file(cancel, &dst_path, &src_path).await?;
                } else {
                    return Err(Error::Unsupported(format!(
                        "{} is not a regular file",
                        src_path.display()
                    )));
                }

                preserve_attributes(&dst_path, &meta)?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Copy `src` to `dst`, as a tree if `src` is a directory.
    async fn copy_path(
        &self,
        cancel: &CancellationToken,
        dst: &Path,
        src: &Path,
        recursive: bool,
        src_desc: &str,
    ) -> Result<()> {
        let src_meta = match fs::metadata(src).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("{} does not exist", src_desc)));
            }
            Err(e) => return Err(Error::from(e).context(format!("get {} status", src_desc))),
        };
        if src_meta.is_dir() && !recursive {
            return Err(Error::NotRecursive(src_desc.to_string()));
        }

        if fs::try_exists(dst).await.unwrap_or(false) {
            info!("Path {} already exists, copying over it", dst.display());
        }

        let copied = if src_meta.is_dir() {
            self.copy_dir(cancel, dst, src).await
        } else {
            self.copy_entry(cancel, dst, src).await
        };
        copied.with_context(|| format!("copy from {} to {}", src.display(), dst.display()))
    }
}

#[cfg(unix)]
fn preserve_attributes(dst: &Path, meta: &std::fs::Metadata) -> Result<()> {
    use std::os::unix::fs::{lchown, MetadataExt, PermissionsExt};

    lchown(dst, Some(meta.uid()), Some(meta.gid()))
        .with_context(|| format!("chown {}", dst.display()))?;
    std::fs::set_permissions(dst, std::fs::Permissions::from_mode(meta.mode() & 0o7777))
        .with_context(|| format!("chmod {}", dst.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn preserve_attributes(dst: &Path, meta: &std::fs::Metadata) -> Result<()> {
    std::fs::set_permissions(dst, meta.permissions())
        .with_context(|| format!("chmod {}", dst.display()))
}

#[async_trait]
impl Downloader for LocalStorage {
    async fn download(
        &self,
        cancel: &CancellationToken,
        local_path: &Path,
        external_uri: &str,
        recursive: bool,
    ) -> Result<()> {
        let src = Self::to_fs_path(external_uri)?;
        self.copy_path(cancel, local_path, &src, recursive, external_uri)
            .await
            .with_context(|| format!("download {}", external_uri))?;
        debug!("Downloaded {} to {}", external_uri, local_path.display());
        Ok(())
    }
}

#[async_trait]
impl Uploader for LocalStorage {
    async fn upload(
        &self,
        cancel: &CancellationToken,
        external_uri: &str,
        local_path: &Path,
        recursive: bool,
    ) -> Result<()> {
        let dst = Self::to_fs_path(external_uri)?;
        let src_desc = local_path.display().to_string();
        self.copy_path(cancel, &dst, local_path, recursive, &src_desc)
            .await
            .with_context(|| format!("upload to {}", external_uri))?;
        debug!("Uploaded {} to {}", local_path.display(), external_uri);
        Ok(())
    }

    async fn incr_upload(
        &self,
        cancel: &CancellationToken,
        external_uri: &str,
        local_path: &Path,
        commit_log_id: u64,
        last_log_id: u64,
    ) -> Result<()> {
        let dst = Self::to_fs_path(external_uri)?;
        let op = || format!("incremental upload to {}", external_uri);

        let src_meta = fs::metadata(local_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("local path {} does not exist", local_path.display()))
            } else {
                Error::from(e)
            }
        });
        if !src_meta.with_context(op)?.is_dir() {
            return Err(Error::InvalidInput(format!(
                "{} is a file, must specify the partition dir",
                local_path.display()
            ))
            .context(op()));
        }

        let selection = wal::load_incremental_files(local_path, commit_log_id, last_log_id)
            .await
            .with_context(op)?;
        fs::create_dir_all(&dst).await.with_context(op)?;

        for name in &selection.files {
            self.copy_entry(cancel, &dst.join(name), &local_path.join(name))
                .await
                .with_context(op)?;
        }

        debug!(
            "Incrementally uploaded {} files from {} to {}, split id {}",
            selection.files.len(),
            local_path.display(),
            external_uri,
            selection.split_id
        );
        Ok(())
    }
}

#[async_trait]
impl Dir for LocalStorage {
    async fn exist_dir(&self, uri: &str) -> Result<bool> {
        let path = Self::to_fs_path(uri)?;
        fs::try_exists(&path)
            .await
            .with_context(|| format!("check {} exists", uri))
    }

    async fn ensure_dir(&self, uri: &str, recursive: bool) -> Result<()> {
        let path = Self::to_fs_path(uri)?;
        if fs::try_exists(&path).await? {
            return Ok(());
        }

        let created = if recursive {
            fs::create_dir_all(&path).await
        } else {
            let parent_exists = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => fs::try_exists(parent).await?,
                _ => true,
            };
            if !parent_exists {
                return Err(Error::NotFound(format!(
                    "{}'s parent dir not found",
                    path.display()
                )));
            }
            fs::create_dir(&path).await
        };
        created.with_context(|| format!("ensure dir {}", uri))
    }

    async fn get_dir(&self, uri: &str) -> Result<Backend> {
        Self::to_fs_path(uri)?;
        Backend::from_uri(uri)
    }

    async fn list_dir(&self, uri: &str) -> Result<Vec<String>> {
        let path = Self::to_fs_path(uri)?;
        let mut entries = fs::read_dir(&path)
            .await
            .with_context(|| format!("read dir {} failed", uri))?;

        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    dirs.push(name.to_string());
                }
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    async fn remove_dir(&self, uri: &str) -> Result<()> {
        let path = Self::to_fs_path(uri)?;
        let meta = match fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("{} not found", uri)));
            }
            Err(e) => return Err(Error::from(e).context(format!("check {} exists", uri))),
        };

        let removed = if meta.is_dir() {
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        };
        removed.with_context(|| format!("remove {}", uri))?;
        debug!("Removed {}", uri);
        Ok(())
    }
}

impl ExternalStorage for LocalStorage {
    fn name(&self) -> &str {
        "local"
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage() -> LocalStorage {
        LocalStorage::new(Arc::new(RateLimiter::unlimited()))
    }

    fn uri(path: &Path) -> String {
        format!("{}{}", LOCAL_PREFIX, path.display())
    }

    fn make_tree(root: &Path) {
        std::fs::create_dir_all(root.join("data/1/2")).unwrap();
        std::fs::create_dir_all(root.join("meta")).unwrap();
        std::fs::write(root.join("data/1/2/000009.sst"), b"sst").unwrap();
        std::fs::write(root.join("meta/__indexes__.sst"), b"idx").unwrap();
        std::fs::write(root.join("README"), b"readme").unwrap();
    }

    #[tokio::test]
    async fn test_upload_download_file() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("local.txt");
        let external = temp.path().join("external.txt");
        let result = temp.path().join("result.txt");
        std::fs::write(&src, b"Hello, Local!").unwrap();
        let cancel = CancellationToken::new();

        storage().upload(&cancel, &uri(&external), &src, false).await.unwrap();
        storage().download(&cancel, &result, &uri(&external), false).await.unwrap();

        assert_eq!(std::fs::read(&result).unwrap(), b"Hello, Local!");
    }

    #[tokio::test]
    async fn test_recursive_upload_mirrors_tree() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        make_tree(&src);

        storage()
            .upload(&CancellationToken::new(), &uri(&dst), &src, true)
            .await
            .unwrap();

        assert_eq!(std::fs::read(dst.join("data/1/2/000009.sst")).unwrap(), b"sst");
        assert_eq!(std::fs::read(dst.join("meta/__indexes__.sst")).unwrap(), b"idx");
        assert_eq!(std::fs::read(dst.join("README")).unwrap(), b"readme");
    }

    #[tokio::test]
    async fn test_reupload_converges() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        make_tree(&src);
        let cancel = CancellationToken::new();

        storage().upload(&cancel, &uri(&dst), &src, true).await.unwrap();
        std::fs::write(src.join("README"), b"changed").unwrap();
        storage().upload(&cancel, &uri(&dst), &src, true).await.unwrap();

        assert_eq!(std::fs::read(dst.join("README")).unwrap(), b"changed");
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_upload_is_rate_limited() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        for i in 0..2 {
            std::fs::write(src.join(format!("{}.sst", i)), vec![0u8; 3 << 20]).unwrap();
        }
        // 1 MiB/s with a 3 MiB burst.
        let storage = LocalStorage::new(Arc::new(RateLimiter::new(8)));

        let start = tokio::time::Instant::now();
        storage
            .upload(
                &CancellationToken::new(),
                &uri(&temp.path().join("dst")),
                &src,
                true,
            )
            .await
            .unwrap();
        assert!(start.elapsed() >= std::time::Duration::from_millis(2990));
        assert_eq!(
            std::fs::read(temp.path().join("dst/1.sst")).unwrap().len(),
            3 << 20
        );
    }

    #[tokio::test]
    async fn test_copy_preserves_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        make_tree(&src);
        std::fs::set_permissions(src.join("README"), std::fs::Permissions::from_mode(0o640))
            .unwrap();
        std::fs::set_permissions(src.join("meta"), std::fs::Permissions::from_mode(0o750))
            .unwrap();

        storage()
            .upload(&CancellationToken::new(), &uri(&dst), &src, true)
            .await
            .unwrap();

        let mode = |p: PathBuf| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(dst.join("README")), 0o640);
        assert_eq!(mode(dst.join("meta")), 0o750);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_anywhere_fails() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        make_tree(&src);
        std::os::unix::fs::symlink(src.join("README"), src.join("data/1/link")).unwrap();
        let cancel = CancellationToken::new();

        let err = storage()
            .upload(&cancel, &uri(&temp.path().join("dst")), &src, true)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::Unsupported(_)));

        let err = storage()
            .download(&cancel, &temp.path().join("back"), &uri(&src), true)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_directory_requires_recursive() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        make_tree(&src);
        let cancel = CancellationToken::new();

        let err = storage()
            .upload(&cancel, &uri(&temp.path().join("dst")), &src, false)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::NotRecursive(_)));

        let err = storage()
            .download(&cancel, &temp.path().join("back"), &uri(&src), false)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::NotRecursive(_)));
    }

    #[tokio::test]
    async fn test_missing_source() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("local_not_exist.txt");
        let cancel = CancellationToken::new();

        let err = storage()
            .upload(&cancel, &uri(&temp.path().join("x")), &missing, false)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::NotFound(_)));

        let err = storage()
            .download(&cancel, &temp.path().join("x"), &uri(&missing), false)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rejects_foreign_uri() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("f");
        std::fs::write(&src, b"x").unwrap();

        let err = storage()
            .upload(&CancellationToken::new(), "s3://bucket/key", &src, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUri(_)));
        assert!(storage().list_dir("gs://bucket/p").await.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_before_copy() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        make_tree(&src);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = storage()
            .upload(&cancel, &uri(&temp.path().join("dst")), &src, true)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::Cancelled));
    }

    #[tokio::test]
    async fn test_ensure_dir() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a/b/c");

        let err = storage().ensure_dir(&uri(&nested), false).await.unwrap_err();
        assert!(matches!(err.root(), Error::NotFound(_)));

        storage().ensure_dir(&uri(&nested), true).await.unwrap();
        assert!(nested.is_dir());

        let child = nested.join("d");
        storage().ensure_dir(&uri(&child), false).await.unwrap();
        assert!(child.is_dir());
        storage().ensure_dir(&uri(&child), false).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_dir_returns_only_directories() {
        let temp = TempDir::new().unwrap();
        make_tree(temp.path());
        std::fs::create_dir(temp.path().join("BACKUP_2024")).unwrap();

        let dirs = storage().list_dir(&uri(temp.path())).await.unwrap();
        assert_eq!(dirs, vec!["BACKUP_2024", "data", "meta"]);
    }

    #[tokio::test]
    async fn test_exist_and_remove_dir() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("tree");
        make_tree(&root);

        assert!(storage().exist_dir(&uri(&root)).await.unwrap());
        storage().remove_dir(&uri(&root)).await.unwrap();
        assert!(!storage().exist_dir(&uri(&root)).await.unwrap());

        let err = storage().remove_dir(&uri(&root)).await.unwrap_err();
        assert!(matches!(err.root(), Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_get_dir() {
        let backend = storage().get_dir("local:///data/backup").await.unwrap();
        assert_eq!(backend.backend_type(), Some(BackendType::Local));
        assert_eq!(backend.path(), Some("/data/backup"));
    }

    #[tokio::test]
    async fn test_incr_upload_copies_selected_wal() {
        let temp = TempDir::new().unwrap();
        let part = temp.path().join("wal/1/3");
        std::fs::create_dir_all(&part).unwrap();
        for name in ["5.wal", "10.wal", "15.wal", "20.wal", "commitlog.id"] {
            std::fs::write(part.join(name), name).unwrap();
        }
        let dst = temp.path().join("backup/wal/1/3");

        storage()
            .incr_upload(&CancellationToken::new(), &uri(&dst), &part, 12, 5)
            .await
            .unwrap();

        let mut copied: Vec<_> = std::fs::read_dir(&dst)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        copied.sort();
        assert_eq!(copied, vec!["10.wal", "15.wal", "20.wal", "commitlog.id"]);
    }

    #[tokio::test]
    async fn test_incr_upload_requires_directory() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("5.wal");
        std::fs::write(&file, b"w").unwrap();

        let err = storage()
            .incr_upload(&CancellationToken::new(), &uri(&temp.path().join("d")), &file, 5, 5)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_move_dir() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        make_tree(&src);
        let dst = temp.path().join("moved");

        storage().move_dir(&src, &dst).await.unwrap();
        assert!(!src.exists());
        assert!(dst.join("README").exists());
    }
}
