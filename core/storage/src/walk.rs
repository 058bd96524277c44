//! Local tree walker feeding recursive uploads.
//!
//! The walker runs as its own task and sends every regular file below the
//! root into a bounded channel. It blocks when the consumer falls behind and
//! stops as soon as the receiver is dropped, so a consumer that bails out on
//! the first failed upload also ends the walk.

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use graphagent_common::{Error, ErrorExt, Result};

/// Start walking `root` and return the channel of discovered files.
///
/// Walk errors are delivered in-band; the channel closes after the first
/// one. Symbolic links are reported as [`Error::Unsupported`].
pub fn walk_files(root: &Path, queue_depth: usize) -> mpsc::Receiver<Result<PathBuf>> {
    spawn_walk(root, queue_depth).0
}

pub(crate) fn spawn_walk(
    root: &Path,
    queue_depth: usize,
) -> (mpsc::Receiver<Result<PathBuf>>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(queue_depth.max(1));
    let root = root.to_path_buf();
    let handle = tokio::spawn(async move {
        if let Err(err) = walk(root.clone(), &tx).await {
            let _ = tx.send(Err(err)).await;
        }
        debug!("Walk of {} finished", root.display());
    });
    (rx, handle)
}

async fn walk(root: PathBuf, tx: &mpsc::Sender<Result<PathBuf>>) -> Result<()> {
    let mut pending = vec![root];

    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("walk to {} failed", dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;

            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                if tx.send(Ok(path)).await.is_err() {
                    // Consumer gave up.
                    return Ok(());
                }
            } else if file_type.is_symlink() {
                return Err(Error::Unsupported(format!(
                    "{} is symbolic link",
                    path.display()
                )));
            } else {
                return Err(Error::Unsupported(format!(
                    "{} is not a regular file",
                    path.display()
                )));
            }
        }
    }
    Ok(())
}

/// Object key for `file` found below `root` when mirroring to `prefix`.
pub fn relative_key(prefix: &str, root: &Path, file: &Path) -> Result<String> {
    let relative = file.strip_prefix(root).map_err(|_| {
        Error::InvalidInput(format!(
            "{} is not below {}",
            file.display(),
            root.display()
        ))
    })?;

    let mut key = prefix.trim_end_matches('/').to_string();
    for component in relative.components() {
        let part = component.as_os_str().to_str().ok_or_else(|| {
            Error::Unsupported(format!("{} is not valid UTF-8", file.display()))
        })?;
        if !key.is_empty() {
            key.push('/');
        }
        key.push_str(part);
    }
    Ok(key)
}
