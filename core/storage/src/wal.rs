//! Incremental WAL selection for delta backups.
//!
//! A partition directory holds write-ahead log segments named
//! `<start_id>.wal` plus a `commitlog.id` marker. Given the last log id
//! confirmed by the previous backup (`commit_log_id`) and the last id known
//! to be present (`last_log_id`), [`select_incremental`] picks the minimal
//! set of files that extends the backup chain without a gap.

use std::collections::BTreeSet;
use std::path::Path;

use graphagent_common::{Error, ErrorExt, Result};

/// File extension of WAL segments.
pub const WAL_EXT: &str = ".wal";
/// File name of the commit marker.
pub const COMMIT_LOG_FILE_NAME: &str = "commitlog.id";

/// Files chosen for an incremental upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalSelection {
    /// Largest segment start id not after `commit_log_id`.
    pub split_id: u64,
    /// Smallest segment start id in the directory.
    pub min_wal_start_id: u64,
    /// File names to upload: the commit marker, then segments by start id.
    pub files: Vec<String>,
}

/// Parse a segment file name into its start id.
pub fn parse_wal_name(name: &str) -> Option<u64> {
    name.strip_suffix(WAL_EXT)?.parse().ok()
}

/// Select the incremental file set from directory entry names.
///
/// `dir` is only used in error messages.
///
/// # Errors
/// - `MissingCommitMarker` if there is no `commitlog.id`
/// - `NoIncrementalWal` if every segment starts after `commit_log_id`
/// - `DiscontinuousWal` if `last_log_id` precedes the earliest segment
pub fn select_incremental<I, S>(
    dir: &str,
    names: I,
    commit_log_id: u64,
    last_log_id: u64,
) -> Result<WalSelection>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut has_commit_marker = false;
    let mut segments = BTreeSet::new();

    for name in names {
        let name = name.as_ref();
        if let Some(start_id) = parse_wal_name(name) {
            segments.insert(start_id);
        } else if name == COMMIT_LOG_FILE_NAME {
            has_commit_marker = true;
        }
    }

    if !has_commit_marker {
        return Err(Error::MissingCommitMarker(dir.to_string()));
    }

    let split_id = segments
        .range(..=commit_log_id)
        .next_back()
        .copied()
        .ok_or_else(|| Error::NoIncrementalWal {
            dir: dir.to_string(),
            commit_log_id,
        })?;

    // Non-empty: split_id was found above.
    let min_wal_start_id = *segments.first().unwrap_or(&split_id);
    if last_log_id < min_wal_start_id {
        return Err(Error::DiscontinuousWal {
            dir: dir.to_string(),
            last_log_id,
            min_wal_start_id,
        });
    }

    let mut files = vec![COMMIT_LOG_FILE_NAME.to_string()];
    files.extend(
        segments
            .range(split_id..)
            .map(|start_id| format!("{}{}", start_id, WAL_EXT)),
    );

    Ok(WalSelection {
        split_id,
        min_wal_start_id,
        files,
    })
}

/// Read `dir` and select its incremental file set.
pub async fn load_incremental_files(
    dir: &Path,
    commit_log_id: u64,
    last_log_id: u64,
) -> Result<WalSelection> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("read wal dir {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }

    select_incremental(&dir.display().to_string(), names, commit_log_id, last_log_id)
}
