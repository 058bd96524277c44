//! Common error types for graphagent.

use thiserror::Error;

/// Top-level error type for storage transfer operations.
#[derive(Debug, Error)]
pub enum Error {
    /// URI could not be parsed, or names a different backend type.
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Source path or object not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Source is a directory but the transfer was not recursive.
    #[error("{0} is a directory, must transfer recursively")]
    NotRecursive(String),

    /// Entry kind that cannot be transferred, such as a symbolic link.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Target object already exists and the backend refuses to overwrite it.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// No WAL segment starts at or before the confirmed commit log id.
    #[error("{dir} has no incremental wal, commit log id is {commit_log_id}")]
    NoIncrementalWal { dir: String, commit_log_id: u64 },

    /// Earliest retained WAL starts after the last known log id.
    #[error(
        "{dir} wal is discontinuous, last log id is {last_log_id} and min wal start id is {min_wal_start_id}"
    )]
    DiscontinuousWal {
        dir: String,
        last_log_id: u64,
        min_wal_start_id: u64,
    },

    /// Partition directory lacks the commit marker file.
    #[error("{0} has no commitlog.id file")]
    MissingCommitMarker(String),

    /// Operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Remote storage backend failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration is invalid or could not be loaded.
    #[error("Config error: {0}")]
    Config(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error annotated with the operation that produced it.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap this error with an operation-context message.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with all context layers stripped.
    pub fn root(&self) -> &Error {
        let mut err = self;
        while let Error::Context { source, .. } = err {
            err = source;
        }
        err
    }

    /// Whether the root cause is a missing path or object.
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Adds operation context to results.
pub trait ErrorExt<T> {
    /// Wrap the error, if any, with a context message.
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Like [`ErrorExt::context`], building the message lazily.
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E: Into<Error>> ErrorExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
