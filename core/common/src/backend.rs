//! Storage backend descriptors and their canonical URI encoding.
//!
//! A [`Backend`] names one storage location together with the information
//! needed to reach it. The URI forms are:
//!
//! - `local://<path>`
//! - `s3://<bucket>/<path>`
//! - `gs://<bucket>/<path>`
//!
//! Credentials never appear in the URI, so repointing a backend at another
//! path through [`Backend::set_uri`] keeps them intact.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// URI prefix of the local filesystem backend.
pub const LOCAL_PREFIX: &str = "local://";
/// URI prefix of the S3-compatible backend.
pub const S3_PREFIX: &str = "s3://";
/// URI prefix of the Google Cloud Storage backend.
pub const GS_PREFIX: &str = "gs://";

/// Kind of storage backend, derived from a URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Local,
    S3,
    Gs,
}

impl BackendType {
    /// Classify a URI by its scheme prefix.
    pub fn parse(uri: &str) -> Option<Self> {
        if uri.starts_with(LOCAL_PREFIX) {
            Some(Self::Local)
        } else if uri.starts_with(S3_PREFIX) {
            Some(Self::S3)
        } else if uri.starts_with(GS_PREFIX) {
            Some(Self::Gs)
        } else {
            None
        }
    }

    /// The URI prefix for this type, including `://`.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Local => LOCAL_PREFIX,
            Self::S3 => S3_PREFIX,
            Self::Gs => GS_PREFIX,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::S3 => "s3",
            Self::Gs => "gs",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directory or file on the agent's own filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalBackend {
    pub path: String,
}

/// A key prefix inside an S3-compatible bucket.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Backend {
    pub bucket: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    /// Explicit endpoint for non-AWS services, e.g. `http://127.0.0.1:9000`.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub region: String,
}

impl fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("path", &self.path)
            .field("access_key", &self.access_key)
            .field("secret_key", &"[REDACTED]")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .finish()
    }
}

/// A key prefix inside a Google Cloud Storage bucket.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GsBackend {
    pub bucket: String,
    #[serde(default)]
    pub path: String,
    /// Inline service account JSON. Empty means discover from the environment.
    #[serde(default)]
    pub credentials: String,
}

impl fmt::Debug for GsBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let credentials = if self.credentials.is_empty() {
            ""
        } else {
            "[REDACTED]"
        };
        f.debug_struct("GsBackend")
            .field("bucket", &self.bucket)
            .field("path", &self.path)
            .field("credentials", &credentials)
            .finish()
    }
}

/// The populated variant of a [`Backend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Storage {
    Local(LocalBackend),
    S3(S3Backend),
    Gs(GsBackend),
}

/// Storage location descriptor with at most one populated variant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    storage: Option<Storage>,
}

impl Backend {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage: Some(storage),
        }
    }

    /// Create a local backend pointing at `path`.
    pub fn local(path: impl Into<String>) -> Self {
        Self::new(Storage::Local(LocalBackend { path: path.into() }))
    }

    /// Parse a URI into a fresh backend with no credentials.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let mut backend = Self::default();
        backend.set_uri(uri)?;
        Ok(backend)
    }

    pub fn storage(&self) -> Option<&Storage> {
        self.storage.as_ref()
    }

    pub fn as_local(&self) -> Option<&LocalBackend> {
        match &self.storage {
            Some(Storage::Local(local)) => Some(local),
            _ => None,
        }
    }

    pub fn as_s3(&self) -> Option<&S3Backend> {
        match &self.storage {
            Some(Storage::S3(s3)) => Some(s3),
            _ => None,
        }
    }

    pub fn as_gs(&self) -> Option<&GsBackend> {
        match &self.storage {
            Some(Storage::Gs(gs)) => Some(gs),
            _ => None,
        }
    }

    /// The type of the populated variant, if any.
    pub fn backend_type(&self) -> Option<BackendType> {
        self.storage.as_ref().map(|storage| match storage {
            Storage::Local(_) => BackendType::Local,
            Storage::S3(_) => BackendType::S3,
            Storage::Gs(_) => BackendType::Gs,
        })
    }

    /// The path component of the populated variant.
    pub fn path(&self) -> Option<&str> {
        self.storage.as_ref().map(|storage| match storage {
            Storage::Local(local) => local.path.as_str(),
            Storage::S3(s3) => s3.path.as_str(),
            Storage::Gs(gs) => gs.path.as_str(),
        })
    }

    /// Render the canonical URI. `None` if no variant is set.
    pub fn uri(&self) -> Option<String> {
        self.storage.as_ref().map(|storage| match storage {
            Storage::Local(local) => format!("{}{}", LOCAL_PREFIX, local.path),
            Storage::S3(s3) => format!("{}{}/{}", S3_PREFIX, s3.bucket, s3.path),
            Storage::Gs(gs) => format!("{}{}/{}", GS_PREFIX, gs.bucket, gs.path),
        })
    }

    /// Point this backend at `uri`.
    ///
    /// An unset backend takes the variant named by the URI scheme. A populated
    /// backend only accepts URIs of its own type; bucket and path are updated
    /// in place and every other field is preserved.
    ///
    /// # Errors
    /// - Unknown scheme or missing bucket
    /// - URI type differs from the populated variant
    pub fn set_uri(&mut self, uri: &str) -> Result<()> {
        let uri_type = BackendType::parse(uri)
            .ok_or_else(|| Error::InvalidUri(format!("unknown storage backend type: {}", uri)))?;

        if let Some(current) = self.backend_type() {
            if current != uri_type {
                return Err(Error::InvalidUri(format!(
                    "cannot set {} uri {} on a {} backend",
                    uri_type, uri, current
                )));
            }
        }

        match uri_type {
            BackendType::Local => {
                let path = uri[LOCAL_PREFIX.len()..].to_string();
                match &mut self.storage {
                    Some(Storage::Local(local)) => local.path = path,
                    _ => self.storage = Some(Storage::Local(LocalBackend { path })),
                }
            }
            BackendType::S3 => {
                let (bucket, path) = split_bucket_uri(uri, S3_PREFIX)?;
                match &mut self.storage {
                    Some(Storage::S3(s3)) => {
                        s3.bucket = bucket;
                        s3.path = path;
                    }
                    _ => {
                        self.storage = Some(Storage::S3(S3Backend {
                            bucket,
                            path,
                            ..Default::default()
                        }))
                    }
                }
            }
            BackendType::Gs => {
                let (bucket, path) = split_bucket_uri(uri, GS_PREFIX)?;
                match &mut self.storage {
                    Some(Storage::Gs(gs)) => {
                        gs.bucket = bucket;
                        gs.path = path;
                    }
                    _ => {
                        self.storage = Some(Storage::Gs(GsBackend {
                            bucket,
                            path,
                            ..Default::default()
                        }))
                    }
                }
            }
        }
        Ok(())
    }

    /// Copy of the active variant's data.
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }

    /// A copy of this backend pointed at `uri`; `self` is left untouched.
    pub fn repoint(&self, uri: &str) -> Result<Self> {
        let mut backend = self.deep_copy();
        backend.set_uri(uri)?;
        Ok(backend)
    }
}

impl From<LocalBackend> for Backend {
    fn from(local: LocalBackend) -> Self {
        Self::new(Storage::Local(local))
    }
}

impl From<S3Backend> for Backend {
    fn from(s3: S3Backend) -> Self {
        Self::new(Storage::S3(s3))
    }
}

impl From<GsBackend> for Backend {
    fn from(gs: GsBackend) -> Self {
        Self::new(Storage::Gs(gs))
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.uri() {
            Some(uri) => f.write_str(&uri),
            None => f.write_str("<unset>"),
        }
    }
}

/// Split `<prefix><bucket>/<path>` into bucket and path.
fn split_bucket_uri(uri: &str, prefix: &str) -> Result<(String, String)> {
    let rest = &uri[prefix.len()..];
    let (bucket, path) = rest.split_once('/').unwrap_or((rest, ""));
    let bucket = bucket.trim_end_matches(' ');
    if bucket.is_empty() {
        return Err(Error::InvalidUri(format!("missing bucket in uri: {}", uri)));
    }
    let path = path.trim_start_matches(['/', ' ']);
    Ok((bucket.to_string(), path.to_string()))
}
