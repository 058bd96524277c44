//! Storage registry and per-session storage cache.

use lru::LruCache;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::gs::GsStorage;
use crate::limiter::RateLimiter;
use crate::local::LocalStorage;
use crate::provider::ExternalStorage;
use crate::s3::S3Storage;
use graphagent_common::{Backend, BackendType, Error, Result, Storage};

/// Factory function type for creating storages.
pub type StorageFactory = Box<dyn Fn(&Backend) -> Result<Arc<dyn ExternalStorage>> + Send + Sync>;

/// Registry of storage factories keyed by backend type.
pub struct StorageRegistry {
    factories: HashMap<BackendType, StorageFactory>,
}

impl StorageRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register the factory for `backend_type`.
    ///
    /// # Postconditions
    /// - `has_backend(backend_type)` returns true
    ///
    /// # Errors
    /// - Returns error if the type is already registered
    pub fn register(&mut self, backend_type: BackendType, factory: StorageFactory) -> Result<()> {
        if self.factories.contains_key(&backend_type) {
            return Err(Error::AlreadyExists(format!(
                "storage '{}' is already registered",
                backend_type
            )));
        }
        self.factories.insert(backend_type, factory);
        Ok(())
    }

    /// Build a storage for `backend`.
    ///
    /// # Errors
    /// - Backend is unset
    /// - No factory registered for its type
    /// - Client construction failed
    pub fn resolve(&self, backend: &Backend) -> Result<Arc<dyn ExternalStorage>> {
        let backend_type = backend
            .backend_type()
            .ok_or_else(|| Error::InvalidUri("unknown storage backend type".to_string()))?;
        let factory = self.factories.get(&backend_type).ok_or_else(|| {
            Error::Unsupported(format!("storage '{}' is not registered", backend_type))
        })?;
        factory(backend)
    }

    /// Check if a backend type is registered.
    pub fn has_backend(&self, backend_type: BackendType) -> bool {
        self.factories.contains_key(&backend_type)
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the local, S3 and GS storages, all sharing
/// `limiter`.
pub fn create_default_registry(limiter: Arc<RateLimiter>, queue_depth: usize) -> StorageRegistry {
    let mut registry = StorageRegistry::new();

    let local_limiter = limiter.clone();
    registry
        .register(
            BackendType::Local,
            Box::new(move |_: &Backend| -> Result<Arc<dyn ExternalStorage>> {
                Ok(Arc::new(LocalStorage::new(local_limiter.clone())))
            }),
        )
        .expect("Failed to register local storage");

    let s3_limiter = limiter.clone();
    registry
        .register(
            BackendType::S3,
            Box::new(move |backend: &Backend| -> Result<Arc<dyn ExternalStorage>> {
                Ok(Arc::new(S3Storage::new(backend, s3_limiter.clone(), queue_depth)?))
            }),
        )
        .expect("Failed to register s3 storage");

    registry
        .register(
            BackendType::Gs,
            Box::new(move |backend: &Backend| -> Result<Arc<dyn ExternalStorage>> {
                Ok(Arc::new(GsStorage::new(backend, limiter.clone(), queue_depth)?))
            }),
        )
        .expect("Failed to register gs storage");

    registry
}

/// Identity of the client configuration a backend needs; the path is
/// excluded since every call repoints it.
fn fingerprint(backend: &Backend) -> u64 {
    let mut hasher = DefaultHasher::new();
    match backend.storage() {
        Some(Storage::Local(_)) => BackendType::Local.hash(&mut hasher),
        Some(Storage::S3(s3)) => {
            BackendType::S3.hash(&mut hasher);
            s3.bucket.hash(&mut hasher);
            s3.endpoint.hash(&mut hasher);
            s3.region.hash(&mut hasher);
            s3.access_key.hash(&mut hasher);
            s3.secret_key.hash(&mut hasher);
        }
        Some(Storage::Gs(gs)) => {
            BackendType::Gs.hash(&mut hasher);
            gs.bucket.hash(&mut hasher);
            gs.credentials.hash(&mut hasher);
        }
        None => {}
    }
    hasher.finish()
}

struct SessionEntry {
    fingerprint: u64,
    storage: Arc<dyn ExternalStorage>,
}

/// Bounded cache of storages keyed by caller session id.
///
/// Repeated requests of one session reuse the same client. The least
/// recently used session is dropped once the capacity is exceeded.
pub struct SessionCache {
    registry: StorageRegistry,
    sessions: Mutex<LruCache<String, SessionEntry>>,
}

impl SessionCache {
    /// Default number of cached sessions.
    pub const DEFAULT_CAPACITY: usize = 32;

    /// Create an empty cache over `registry`.
    ///
    /// # Preconditions
    /// - `capacity` is positive
    ///
    /// # Errors
    /// - Returns [`Error::Config`] for a zero capacity
    pub fn new(registry: StorageRegistry, capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| Error::Config("session cache capacity must be positive".to_string()))?;
        Ok(Self {
            registry,
            sessions: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// The storage of `session_id`, built from `backend` on first use.
    ///
    /// A cached entry created from a different client configuration is
    /// rebuilt.
    pub fn get_or_create(
        &self,
        session_id: &str,
        backend: &Backend,
    ) -> Result<Arc<dyn ExternalStorage>> {
        let fingerprint = fingerprint(backend);
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = sessions.get(session_id) {
            if entry.fingerprint == fingerprint {
                return Ok(entry.storage.clone());
            }
            debug!("Backend of session {} changed, rebuilding storage", session_id);
        }

        let storage = self.registry.resolve(backend)?;
        debug!("Created {} storage for session {}", storage.name(), session_id);

        let entry = SessionEntry {
            fingerprint,
            storage: storage.clone(),
        };
        if let Some((evicted, _)) = sessions.push(session_id.to_string(), entry) {
            if evicted != session_id {
                warn!("Session {} evicted from storage cache", evicted);
            }
        }
        Ok(storage)
    }

    /// Drop the cached storage of `session_id`.
    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop(session_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
