//! Shared key/value storage with change notifications.
//!
//! Everything the session layer persists (token copies, user snapshot,
//! logout marker) lives behind the `StorageBackend` trait so the mechanism
//! is swappable per platform. `SharedStorage` wraps a backend with a
//! broadcast bus: every mutation publishes a `StorageEvent`, and sibling
//! handles (`new_handle`) model other tabs or windows sharing the same
//! store. A handle never observes its own writes through the bus, matching
//! the semantics of browser storage events.

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use crate::error::StorageError;

/// Well-known storage keys shared by every context of the client.
pub mod keys {
    /// Primary token location, first in priority order.
    pub const TOKEN_PRIMARY: &str = "token.primary";
    /// First fallback token location.
    pub const TOKEN_BACKUP: &str = "token.backup";
    /// Last-resort token location.
    pub const TOKEN_RECOVERY: &str = "token.recovery";
    /// Serialized `SessionUser` snapshot for optimistic rendering.
    pub const USER_SNAPSHOT: &str = "user.snapshot";
    /// Transient marker set while logout cleanup runs.
    pub const LOGGING_OUT: &str = "session.loggingOut";
}

/// Buffer size for the change-notification bus.
/// A lagging subscriber skips old events rather than blocking writers.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Raw storage mechanism: string values under string keys.
pub trait StorageBackend: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn write(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// A single observed mutation of the shared store.
#[derive(Debug, Clone)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    /// Handle that performed the write; subscribers skip their own.
    pub origin: u64,
}

struct StorageCore {
    backend: Arc<dyn StorageBackend>,
    events: broadcast::Sender<StorageEvent>,
    next_origin: AtomicU64,
}

/// Handle to the shared store as seen from one context.
///
/// `Clone` keeps the same origin (same context); `new_handle` mints a
/// sibling with a fresh origin, standing in for another tab.
#[derive(Clone)]
pub struct SharedStorage {
    core: Arc<StorageCore>,
    origin: u64,
}

impl SharedStorage {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            core: Arc::new(StorageCore {
                backend,
                events,
                next_origin: AtomicU64::new(1),
            }),
            origin: 0,
        }
    }

    /// In-process store, the default for tests and single-context use.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// Durable store under `dir`, shared by every context of the client on
    /// this machine.
    pub fn on_disk(dir: PathBuf) -> Result<Self, StorageError> {
        Ok(Self::new(Arc::new(FileStorage::new(dir)?)))
    }

    /// A sibling handle over the same backing store, as seen from another
    /// context (tab, window, helper process).
    pub fn new_handle(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            origin: self.core.next_origin.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn origin(&self) -> u64 {
        self.origin
    }

    /// Read a value. Backend failures degrade to "missing": they are
    /// logged, never propagated.
    pub fn get(&self, key: &str) -> Option<String> {
        match self.core.backend.read(key) {
            Ok(value) => value,
            Err(e) => {
                debug!(key, error = %e, "Storage read failed, treating as missing");
                None
            }
        }
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let old_value = self.core.backend.read(key).ok().flatten();
        self.core.backend.write(key, value)?;
        self.publish(key, old_value, Some(value.to_string()));
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<(), StorageError> {
        let old_value = self.core.backend.read(key).ok().flatten();
        self.core.backend.remove(key)?;
        if old_value.is_some() {
            self.publish(key, old_value, None);
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.core.events.subscribe()
    }

    fn publish(&self, key: &str, old_value: Option<String>, new_value: Option<String>) {
        // Send only fails when nobody is subscribed, which is fine.
        let _ = self.core.events.send(StorageEvent {
            key: key.to_string(),
            old_value,
            new_value,
            origin: self.origin,
        });
    }
}
