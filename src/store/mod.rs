//! Shared keyed store with change notification.
//!
//! The store is the single mutable resource shared between session
//! orchestrator instances ("tabs"). Any handle may write; the most recent
//! write wins. Change notifications are delivered to subscribers on *other*
//! handles of the same store, with no ordering guarantee beyond eventual
//! visibility — the writing handle already saw its own write synchronously.

mod file;
mod memory;

pub use file::FileTokenStore;
pub use memory::MemoryTokenStore;

use tokio::sync::broadcast;

/// Persisted key layout. Values are opaque strings; `user` holds a
/// JSON-encoded profile and `expires_at` a decimal epoch-ms timestamp.
pub mod keys {
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const REFRESH_TOKEN: &str = "refresh_token";
    pub const USER: &str = "user";
    pub const EXPIRES_AT: &str = "expires_at";
    pub const SESSION_ID: &str = "session_id";

    /// Every key the session subsystem persists, in clearing order.
    pub const CREDENTIAL_KEYS: [&str; 5] =
        [ACCESS_TOKEN, REFRESH_TOKEN, USER, EXPIRES_AT, SESSION_ID];
}

/// Notification that another handle changed a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
}

impl StoreChange {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// Whether this change touches one of the persisted credential keys.
    pub fn is_credential_key(&self) -> bool {
        keys::CREDENTIAL_KEYS.contains(&self.key.as_str())
    }
}

/// A persistent, synchronous key-value accessor for credential fields.
///
/// No validation or business logic lives here: malformed values are
/// returned as-is and callers must validate. Values persist until
/// explicitly removed. Implementations log and swallow their own I/O
/// failures, degrading to "no value", which mirrors the best-effort
/// contract of browser storage.
pub trait TokenStore: Send + Sync {
    /// Read the current value for a key.
    fn get(&self, key: &str) -> Option<String>;

    /// Write a value, visible to this handle immediately and to other
    /// handles via their change subscription. Writing the value a key
    /// already holds is a no-op and produces no notification.
    fn set(&self, key: &str, value: &str);

    /// Remove a key. Removing an absent key is a no-op.
    fn remove(&self, key: &str);

    /// Subscribe to changes made through other handles of this store.
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}
