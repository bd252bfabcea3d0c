use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::trace;

use super::{StoreChange, TokenStore};

/// Capacity of each handle's notification channel.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

struct SharedMap {
    map: RwLock<HashMap<String, String>>,
    /// One notification channel per handle, keyed by handle id so a writer
    /// can skip itself.
    channels: Mutex<Vec<(u64, broadcast::Sender<StoreChange>)>>,
    next_handle: AtomicU64,
}

/// In-process [`TokenStore`] backed by a shared map.
///
/// Each value returned by [`handle`](MemoryTokenStore::handle) stands in
/// for another tab of the same origin: it reads and writes the same map,
/// and its writes are announced to every handle except itself.
pub struct MemoryTokenStore {
    shared: Arc<SharedMap>,
    handle_id: u64,
    tx: broadcast::Sender<StoreChange>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        let shared = Arc::new(SharedMap {
            map: RwLock::new(HashMap::new()),
            channels: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(0),
        });
        Self::attach(shared)
    }

    /// Open another handle onto the same underlying map.
    pub fn handle(&self) -> Self {
        Self::attach(Arc::clone(&self.shared))
    }

    fn attach(shared: Arc<SharedMap>) -> Self {
        let handle_id = shared.next_handle.fetch_add(1, Ordering::Relaxed);
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        shared.channels.lock().push((handle_id, tx.clone()));
        Self {
            shared,
            handle_id,
            tx,
        }
    }

    fn notify_others(&self, key: &str) {
        let channels = self.shared.channels.lock();
        for (id, tx) in channels.iter() {
            if *id != self.handle_id {
                // Send failures just mean that handle has no live subscriber.
                let _ = tx.send(StoreChange::new(key));
            }
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Option<String> {
        self.shared.map.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let prev = self
            .shared
            .map
            .write()
            .insert(key.to_string(), value.to_string());
        // Writing an identical value changes nothing and stays silent.
        if prev.as_deref() != Some(value) {
            trace!(handle = self.handle_id, key, "memory store write");
            self.notify_others(key);
        }
    }

    fn remove(&self, key: &str) {
        let removed = self.shared.map.write().remove(key).is_some();
        if removed {
            trace!(handle = self.handle_id, key, "memory store remove");
            self.notify_others(key);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.tx.subscribe()
    }
}

impl Default for MemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryTokenStore {
    fn drop(&mut self) {
        // Writers iterate the channel list; a dead handle must not linger.
        self.shared
            .channels
            .lock()
            .retain(|(id, _)| *id != self.handle_id);
    }
}
