use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{StoreChange, TokenStore};

/// Capacity of the watcher's notification channel.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// [`TokenStore`] backed by a JSON file shared between processes.
///
/// Writes are load-modify-write with an atomic rename, so concurrent
/// writers interleave at whole-key granularity (last writer wins). A
/// polling watcher diffs the file against the last snapshot this handle
/// saw and announces foreign changes per key; local writes update the
/// snapshot first and are therefore never self-announced.
pub struct FileTokenStore {
    path: PathBuf,
    /// Last file contents this handle observed, used by the watcher to
    /// detect foreign writes.
    snapshot: Arc<Mutex<HashMap<String, String>>>,
    tx: broadcast::Sender<StoreChange>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl FileTokenStore {
    /// Open a store at the given path. The file is created lazily on the
    /// first write; a missing file reads as empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let initial = load_map(&path)
            .with_context(|| format!("reading token store {}", path.display()))?;
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            path,
            snapshot: Arc::new(Mutex::new(initial)),
            tx,
            watcher: Mutex::new(None),
        })
    }

    /// Start the polling watcher that surfaces writes made by other
    /// processes. Requires a tokio runtime; idempotent.
    pub fn start_watcher(&self, poll_interval: Duration) {
        let mut guard = self.watcher.lock();
        if guard.is_some() {
            return;
        }
        let path = self.path.clone();
        let snapshot = Arc::clone(&self.snapshot);
        let tx = self.tx.clone();
        debug!(path = %path.display(), ?poll_interval, "starting token store watcher");
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let current = match load_map(&path) {
                    Ok(map) => map,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "token store poll failed");
                        continue;
                    }
                };
                let changed = {
                    let mut seen = snapshot.lock();
                    let changed = diff_keys(&seen, &current);
                    *seen = current;
                    changed
                };
                for key in changed {
                    trace!(key = %key, "foreign token store change");
                    let _ = tx.send(StoreChange::new(key));
                }
            }
        }));
    }

    /// Stop the polling watcher, if running.
    pub fn stop_watcher(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate(&self, f: impl Fn(&mut HashMap<String, String>) -> bool) {
        let mut seen = self.snapshot.lock();
        let mut map = match load_map(&self.path) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "token store read failed, rewriting from snapshot");
                seen.clone()
            }
        };
        if !f(&mut map) {
            return;
        }
        if let Err(e) = persist_map(&self.path, &map) {
            warn!(path = %self.path.display(), error = %e, "token store write failed");
            return;
        }
        // Only the written keys move into the snapshot; foreign keys keep
        // their last-seen values so the watcher still reports them.
        f(&mut seen);
    }
}

impl TokenStore for FileTokenStore {
    fn get(&self, key: &str) -> Option<String> {
        match load_map(&self.path) {
            Ok(map) => map.get(key).cloned(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "token store read failed");
                self.snapshot.lock().get(key).cloned()
            }
        }
    }

    fn set(&self, key: &str, value: &str) {
        self.mutate(|map| {
            map.insert(key.to_string(), value.to_string()).as_deref() != Some(value)
        });
    }

    fn remove(&self, key: &str) {
        self.mutate(|map| map.remove(key).is_some());
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.tx.subscribe()
    }
}

impl Drop for FileTokenStore {
    fn drop(&mut self) {
        self.stop_watcher();
    }
}

fn load_map(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(HashMap::new());
    }
    serde_json::from_str(&raw).context("token store file is not a JSON object of strings")
}

fn persist_map(path: &Path, map: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(map)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn diff_keys(before: &HashMap<String, String>, after: &HashMap<String, String>) -> Vec<String> {
    let mut changed = Vec::new();
    for (key, value) in after {
        if before.get(key) != Some(value) {
            changed.push(key.clone());
        }
    }
    for key in before.keys() {
        if !after.contains_key(key) {
            changed.push(key.clone());
        }
    }
    changed
}
