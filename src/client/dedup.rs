//! Duplicate detection for inbound messages, keyed by message ID and peer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hashbrown::HashMap;
use log::trace;
use tokio::task::JoinHandle;

use crate::client::exchange::{Exchange, KeyId};

/// Concurrent map from message key to the exchange that first claimed it.  A periodic
/// mark-and-sweep task evicts entries that fell off the exchange-lifetime horizon; readers
/// treat a missing entry as "no duplicate".
pub(crate) struct Deduplicator {
    entries: Arc<Mutex<HashMap<KeyId, Arc<Exchange>>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            sweeper: Mutex::new(None),
        }
    }

    /// Atomically insert-or-replace, returning whatever was present under the key before
    /// the call.  Two receive paths racing on the same message ID therefore agree on which
    /// copy was first.
    pub fn find_previous(&self, key: KeyId, exchange: &Arc<Exchange>) -> Option<Arc<Exchange>> {
        self.entries.lock().unwrap().insert(key, exchange.clone())
    }

    pub fn find(&self, key: &KeyId) -> Option<Arc<Exchange>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Start the sweep task.  Restarting replaces any previous sweeper.
    pub fn start(&self, interval: Duration, lifetime: Duration) {
        let entries = self.entries.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let mut entries = entries.lock().unwrap();
                let before = entries.len();
                entries.retain(|_, exchange| exchange.age() <= lifetime);
                let evicted = before - entries.len();
                if evicted > 0 {
                    trace!("Dedup sweep evicted {evicted} of {before} entries");
                }
            }
        });
        if let Some(old) = self.sweeper.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for Deduplicator {
    fn drop(&mut self) {
        self.stop();
    }
}
