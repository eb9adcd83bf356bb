//! In-Memory Keystore
//!
//! A single-process implementation of the registry port for tests,
//! dry-runs, and single-node development. Commits are linearized under one
//! lock; watchers registered under that same lock observe every later
//! commit in order, which is what the subscribe-before-read pattern in the
//! waiters relies on. Leases can be expired manually to inject dead-host
//! failures.

use crate::domain::ports::{
    DistributedMutex, KeyValueVersion, Keystore, LeaseKeeper, Transaction, WatchEvent, WatchStream,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    version: i64,
}

struct Watcher {
    key: String,
    with_prefix: bool,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl Watcher {
    fn wants(&self, key: &str) -> bool {
        if self.with_prefix {
            key.starts_with(&self.key)
        } else {
            key == self.key
        }
    }
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    watchers: Vec<Watcher>,
}

impl State {
    fn kv(&self, key: &str) -> Option<KeyValueVersion> {
        self.entries.get(key).map(|e| KeyValueVersion {
            key: key.to_string(),
            value: e.value.clone(),
            version: e.version,
        })
    }

    fn notify(&mut self, event: WatchEvent) {
        self.watchers.retain(|w| {
            if w.cancel.is_cancelled() {
                return false;
            }
            if !w.wants(event.key()) {
                return true;
            }
            w.tx.send(event.clone()).is_ok()
        });
    }

    fn put(&mut self, key: &str, value: &str) {
        let old = self.kv(key);
        let version = old.as_ref().map(|kv| kv.version + 1).unwrap_or(1);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                version,
            },
        );
        let new = self.kv(key);
        self.notify(WatchEvent { old, new });
    }

    fn remove(&mut self, key: &str) {
        let old = self.kv(key);
        if old.is_some() {
            self.entries.remove(key);
            self.notify(WatchEvent { old, new: None });
        }
    }
}

// =============================================================================
// Memory Keystore
// =============================================================================

/// In-process registry with full watch, lease, and mutex support
#[derive(Clone, Default)]
pub struct MemoryKeystore {
    state: Arc<Mutex<State>>,
    mutexes: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a leased key as if its renewals stopped arriving, regardless
    /// of any live handle. Failure injection for dead-host tests.
    pub fn expire_lease(&self, key: &str) {
        trace!(key, "expiring lease");
        self.state.lock().remove(key);
    }
}

#[async_trait]
impl Keystore for MemoryKeystore {
    async fn get(&self, key: &str) -> Result<KeyValueVersion> {
        self.state
            .lock()
            .kv(key)
            .ok_or_else(|| Error::not_found(key))
    }

    async fn get_all(&self, prefix: &str) -> Result<Vec<KeyValueVersion>> {
        let state = self.state.lock();
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValueVersion {
                key: k.clone(),
                value: e.value.clone(),
                version: e.version,
            })
            .collect())
    }

    async fn txn(&self, txn: Transaction) -> Result<()> {
        let mut state = self.state.lock();

        // all guards are checked before any write lands
        for kv in &txn.creates {
            if state.entries.contains_key(&kv.key) {
                return Err(Error::AlreadyExists {
                    key: kv.key.clone(),
                });
            }
        }
        for kv in txn.updates.iter().chain(txn.deletes.iter()) {
            match state.entries.get(&kv.key) {
                Some(entry) if entry.version == kv.version => {}
                _ => return Err(Error::conflict(&kv.key)),
            }
        }

        for kv in &txn.creates {
            state.put(&kv.key, &kv.value);
        }
        for kv in &txn.updates {
            state.put(&kv.key, &kv.value);
        }
        for kv in &txn.deletes {
            state.remove(&kv.key);
        }
        Ok(())
    }

    async fn watch(
        &self,
        cancel: &CancellationToken,
        key: &str,
        with_prefix: bool,
    ) -> Result<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().watchers.push(Watcher {
            key: key.to_string(),
            with_prefix,
            cancel: cancel.clone(),
            tx,
        });
        Ok(rx)
    }

    async fn keep_alive(&self, key: &str) -> Result<Box<dyn LeaseKeeper>> {
        self.state.lock().put(key, "");
        Ok(Box::new(MemoryLease {
            key: key.to_string(),
            state: Arc::clone(&self.state),
        }))
    }

    async fn new_mutex(&self, key: &str) -> Result<Box<dyn DistributedMutex>> {
        let mutex = {
            let mut mutexes = self.mutexes.lock();
            Arc::clone(
                mutexes
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        Ok(Box::new(MemoryMutex { mutex, guard: None }))
    }

    async fn clean_prefix(&self, prefix: &str) -> Result<()> {
        let keys: Vec<String> = {
            let state = self.state.lock();
            state
                .entries
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone())
                .collect()
        };
        let mut state = self.state.lock();
        for key in keys {
            state.remove(&key);
        }
        Ok(())
    }
}

// =============================================================================
// Lease and Mutex
// =============================================================================

struct MemoryLease {
    key: String,
    state: Arc<Mutex<State>>,
}

impl LeaseKeeper for MemoryLease {
    fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        self.state.lock().remove(&self.key);
    }
}

struct MemoryMutex {
    mutex: Arc<tokio::sync::Mutex<()>>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

#[async_trait]
impl DistributedMutex for MemoryMutex {
    async fn lock(&mut self) -> Result<()> {
        if self.guard.is_none() {
            self.guard = Some(Arc::clone(&self.mutex).lock_owned().await);
        }
        Ok(())
    }

    async fn unlock(&mut self) -> Result<()> {
        self.guard.take();
        Ok(())
    }
}
