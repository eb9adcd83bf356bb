//! Domain Ports - Core trait definitions for the operator
//!
//! These traits define the boundaries between the lifecycle logic and
//! external systems: the shared key-value registry, the remote command
//! runner, and the filesystem recipes. Adapters implement these traits to
//! provide concrete functionality; tests substitute in-memory and
//! recording variants.

use crate::error::Result;
use crate::model::{Attachment, BrickAllocation, Volume};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Key-Value Types
// =============================================================================

/// A key/value pair to be created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A key/value pair together with the version it was read at
///
/// The version counts modifications of the key, starting at 1 on creation;
/// version 0 means "the key must not exist" in transaction compares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueVersion {
    pub key: String,
    pub value: String,
    pub version: i64,
}

/// One committed change under a watched key or prefix
///
/// `old` is absent for creations, `new` is absent for deletions.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub old: Option<KeyValueVersion>,
    pub new: Option<KeyValueVersion>,
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .map(|kv| kv.key.as_str())
            .unwrap_or_default()
    }

    pub fn is_create(&self) -> bool {
        self.old.is_none() && self.new.is_some()
    }

    pub fn is_delete(&self) -> bool {
        self.new.is_none()
    }
}

/// Ordered stream of watch events for one subscription
pub type WatchStream = mpsc::UnboundedReceiver<WatchEvent>;

// =============================================================================
// Transaction
// =============================================================================

/// A multi-key transaction: every guard must pass before any write lands
///
/// `creates` fail the whole transaction with `AlreadyExists` when a key is
/// present; `updates` and `deletes` fail with `Conflict` on a version
/// mismatch.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pub creates: Vec<KeyValue>,
    pub updates: Vec<KeyValueVersion>,
    pub deletes: Vec<KeyValueVersion>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.creates.push(KeyValue::new(key, value));
        self
    }

    pub fn update(mut self, kv: KeyValueVersion) -> Self {
        self.updates.push(kv);
        self
    }

    pub fn delete(mut self, kv: KeyValueVersion) -> Self {
        self.deletes.push(kv);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

// =============================================================================
// Keystore Port
// =============================================================================

/// Handle for a leased liveness key; the key survives only while the
/// handle is held and renewals keep succeeding
pub trait LeaseKeeper: Send + Sync {
    fn key(&self) -> &str;
}

/// A distributed mutex scoped to one key
///
/// Acquire blocks until granted; release is idempotent.
#[async_trait]
pub trait DistributedMutex: Send {
    async fn lock(&mut self) -> Result<()>;
    async fn unlock(&mut self) -> Result<()>;
}

/// Port for the strongly consistent key/value registry
///
/// Operations on distinct keys are linearizable. A watcher that subscribes
/// at version V observes every commit ≥ V for its key or prefix exactly
/// once, in commit order.
#[async_trait]
pub trait Keystore: Send + Sync {
    /// Read one key; fails with `NotFound`
    async fn get(&self, key: &str) -> Result<KeyValueVersion>;

    /// Read every key under a prefix, ordered by key
    async fn get_all(&self, prefix: &str) -> Result<Vec<KeyValueVersion>>;

    /// Commit a guarded multi-key transaction
    async fn txn(&self, txn: Transaction) -> Result<()>;

    /// Atomic multi-put that fails with `AlreadyExists` if any key exists
    async fn add(&self, items: Vec<KeyValue>) -> Result<()> {
        self.txn(Transaction {
            creates: items,
            ..Transaction::default()
        })
        .await
    }

    /// Atomic multi-put with per-key expected-version check
    async fn update(&self, items: Vec<KeyValueVersion>) -> Result<()> {
        self.txn(Transaction {
            updates: items,
            ..Transaction::default()
        })
        .await
    }

    /// Atomic multi-delete with expected-version check
    async fn delete_all(&self, items: Vec<KeyValueVersion>) -> Result<()> {
        self.txn(Transaction {
            deletes: items,
            ..Transaction::default()
        })
        .await
    }

    /// Subscribe to commits under `key` (or the whole prefix); events are
    /// pushed until the token is cancelled
    async fn watch(
        &self,
        cancel: &CancellationToken,
        key: &str,
        with_prefix: bool,
    ) -> Result<WatchStream>;

    /// Place a value under `key` bound to a lease; the key auto-deletes on
    /// missed renewals or when the returned handle is dropped
    async fn keep_alive(&self, key: &str) -> Result<Box<dyn LeaseKeeper>>;

    /// Create a distributed mutex scoped to `key`
    async fn new_mutex(&self, key: &str) -> Result<Box<dyn DistributedMutex>>;

    /// Bulk delete used only at teardown
    async fn clean_prefix(&self, prefix: &str) -> Result<()>;
}

pub type KeystoreRef = Arc<dyn Keystore>;

// =============================================================================
// Command Runner Port
// =============================================================================

/// Port for running a privileged command on a remote host
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn execute(&self, hostname: &str, command: &str) -> Result<()>;
}

pub type CommandRunnerRef = Arc<dyn CommandRunner>;

// =============================================================================
// Filesystem Driver Port
// =============================================================================

/// Port for attaching and detaching a provisioned filesystem on compute
/// nodes, dispatching the per-filesystem recipe internally
#[async_trait]
pub trait FilesystemDriver: Send + Sync {
    /// Perform the attach work for every attachment in `RequestAttach`
    async fn mount(
        &self,
        volume: &Volume,
        bricks: &[BrickAllocation],
        attachments: &[Attachment],
    ) -> Result<()>;

    /// Perform the detach work for every attachment in `RequestDetach`
    async fn umount(
        &self,
        volume: &Volume,
        bricks: &[BrickAllocation],
        attachments: &[Attachment],
    ) -> Result<()>;
}

pub type FilesystemDriverRef = Arc<dyn FilesystemDriver>;
