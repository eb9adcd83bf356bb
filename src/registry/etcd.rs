//! Etcd Keystore
//!
//! Production implementation of the registry port over etcd v3: guarded
//! transactions map to version compares, watches carry previous values,
//! liveness uses leases with a background keep-alive task, and the
//! allocator mutex uses the etcd lock service.

use crate::domain::ports::{
    DistributedMutex, KeyValueVersion, Keystore, LeaseKeeper, Transaction, WatchEvent, WatchStream,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, EventType, GetOptions, LockOptions, PutOptions,
    Txn, TxnOp, WatchOptions,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lease TTL for liveness keys; renewals run at a third of this
const LEASE_TTL_SECS: i64 = 10;

/// Lease TTL bounding how long a crashed holder can pin the lock service
const MUTEX_LEASE_TTL_SECS: i64 = 60;

fn keystore_err(err: etcd_client::Error) -> Error {
    Error::Keystore(err.to_string())
}

fn to_kv(kv: &etcd_client::KeyValue) -> Result<KeyValueVersion> {
    Ok(KeyValueVersion {
        key: kv.key_str().map_err(keystore_err)?.to_string(),
        value: kv.value_str().map_err(keystore_err)?.to_string(),
        version: kv.version(),
    })
}

// =============================================================================
// Etcd Keystore
// =============================================================================

/// Registry backed by an etcd v3 cluster
#[derive(Clone)]
pub struct EtcdKeystore {
    client: Client,
}

impl EtcdKeystore {
    pub async fn connect(endpoints: Vec<String>) -> Result<Self> {
        let client = Client::connect(endpoints, None).await.map_err(keystore_err)?;
        Ok(Self { client })
    }

    /// Work out which guard made a failed transaction miss, so callers get
    /// the taxonomic kind they can act on
    async fn classify_txn_failure(&self, txn: &Transaction) -> Error {
        let mut client = self.client.clone();
        for kv in &txn.creates {
            if let Ok(resp) = client.get(kv.key.as_str(), None).await {
                if !resp.kvs().is_empty() {
                    return Error::AlreadyExists {
                        key: kv.key.clone(),
                    };
                }
            }
        }
        for kv in txn.updates.iter().chain(txn.deletes.iter()) {
            match client.get(kv.key.as_str(), None).await {
                Ok(resp) => {
                    let current = resp.kvs().first().map(|kv| kv.version()).unwrap_or(0);
                    if current != kv.version {
                        return Error::conflict(&kv.key);
                    }
                }
                Err(err) => return keystore_err(err),
            }
        }
        let key = txn
            .updates
            .first()
            .or_else(|| txn.deletes.first())
            .map(|kv| kv.key.clone())
            .or_else(|| txn.creates.first().map(|kv| kv.key.clone()))
            .unwrap_or_default();
        Error::conflict(key)
    }
}

#[async_trait]
impl Keystore for EtcdKeystore {
    async fn get(&self, key: &str) -> Result<KeyValueVersion> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await.map_err(keystore_err)?;
        match resp.kvs().first() {
            Some(kv) => to_kv(kv),
            None => Err(Error::not_found(key)),
        }
    }

    async fn get_all(&self, prefix: &str) -> Result<Vec<KeyValueVersion>> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(keystore_err)?;
        let mut out = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            out.push(to_kv(kv)?);
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn txn(&self, txn: Transaction) -> Result<()> {
        if txn.is_empty() {
            return Ok(());
        }
        let mut compares = Vec::new();
        let mut ops = Vec::new();

        for kv in &txn.creates {
            compares.push(Compare::version(kv.key.as_str(), CompareOp::Equal, 0));
            ops.push(TxnOp::put(kv.key.as_str(), kv.value.as_str(), None));
        }
        for kv in &txn.updates {
            compares.push(Compare::version(
                kv.key.as_str(),
                CompareOp::Equal,
                kv.version,
            ));
            ops.push(TxnOp::put(kv.key.as_str(), kv.value.as_str(), None));
        }
        for kv in &txn.deletes {
            compares.push(Compare::version(
                kv.key.as_str(),
                CompareOp::Equal,
                kv.version,
            ));
            ops.push(TxnOp::delete(kv.key.as_str(), None));
        }

        let mut client = self.client.clone();
        let resp = client
            .txn(Txn::new().when(compares).and_then(ops))
            .await
            .map_err(keystore_err)?;
        if resp.succeeded() {
            Ok(())
        } else {
            Err(self.classify_txn_failure(&txn).await)
        }
    }

    async fn watch(
        &self,
        cancel: &CancellationToken,
        key: &str,
        with_prefix: bool,
    ) -> Result<WatchStream> {
        let mut options = WatchOptions::new().with_prev_key();
        if with_prefix {
            options = options.with_prefix();
        }
        let mut client = self.client.clone();
        let (mut watcher, mut stream) = client
            .watch(key, Some(options))
            .await
            .map_err(keystore_err)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = stream.message() => match msg {
                        Ok(Some(resp)) => {
                            for event in resp.events() {
                                let old = event.prev_kv().and_then(|kv| to_kv(kv).ok());
                                let new = match event.event_type() {
                                    EventType::Put => event.kv().and_then(|kv| to_kv(kv).ok()),
                                    EventType::Delete => None,
                                };
                                if tx.send(WatchEvent { old, new }).is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(error = %err, "etcd watch stream failed");
                            break;
                        }
                    },
                }
            }
            let _ = watcher.cancel().await;
        });
        Ok(rx)
    }

    async fn keep_alive(&self, key: &str) -> Result<Box<dyn LeaseKeeper>> {
        let mut client = self.client.clone();
        let lease_id = client
            .lease_grant(LEASE_TTL_SECS, None)
            .await
            .map_err(keystore_err)?
            .id();
        client
            .put(key, "", Some(PutOptions::new().with_lease(lease_id)))
            .await
            .map_err(keystore_err)?;

        let (mut keeper, mut responses) = client
            .lease_keep_alive(lease_id)
            .await
            .map_err(keystore_err)?;
        let renew_key = key.to_string();
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(LEASE_TTL_SECS as u64 / 3));
            loop {
                tick.tick().await;
                if keeper.keep_alive().await.is_err() {
                    warn!(key = %renew_key, "lease renewal failed");
                    break;
                }
                match responses.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        debug!(key = %renew_key, ttl = resp.ttl(), "lease renewed");
                    }
                    _ => {
                        warn!(key = %renew_key, "lease expired or stream closed");
                        break;
                    }
                }
            }
        });

        Ok(Box::new(EtcdLease {
            key: key.to_string(),
            lease_id,
            client: self.client.clone(),
            task,
        }))
    }

    async fn new_mutex(&self, key: &str) -> Result<Box<dyn DistributedMutex>> {
        Ok(Box::new(EtcdMutex {
            client: self.client.clone(),
            name: key.to_string(),
            held: None,
        }))
    }

    async fn clean_prefix(&self, prefix: &str) -> Result<()> {
        let mut client = self.client.clone();
        client
            .delete(prefix, Some(DeleteOptions::new().with_prefix()))
            .await
            .map_err(keystore_err)?;
        Ok(())
    }
}

// =============================================================================
// Lease and Mutex
// =============================================================================

struct EtcdLease {
    key: String,
    lease_id: i64,
    client: Client,
    task: tokio::task::JoinHandle<()>,
}

impl LeaseKeeper for EtcdLease {
    fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for EtcdLease {
    fn drop(&mut self) {
        self.task.abort();
        let mut client = self.client.clone();
        let lease_id = self.lease_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = client.lease_revoke(lease_id).await;
            });
        }
    }
}

struct EtcdMutex {
    client: Client,
    name: String,
    held: Option<(Vec<u8>, i64)>,
}

#[async_trait]
impl DistributedMutex for EtcdMutex {
    async fn lock(&mut self) -> Result<()> {
        if self.held.is_some() {
            return Ok(());
        }
        let mut client = self.client.clone();
        let lease_id = client
            .lease_grant(MUTEX_LEASE_TTL_SECS, None)
            .await
            .map_err(keystore_err)?
            .id();
        let resp = client
            .lock(
                self.name.as_str(),
                Some(LockOptions::new().with_lease(lease_id)),
            )
            .await
            .map_err(keystore_err)?;
        self.held = Some((resp.key().to_vec(), lease_id));
        Ok(())
    }

    async fn unlock(&mut self) -> Result<()> {
        if let Some((lock_key, lease_id)) = self.held.take() {
            let mut client = self.client.clone();
            client.unlock(lock_key).await.map_err(keystore_err)?;
            let _ = client.lease_revoke(lease_id).await;
        }
        Ok(())
    }
}
