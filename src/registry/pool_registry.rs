//! Pool Registry
//!
//! Host and brick registration, liveness, the derived pool view, and the
//! brick allocator. The allocator is registry-owned: the per-pool mutex
//! and the combined allocation-plus-state transaction both live here, so
//! no caller can interleave a second allocation between selection and
//! commit.

use crate::allocation::choose_host_disjoint_bricks;
use crate::domain::ports::{KeyValueVersion, KeystoreRef, LeaseKeeper, Transaction};
use crate::error::{Error, Result};
use crate::model::{
    AllocationRecord, BrickAllocation, BrickHostStatus, BrickInfo, HostInfo, Pool, Volume,
    VolumeName, VolumeState,
};
use crate::registry::keys;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bounded retries for the allocate transaction racing other writers
const MAX_ALLOC_RETRIES: usize = 5;

/// Bounded retries for flag updates racing the agents
const MAX_CAS_RETRIES: usize = 8;

fn parse_brick(kv: &KeyValueVersion) -> Result<BrickInfo> {
    Ok(serde_json::from_str(&kv.value)?)
}

fn parse_bricks(kv: &KeyValueVersion) -> Result<Vec<BrickInfo>> {
    Ok(serde_json::from_str(&kv.value)?)
}

fn parse_allocation(kv: &KeyValueVersion) -> Result<AllocationRecord> {
    Ok(AllocationRecord {
        allocation: serde_json::from_str(&kv.value)?,
        version: kv.version,
    })
}

// =============================================================================
// Pool Registry
// =============================================================================

/// Façade over the keystore for hosts, bricks, pools, and allocations
#[derive(Clone)]
pub struct PoolRegistry {
    store: KeystoreRef,
}

impl PoolRegistry {
    pub fn new(store: KeystoreRef) -> Self {
        Self { store }
    }

    // =========================================================================
    // Host Registration
    // =========================================================================

    /// Upsert the full brick list of one host
    ///
    /// The update replaces any previous registration. It is refused with
    /// `Conflict` when a previously registered brick would be removed
    /// while an allocation for it exists, and with `Invalid` when the
    /// bricks disagree in hostname or pool, or their capacity does not
    /// match the established pool granularity.
    pub async fn update_host(&self, bricks: Vec<BrickInfo>) -> Result<()> {
        let first = bricks
            .first()
            .ok_or_else(|| Error::Invalid("empty brick list".into()))?
            .clone();
        for brick in &bricks {
            brick.validate()?;
            if brick.hostname != first.hostname {
                return Err(Error::Invalid(format!(
                    "bricks span hosts {} and {}",
                    first.hostname, brick.hostname
                )));
            }
            if brick.pool_name != first.pool_name {
                return Err(Error::Invalid(format!(
                    "bricks span pools {} and {}",
                    first.pool_name, brick.pool_name
                )));
            }
            if brick.capacity_gb != first.capacity_gb {
                return Err(Error::Invalid(format!(
                    "brick {}/{} capacity {}GB breaks pool granularity {}GB",
                    brick.hostname, brick.device, brick.capacity_gb, first.capacity_gb
                )));
            }
        }
        let mut devices = HashSet::new();
        for brick in &bricks {
            if !devices.insert(brick.device.as_str()) {
                return Err(Error::Invalid(format!(
                    "duplicate device {} for host {}",
                    brick.device, first.hostname
                )));
            }
        }

        // the first brick registered for a pool establishes its granularity
        let index = self
            .store
            .get_all(&keys::pool_bricks_prefix(&first.pool_name))
            .await?;
        for kv in &index {
            let existing = parse_brick(kv)?;
            if existing.hostname != first.hostname && existing.capacity_gb != first.capacity_gb {
                return Err(Error::Invalid(format!(
                    "capacity {}GB does not match pool {} granularity {}GB",
                    first.capacity_gb, first.pool_name, existing.capacity_gb
                )));
            }
        }

        let info_key = keys::host_info(&first.hostname);
        let old = match self.store.get(&info_key).await {
            Ok(kv) => Some(kv),
            Err(Error::NotFound { .. }) => None,
            Err(err) => return Err(err),
        };
        let old_bricks = old.as_ref().map(parse_bricks).transpose()?.unwrap_or_default();

        // a brick that has gone away may not still be allocated
        let new_ids: HashSet<(&str, &str)> = bricks
            .iter()
            .map(|b| (b.hostname.as_str(), b.device.as_str()))
            .collect();
        let mut removed = Vec::new();
        for brick in &old_bricks {
            if !new_ids.contains(&(brick.hostname.as_str(), brick.device.as_str())) {
                if self
                    .store
                    .get(&keys::allocation(&brick.hostname, &brick.device))
                    .await
                    .is_ok()
                {
                    return Err(Error::conflict(keys::allocation(
                        &brick.hostname,
                        &brick.device,
                    )));
                }
                removed.push(brick.clone());
            }
        }

        let mut txn = Transaction::new();
        let info_value = serde_json::to_string(&bricks)?;
        match old {
            Some(kv) => {
                txn = txn.update(KeyValueVersion {
                    key: info_key,
                    value: info_value,
                    version: kv.version,
                });
            }
            None => {
                txn = txn.create(info_key, info_value);
            }
        }
        for brick in &bricks {
            let key = keys::pool_brick(&brick.pool_name, &brick.hostname, &brick.device);
            let value = serde_json::to_string(brick)?;
            match self.store.get(&key).await {
                Ok(kv) => {
                    txn = txn.update(KeyValueVersion {
                        key,
                        value,
                        version: kv.version,
                    });
                }
                Err(Error::NotFound { .. }) => {
                    txn = txn.create(key, value);
                }
                Err(err) => return Err(err),
            }
        }
        for brick in &removed {
            let key = keys::pool_brick(&brick.pool_name, &brick.hostname, &brick.device);
            if let Ok(kv) = self.store.get(&key).await {
                txn = txn.delete(kv);
            }
        }

        self.store.txn(txn).await?;
        info!(
            hostname = %first.hostname,
            pool = %first.pool_name,
            bricks = bricks.len(),
            removed = removed.len(),
            "host registration updated"
        );
        Ok(())
    }

    /// Advertise host liveness with a leased key; callers renew the
    /// returned lease for the lifetime of the agent process
    pub async fn keep_alive_host(&self, hostname: &str) -> Result<Box<dyn LeaseKeeper>> {
        if self.store.get(&keys::host_info(hostname)).await.is_err() {
            return Err(Error::not_found(keys::host_info(hostname)));
        }
        self.store.keep_alive(&keys::host_alive(hostname)).await
    }

    pub async fn host_alive(&self, hostname: &str) -> Result<bool> {
        Ok(self.store.get(&keys::host_alive(hostname)).await.is_ok())
    }

    /// Snapshot of every registered host with its liveness
    pub async fn brick_host_statuses(&self) -> Result<Vec<BrickHostStatus>> {
        let kvs = self.store.get_all(keys::HOSTS_PREFIX).await?;
        let alive: HashSet<&str> = kvs
            .iter()
            .filter_map(|kv| keys::parse_alive_key(&kv.key))
            .collect();

        let mut statuses = Vec::new();
        for kv in kvs.iter().filter(|kv| kv.key.ends_with("/info")) {
            let bricks = parse_bricks(kv)?;
            let hostname = bricks
                .first()
                .map(|b| b.hostname.clone())
                .unwrap_or_default();
            let is_alive = alive.contains(hostname.as_str());
            statuses.push(BrickHostStatus {
                hostname,
                bricks,
                alive: is_alive,
            });
        }
        Ok(statuses)
    }

    pub async fn get_brick_info(&self, hostname: &str, device: &str) -> Result<BrickInfo> {
        let kv = self.store.get(&keys::host_info(hostname)).await?;
        parse_bricks(&kv)?
            .into_iter()
            .find(|b| b.device == device)
            .ok_or_else(|| Error::not_found(format!("{}/{}", hostname, device)))
    }

    // =========================================================================
    // Derived Pools
    // =========================================================================

    /// Rebuild the derived pool list from the current registry snapshot
    ///
    /// A brick is available iff it is not referenced by any allocation and
    /// its host holds a current liveness lease.
    pub async fn pools(&self) -> Result<Vec<Pool>> {
        let index = self.store.get_all(keys::POOLS_PREFIX).await?;
        let hosts = self.store.get_all(keys::HOSTS_PREFIX).await?;
        let allocs = self.store.get_all(keys::ALLOCS_PREFIX).await?;

        let alive: HashSet<&str> = hosts
            .iter()
            .filter_map(|kv| keys::parse_alive_key(&kv.key))
            .collect();
        let mut allocations = Vec::new();
        for kv in &allocs {
            allocations.push(parse_allocation(kv)?.allocation);
        }
        let allocated: HashSet<(String, String)> = allocations
            .iter()
            .map(|a| (a.hostname.clone(), a.device.clone()))
            .collect();

        let mut by_pool: BTreeMap<String, Vec<BrickInfo>> = BTreeMap::new();
        for kv in &index {
            let brick = parse_brick(kv)?;
            by_pool.entry(brick.pool_name.clone()).or_default().push(brick);
        }

        let mut pools = Vec::new();
        for (name, bricks) in by_pool {
            let granularity_gb = bricks.iter().map(|b| b.capacity_gb).min().unwrap_or(0);
            let brick_ids: HashSet<(&str, &str)> = bricks
                .iter()
                .map(|b| (b.hostname.as_str(), b.device.as_str()))
                .collect();

            let mut hosts_map = BTreeMap::new();
            for brick in &bricks {
                hosts_map
                    .entry(brick.hostname.clone())
                    .or_insert_with(|| HostInfo {
                        hostname: brick.hostname.clone(),
                        alive: alive.contains(brick.hostname.as_str()),
                    });
            }

            let available_bricks = bricks
                .iter()
                .filter(|b| {
                    alive.contains(b.hostname.as_str())
                        && !allocated.contains(&(b.hostname.clone(), b.device.clone()))
                })
                .cloned()
                .collect();
            let allocated_bricks = allocations
                .iter()
                .filter(|a| brick_ids.contains(&(a.hostname.as_str(), a.device.as_str())))
                .cloned()
                .collect();

            pools.push(Pool {
                name,
                granularity_gb,
                available_bricks,
                allocated_bricks,
                hosts: hosts_map,
            });
        }
        Ok(pools)
    }

    pub async fn pool(&self, name: &str) -> Result<Pool> {
        self.pools()
            .await?
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::not_found(keys::pool_bricks_prefix(name)))
    }

    // =========================================================================
    // Allocations
    // =========================================================================

    pub async fn get_allocations_for_volume(
        &self,
        name: &VolumeName,
    ) -> Result<Vec<AllocationRecord>> {
        let kvs = self.store.get_all(keys::ALLOCS_PREFIX).await?;
        let mut records = Vec::new();
        for kv in &kvs {
            let record = parse_allocation(kv)?;
            if &record.allocation.allocated_volume == name {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.allocation.allocated_index);
        Ok(records)
    }

    pub async fn get_allocations_for_host(&self, hostname: &str) -> Result<Vec<AllocationRecord>> {
        let kvs = self
            .store
            .get_all(&keys::host_allocs_prefix(hostname))
            .await?;
        kvs.iter().map(parse_allocation).collect()
    }

    /// Reserve host-disjoint bricks for the volume and advance it to
    /// `BricksAllocated` in a single commit
    ///
    /// Serialized per pool through the distributed allocator mutex; on a
    /// version conflict the selection is retried against a fresh snapshot
    /// a bounded number of times.
    pub async fn allocate_bricks_for_volume(
        &self,
        volume: &Volume,
    ) -> Result<Vec<BrickAllocation>> {
        if volume.size_bricks == 0 {
            return Err(Error::Invalid(format!(
                "volume {} requests no bricks",
                volume.name
            )));
        }
        if !self
            .get_allocations_for_volume(&volume.name)
            .await?
            .is_empty()
        {
            return Err(Error::Invalid(format!(
                "volume {} already has allocations",
                volume.name
            )));
        }
        // fail fast before taking the lock or writing anything
        let pool = self.pool(&volume.pool).await?;
        let wanted = volume.size_bricks as usize;
        if pool.distinct_available_hosts() < wanted {
            return Err(Error::Unsatisfiable {
                pool: pool.name,
                requested: wanted,
            });
        }

        let mut mutex = self.store.new_mutex(&keys::alloc_mutex(&volume.pool)).await?;
        mutex.lock().await?;
        let result = self.allocate_locked(volume).await;
        if let Err(err) = mutex.unlock().await {
            warn!(pool = %volume.pool, error = %err, "failed to release allocator mutex");
        }
        result
    }

    async fn allocate_locked(&self, volume: &Volume) -> Result<Vec<BrickAllocation>> {
        let wanted = volume.size_bricks as usize;
        for attempt in 0..MAX_ALLOC_RETRIES {
            let pool = self.pool(&volume.pool).await?;
            let chosen = choose_host_disjoint_bricks(&pool, wanted, &mut rand::thread_rng())?;

            let allocations: Vec<BrickAllocation> = chosen
                .iter()
                .enumerate()
                .map(|(i, brick)| BrickAllocation {
                    hostname: brick.hostname.clone(),
                    device: brick.device.clone(),
                    allocated_volume: volume.name.clone(),
                    allocated_index: i as u32,
                    deallocate_requested: false,
                })
                .collect();

            let record_key = keys::volume_record(volume.name.as_str());
            let record = self.store.get(&record_key).await?;
            let current: Volume = serde_json::from_str(&record.value)?;
            if !current.state.can_advance_to(VolumeState::BricksAllocated) {
                return Err(Error::InvalidState {
                    volume: volume.name.to_string(),
                    state: current.state.to_string(),
                });
            }
            let mut updated = current;
            updated.state = VolumeState::BricksAllocated;
            updated.had_bricks_assigned = true;

            let mut txn = Transaction::new().update(KeyValueVersion {
                key: record_key,
                value: serde_json::to_string(&updated)?,
                version: record.version,
            });
            for alloc in &allocations {
                txn = txn.create(
                    keys::allocation(&alloc.hostname, &alloc.device),
                    serde_json::to_string(alloc)?,
                );
            }

            match self.store.txn(txn).await {
                Ok(()) => {
                    info!(
                        volume = %volume.name,
                        pool = %volume.pool,
                        bricks = allocations.len(),
                        primary = %allocations[0].hostname,
                        "bricks allocated"
                    );
                    return Ok(allocations);
                }
                Err(Error::Conflict { .. }) | Err(Error::AlreadyExists { .. }) => {
                    debug!(
                        volume = %volume.name,
                        attempt,
                        "allocation raced a concurrent commit, retrying"
                    );
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::conflict(keys::volume_record(volume.name.as_str())))
    }

    /// Request deallocation of every brick of the volume
    ///
    /// The flag is set on all allocations whether or not their host is
    /// alive; dead hosts leave their records in place and drain them on
    /// revival. Returns as soon as the request is recorded.
    pub async fn deallocate_bricks(&self, name: &VolumeName) -> Result<()> {
        for _ in 0..MAX_CAS_RETRIES {
            let records = self.get_allocations_for_volume(name).await?;
            let updates: Vec<KeyValueVersion> = records
                .iter()
                .filter(|r| !r.allocation.deallocate_requested)
                .map(|r| {
                    let mut flagged = r.allocation.clone();
                    flagged.deallocate_requested = true;
                    Ok(KeyValueVersion {
                        key: keys::allocation(&r.allocation.hostname, &r.allocation.device),
                        value: serde_json::to_string(&flagged)?,
                        version: r.version,
                    })
                })
                .collect::<Result<_>>()?;
            if updates.is_empty() {
                return Ok(());
            }
            match self.store.update(updates).await {
                Ok(()) => {
                    debug!(volume = %name, "deallocate requested");
                    return Ok(());
                }
                Err(err) if err.is_transient() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::conflict(keys::ALLOCS_PREFIX))
    }

    /// Remove allocation records previously drained by the primary host
    ///
    /// Fails with `Conflict` if any record was modified since the caller
    /// read it.
    pub async fn hard_delete_allocations(&self, records: Vec<AllocationRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let deletes = records
            .iter()
            .map(|r| {
                Ok(KeyValueVersion {
                    key: keys::allocation(&r.allocation.hostname, &r.allocation.device),
                    value: serde_json::to_string(&r.allocation)?,
                    version: r.version,
                })
            })
            .collect::<Result<_>>()?;
        self.store.delete_all(deletes).await?;
        debug!(count = records.len(), "allocations hard deleted");
        Ok(())
    }

    /// Stream every new brick allocation committed for one host
    pub async fn watch_host_allocations(
        &self,
        cancel: &CancellationToken,
        hostname: &str,
    ) -> Result<mpsc::UnboundedReceiver<BrickAllocation>> {
        let mut events = self
            .store
            .watch(cancel, &keys::host_allocs_prefix(hostname), true)
            .await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        None => break,
                        Some(event) if event.is_create() => {
                            let parsed = event
                                .new
                                .as_ref()
                                .and_then(|kv| serde_json::from_str(&kv.value).ok());
                            match parsed {
                                Some(alloc) => {
                                    if tx.send(alloc).is_err() {
                                        break;
                                    }
                                }
                                None => warn!(key = event.key(), "unparseable allocation record"),
                            }
                        }
                        Some(_) => {}
                    },
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::Keystore;
    use crate::registry::{MemoryKeystore, VolumeRegistry};
    use std::sync::Arc;

    fn setup() -> (PoolRegistry, VolumeRegistry, Arc<MemoryKeystore>) {
        let store = Arc::new(MemoryKeystore::new());
        (
            PoolRegistry::new(store.clone()),
            VolumeRegistry::new(store.clone()),
            store,
        )
    }

    fn two_bricks() -> Vec<BrickInfo> {
        vec![
            BrickInfo::new("h1", "dA", "pool1", 100),
            BrickInfo::new("h1", "dB", "pool1", 100),
        ]
    }

    #[tokio::test]
    async fn test_update_host_is_idempotent() {
        let (pools, _, _) = setup();
        pools.update_host(two_bricks()).await.unwrap();
        pools.update_host(two_bricks()).await.unwrap();

        let status = pools.brick_host_statuses().await.unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].bricks.len(), 2);
        assert!(!status[0].alive);
    }

    #[tokio::test]
    async fn test_update_host_rejects_mixed_input() {
        let (pools, _, _) = setup();
        assert!(matches!(
            pools.update_host(vec![]).await,
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            pools
                .update_host(vec![
                    BrickInfo::new("h1", "dA", "pool1", 100),
                    BrickInfo::new("h2", "dB", "pool1", 100),
                ])
                .await,
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            pools
                .update_host(vec![
                    BrickInfo::new("h1", "dA", "pool1", 100),
                    BrickInfo::new("h1", "dB", "pool2", 100),
                ])
                .await,
            Err(Error::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_granularity_is_established_by_first_registration() {
        let (pools, _, _) = setup();
        pools.update_host(two_bricks()).await.unwrap();

        // another host with a different capacity breaks the granularity
        let err = pools
            .update_host(vec![BrickInfo::new("h2", "dC", "pool1", 200)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));

        pools
            .update_host(vec![BrickInfo::new("h2", "dC", "pool1", 100)])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_brick_info() {
        let (pools, _, _) = setup();
        pools.update_host(two_bricks()).await.unwrap();

        let brick = pools.get_brick_info("h1", "dA").await.unwrap();
        assert_eq!(brick.pool_name, "pool1");
        assert_eq!(brick.capacity_gb, 100);

        assert!(matches!(
            pools.get_brick_info("h1", "missing").await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            pools.get_brick_info("ghost", "dA").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_keep_alive_requires_registration() {
        let (pools, _, _) = setup();
        assert!(matches!(
            pools.keep_alive_host("h1").await,
            Err(Error::NotFound { .. })
        ));

        pools.update_host(two_bricks()).await.unwrap();
        let lease = pools.keep_alive_host("h1").await.unwrap();
        assert!(pools.host_alive("h1").await.unwrap());
        drop(lease);
        assert!(!pools.host_alive("h1").await.unwrap());
    }

    #[tokio::test]
    async fn test_keep_alive_after_expiry_keeps_bricks() {
        let (pools, _, store) = setup();
        pools.update_host(two_bricks()).await.unwrap();
        let _lease = pools.keep_alive_host("h1").await.unwrap();
        store.expire_lease("/hosts/h1/alive");
        assert!(!pools.host_alive("h1").await.unwrap());

        let _lease2 = pools.keep_alive_host("h1").await.unwrap();
        assert!(pools.host_alive("h1").await.unwrap());
        assert_eq!(
            pools.brick_host_statuses().await.unwrap()[0].bricks.len(),
            2
        );
    }

    #[tokio::test]
    async fn test_pool_availability_tracks_liveness() {
        let (pools, _, store) = setup();
        pools.update_host(two_bricks()).await.unwrap();
        let _lease = pools.keep_alive_host("h1").await.unwrap();

        let pool = pools.pool("pool1").await.unwrap();
        assert_eq!(pool.granularity_gb, 100);
        assert_eq!(pool.available_bricks.len(), 2);
        assert!(pool.hosts["h1"].alive);

        store.expire_lease("/hosts/h1/alive");
        let pool = pools.pool("pool1").await.unwrap();
        assert!(pool.available_bricks.is_empty());
        assert!(!pool.hosts["h1"].alive);
    }

    async fn register_three_hosts(pools: &PoolRegistry) -> Vec<Box<dyn LeaseKeeper>> {
        let mut leases = Vec::new();
        for (host, dev) in [("h1", "dA"), ("h2", "dB"), ("h3", "dC")] {
            pools
                .update_host(vec![BrickInfo::new(host, dev, "pool1", 100)])
                .await
                .unwrap();
            leases.push(pools.keep_alive_host(host).await.unwrap());
        }
        leases
    }

    #[tokio::test]
    async fn test_allocate_assigns_dense_disjoint_indices() {
        let (pools, volumes, _) = setup();
        let _leases = register_three_hosts(&pools).await;

        let vol = Volume::new("vs", "pool1", 2, "j1");
        volumes.add_volume(&vol).await.unwrap();

        let allocs = pools.allocate_bricks_for_volume(&vol).await.unwrap();
        assert_eq!(allocs.len(), 2);
        assert_eq!(allocs[0].allocated_index, 0);
        assert_eq!(allocs[1].allocated_index, 1);
        assert_ne!(allocs[0].hostname, allocs[1].hostname);

        let back = volumes.volume(&vol.name).await.unwrap();
        assert_eq!(back.state, VolumeState::BricksAllocated);
        assert!(back.had_bricks_assigned);

        // a second allocation for the same volume is refused
        assert!(matches!(
            pools.allocate_bricks_for_volume(&vol).await,
            Err(Error::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_unsatisfiable_leaves_no_trace() {
        let (pools, volumes, store) = setup();
        pools.update_host(two_bricks()).await.unwrap();
        let _lease = pools.keep_alive_host("h1").await.unwrap();

        // two bricks, but a single live host
        let vol = Volume::new("vs", "pool1", 2, "j1");
        volumes.add_volume(&vol).await.unwrap();

        let err = pools.allocate_bricks_for_volume(&vol).await.unwrap_err();
        assert!(matches!(err, Error::Unsatisfiable { .. }));

        let back = volumes.volume(&vol.name).await.unwrap();
        assert_eq!(back.state, VolumeState::Registered);
        assert!(!back.had_bricks_assigned);
        assert!(store.get_all("/allocs/").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_never_double_claim() {
        let (pools, volumes, _) = setup();
        // two bricks per host so any interleaving can satisfy both requests
        let mut _leases = Vec::new();
        for (host, d1, d2) in [("h1", "dA", "dD"), ("h2", "dB", "dE"), ("h3", "dC", "dF")] {
            pools
                .update_host(vec![
                    BrickInfo::new(host, d1, "pool1", 100),
                    BrickInfo::new(host, d2, "pool1", 100),
                ])
                .await
                .unwrap();
            _leases.push(pools.keep_alive_host(host).await.unwrap());
        }

        let va = Volume::new("va", "pool1", 2, "j1");
        let vb = Volume::new("vb", "pool1", 2, "j2");
        volumes.add_volume(&va).await.unwrap();
        volumes.add_volume(&vb).await.unwrap();

        let (ra, rb) = tokio::join!(
            {
                let pools = pools.clone();
                let va = va.clone();
                tokio::spawn(async move { pools.allocate_bricks_for_volume(&va).await })
            },
            {
                let pools = pools.clone();
                let vb = vb.clone();
                tokio::spawn(async move { pools.allocate_bricks_for_volume(&vb).await })
            }
        );
        let allocs_a = ra.unwrap().unwrap();
        let allocs_b = rb.unwrap().unwrap();

        let mut seen = HashSet::new();
        for alloc in allocs_a.iter().chain(allocs_b.iter()) {
            assert!(
                seen.insert((alloc.hostname.clone(), alloc.device.clone())),
                "brick {}/{} allocated twice",
                alloc.hostname,
                alloc.device
            );
        }
        assert_eq!(seen.len(), 4);
    }

    #[tokio::test]
    async fn test_deallocate_flags_allocations_even_for_dead_hosts() {
        let (pools, volumes, store) = setup();
        let _leases = register_three_hosts(&pools).await;

        let vol = Volume::new("vs", "pool1", 2, "j1");
        volumes.add_volume(&vol).await.unwrap();
        let allocs = pools.allocate_bricks_for_volume(&vol).await.unwrap();

        // one of the allocated hosts dies
        store.expire_lease(&keys::host_alive(&allocs[1].hostname));

        pools.deallocate_bricks(&vol.name).await.unwrap();
        let records = pools.get_allocations_for_volume(&vol.name).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records
            .iter()
            .all(|r| r.allocation.deallocate_requested));

        // flagging again is a no-op
        pools.deallocate_bricks(&vol.name).await.unwrap();
    }

    #[tokio::test]
    async fn test_hard_delete_requires_fresh_versions() {
        let (pools, volumes, store) = setup();
        let _leases = register_three_hosts(&pools).await;

        let vol = Volume::new("vs", "pool1", 2, "j1");
        volumes.add_volume(&vol).await.unwrap();
        pools.allocate_bricks_for_volume(&vol).await.unwrap();

        let stale = pools.get_allocations_for_volume(&vol.name).await.unwrap();
        pools.deallocate_bricks(&vol.name).await.unwrap();

        // versions moved under the stale read
        assert!(matches!(
            pools.hard_delete_allocations(stale).await,
            Err(Error::Conflict { .. })
        ));

        let fresh = pools.get_allocations_for_volume(&vol.name).await.unwrap();
        pools.hard_delete_allocations(fresh).await.unwrap();
        assert!(store.get_all("/allocs/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_host_cannot_remove_allocated_brick() {
        let (pools, volumes, _) = setup();
        let _leases = register_three_hosts(&pools).await;

        let vol = Volume::new("vs", "pool1", 3, "j1");
        volumes.add_volume(&vol).await.unwrap();
        pools.allocate_bricks_for_volume(&vol).await.unwrap();

        // h1's only brick is allocated now; dropping it must fail
        let err = pools
            .update_host(vec![BrickInfo::new("h1", "dZ", "pool1", 100)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_watch_host_allocations_streams_new_claims() {
        let (pools, volumes, _) = setup();
        let _leases = register_three_hosts(&pools).await;

        let cancel = CancellationToken::new();
        let mut h1 = pools.watch_host_allocations(&cancel, "h1").await.unwrap();
        let mut h2 = pools.watch_host_allocations(&cancel, "h2").await.unwrap();
        let mut h3 = pools.watch_host_allocations(&cancel, "h3").await.unwrap();

        let vol = Volume::new("vs", "pool1", 3, "j1");
        volumes.add_volume(&vol).await.unwrap();
        pools.allocate_bricks_for_volume(&vol).await.unwrap();

        for rx in [&mut h1, &mut h2, &mut h3] {
            let alloc = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
                .await
                .expect("allocation event expected")
                .unwrap();
            assert_eq!(alloc.allocated_volume, vol.name);
        }
        cancel.cancel();
    }
}
