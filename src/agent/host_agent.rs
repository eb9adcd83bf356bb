//! Host Agent
//!
//! Long-running per-storage-host process: registers the host's bricks,
//! holds the liveness lease, drains deallocation requests left over from
//! a previous incarnation, and spawns a volume worker for every primary
//! brick allocated to this host.

use crate::domain::ports::{FilesystemDriverRef, KeystoreRef};
use crate::error::Result;
use crate::model::{BrickInfo, VolumeName};
use crate::registry::{PoolRegistry, VolumeRegistry};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::volume_worker::VolumeWorker;

// =============================================================================
// Configuration
// =============================================================================

/// Static facts about the host this agent fronts
#[derive(Debug, Clone)]
pub struct HostAgentConfig {
    pub hostname: String,
    pub pool: String,
    pub devices: Vec<String>,
    pub capacity_gb: u64,
}

impl HostAgentConfig {
    fn bricks(&self) -> Vec<BrickInfo> {
        self.devices
            .iter()
            .map(|device| {
                BrickInfo::new(
                    self.hostname.clone(),
                    device.clone(),
                    self.pool.clone(),
                    self.capacity_gb,
                )
            })
            .collect()
    }
}

// =============================================================================
// Host Agent
// =============================================================================

pub struct HostAgent {
    volumes: VolumeRegistry,
    pools: PoolRegistry,
    driver: FilesystemDriverRef,
    config: HostAgentConfig,
    running: Arc<Mutex<HashSet<VolumeName>>>,
}

impl HostAgent {
    pub fn new(store: KeystoreRef, driver: FilesystemDriverRef, config: HostAgentConfig) -> Self {
        Self {
            volumes: VolumeRegistry::new(store.clone()),
            pools: PoolRegistry::new(store),
            driver,
            config,
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Register, advertise liveness, and serve until cancelled
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let hostname = self.config.hostname.clone();
        self.pools.update_host(self.config.bricks()).await?;
        let _lease = self.pools.keep_alive_host(&hostname).await?;
        info!(
            hostname = %hostname,
            pool = %self.config.pool,
            bricks = self.config.devices.len(),
            "host agent ready"
        );

        self.drain_deallocated().await?;

        // subscribe before the snapshot so an allocation committed in
        // between is seen exactly once
        let mut new_allocations = self
            .pools
            .watch_host_allocations(&cancel, &hostname)
            .await?;
        for record in self.pools.get_allocations_for_host(&hostname).await? {
            if record.allocation.is_primary() {
                self.spawn_worker(record.allocation.allocated_volume, &cancel);
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                allocation = new_allocations.recv() => match allocation {
                    None => break,
                    Some(allocation) if allocation.is_primary() => {
                        self.spawn_worker(allocation.allocated_volume, &cancel);
                    }
                    Some(_) => {}
                },
            }
        }
        info!(hostname = %hostname, "host agent stopping");
        Ok(())
    }

    /// Remove allocation records flagged for deallocation whose volume is
    /// already gone; this is how a host that was dead during a delete
    /// catches up after revival
    async fn drain_deallocated(&self) -> Result<()> {
        let records = self
            .pools
            .get_allocations_for_host(&self.config.hostname)
            .await?;
        let mut stale = Vec::new();
        for record in records {
            if !record.allocation.deallocate_requested {
                continue;
            }
            match self.volumes.volume(&record.allocation.allocated_volume).await {
                Err(crate::error::Error::NotFound { .. }) => stale.push(record),
                Ok(_) => {} // delete still in flight, the worker owns it
                Err(err) => return Err(err),
            }
        }
        if !stale.is_empty() {
            info!(
                hostname = %self.config.hostname,
                count = stale.len(),
                "draining deallocated bricks from previous incarnation"
            );
            self.pools.hard_delete_allocations(stale).await?;
        }
        Ok(())
    }

    fn spawn_worker(&self, name: VolumeName, cancel: &CancellationToken) {
        if !self.running.lock().insert(name.clone()) {
            return;
        }
        let worker = VolumeWorker::new(
            self.volumes.clone(),
            self.pools.clone(),
            self.driver.clone(),
            self.config.hostname.clone(),
            name.clone(),
        );
        let running = Arc::clone(&self.running);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = worker.run(&cancel).await {
                error!(volume = %name, error = %err, "volume worker failed");
            }
            running.lock().remove(&name);
        });
    }
}
