//! Volume Lifecycle Manager
//!
//! Every entry point follows one shared pattern: write intent into the
//! registry, then block on a watch until the target state arrives, a
//! terminal error state arrives, or the caller cancels. The registry is
//! the only rendezvous with the host agents; neither side calls the
//! other.

use crate::error::{Error, Result};
use crate::model::{Attachment, AttachmentState, VolumeName, VolumeState};
use crate::registry::{PoolRegistry, VolumeRegistry};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Coordinator-side driver for one volume
#[derive(Clone)]
pub struct VolumeLifecycleManager {
    volumes: VolumeRegistry,
    pools: PoolRegistry,
    name: VolumeName,
}

impl VolumeLifecycleManager {
    pub fn new(volumes: VolumeRegistry, pools: PoolRegistry, name: VolumeName) -> Self {
        Self {
            volumes,
            pools,
            name,
        }
    }

    pub fn volume_name(&self) -> &VolumeName {
        &self.name
    }

    // =========================================================================
    // Provision
    // =========================================================================

    /// Reserve bricks and wait for the primary host to finish the
    /// physical provisioning
    ///
    /// No deadline is imposed here: provisioning is agent-driven and may
    /// legitimately take minutes. The caller's token bounds the wait.
    pub async fn provision_bricks(&self, cancel: &CancellationToken) -> Result<()> {
        let volume = self.volumes.volume(&self.name).await?;
        if volume.size_bricks == 0 {
            debug!(volume = %self.name, "skipping provision for zero-brick volume");
            return Ok(());
        }
        self.pools.allocate_bricks_for_volume(&volume).await?;
        self.volumes
            .wait_for_state(&self.name, VolumeState::BricksProvisioned, cancel)
            .await
    }

    // =========================================================================
    // Data Staging
    // =========================================================================

    pub async fn data_in(&self, cancel: &CancellationToken) -> Result<()> {
        let volume = self.volumes.volume(&self.name).await?;
        if volume.size_bricks == 0 {
            debug!(volume = %self.name, "skipping data_in for zero-brick volume");
            return Ok(());
        }
        self.volumes
            .update_state(&self.name, VolumeState::DataInRequested)
            .await?;
        self.volumes
            .wait_for_state(&self.name, VolumeState::DataInComplete, cancel)
            .await
    }

    pub async fn data_out(&self, cancel: &CancellationToken) -> Result<()> {
        let volume = self.volumes.volume(&self.name).await?;
        if volume.size_bricks == 0 {
            debug!(volume = %self.name, "skipping data_out for zero-brick volume");
            return Ok(());
        }
        self.volumes
            .update_state(&self.name, VolumeState::DataOutRequested)
            .await?;
        self.volumes
            .wait_for_state(&self.name, VolumeState::DataOutComplete, cancel)
            .await
    }

    // =========================================================================
    // Mount / Unmount
    // =========================================================================

    /// Attach the volume on every listed compute host for the given job
    ///
    /// Fails fast with `AttachmentFailed` as soon as any requested
    /// attachment errors; already attached peers are left in place for
    /// the caller to unmount.
    pub async fn mount(
        &self,
        hosts: &[String],
        job: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let volume = self.volumes.volume(&self.name).await?;
        if volume.size_bricks == 0 {
            debug!(volume = %self.name, "skipping mount for zero-brick volume");
            return Ok(());
        }
        if hosts.is_empty() {
            return Ok(());
        }
        if !volume.state.is_operational() {
            return Err(Error::InvalidState {
                volume: self.name.to_string(),
                state: volume.state.to_string(),
            });
        }

        info!(volume = %self.name, job, hosts = hosts.len(), "mount requested");
        let job_owned = job.to_string();
        let hosts_owned: Vec<String> = hosts.to_vec();
        let name_owned = self.name.to_string();
        self.volumes
            .update_attachments(&self.name, move |attachments| {
                // a prior job must be fully detached before a new one
                // attaches
                if let Some(stale) = attachments
                    .iter()
                    .find(|a| a.job != job_owned && a.state != AttachmentState::Detached)
                {
                    return Err(Error::InvalidState {
                        volume: name_owned.clone(),
                        state: format!("job {} still {}", stale.job, stale.state),
                    });
                }
                for host in &hosts_owned {
                    if attachments.iter().any(|a| a.matches(host, &job_owned)) {
                        return Err(Error::AlreadyExists {
                            key: format!("{}/{}", host, job_owned),
                        });
                    }
                    attachments.push(Attachment::request(host, &job_owned));
                }
                Ok(())
            })
            .await?;

        let wanted: Vec<(String, String)> = hosts
            .iter()
            .map(|h| (h.clone(), job.to_string()))
            .collect();
        let volume_name = self.name.to_string();
        self.volumes
            .wait_for_condition(&self.name, cancel, move |volume, attachments| {
                if volume.state == VolumeState::Error {
                    return Some(Err(Error::VolumeErrored {
                        volume: volume_name.clone(),
                        reason: volume
                            .error_detail
                            .clone()
                            .unwrap_or_else(|| "unknown".to_string()),
                    }));
                }
                for (host, job) in &wanted {
                    let att = attachments.iter().find(|a| a.matches(host, job));
                    match att.map(|a| a.state) {
                        Some(AttachmentState::AttachmentError) => {
                            return Some(Err(Error::AttachmentFailed {
                                volume: volume_name.clone(),
                                hostname: host.clone(),
                                reason: att
                                    .and_then(|a| a.detail.clone())
                                    .unwrap_or_else(|| "unknown".to_string()),
                            }));
                        }
                        Some(AttachmentState::Attached) => {}
                        _ => return None,
                    }
                }
                Some(Ok(()))
            })
            .await
    }

    /// Detach the volume from the listed hosts and drop the attachment
    /// records once everything is detached
    pub async fn unmount(
        &self,
        hosts: &[String],
        job: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let volume = self.volumes.volume(&self.name).await?;
        if volume.size_bricks == 0 {
            debug!(volume = %self.name, "skipping unmount for zero-brick volume");
            return Ok(());
        }
        if hosts.is_empty() {
            return Ok(());
        }
        if !volume.state.is_operational() {
            return Err(Error::InvalidState {
                volume: self.name.to_string(),
                state: volume.state.to_string(),
            });
        }

        info!(volume = %self.name, job, hosts = hosts.len(), "unmount requested");
        let job_owned = job.to_string();
        let hosts_owned: Vec<String> = hosts.to_vec();
        self.volumes
            .update_attachments(&self.name, move |attachments| {
                for host in &hosts_owned {
                    let att = attachments
                        .iter_mut()
                        .find(|a| a.matches(host, &job_owned))
                        .ok_or_else(|| Error::not_found(format!("{}/{}", host, job_owned)))?;
                    if att.state != AttachmentState::Attached {
                        return Err(Error::InvalidState {
                            volume: format!("{}/{}", host, job_owned),
                            state: att.state.to_string(),
                        });
                    }
                    att.state = AttachmentState::RequestDetach;
                }
                Ok(())
            })
            .await?;

        let wanted: Vec<(String, String)> = hosts
            .iter()
            .map(|h| (h.clone(), job.to_string()))
            .collect();
        let volume_name = self.name.to_string();
        let wanted_for_wait = wanted.clone();
        self.volumes
            .wait_for_condition(&self.name, cancel, move |volume, attachments| {
                if volume.state == VolumeState::Error {
                    return Some(Err(Error::VolumeErrored {
                        volume: volume_name.clone(),
                        reason: volume
                            .error_detail
                            .clone()
                            .unwrap_or_else(|| "unknown".to_string()),
                    }));
                }
                for (host, job) in &wanted_for_wait {
                    let att = attachments.iter().find(|a| a.matches(host, job));
                    match att.map(|a| a.state) {
                        Some(AttachmentState::AttachmentError) => {
                            return Some(Err(Error::AttachmentFailed {
                                volume: volume_name.clone(),
                                hostname: host.clone(),
                                reason: att
                                    .and_then(|a| a.detail.clone())
                                    .unwrap_or_else(|| "unknown".to_string()),
                            }));
                        }
                        Some(AttachmentState::Detached) | None => {}
                        _ => return None,
                    }
                }
                Some(Ok(()))
            })
            .await?;

        // drop the detached records so a later job can attach
        self.volumes
            .update_attachments(&self.name, move |attachments| {
                attachments.retain(|a| {
                    !wanted
                        .iter()
                        .any(|(host, job)| a.matches(host, job))
                });
                Ok(())
            })
            .await?;
        Ok(())
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Tear the volume down and remove its record
    ///
    /// Covers the aborted-allocation path: a volume that never had bricks
    /// assigned is deleted outright, unless allocations already exist in
    /// which case the agent has not caught up yet and the caller must
    /// retry.
    pub async fn delete(&self, cancel: &CancellationToken) -> Result<()> {
        let volume = self.volumes.volume(&self.name).await?;
        if volume.size_bricks == 0 {
            return self.volumes.delete_volume(&self.name).await;
        }

        let allocations = self.pools.get_allocations_for_volume(&self.name).await?;
        if !volume.had_bricks_assigned {
            if allocations.is_empty() {
                return self.volumes.delete_volume(&self.name).await;
            }
            return Err(Error::Race {
                volume: self.name.to_string(),
            });
        }

        info!(volume = %self.name, "delete requested");
        match volume.state {
            // an errored volume is removed without the teardown dance;
            // its bricks drain through the deallocate flags
            VolumeState::Error | VolumeState::BricksDeleted => {}
            VolumeState::DeleteRequested => {
                self.volumes
                    .wait_for_state(&self.name, VolumeState::BricksDeleted, cancel)
                    .await?;
            }
            _ => {
                self.volumes
                    .update_state(&self.name, VolumeState::DeleteRequested)
                    .await?;
                self.volumes
                    .wait_for_state(&self.name, VolumeState::BricksDeleted, cancel)
                    .await?;
            }
        }

        self.pools.deallocate_bricks(&self.name).await?;
        let remaining = self.pools.get_allocations_for_volume(&self.name).await?;
        self.pools.hard_delete_allocations(remaining).await?;
        self.volumes.delete_volume(&self.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::Keystore;
    use crate::model::Volume;
    use crate::registry::MemoryKeystore;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (VolumeRegistry, PoolRegistry, Arc<MemoryKeystore>) {
        let store = Arc::new(MemoryKeystore::new());
        (
            VolumeRegistry::new(store.clone()),
            PoolRegistry::new(store.clone()),
            store,
        )
    }

    fn manager(
        volumes: &VolumeRegistry,
        pools: &PoolRegistry,
        name: &str,
    ) -> VolumeLifecycleManager {
        VolumeLifecycleManager::new(volumes.clone(), pools.clone(), VolumeName::new(name))
    }

    #[tokio::test]
    async fn test_zero_brick_volume_crosses_lifecycle_without_work() {
        let (volumes, pools, store) = setup();
        let vol = Volume::new("meta", "pool1", 0, "j1");
        volumes.add_volume(&vol).await.unwrap();

        let vlm = manager(&volumes, &pools, "meta");
        let cancel = CancellationToken::new();

        vlm.provision_bricks(&cancel).await.unwrap();
        vlm.data_in(&cancel).await.unwrap();
        vlm.mount(&["c1".into()], "j1", &cancel).await.unwrap();
        vlm.unmount(&["c1".into()], "j1", &cancel).await.unwrap();
        vlm.data_out(&cancel).await.unwrap();
        vlm.delete(&cancel).await.unwrap();

        assert!(store.get_all("/volumes/").await.unwrap().is_empty());
        assert!(store.get_all("/allocs/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mount_with_empty_host_list_is_noop() {
        let (volumes, pools, _) = setup();
        let vol = Volume::new("vs", "pool1", 2, "j1");
        volumes.add_volume(&vol).await.unwrap();

        let vlm = manager(&volumes, &pools, "vs");
        let cancel = CancellationToken::new();
        // state precondition is never even consulted
        vlm.mount(&[], "j1", &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_mount_refused_outside_operational_states() {
        let (volumes, pools, _) = setup();
        let vol = Volume::new("vs", "pool1", 2, "j1");
        volumes.add_volume(&vol).await.unwrap();

        let vlm = manager(&volumes, &pools, "vs");
        let cancel = CancellationToken::new();
        let err = vlm
            .mount(&["c1".into()], "j1", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_delete_race_when_allocation_outpaces_flag() {
        let (volumes, pools, store) = setup();
        let vol = Volume::new("vs", "pool1", 2, "j1");
        volumes.add_volume(&vol).await.unwrap();

        // an allocation record exists but the sticky flag is not yet set
        store
            .add(vec![crate::domain::ports::KeyValue::new(
                "/allocs/h1/dA",
                serde_json::to_string(&crate::model::BrickAllocation {
                    hostname: "h1".into(),
                    device: "dA".into(),
                    allocated_volume: VolumeName::new("vs"),
                    allocated_index: 0,
                    deallocate_requested: false,
                })
                .unwrap(),
            )])
            .await
            .unwrap();

        let vlm = manager(&volumes, &pools, "vs");
        let cancel = CancellationToken::new();
        assert!(matches!(
            vlm.delete(&cancel).await,
            Err(Error::Race { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_of_never_allocated_volume() {
        let (volumes, pools, store) = setup();
        let vol = Volume::new("vs", "pool1", 2, "j1");
        volumes.add_volume(&vol).await.unwrap();

        let vlm = manager(&volumes, &pools, "vs");
        let cancel = CancellationToken::new();
        vlm.delete(&cancel).await.unwrap();
        assert!(store.get_all("/volumes/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mount_fails_fast_on_attachment_error() {
        let (volumes, pools, _) = setup();
        let vol = Volume::new("vs", "pool1", 2, "j1");
        volumes.add_volume(&vol).await.unwrap();
        volumes
            .update_state(&vol.name, VolumeState::BricksAllocated)
            .await
            .unwrap();
        volumes
            .update_state(&vol.name, VolumeState::BricksProvisioned)
            .await
            .unwrap();

        let vlm = manager(&volumes, &pools, "vs");
        let cancel = CancellationToken::new();

        // play the agent: c1 attaches, c2 fails
        let agent = {
            let volumes = volumes.clone();
            let name = vol.name.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                volumes
                    .update_attachments(&name, |attachments| {
                        for att in attachments.iter_mut() {
                            if att.hostname == "c1" {
                                att.state = AttachmentState::Attached;
                            } else {
                                att.state = AttachmentState::AttachmentError;
                                att.detail = Some("loopback busy".into());
                            }
                        }
                        Ok(())
                    })
                    .await
                    .unwrap();
            })
        };

        let err = vlm
            .mount(&["c1".into(), "c2".into()], "j1", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AttachmentFailed { ref hostname, .. } if hostname == "c2"));
        agent.await.unwrap();

        // the successful peer is left attached for the caller to unmount
        let attachments = volumes.attachments(&vol.name).await.unwrap();
        let c1 = attachments.iter().find(|a| a.hostname == "c1").unwrap();
        assert_eq!(c1.state, AttachmentState::Attached);
    }

    #[tokio::test]
    async fn test_mount_refuses_while_other_job_still_attached() {
        let (volumes, pools, _) = setup();
        let mut vol = Volume::new("vp", "pool1", 1, "ja");
        vol.multi_job = true;
        volumes.add_volume(&vol).await.unwrap();
        volumes
            .update_state(&vol.name, VolumeState::BricksAllocated)
            .await
            .unwrap();
        volumes
            .update_state(&vol.name, VolumeState::BricksProvisioned)
            .await
            .unwrap();

        // job ja is still attached
        volumes
            .update_attachments(&vol.name, |attachments| {
                attachments.push(Attachment {
                    hostname: "c1".into(),
                    job: "ja".into(),
                    state: AttachmentState::Attached,
                    detail: None,
                });
                Ok(())
            })
            .await
            .unwrap();

        let vlm = manager(&volumes, &pools, "vp");
        let cancel = CancellationToken::new();
        let err = vlm
            .mount(&["c2".into()], "jb", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }
}
