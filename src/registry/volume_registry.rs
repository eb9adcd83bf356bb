//! Volume Registry
//!
//! Reads and compare-and-swap writes for volume records and their
//! attachment lists, plus the watch-backed wait primitives the lifecycle
//! entry points block on. Waits subscribe before reading the initial
//! snapshot so no commit can be lost in between.

use crate::domain::ports::{KeyValue, KeyValueVersion, KeystoreRef, Transaction};
use crate::error::{Error, Result};
use crate::model::{Attachment, Volume, VolumeName, VolumeState};
use crate::registry::keys;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Bounded retries for read-modify-write loops racing other writers
const MAX_CAS_RETRIES: usize = 8;

fn is_valid_volume_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn parse_volume(kv: &KeyValueVersion) -> Result<Volume> {
    Ok(serde_json::from_str(&kv.value)?)
}

fn parse_attachments(kv: &KeyValueVersion) -> Result<Vec<Attachment>> {
    Ok(serde_json::from_str(&kv.value)?)
}

// =============================================================================
// Volume Registry
// =============================================================================

/// Façade over the keystore for volume records
#[derive(Clone)]
pub struct VolumeRegistry {
    store: KeystoreRef,
}

impl VolumeRegistry {
    pub fn new(store: KeystoreRef) -> Self {
        Self { store }
    }

    // =========================================================================
    // CRUD
    // =========================================================================

    /// Register a new volume; the record and its empty attachment list are
    /// created in one commit
    pub async fn add_volume(&self, volume: &Volume) -> Result<()> {
        if !is_valid_volume_name(volume.name.as_str()) {
            return Err(Error::Invalid(format!(
                "bad volume name: {:?}",
                volume.name.as_str()
            )));
        }
        if volume.state != VolumeState::Registered {
            return Err(Error::Invalid(format!(
                "new volume {} must start Registered, got {}",
                volume.name, volume.state
            )));
        }
        let record = serde_json::to_string(volume)?;
        self.store
            .add(vec![
                KeyValue::new(keys::volume_record(volume.name.as_str()), record),
                KeyValue::new(keys::volume_attachments(volume.name.as_str()), "[]"),
            ])
            .await?;
        debug!(volume = %volume.name, pool = %volume.pool, bricks = volume.size_bricks, "volume registered");
        Ok(())
    }

    pub async fn volume(&self, name: &VolumeName) -> Result<Volume> {
        let kv = self.store.get(&keys::volume_record(name.as_str())).await?;
        parse_volume(&kv)
    }

    /// Read a volume together with the version needed for CAS writes
    pub async fn record(&self, name: &VolumeName) -> Result<(Volume, i64)> {
        let kv = self.store.get(&keys::volume_record(name.as_str())).await?;
        Ok((parse_volume(&kv)?, kv.version))
    }

    pub async fn all_volumes(&self) -> Result<Vec<Volume>> {
        let kvs = self.store.get_all(keys::VOLUMES_PREFIX).await?;
        let mut volumes = Vec::new();
        for kv in kvs.iter().filter(|kv| kv.key.ends_with("/record")) {
            volumes.push(parse_volume(kv)?);
        }
        Ok(volumes)
    }

    pub async fn attachments(&self, name: &VolumeName) -> Result<Vec<Attachment>> {
        match self
            .store
            .get(&keys::volume_attachments(name.as_str()))
            .await
        {
            Ok(kv) => parse_attachments(&kv),
            Err(Error::NotFound { .. }) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Delete the record and the attachment list in one commit
    pub async fn delete_volume(&self, name: &VolumeName) -> Result<()> {
        let record = self.store.get(&keys::volume_record(name.as_str())).await?;
        let mut txn = Transaction::new().delete(record);
        if let Ok(atts) = self
            .store
            .get(&keys::volume_attachments(name.as_str()))
            .await
        {
            txn = txn.delete(atts);
        }
        self.store.txn(txn).await?;
        debug!(volume = %name, "volume deleted");
        Ok(())
    }

    // =========================================================================
    // State Transitions
    // =========================================================================

    /// Advance the volume state; legal only along the canonical ordering
    pub async fn update_state(&self, name: &VolumeName, new_state: VolumeState) -> Result<Volume> {
        for _ in 0..MAX_CAS_RETRIES {
            let (volume, version) = self.record(name).await?;
            if !volume.state.can_advance_to(new_state) {
                return Err(Error::InvalidState {
                    volume: name.to_string(),
                    state: volume.state.to_string(),
                });
            }
            let mut updated = volume;
            updated.state = new_state;
            let value = serde_json::to_string(&updated)?;
            match self
                .store
                .update(vec![KeyValueVersion {
                    key: keys::volume_record(name.as_str()),
                    value,
                    version,
                }])
                .await
            {
                Ok(()) => {
                    debug!(volume = %name, state = %new_state, "volume state advanced");
                    return Ok(updated);
                }
                Err(err) if err.is_transient() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::conflict(keys::volume_record(name.as_str())))
    }

    /// Sink the volume into the error state with a reason for diagnosis
    ///
    /// Keeps the first recorded reason if the volume is already errored.
    pub async fn set_error(&self, name: &VolumeName, reason: &str) -> Result<()> {
        for _ in 0..MAX_CAS_RETRIES {
            let (volume, version) = self.record(name).await?;
            if volume.state == VolumeState::Error {
                return Ok(());
            }
            if !volume.state.can_advance_to(VolumeState::Error) {
                return Err(Error::InvalidState {
                    volume: name.to_string(),
                    state: volume.state.to_string(),
                });
            }
            let mut updated = volume;
            updated.state = VolumeState::Error;
            updated.error_detail = Some(reason.to_string());
            let value = serde_json::to_string(&updated)?;
            match self
                .store
                .update(vec![KeyValueVersion {
                    key: keys::volume_record(name.as_str()),
                    value,
                    version,
                }])
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::conflict(keys::volume_record(name.as_str())))
    }

    // =========================================================================
    // Attachments
    // =========================================================================

    /// Mutate the attachment list under CAS; refused while the volume is
    /// in the error state
    pub async fn update_attachments<F>(&self, name: &VolumeName, mutate: F) -> Result<Vec<Attachment>>
    where
        F: Fn(&mut Vec<Attachment>) -> Result<()>,
    {
        for _ in 0..MAX_CAS_RETRIES {
            let (volume, _) = self.record(name).await?;
            if volume.state == VolumeState::Error {
                return Err(Error::InvalidState {
                    volume: name.to_string(),
                    state: volume.state.to_string(),
                });
            }
            let key = keys::volume_attachments(name.as_str());
            let kv = self.store.get(&key).await?;
            let mut attachments = parse_attachments(&kv)?;
            mutate(&mut attachments)?;
            let value = serde_json::to_string(&attachments)?;
            match self
                .store
                .update(vec![KeyValueVersion {
                    key,
                    value,
                    version: kv.version,
                }])
                .await
            {
                Ok(()) => return Ok(attachments),
                Err(err) if err.is_transient() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::conflict(keys::volume_attachments(name.as_str())))
    }

    // =========================================================================
    // Waits
    // =========================================================================

    /// Raw subscription to every commit touching this volume, used by the
    /// agent-side workers to drive their reconcile loop
    pub async fn watch_volume(
        &self,
        cancel: &CancellationToken,
        name: &VolumeName,
    ) -> Result<crate::domain::ports::WatchStream> {
        self.store
            .watch(cancel, &keys::volume_prefix(name.as_str()), true)
            .await
    }

    /// Block until `pred` accepts a snapshot of the volume and its
    /// attachments, the volume disappears, or the token is cancelled
    ///
    /// The watch is subscribed before the initial read, so a commit racing
    /// the subscription is observed either in the snapshot or as an event.
    pub async fn wait_for_condition<F>(
        &self,
        name: &VolumeName,
        cancel: &CancellationToken,
        mut pred: F,
    ) -> Result<()>
    where
        F: FnMut(&Volume, &[Attachment]) -> Option<Result<()>> + Send,
    {
        let record_key = keys::volume_record(name.as_str());
        let attachments_key = keys::volume_attachments(name.as_str());

        let mut events = self
            .store
            .watch(cancel, &keys::volume_prefix(name.as_str()), true)
            .await?;

        let mut volume = self.volume(name).await?;
        let mut attachments = self.attachments(name).await?;

        loop {
            if let Some(result) = pred(&volume, &attachments) {
                return result;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                event = events.recv() => match event {
                    None => return Err(Error::Keystore("watch stream closed".into())),
                    Some(event) => {
                        trace!(volume = %name, key = event.key(), "volume watch event");
                        if event.key() == record_key {
                            match &event.new {
                                Some(kv) => volume = parse_volume(kv)?,
                                None => return Err(Error::not_found(&record_key)),
                            }
                        } else if event.key() == attachments_key {
                            attachments = match &event.new {
                                Some(kv) => parse_attachments(kv)?,
                                None => Vec::new(),
                            };
                        }
                    }
                },
            }
        }
    }

    /// Block until the volume reaches `target`, fails into the error
    /// state, or the token is cancelled
    pub async fn wait_for_state(
        &self,
        name: &VolumeName,
        target: VolumeState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug!(volume = %name, target = %target, "waiting for volume state");
        self.wait_for_condition(name, cancel, |volume, _| {
            if volume.state == VolumeState::Error {
                return Some(Err(Error::VolumeErrored {
                    volume: volume.name.to_string(),
                    reason: volume
                        .error_detail
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                }));
            }
            if volume.state.rank() >= target.rank() {
                return Some(Ok(()));
            }
            None
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::Keystore;
    use crate::registry::MemoryKeystore;
    use std::sync::Arc;
    use std::time::Duration;

    fn registry() -> (VolumeRegistry, Arc<MemoryKeystore>) {
        let store = Arc::new(MemoryKeystore::new());
        (VolumeRegistry::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_add_and_get_volume() {
        let (volumes, _) = registry();
        let vol = Volume::new("vs", "pool1", 2, "j1");
        volumes.add_volume(&vol).await.unwrap();

        let back = volumes.volume(&vol.name).await.unwrap();
        assert_eq!(back, vol);
        assert!(volumes.attachments(&vol.name).await.unwrap().is_empty());

        assert!(matches!(
            volumes.add_volume(&vol).await,
            Err(Error::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_add_volume_rejects_bad_name() {
        let (volumes, _) = registry();
        let vol = Volume::new("bad/name", "pool1", 1, "j1");
        assert!(matches!(
            volumes.add_volume(&vol).await,
            Err(Error::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_update_state_is_monotonic() {
        let (volumes, _) = registry();
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

        // rewind refused
        let err = volumes
            .update_state(&vol.name, VolumeState::BricksAllocated)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        let back = volumes.volume(&vol.name).await.unwrap();
        assert_eq!(back.state, VolumeState::BricksProvisioned);
    }

    #[tokio::test]
    async fn test_set_error_records_reason_once() {
        let (volumes, _) = registry();
        let vol = Volume::new("vs", "pool1", 2, "j1");
        volumes.add_volume(&vol).await.unwrap();

        volumes.set_error(&vol.name, "mkfs failed").await.unwrap();
        volumes.set_error(&vol.name, "later failure").await.unwrap();

        let back = volumes.volume(&vol.name).await.unwrap();
        assert_eq!(back.state, VolumeState::Error);
        assert_eq!(back.error_detail.as_deref(), Some("mkfs failed"));
    }

    #[tokio::test]
    async fn test_update_attachments_refused_in_error() {
        let (volumes, _) = registry();
        let vol = Volume::new("vs", "pool1", 2, "j1");
        volumes.add_volume(&vol).await.unwrap();
        volumes.set_error(&vol.name, "boom").await.unwrap();

        let err = volumes
            .update_attachments(&vol.name, |atts| {
                atts.push(Attachment::request("c1", "j1"));
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_wait_for_state_sees_later_commit() {
        let (volumes, _) = registry();
        let vol = Volume::new("vs", "pool1", 2, "j1");
        volumes.add_volume(&vol).await.unwrap();

        let waiter = {
            let volumes = volumes.clone();
            let name = vol.name.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                volumes
                    .wait_for_state(&name, VolumeState::BricksProvisioned, &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        volumes
            .update_state(&vol.name, VolumeState::BricksAllocated)
            .await
            .unwrap();
        volumes
            .update_state(&vol.name, VolumeState::BricksProvisioned)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_state_returns_immediately_when_already_there() {
        let (volumes, _) = registry();
        let vol = Volume::new("vs", "pool1", 2, "j1");
        volumes.add_volume(&vol).await.unwrap();
        volumes
            .update_state(&vol.name, VolumeState::BricksAllocated)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        tokio::time::timeout(
            Duration::from_millis(200),
            volumes.wait_for_state(&vol.name, VolumeState::BricksAllocated, &cancel),
        )
        .await
        .expect("should not block")
        .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_state_fails_on_error_sink() {
        let (volumes, _) = registry();
        let vol = Volume::new("vs", "pool1", 2, "j1");
        volumes.add_volume(&vol).await.unwrap();

        let waiter = {
            let volumes = volumes.clone();
            let name = vol.name.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                volumes
                    .wait_for_state(&name, VolumeState::BricksProvisioned, &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        volumes.set_error(&vol.name, "provision failed").await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::VolumeErrored { .. })));
    }

    #[tokio::test]
    async fn test_wait_cancellation() {
        let (volumes, _) = registry();
        let vol = Volume::new("vs", "pool1", 2, "j1");
        volumes.add_volume(&vol).await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let volumes = volumes.clone();
            let name = vol.name.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                volumes
                    .wait_for_state(&name, VolumeState::BricksDeleted, &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_delete_volume_removes_both_keys() {
        let (volumes, store) = registry();
        let vol = Volume::new("vs", "pool1", 2, "j1");
        volumes.add_volume(&vol).await.unwrap();

        volumes.delete_volume(&vol.name).await.unwrap();
        assert!(store.get_all("/volumes/").await.unwrap().is_empty());
    }
}
