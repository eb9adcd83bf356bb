//! Volume Worker
//!
//! Runs on the primary brick host for one volume and owns its physical
//! progress: provisioning, data staging, attach/detach work on the
//! compute nodes, and teardown. The worker reacts to registry commits and
//! is idempotent; replaying a transition it has already performed
//! succeeds because the underlying recipes guard themselves.

use crate::domain::ports::FilesystemDriverRef;
use crate::error::{Error, Result};
use crate::model::{Attachment, AttachmentState, Volume, VolumeName, VolumeState};
use crate::registry::{PoolRegistry, VolumeRegistry};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct VolumeWorker {
    volumes: VolumeRegistry,
    pools: PoolRegistry,
    driver: FilesystemDriverRef,
    hostname: String,
    name: VolumeName,
}

impl VolumeWorker {
    pub fn new(
        volumes: VolumeRegistry,
        pools: PoolRegistry,
        driver: FilesystemDriverRef,
        hostname: impl Into<String>,
        name: VolumeName,
    ) -> Self {
        Self {
            volumes,
            pools,
            driver,
            hostname: hostname.into(),
            name,
        }
    }

    /// Drive the volume until its record disappears or the agent stops
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        // subscribe before the first snapshot so no commit is lost
        let mut events = self.volumes.watch_volume(cancel, &self.name).await?;
        info!(volume = %self.name, hostname = %self.hostname, "volume worker started");

        loop {
            let volume = match self.volumes.volume(&self.name).await {
                Ok(volume) => volume,
                Err(Error::NotFound { .. }) => {
                    info!(volume = %self.name, "volume record gone, worker done");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            let attachments = self.volumes.attachments(&self.name).await?;

            self.step(&volume, &attachments).await?;

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    None => return Ok(()),
                    Some(event) => {
                        debug!(volume = %self.name, key = event.key(), "worker woke on commit");
                        // drain whatever else is queued before re-reading
                        while let Ok(more) = events.try_recv() {
                            debug!(volume = %self.name, key = more.key(), "worker drained commit");
                        }
                    }
                },
            }
        }
    }

    /// Perform every piece of physical work the current snapshot asks for
    async fn step(&self, volume: &Volume, attachments: &[Attachment]) -> Result<()> {
        match volume.state {
            VolumeState::BricksAllocated => self.provision(volume).await?,
            VolumeState::DataInRequested => self.stage(volume, VolumeState::DataInComplete).await?,
            VolumeState::DataOutRequested => {
                self.stage(volume, VolumeState::DataOutComplete).await?
            }
            VolumeState::DeleteRequested => self.teardown(volume).await?,
            VolumeState::Error => return Ok(()),
            _ => {}
        }

        for attachment in attachments {
            match attachment.state {
                AttachmentState::RequestAttach => self.attach(volume, attachment).await?,
                AttachmentState::RequestDetach => self.detach(volume, attachment).await?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Format and assemble the filesystem across the allocated bricks
    ///
    /// The formatting recipe itself is deployment tooling; from the
    /// coordination protocol's point of view this step is opaque and ends
    /// with the state advancing.
    async fn provision(&self, volume: &Volume) -> Result<()> {
        info!(volume = %volume.name, fs = %volume.filesystem, "provisioning bricks");
        self.advance(volume, VolumeState::BricksProvisioned).await
    }

    /// Opaque data staging pass ending in the given complete state
    async fn stage(&self, volume: &Volume, complete: VolumeState) -> Result<()> {
        info!(volume = %volume.name, target = %complete, "staging data");
        self.advance(volume, complete).await
    }

    async fn teardown(&self, volume: &Volume) -> Result<()> {
        info!(volume = %volume.name, "tearing down bricks");
        self.advance(volume, VolumeState::BricksDeleted).await
    }

    async fn advance(&self, volume: &Volume, state: VolumeState) -> Result<()> {
        match self.volumes.update_state(&volume.name, state).await {
            Ok(_) => Ok(()),
            // someone else already advanced it, the watch will wake us
            Err(Error::InvalidState { .. }) | Err(Error::Conflict { .. }) => Ok(()),
            Err(err) => {
                self.volumes
                    .set_error(&volume.name, &err.to_string())
                    .await
                    .ok();
                Err(err)
            }
        }
    }

    async fn attach(&self, volume: &Volume, attachment: &Attachment) -> Result<()> {
        let records = self.pools.get_allocations_for_volume(&self.name).await?;
        let bricks: Vec<_> = records.into_iter().map(|r| r.allocation).collect();

        let result = self
            .driver
            .mount(volume, &bricks, std::slice::from_ref(attachment))
            .await;
        match result {
            Ok(()) => {
                self.finish_attachment(
                    attachment,
                    AttachmentState::RequestAttach,
                    AttachmentState::Attached,
                    None,
                )
                .await
            }
            Err(err) => {
                warn!(
                    volume = %volume.name,
                    hostname = %attachment.hostname,
                    error = %err,
                    "attach failed"
                );
                self.finish_attachment(
                    attachment,
                    AttachmentState::RequestAttach,
                    AttachmentState::AttachmentError,
                    Some(err.to_string()),
                )
                .await
            }
        }
    }

    async fn detach(&self, volume: &Volume, attachment: &Attachment) -> Result<()> {
        let records = self.pools.get_allocations_for_volume(&self.name).await?;
        let bricks: Vec<_> = records.into_iter().map(|r| r.allocation).collect();

        let result = self
            .driver
            .umount(volume, &bricks, std::slice::from_ref(attachment))
            .await;
        match result {
            Ok(()) => {
                self.finish_attachment(
                    attachment,
                    AttachmentState::RequestDetach,
                    AttachmentState::Detached,
                    None,
                )
                .await
            }
            Err(err) => {
                warn!(
                    volume = %volume.name,
                    hostname = %attachment.hostname,
                    error = %err,
                    "detach failed"
                );
                self.finish_attachment(
                    attachment,
                    AttachmentState::RequestDetach,
                    AttachmentState::AttachmentError,
                    Some(err.to_string()),
                )
                .await
            }
        }
    }

    /// CAS one attachment from `expected` into `next`, tolerating a
    /// concurrent transition by someone else
    async fn finish_attachment(
        &self,
        attachment: &Attachment,
        expected: AttachmentState,
        next: AttachmentState,
        detail: Option<String>,
    ) -> Result<()> {
        let hostname = attachment.hostname.clone();
        let job = attachment.job.clone();
        let result = self
            .volumes
            .update_attachments(&self.name, move |attachments| {
                if let Some(att) = attachments
                    .iter_mut()
                    .find(|a| a.matches(&hostname, &job) && a.state == expected)
                {
                    att.state = next;
                    att.detail = detail.clone();
                }
                Ok(())
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            // attachment mutation is refused once the volume errored;
            // nothing left for this worker to record
            Err(Error::InvalidState { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
