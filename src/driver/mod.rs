//! Driver Module
//!
//! Composes the per-filesystem recipes (Lustre, BeeGFS) with the generic
//! per-attachment work: mount directories, optional swap over a loopback
//! device, optional private namespaces, the shared global directory, and
//! ownership fix-ups. Every physical action goes through the command
//! runner handed in at construction.

pub mod beegfs;
pub mod lustre;
pub mod runner;

pub use runner::{RecordingRunner, SshRunner};

use crate::domain::ports::{CommandRunnerRef, FilesystemDriver};
use crate::error::{Error, Result};
use crate::model::{Attachment, AttachmentState, BrickAllocation, FsType, Volume};
use async_trait::async_trait;
use tracing::{info, warn};

/// Metadata target size used when formatting, overridable per deployment
const DEFAULT_MDT_SIZE: &str = "20GB";

// =============================================================================
// Parallel Filesystem Driver
// =============================================================================

/// Production driver dispatching to the Lustre and BeeGFS recipes
pub struct PfsDriver {
    runner: CommandRunnerRef,
    lnet_suffix: String,
    mdt_size: String,
}

impl PfsDriver {
    pub fn new(runner: CommandRunnerRef) -> Self {
        Self {
            runner,
            lnet_suffix: String::new(),
            mdt_size: DEFAULT_MDT_SIZE.to_string(),
        }
    }

    /// Pick up `DAC_LNET_SUFFIX` and `DAC_MDT_SIZE` from the environment
    pub fn from_env(runner: CommandRunnerRef) -> Self {
        let lnet_suffix = std::env::var("DAC_LNET_SUFFIX").unwrap_or_default();
        let mdt_size =
            std::env::var("DAC_MDT_SIZE").unwrap_or_else(|_| DEFAULT_MDT_SIZE.to_string());
        Self {
            runner,
            lnet_suffix,
            mdt_size,
        }
    }

    pub fn mdt_size(&self) -> &str {
        &self.mdt_size
    }

    fn primary_host<'a>(volume: &Volume, bricks: &'a [BrickAllocation]) -> Result<&'a str> {
        bricks
            .iter()
            .find(|b| b.is_primary())
            .map(|b| b.hostname.as_str())
            .ok_or_else(|| {
                Error::Internal(format!("no primary brick for volume {}", volume.name))
            })
    }

    async fn attach_one(
        &self,
        volume: &Volume,
        primary: &str,
        attachment: &Attachment,
    ) -> Result<()> {
        let hostname = attachment.hostname.as_str();
        let mount_dir = volume.mount_dir(&attachment.job);

        mkdir(&self.runner, hostname, &mount_dir).await?;
        match volume.filesystem {
            FsType::Lustre => {
                lustre::mount(
                    &self.runner,
                    hostname,
                    &self.lnet_suffix,
                    primary,
                    &volume.uuid,
                    &mount_dir,
                )
                .await?
            }
            FsType::Beegfs => {
                beegfs::mount(&self.runner, hostname, &volume.uuid, &mount_dir).await?
            }
        }

        if !volume.multi_job && volume.attach_as_swap_bytes > 0 {
            let swap_dir = format!("{}/swap", mount_dir);
            mkdir(&self.runner, hostname, &swap_dir).await?;
            fixup_ownership(&self.runner, hostname, 0, 0, &swap_dir).await?;

            let swap_mb = volume.attach_as_swap_bytes / (1024 * 1024);
            let swap_file = format!("{}/{}", swap_dir, hostname);
            let loopback = format!("/dev/loop{}", volume.client_port);
            create_swap(&self.runner, hostname, swap_mb, &swap_file, &loopback).await?;
            swap_on(&self.runner, hostname, &loopback).await?;
        }

        if !volume.multi_job && volume.attach_private_namespace {
            let private_dir = format!("{}/private/{}", mount_dir, hostname);
            mkdir(&self.runner, hostname, &private_dir).await?;
            fixup_ownership(&self.runner, hostname, volume.owner, volume.group, &private_dir)
                .await?;

            // a consistent symlink so shared environment variables work
            // on every host
            let symlink = Volume::private_symlink_dir(&attachment.job);
            create_symlink(&self.runner, hostname, &private_dir, &symlink).await?;
        }

        let shared_dir = format!("{}/global", mount_dir);
        mkdir(&self.runner, hostname, &shared_dir).await?;
        fixup_ownership(&self.runner, hostname, volume.owner, volume.group, &shared_dir).await
    }

    async fn detach_one(&self, volume: &Volume, attachment: &Attachment) -> Result<()> {
        let hostname = attachment.hostname.as_str();
        let mount_dir = volume.mount_dir(&attachment.job);

        if !volume.multi_job && volume.attach_as_swap_bytes > 0 {
            let swap_file = format!("{}/swap/{}", mount_dir, hostname);
            let loopback = format!("/dev/loop{}", volume.client_port);
            if let Err(err) = swap_off(&self.runner, hostname, &loopback).await {
                warn!(hostname, error = %err, "failed to swap off, carrying on");
            }
            if let Err(err) = detach_loopback(&self.runner, hostname, &loopback).await {
                warn!(hostname, error = %err, "failed to detach loopback, carrying on");
            }
            remove_subtree(&self.runner, hostname, &swap_file).await?;
        }

        if !volume.multi_job && volume.attach_private_namespace {
            let symlink = Volume::private_symlink_dir(&attachment.job);
            remove_subtree(&self.runner, hostname, &symlink).await?;
        }

        match volume.filesystem {
            FsType::Lustre => {
                lustre::umount(&self.runner, hostname, &mount_dir).await?;
                remove_subtree(&self.runner, hostname, &mount_dir).await?;
            }
            FsType::Beegfs => {
                beegfs::umount(&self.runner, hostname, &mount_dir).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FilesystemDriver for PfsDriver {
    async fn mount(
        &self,
        volume: &Volume,
        bricks: &[BrickAllocation],
        attachments: &[Attachment],
    ) -> Result<()> {
        info!(volume = %volume.name, "mount");
        let primary = Self::primary_host(volume, bricks)?;
        for attachment in attachments {
            if attachment.state != AttachmentState::RequestAttach {
                continue;
            }
            self.attach_one(volume, primary, attachment).await?;
        }
        Ok(())
    }

    async fn umount(
        &self,
        volume: &Volume,
        _bricks: &[BrickAllocation],
        attachments: &[Attachment],
    ) -> Result<()> {
        info!(volume = %volume.name, "umount");
        for attachment in attachments {
            if attachment.state != AttachmentState::RequestDetach {
                continue;
            }
            self.detach_one(volume, attachment).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Generic Attach Commands
// =============================================================================

async fn mkdir(runner: &CommandRunnerRef, hostname: &str, directory: &str) -> Result<()> {
    runner
        .execute(hostname, &format!("mkdir -p {}", directory))
        .await
}

async fn fixup_ownership(
    runner: &CommandRunnerRef,
    hostname: &str,
    owner: u32,
    group: u32,
    directory: &str,
) -> Result<()> {
    runner
        .execute(hostname, &format!("chown {}:{} {}", owner, group, directory))
        .await?;
    runner
        .execute(hostname, &format!("chmod 770 {}", directory))
        .await
}

async fn create_swap(
    runner: &CommandRunnerRef,
    hostname: &str,
    swap_mb: u64,
    filename: &str,
    loopback: &str,
) -> Result<()> {
    runner
        .execute(
            hostname,
            &format!("dd if=/dev/zero of={} bs=1024 count={}", filename, swap_mb * 1024),
        )
        .await?;
    runner
        .execute(hostname, &format!("chmod 0600 {}", filename))
        .await?;
    runner
        .execute(hostname, &format!("losetup {} {}", loopback, filename))
        .await?;
    runner
        .execute(hostname, &format!("mkswap {}", loopback))
        .await
}

async fn swap_on(runner: &CommandRunnerRef, hostname: &str, loopback: &str) -> Result<()> {
    runner
        .execute(hostname, &format!("swapon {}", loopback))
        .await
}

async fn swap_off(runner: &CommandRunnerRef, hostname: &str, loopback: &str) -> Result<()> {
    runner
        .execute(hostname, &format!("swapoff {}", loopback))
        .await
}

async fn detach_loopback(runner: &CommandRunnerRef, hostname: &str, loopback: &str) -> Result<()> {
    runner
        .execute(hostname, &format!("losetup -d {}", loopback))
        .await
}

async fn remove_subtree(runner: &CommandRunnerRef, hostname: &str, directory: &str) -> Result<()> {
    runner
        .execute(hostname, &format!("rm -rf {}", directory))
        .await
}

async fn create_symlink(
    runner: &CommandRunnerRef,
    hostname: &str,
    src: &str,
    dest: &str,
) -> Result<()> {
    runner
        .execute(hostname, &format!("ln -s {} {}", src, dest))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VolumeName;
    use std::sync::Arc;

    fn scratch_volume() -> Volume {
        let mut vol = Volume::new("vs", "pool1", 2, "j1");
        vol.uuid = "u1".into();
        vol.owner = 1001;
        vol.group = 1001;
        vol.client_port = 3;
        vol
    }

    fn bricks_for(volume: &Volume) -> Vec<BrickAllocation> {
        vec![
            BrickAllocation {
                hostname: "h1".into(),
                device: "dA".into(),
                allocated_volume: volume.name.clone(),
                allocated_index: 0,
                deallocate_requested: false,
            },
            BrickAllocation {
                hostname: "h2".into(),
                device: "dC".into(),
                allocated_volume: volume.name.clone(),
                allocated_index: 1,
                deallocate_requested: false,
            },
        ]
    }

    fn driver_with(recorder: &Arc<RecordingRunner>) -> PfsDriver {
        let runner: CommandRunnerRef = recorder.clone();
        PfsDriver {
            runner,
            lnet_suffix: String::new(),
            mdt_size: DEFAULT_MDT_SIZE.to_string(),
        }
    }

    #[tokio::test]
    async fn test_attach_sequence_for_plain_scratch_volume() {
        let recorder = Arc::new(RecordingRunner::new());
        recorder.fail_matching("grep", "not mounted");
        let driver = driver_with(&recorder);

        let volume = scratch_volume();
        let bricks = bricks_for(&volume);
        let attachments = vec![Attachment::request("c1", "j1")];

        driver.mount(&volume, &bricks, &attachments).await.unwrap();

        let cmds = recorder.commands_for("c1");
        assert_eq!(
            cmds,
            vec![
                "mkdir -p /dac/j1_job".to_string(),
                "grep /dac/j1_job /etc/mtab".to_string(),
                "mount -t lustre -o flock,nodev,nosuid h1:/u1 /dac/j1_job".to_string(),
                "mkdir -p /dac/j1_job/global".to_string(),
                "chown 1001:1001 /dac/j1_job/global".to_string(),
                "chmod 770 /dac/j1_job/global".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_attach_with_swap_and_private_namespace() {
        let recorder = Arc::new(RecordingRunner::new());
        recorder.fail_matching("grep", "not mounted");
        let driver = driver_with(&recorder);

        let mut volume = scratch_volume();
        volume.attach_as_swap_bytes = 3 * 1024 * 1024;
        volume.attach_private_namespace = true;
        let bricks = bricks_for(&volume);
        let attachments = vec![Attachment::request("c1", "j1")];

        driver.mount(&volume, &bricks, &attachments).await.unwrap();

        let cmds = recorder.commands_for("c1");
        assert!(cmds.contains(&"mkdir -p /dac/j1_job/swap".to_string()));
        assert!(cmds.contains(&"chown 0:0 /dac/j1_job/swap".to_string()));
        assert!(cmds.contains(
            &"dd if=/dev/zero of=/dac/j1_job/swap/c1 bs=1024 count=3072".to_string()
        ));
        assert!(cmds.contains(&"chmod 0600 /dac/j1_job/swap/c1".to_string()));
        assert!(cmds.contains(&"losetup /dev/loop3 /dac/j1_job/swap/c1".to_string()));
        assert!(cmds.contains(&"mkswap /dev/loop3".to_string()));
        assert!(cmds.contains(&"swapon /dev/loop3".to_string()));
        assert!(cmds.contains(&"mkdir -p /dac/j1_job/private/c1".to_string()));
        assert!(cmds.contains(
            &"ln -s /dac/j1_job/private/c1 /dac/j1_job_private".to_string()
        ));
    }

    #[tokio::test]
    async fn test_detach_reverses_attach() {
        let recorder = Arc::new(RecordingRunner::new());
        let driver = driver_with(&recorder);

        let mut volume = scratch_volume();
        volume.attach_as_swap_bytes = 3 * 1024 * 1024;
        volume.attach_private_namespace = true;
        let bricks = bricks_for(&volume);
        let mut attachment = Attachment::request("c1", "j1");
        attachment.state = AttachmentState::RequestDetach;

        driver
            .umount(&volume, &bricks, &[attachment])
            .await
            .unwrap();

        let cmds = recorder.commands_for("c1");
        assert_eq!(
            cmds,
            vec![
                "swapoff /dev/loop3".to_string(),
                "losetup -d /dev/loop3".to_string(),
                "rm -rf /dac/j1_job/swap/c1".to_string(),
                "rm -rf /dac/j1_job_private".to_string(),
                "grep /dac/j1_job /etc/mtab".to_string(),
                "umount /dac/j1_job".to_string(),
                "rm -rf /dac/j1_job".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_persistent_volume_skips_swap_and_private() {
        let recorder = Arc::new(RecordingRunner::new());
        recorder.fail_matching("grep", "not mounted");
        let driver = driver_with(&recorder);

        let mut volume = scratch_volume();
        volume.name = VolumeName::new("vp");
        volume.multi_job = true;
        volume.attach_as_swap_bytes = 1024 * 1024;
        volume.attach_private_namespace = true;
        let bricks = bricks_for(&volume);
        let attachments = vec![Attachment::request("c1", "jb")];

        driver.mount(&volume, &bricks, &attachments).await.unwrap();

        let cmds = recorder.commands_for("c1");
        assert!(cmds.contains(&"mkdir -p /dac/jb_persistent_vp".to_string()));
        assert!(!cmds.iter().any(|c| c.contains("swap")));
        assert!(!cmds.iter().any(|c| c.contains("private")));
    }

    #[tokio::test]
    async fn test_missing_primary_brick_is_an_error() {
        let recorder = Arc::new(RecordingRunner::new());
        let driver = driver_with(&recorder);

        let volume = scratch_volume();
        let mut bricks = bricks_for(&volume);
        bricks.remove(0);
        let attachments = vec![Attachment::request("c1", "j1")];

        assert!(matches!(
            driver.mount(&volume, &bricks, &attachments).await,
            Err(Error::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_attachments_not_in_request_state_are_skipped() {
        let recorder = Arc::new(RecordingRunner::new());
        let driver = driver_with(&recorder);

        let volume = scratch_volume();
        let bricks = bricks_for(&volume);
        let mut attached = Attachment::request("c1", "j1");
        attached.state = AttachmentState::Attached;

        driver.mount(&volume, &bricks, &[attached]).await.unwrap();
        assert!(recorder.calls().is_empty());
    }
}
