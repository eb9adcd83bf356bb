//! Lustre Recipe
//!
//! Client-side mount and unmount of a provisioned Lustre filesystem. The
//! MGS is fronted by the primary brick host, optionally suffixed with an
//! LNet network name. Mounts are guarded by an mtab check so replays are
//! idempotent.

use crate::domain::ports::CommandRunnerRef;
use crate::error::Result;
use tracing::debug;

/// Mount the filesystem unless the directory is already in mtab
///
/// Assumes `modprobe -v lustre` has already happened on the client.
pub async fn mount(
    runner: &CommandRunnerRef,
    hostname: &str,
    lnet_suffix: &str,
    mgt_host: &str,
    fsname: &str,
    directory: &str,
) -> Result<()> {
    if runner
        .execute(hostname, &format!("grep {} /etc/mtab", directory))
        .await
        .is_ok()
    {
        debug!(hostname, directory, "already mounted, skipping");
        return Ok(());
    }
    runner
        .execute(
            hostname,
            &format!(
                "mount -t lustre -o flock,nodev,nosuid {}{}:/{} {}",
                mgt_host, lnet_suffix, fsname, directory
            ),
        )
        .await
}

/// Unmount only when currently mounted; `-l` is deliberately not used so
/// a stuck unmount surfaces instead of being masked
pub async fn umount(runner: &CommandRunnerRef, hostname: &str, directory: &str) -> Result<()> {
    if runner
        .execute(hostname, &format!("grep {} /etc/mtab", directory))
        .await
        .is_ok()
    {
        runner
            .execute(hostname, &format!("umount {}", directory))
            .await?;
    } else {
        debug!(hostname, directory, "not mounted, skipping umount");
    }
    Ok(())
}
