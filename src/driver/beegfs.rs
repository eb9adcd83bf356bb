//! BeeGFS Recipe
//!
//! The BeeGFS client tooling mounts every filesystem under
//! `/mnt/beegfs/<fsname>`; the per-job mount point is a symlink into that
//! location.

use crate::domain::ports::CommandRunnerRef;
use crate::error::Result;

/// Replace the mount directory with a symlink into the client mount tree
pub async fn mount(
    runner: &CommandRunnerRef,
    hostname: &str,
    fsname: &str,
    directory: &str,
) -> Result<()> {
    runner
        .execute(hostname, &format!("rm -rf {}", directory))
        .await?;
    runner
        .execute(
            hostname,
            &format!("ln -s /mnt/beegfs/{} {}", fsname, directory),
        )
        .await
}

/// Drop the symlink; the client tooling owns the real mount
pub async fn umount(runner: &CommandRunnerRef, hostname: &str, directory: &str) -> Result<()> {
    runner
        .execute(hostname, &format!("rm -rf {}", directory))
        .await
}
