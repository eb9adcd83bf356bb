//! CLI Actions
//!
//! Implementations behind the `--function` dispatch. Each action is a
//! thin adapter from flags to the lifecycle manager and the registries;
//! anything that blocks does so on the shared cancellation token so a
//! SIGINT unwinds cleanly.

use crate::cli::{bricks_for_capacity, parse_access, parse_capacity, CliArgs};
use crate::error::{Error, Result};
use crate::lifecycle::VolumeLifecycleManager;
use crate::model::{Volume, VolumeName};
use crate::registry::{PoolRegistry, VolumeRegistry};
use crate::domain::ports::KeystoreRef;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct CliActions {
    volumes: VolumeRegistry,
    pools: PoolRegistry,
    cancel: CancellationToken,
}

impl CliActions {
    pub fn new(store: KeystoreRef, cancel: CancellationToken) -> Self {
        Self {
            volumes: VolumeRegistry::new(store.clone()),
            pools: PoolRegistry::new(store),
            cancel,
        }
    }

    fn manager(&self, token: &str) -> VolumeLifecycleManager {
        VolumeLifecycleManager::new(
            self.volumes.clone(),
            self.pools.clone(),
            VolumeName::new(token),
        )
    }

    /// Dispatch one front-end invocation
    pub async fn run(&self, args: &CliArgs) -> Result<()> {
        match args.function.as_str() {
            "create_persistent" => self.create_persistent(args).await,
            "setup" => self.setup(args).await,
            "teardown" => self.teardown(args).await,
            "pools" => self.show_pools().await,
            "show_instances" => self.show_instances().await,
            "show_sessions" => self.show_sessions().await,
            "show_configurations" => self.show_configurations().await,
            "job_process" => self.job_process(args).await,
            "real_size" => self.real_size(args).await,
            "data_in" => self.data_in(args).await,
            "paths" => self.paths(args).await,
            "pre_run" => self.pre_run(args).await,
            "post_run" => self.post_run(args).await,
            "data_out" => self.data_out(args).await,
            other => Err(Error::Invalid(format!("unknown function: {}", other))),
        }
    }

    // =========================================================================
    // Buffer Creation
    // =========================================================================

    async fn create_buffer(&self, args: &CliArgs, multi_job: bool) -> Result<()> {
        let token = args.require(&args.token, "token")?;
        let capacity = args.require(&args.capacity, "capacity")?;
        let (pool_name, bytes) = parse_capacity(capacity)?;
        let pool = self.pools.pool(&pool_name).await?;
        let size_bricks = bricks_for_capacity(bytes, pool.granularity_gb);

        let job = args.job.as_deref().unwrap_or(token);
        let mut volume = Volume::new(token, pool_name, size_bricks, job);
        volume.multi_job = multi_job;
        volume.size_gb = size_bricks * pool.granularity_gb;
        volume.owner = args.user.unwrap_or(0);
        volume.group = args.groupid.unwrap_or(args.user.unwrap_or(0));
        if let Some(access) = args.access.as_deref() {
            let flags = parse_access(access)?;
            volume.attach_global_namespace = flags.striped;
            volume.attach_private_namespace = flags.private;
        }

        self.volumes.add_volume(&volume).await?;
        info!(volume = %volume.name, bricks = size_bricks, multi_job, "buffer created");

        let vlm = self.manager(token);
        if let Err(err) = vlm.provision_bricks(&self.cancel).await {
            warn!(volume = %token, error = %err, "provision failed after creation");
            return Err(err);
        }
        Ok(())
    }

    async fn create_persistent(&self, args: &CliArgs) -> Result<()> {
        args.require(&args.caller, "caller")?;
        self.create_buffer(args, true).await
    }

    async fn setup(&self, args: &CliArgs) -> Result<()> {
        args.require(&args.job, "job")?;
        self.create_buffer(args, false).await
    }

    async fn teardown(&self, args: &CliArgs) -> Result<()> {
        let token = args.require(&args.token, "token")?;
        let vlm = self.manager(token);

        if args.hurry {
            info!(volume = %token, "hurried teardown, skipping data out");
        } else {
            let volume = self.volumes.volume(&VolumeName::new(token)).await?;
            if volume.size_bricks > 0
                && volume.state == crate::model::VolumeState::DataInComplete
            {
                vlm.data_out(&self.cancel).await?;
            }
        }
        vlm.delete(&self.cancel).await
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    async fn show_pools(&self) -> Result<()> {
        let pools = self.pools.pools().await?;
        let report: Vec<_> = pools
            .iter()
            .map(|p| {
                json!({
                    "id": p.name,
                    "units": "bytes",
                    "granularity": p.granularity_gb * (1 << 30),
                    "quantity": p.hosts.len(),
                    "free": p.available_bricks.len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&json!({ "pools": report }))?);
        Ok(())
    }

    async fn show_instances(&self) -> Result<()> {
        let volumes = self.volumes.all_volumes().await?;
        let report: Vec<_> = volumes
            .iter()
            .map(|v| {
                json!({
                    "id": v.name,
                    "capacity": { "bytes": v.size_gb * (1 << 30), "nodes": v.size_bricks },
                    "state": v.state.to_string(),
                    "label": v.uuid,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "instances": report }))?
        );
        Ok(())
    }

    async fn show_sessions(&self) -> Result<()> {
        let volumes = self.volumes.all_volumes().await?;
        let report: Vec<_> = volumes
            .iter()
            .map(|v| {
                json!({
                    "id": v.name,
                    "created": v.created_at.timestamp(),
                    "owner": v.owner,
                    "token": v.job_name,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "sessions": report }))?
        );
        Ok(())
    }

    async fn show_configurations(&self) -> Result<()> {
        let volumes = self.volumes.all_volumes().await?;
        let mut report = Vec::new();
        for volume in &volumes {
            let attachments = self.volumes.attachments(&volume.name).await?;
            report.push(json!({
                "id": volume.name,
                "attachments": attachments
                    .iter()
                    .map(|a| json!({
                        "hostname": a.hostname,
                        "job": a.job,
                        "state": a.state.to_string(),
                    }))
                    .collect::<Vec<_>>(),
            }));
        }
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "configurations": report }))?
        );
        Ok(())
    }

    async fn real_size(&self, args: &CliArgs) -> Result<()> {
        let token = args.require(&args.token, "token")?;
        let volume = self.volumes.volume(&VolumeName::new(token)).await?;
        println!(
            "{}",
            json!({
                "token": token,
                "capacity": volume.size_gb * (1 << 30),
                "units": "bytes",
            })
        );
        Ok(())
    }

    // =========================================================================
    // Job Flow
    // =========================================================================

    /// Validate the job script's burst buffer directives
    async fn job_process(&self, args: &CliArgs) -> Result<()> {
        let path = args.require(&args.job, "job")?;
        let content = std::fs::read_to_string(path)?;
        let directives: Vec<&str> = content
            .lines()
            .filter(|line| line.trim_start().starts_with("#DW "))
            .collect();
        for directive in &directives {
            let body = directive.trim_start().trim_start_matches("#DW ").trim();
            let verb = body.split_whitespace().next().unwrap_or_default();
            match verb {
                "jobdw" | "persistentdw" | "stage_in" | "stage_out" | "swap" => {}
                other => {
                    return Err(Error::Invalid(format!(
                        "unsupported directive #DW {}",
                        other
                    )))
                }
            }
        }
        info!(path, directives = directives.len(), "job script validated");
        Ok(())
    }

    async fn data_in(&self, args: &CliArgs) -> Result<()> {
        let token = args.require(&args.token, "token")?;
        self.manager(token).data_in(&self.cancel).await
    }

    async fn data_out(&self, args: &CliArgs) -> Result<()> {
        let token = args.require(&args.token, "token")?;
        self.manager(token).data_out(&self.cancel).await
    }

    /// Write the per-job environment file the workload manager exports
    async fn paths(&self, args: &CliArgs) -> Result<()> {
        let token = args.require(&args.token, "token")?;
        let job = args.require(&args.job, "job")?;
        let pathfile = args.require(&args.pathfile, "pathfile")?;

        let volume = self.volumes.volume(&VolumeName::new(token)).await?;
        let mount_dir = volume.mount_dir(job);
        let mut lines = Vec::new();
        if volume.multi_job {
            lines.push(format!(
                "DW_PERSISTENT_STRIPED_{}={}/global",
                volume.name, mount_dir
            ));
        } else {
            if volume.attach_global_namespace {
                lines.push(format!("DW_JOB_STRIPED={}/global", mount_dir));
            }
            if volume.attach_private_namespace {
                lines.push(format!(
                    "DW_JOB_PRIVATE={}",
                    Volume::private_symlink_dir(job)
                ));
            }
        }
        std::fs::write(pathfile, lines.join("\n") + "\n")?;
        Ok(())
    }

    async fn pre_run(&self, args: &CliArgs) -> Result<()> {
        let token = args.require(&args.token, "token")?;
        let job = args.require(&args.job, "job")?;
        let hosts_file = args.require(&args.nodehostnamefile, "nodehostnamefile")?;

        let hosts: Vec<String> = std::fs::read_to_string(hosts_file)?
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        self.manager(token).mount(&hosts, job, &self.cancel).await
    }

    async fn post_run(&self, args: &CliArgs) -> Result<()> {
        let token = args.require(&args.token, "token")?;
        let job = args.require(&args.job, "job")?;

        let name = VolumeName::new(token);
        let volume = self.volumes.volume(&name).await?;
        if volume.size_bricks == 0 {
            return Ok(());
        }
        let hosts: Vec<String> = self
            .volumes
            .attachments(&name)
            .await?
            .iter()
            .filter(|a| a.job == job)
            .map(|a| a.hostname.clone())
            .collect();
        if hosts.is_empty() {
            return Ok(());
        }
        self.manager(token).unmount(&hosts, job, &self.cancel).await
    }
}
