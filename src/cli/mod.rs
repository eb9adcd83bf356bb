//! CLI Module
//!
//! The scheduler-facing front-end contract: dispatch by `--function`,
//! with the flag surface the workload manager passes through. Failures
//! surface as a single-line reason and a non-zero exit code; the
//! taxonomic error kind stays intact for programmatic callers.

pub mod actions;

pub use actions::CliActions;

use crate::error::{Error, Result};
use clap::Parser;

// =============================================================================
// Arguments
// =============================================================================

/// Flag surface of the burst buffer front-end
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "bbctl", about = "Burst buffer orchestration front-end")]
pub struct CliArgs {
    /// Operation to perform
    #[arg(long)]
    pub function: String,

    /// Persistent buffer name or per-job buffer token
    #[arg(long, short = 't')]
    pub token: Option<String>,

    /// Job name (or job script path for job_process)
    #[arg(long, short = 'j')]
    pub job: Option<String>,

    /// Calling workload manager
    #[arg(long, short = 'c')]
    pub caller: Option<String>,

    /// Owner uid for the buffer
    #[arg(long, short = 'u')]
    pub user: Option<u32>,

    /// Owner gid for the buffer
    #[arg(long, short = 'g')]
    pub groupid: Option<u32>,

    /// Requested capacity as <pool>:<size>
    #[arg(long, short = 'C')]
    pub capacity: Option<String>,

    /// Access flags: striped, private, or striped,private
    #[arg(long, short = 'a')]
    pub access: Option<String>,

    /// Buffer type hint from the scheduler
    #[arg(long = "type", short = 'T')]
    pub buffer_type: Option<String>,

    /// File listing one compute hostname per line
    #[arg(long)]
    pub nodehostnamefile: Option<String>,

    /// File the paths function writes environment variables into
    #[arg(long)]
    pub pathfile: Option<String>,

    /// Skip the data-out pass during teardown
    #[arg(long)]
    pub hurry: bool,
}

impl CliArgs {
    pub fn require<'a>(&self, value: &'a Option<String>, flag: &str) -> Result<&'a str> {
        value
            .as_deref()
            .ok_or_else(|| Error::Invalid(format!("--{} is required for --function {}", flag, self.function)))
    }
}

// =============================================================================
// Capacity and Access Parsing
// =============================================================================

const BYTES_IN_GB: u64 = 1 << 30;

/// Parse `<pool>:<size>` into a pool name and a byte count
///
/// Binary units (KiB, MiB, GiB, TiB) and their decimal spellings are both
/// accepted; the decimal spellings mean the binary sizes, matching what
/// workload managers emit.
pub fn parse_capacity(spec: &str) -> Result<(String, u64)> {
    let (pool, size) = spec
        .split_once(':')
        .ok_or_else(|| Error::CapacityParse(format!("expected <pool>:<size>, got {:?}", spec)))?;
    if pool.is_empty() {
        return Err(Error::CapacityParse(format!("empty pool in {:?}", spec)));
    }
    let size = size.trim();
    let split = size
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(size.len());
    let (digits, unit) = size.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::CapacityParse(format!("bad size number in {:?}", spec)))?;
    let multiplier = match unit.trim() {
        "" | "B" => 1,
        "KiB" | "KB" => 1 << 10,
        "MiB" | "MB" => 1 << 20,
        "GiB" | "GB" => BYTES_IN_GB,
        "TiB" | "TB" => 1 << 40,
        other => {
            return Err(Error::CapacityParse(format!(
                "unknown capacity unit {:?}",
                other
            )))
        }
    };
    Ok((pool.to_string(), value * multiplier))
}

/// Round a byte request up to whole bricks of the pool granularity
pub fn bricks_for_capacity(bytes: u64, granularity_gb: u64) -> u64 {
    let brick_bytes = granularity_gb * BYTES_IN_GB;
    if brick_bytes == 0 {
        return 0;
    }
    bytes.div_ceil(brick_bytes)
}

/// Access flags requested by the job script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessFlags {
    pub striped: bool,
    pub private: bool,
}

pub fn parse_access(spec: &str) -> Result<AccessFlags> {
    let mut flags = AccessFlags::default();
    for part in spec.split(',').filter(|p| !p.is_empty()) {
        match part.trim() {
            "striped" => flags.striped = true,
            "private" => flags.private = true,
            other => {
                return Err(Error::Invalid(format!("unknown access flag {:?}", other)));
            }
        }
    }
    Ok(flags)
}
