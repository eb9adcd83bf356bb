//! Volume and Attachment Entities
//!
//! A volume is the unit of client reservation, composed from bricks of one
//! pool. Its state only ever advances along the canonical ordering; the
//! error state is a terminal sink reachable from any non-terminal state.
//! Attachments bind a volume to a (compute host, job) pair and progress
//! through their own sub-state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Volume Name
// =============================================================================

/// Unique name of a volume, used as the registry key component
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeName(pub String);

impl VolumeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VolumeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for VolumeName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// Volume State
// =============================================================================

/// Lifecycle states of a volume
///
/// The data staging states are optional, so a legal advance moves to any
/// state of strictly greater rank. Rewinds are impossible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeState {
    Registered,
    BricksAllocated,
    BricksProvisioned,
    DataInRequested,
    DataInComplete,
    DataOutRequested,
    DataOutComplete,
    DeleteRequested,
    BricksDeleted,
    Error,
}

impl VolumeState {
    /// Position along the canonical ordering
    pub fn rank(&self) -> u8 {
        match self {
            VolumeState::Registered => 0,
            VolumeState::BricksAllocated => 1,
            VolumeState::BricksProvisioned => 2,
            VolumeState::DataInRequested => 3,
            VolumeState::DataInComplete => 4,
            VolumeState::DataOutRequested => 5,
            VolumeState::DataOutComplete => 6,
            VolumeState::DeleteRequested => 7,
            VolumeState::BricksDeleted => 8,
            VolumeState::Error => u8::MAX,
        }
    }

    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, VolumeState::BricksDeleted | VolumeState::Error)
    }

    /// Check whether a transition to `next` is a legal advance
    pub fn can_advance_to(&self, next: VolumeState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == VolumeState::Error {
            return true;
        }
        next != VolumeState::Error && next.rank() > self.rank()
    }

    /// States from which a volume may be mounted or unmounted
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            VolumeState::BricksProvisioned | VolumeState::DataInComplete
        )
    }
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VolumeState::Registered => "Registered",
            VolumeState::BricksAllocated => "BricksAllocated",
            VolumeState::BricksProvisioned => "BricksProvisioned",
            VolumeState::DataInRequested => "DataInRequested",
            VolumeState::DataInComplete => "DataInComplete",
            VolumeState::DataOutRequested => "DataOutRequested",
            VolumeState::DataOutComplete => "DataOutComplete",
            VolumeState::DeleteRequested => "DeleteRequested",
            VolumeState::BricksDeleted => "BricksDeleted",
            VolumeState::Error => "Error",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Attachment
// =============================================================================

/// Sub-states of a single (volume, host, job) attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttachmentState {
    RequestAttach,
    Attached,
    RequestDetach,
    Detached,
    AttachmentError,
}

impl AttachmentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttachmentState::Detached | AttachmentState::AttachmentError
        )
    }
}

impl std::fmt::Display for AttachmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AttachmentState::RequestAttach => "RequestAttach",
            AttachmentState::Attached => "Attached",
            AttachmentState::RequestDetach => "RequestDetach",
            AttachmentState::Detached => "Detached",
            AttachmentState::AttachmentError => "AttachmentError",
        };
        write!(f, "{}", s)
    }
}

/// Binding of a volume to a (compute host, job) pair
///
/// Attachments of the same volume share a parent transition but progress
/// independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub hostname: String,

    /// Name of the attaching job, which is not necessarily the job that
    /// created the volume
    pub job: String,

    pub state: AttachmentState,

    /// Human-readable reason recorded when the state is AttachmentError
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Attachment {
    pub fn request(hostname: impl Into<String>, job: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            job: job.into(),
            state: AttachmentState::RequestAttach,
            detail: None,
        }
    }

    pub fn matches(&self, hostname: &str, job: &str) -> bool {
        self.hostname == hostname && self.job == job
    }
}

// =============================================================================
// Filesystem Type
// =============================================================================

/// Parallel filesystem flavor a volume is provisioned with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    Lustre,
    Beegfs,
}

impl Default for FsType {
    fn default() -> Self {
        FsType::Lustre
    }
}

impl std::fmt::Display for FsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsType::Lustre => write!(f, "lustre"),
            FsType::Beegfs => write!(f, "beegfs"),
        }
    }
}

impl std::str::FromStr for FsType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lustre" => Ok(FsType::Lustre),
            "beegfs" => Ok(FsType::Beegfs),
            other => Err(crate::error::Error::Invalid(format!(
                "unknown filesystem type: {}",
                other
            ))),
        }
    }
}

// =============================================================================
// Volume
// =============================================================================

/// The unit of client reservation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Unique name, also the registry key component
    pub name: VolumeName,

    /// Stable id used as the filesystem name on the wire
    pub uuid: String,

    /// Pool the bricks are reserved from
    pub pool: String,

    /// Number of bricks to reserve; zero means a metadata-only volume with
    /// no physical reservation
    pub size_bricks: u64,

    /// Rounded-up capacity backing the reservation
    pub size_gb: u64,

    /// Job that created the volume
    pub job_name: String,

    /// True for persistent volumes that survive many jobs
    pub multi_job: bool,

    pub owner: u32,
    pub group: u32,
    pub created_at: DateTime<Utc>,

    /// When non-zero, each attaching host gets a swap file of this size
    pub attach_as_swap_bytes: u64,

    pub attach_private_namespace: bool,
    pub attach_global_namespace: bool,

    pub filesystem: FsType,

    /// Small integer used to pick a unique loopback device per volume on
    /// each client
    pub client_port: u16,

    pub state: VolumeState,

    /// Sticky flag set once the allocator has succeeded; never reverts
    pub had_bricks_assigned: bool,

    /// Reason recorded when the state is Error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl Volume {
    /// Create a freshly registered volume with a new UUID
    pub fn new(
        name: impl Into<VolumeName>,
        pool: impl Into<String>,
        size_bricks: u64,
        job_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            uuid: uuid::Uuid::new_v4().simple().to_string(),
            pool: pool.into(),
            size_bricks,
            size_gb: 0,
            job_name: job_name.into(),
            multi_job: false,
            owner: 0,
            group: 0,
            created_at: Utc::now(),
            attach_as_swap_bytes: 0,
            attach_private_namespace: false,
            attach_global_namespace: true,
            filesystem: FsType::default(),
            client_port: 0,
            state: VolumeState::Registered,
            had_bricks_assigned: false,
            error_detail: None,
        }
    }

    /// Client-visible mount point for the given attaching job
    pub fn mount_dir(&self, job: &str) -> String {
        if self.multi_job {
            format!("/dac/{}_persistent_{}", job, self.name)
        } else {
            format!("/dac/{}_job", job)
        }
    }

    /// Per-job symlink target for the private namespace
    pub fn private_symlink_dir(job: &str) -> String {
        format!("/dac/{}_job_private", job)
    }
}
