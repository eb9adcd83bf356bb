//! Brick Allocation Entity
//!
//! A claim binding one brick to one volume. The index-0 allocation is the
//! primary brick; its host fronts the filesystem and drives the physical
//! work for the volume.

use super::volume::VolumeName;
use serde::{Deserialize, Serialize};

/// A claim binding a brick to a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrickAllocation {
    pub hostname: String,
    pub device: String,

    /// Name of the volume that owns the brick
    pub allocated_volume: VolumeName,

    /// Dense index starting at 0; the 0 index is the primary brick
    pub allocated_index: u32,

    /// Set instead of removing the record when deallocation is requested
    /// while the owning host is not alive; the host drains these on revival
    pub deallocate_requested: bool,
}

impl BrickAllocation {
    pub fn is_primary(&self) -> bool {
        self.allocated_index == 0
    }
}

/// An allocation together with the registry version it was read at, so
/// hard deletes can fail on concurrent modification
#[derive(Debug, Clone)]
pub struct AllocationRecord {
    pub allocation: BrickAllocation,
    pub version: i64,
}
