//! Model Module
//!
//! Entity definitions for bricks, hosts, pools, allocations, and volumes.
//! These are the records persisted in the shared registry; in-memory
//! representations are keyed lookups rebuilt from registry snapshots and
//! carry no back pointers.

pub mod allocation;
pub mod brick_host;
pub mod pool;
pub mod volume;

pub use allocation::{AllocationRecord, BrickAllocation};
pub use brick_host::{BrickHostStatus, BrickInfo};
pub use pool::{HostInfo, Pool};
pub use volume::{Attachment, AttachmentState, FsType, Volume, VolumeName, VolumeState};
