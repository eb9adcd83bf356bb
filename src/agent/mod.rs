//! Agent Module
//!
//! The per-storage-host process half of the system: registers bricks,
//! advertises liveness, and performs the physical work for volumes whose
//! primary brick lives on this host. The registry is the only rendezvous
//! with the coordinator.

pub mod host_agent;
pub mod volume_worker;

pub use host_agent::{HostAgent, HostAgentConfig};
pub use volume_worker::VolumeWorker;
