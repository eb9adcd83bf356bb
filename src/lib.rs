//! Burst Buffer Operator
//!
//! On-demand burst buffer storage orchestration for batch compute jobs:
//! reserves SSD slices ("bricks") across a fleet of storage hosts,
//! composes them into per-job or persistent parallel filesystems, stages
//! data in and out, and attaches the result to the compute nodes running
//! the job.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                      Coordinator (bbctl)                            │
//! │  ┌───────────────┐  ┌────────────────────┐  ┌───────────────────┐  │
//! │  │  CLI Dispatch │  │ Volume Lifecycle   │  │  Brick Allocator  │  │
//! │  │  (--function) │  │ (write intent,     │  │  (host-disjoint,  │  │
//! │  │               │  │  watch fulfilment) │  │   pool mutex)     │  │
//! │  └───────┬───────┘  └─────────┬──────────┘  └─────────┬─────────┘  │
//! │          └────────────────────┼───────────────────────┘            │
//! ├───────────────────────────────┼─────────────────────────────────────┤
//! │                    ┌──────────┴──────────┐                          │
//! │                    │  Shared Registry    │    etcd / in-memory      │
//! │                    │  (CAS, watch,       │                          │
//! │                    │   lease, mutex)     │                          │
//! │                    └──────────┬──────────┘                          │
//! ├───────────────────────────────┼─────────────────────────────────────┤
//! │                      Host Agents (bbhost)                           │
//! │  ┌───────────────┐  ┌─────────┴──────────┐  ┌───────────────────┐  │
//! │  │ Brick + Lease │  │   Volume Workers   │  │  Filesystem       │  │
//! │  │ Registration  │  │ (provision, stage, │  │  Recipes          │  │
//! │  │               │  │  attach, teardown) │  │  (Lustre, BeeGFS) │  │
//! │  └───────────────┘  └────────────────────┘  └─────────┬─────────┘  │
//! │                                                       │ ssh        │
//! │                                              compute nodes         │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The registry is the only rendezvous between the coordinator and the
//! agents; neither side ever calls the other. Every invariant that spans
//! processes (at most one allocation per brick, host-disjoint placement,
//! monotonic state progression, no orphaned bricks) is enforced through
//! per-key compare-and-swap and lease-based liveness, never through any
//! single process's memory.
//!
//! # Modules
//!
//! - [`lifecycle`]: Coordinator-side lifecycle entry points
//! - [`registry`]: Keystore implementations and the pool/volume façades
//! - [`allocation`]: Host-disjoint brick selection
//! - [`agent`]: Per-host agent and volume workers
//! - [`driver`]: Filesystem recipes and command runners
//! - [`model`]: Persisted entities
//! - [`domain`]: Capability ports
//! - [`cli`]: Front-end dispatch
//! - [`error`]: Error types and handling

pub mod agent;
pub mod allocation;
pub mod cli;
pub mod domain;
pub mod driver;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod registry;

// Re-export commonly used types
pub use agent::{HostAgent, HostAgentConfig, VolumeWorker};
pub use domain::ports::{
    CommandRunner, CommandRunnerRef, DistributedMutex, FilesystemDriver, FilesystemDriverRef,
    Keystore, KeystoreRef, LeaseKeeper,
};
pub use driver::{PfsDriver, RecordingRunner, SshRunner};
pub use error::{Error, Result};
pub use lifecycle::VolumeLifecycleManager;
pub use model::{
    Attachment, AttachmentState, BrickAllocation, BrickHostStatus, BrickInfo, FsType, HostInfo,
    Pool, Volume, VolumeName, VolumeState,
};
pub use registry::{EtcdKeystore, MemoryKeystore, PoolRegistry, VolumeRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
