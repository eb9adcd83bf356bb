//! Registry Module
//!
//! Everything that touches the shared key-value registry: the keystore
//! implementations, the persisted key layout, and the pool/volume façades
//! the lifecycle layer and the host agents are written against.

pub mod etcd;
pub mod keys;
pub mod memory;
pub mod pool_registry;
pub mod volume_registry;

pub use etcd::EtcdKeystore;
pub use memory::MemoryKeystore;
pub use pool_registry::PoolRegistry;
pub use volume_registry::VolumeRegistry;
