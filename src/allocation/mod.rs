//! Allocation Module
//!
//! Host-disjoint brick selection for volumes.

pub mod allocator;

pub use allocator::choose_host_disjoint_bricks;
