//! Pool Entity
//!
//! A pool is a derived aggregate: the set of all bricks sharing a pool
//! name. It is rebuilt from registry snapshots and never persisted as a
//! record of its own.

use super::allocation::BrickAllocation;
use super::brick_host::BrickInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Liveness summary for one host contributing bricks to a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub hostname: String,

    /// True if the agent's keep-alive key currently exists
    pub alive: bool,
}

/// Derived view of one pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    pub name: String,

    /// Allocation unit for the pool; the capacity every member brick must
    /// report
    pub granularity_gb: u64,

    /// Unallocated bricks on live hosts
    pub available_bricks: Vec<BrickInfo>,

    /// All current allocations naming a brick in this pool
    pub allocated_bricks: Vec<BrickAllocation>,

    /// Every host that reports bricks in this pool
    pub hosts: BTreeMap<String, HostInfo>,
}

impl Pool {
    /// Number of distinct live hosts with at least one available brick,
    /// the upper bound on any host-disjoint request
    pub fn distinct_available_hosts(&self) -> usize {
        let mut hosts: Vec<&str> = self
            .available_bricks
            .iter()
            .map(|b| b.hostname.as_str())
            .collect();
        hosts.sort_unstable();
        hosts.dedup();
        hosts.len()
    }
}
