//! Brick and Host Entities
//!
//! A brick is one physical device on one storage host, the unit of
//! allocation. Hosts advertise their bricks to the registry and hold a
//! leased liveness key while their agent process is running.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

// =============================================================================
// Charset Validation
// =============================================================================

/// Check a token against the `[A-Za-z0-9]` charset used for device and
/// pool names
pub fn is_valid_token(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Check a hostname against the `[A-Za-z0-9.]` charset
pub fn is_valid_hostname(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '.')
}

// =============================================================================
// Brick Info
// =============================================================================

/// A physical device on a host, identified by `(hostname, device)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrickInfo {
    /// Hostname of the storage host, unique across the cluster
    pub hostname: String,

    /// Device name, unique within a host (e.g. nvme0n1)
    pub device: String,

    /// Pool this brick belongs to
    pub pool_name: String,

    /// Size of the brick; defines the pool granularity
    pub capacity_gb: u64,
}

impl BrickInfo {
    pub fn new(
        hostname: impl Into<String>,
        device: impl Into<String>,
        pool_name: impl Into<String>,
        capacity_gb: u64,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            device: device.into(),
            pool_name: pool_name.into(),
            capacity_gb,
        }
    }

    /// Validate the charset constraints on all identifying fields
    pub fn validate(&self) -> Result<()> {
        if !is_valid_hostname(&self.hostname) {
            return Err(Error::Invalid(format!(
                "bad hostname: {:?} (allowed: A-Za-z0-9.)",
                self.hostname
            )));
        }
        if !is_valid_token(&self.device) {
            return Err(Error::Invalid(format!(
                "bad device: {:?} (allowed: A-Za-z0-9)",
                self.device
            )));
        }
        if !is_valid_token(&self.pool_name) {
            return Err(Error::Invalid(format!(
                "bad pool name: {:?} (allowed: A-Za-z0-9)",
                self.pool_name
            )));
        }
        if self.capacity_gb == 0 {
            return Err(Error::Invalid(format!(
                "brick {}/{} has zero capacity",
                self.hostname, self.device
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Brick Host Status
// =============================================================================

/// Snapshot of one host's registration and liveness
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrickHostStatus {
    pub hostname: String,

    /// All bricks the host has registered
    pub bricks: Vec<BrickInfo>,

    /// True if the current keep-alive key exists
    pub alive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_charset() {
        assert!(is_valid_hostname("node1.cluster.local"));
        assert!(is_valid_hostname("h1"));
        assert!(!is_valid_hostname("node_1"));
        assert!(!is_valid_hostname("node-1"));
        assert!(!is_valid_hostname(""));
    }

    #[test]
    fn test_token_charset() {
        assert!(is_valid_token("nvme0n1"));
        assert!(is_valid_token("pool1"));
        assert!(!is_valid_token("nvme-0"));
        assert!(!is_valid_token("a.b"));
        assert!(!is_valid_token(""));
    }

    #[test]
    fn test_brick_validate() {
        let brick = BrickInfo::new("h1", "dA", "pool1", 100);
        assert!(brick.validate().is_ok());

        let bad = BrickInfo::new("h 1", "dA", "pool1", 100);
        assert!(matches!(bad.validate(), Err(Error::Invalid(_))));

        let zero = BrickInfo::new("h1", "dA", "pool1", 0);
        assert!(matches!(zero.validate(), Err(Error::Invalid(_))));
    }
}
