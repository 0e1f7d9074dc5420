// Host memory model: one pool, a slice of which is kept private to the host.

use serde::{Deserialize, Serialize};

use super::TopologyError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemSet {
    #[serde(rename = "total")]
    total_mb: u64,
    allowed_mb: u64,
}

impl MemSet {
    pub fn new(total_mb: u64, private_mb: u64) -> Result<Self, TopologyError> {
        if private_mb > total_mb {
            return Err(TopologyError::BadMemoryReserve { total_mb, private_mb });
        }
        Ok(Self { total_mb, allowed_mb: total_mb - private_mb })
    }

    pub fn total_mb(&self) -> u64 {
        self.total_mb
    }

    /// Memory VMs may consume, after the private reserve.
    pub fn allowed_mb(&self) -> u64 {
        self.allowed_mb
    }
}
