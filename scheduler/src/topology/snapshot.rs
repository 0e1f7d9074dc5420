// Persisted topology: discover once, reload on later runs.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::cpuset::CpuSet;
use super::memset::MemSet;
use super::TopologyError;

/// Snapshot of the discovered host model. CPU time samples are transient and
/// never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub cpuset: CpuSet,
    pub memset: MemSet,
}

impl TopologySnapshot {
    pub fn dump(&self, path: &Path) -> Result<(), TopologyError> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|err| TopologyError::Snapshot(err.to_string()))?;
        fs::write(path, text).map_err(|err| TopologyError::Snapshot(err.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, TopologyError> {
        let text = fs::read_to_string(path)
            .map_err(|_| TopologyError::MissingFile(path.to_path_buf()))?;
        serde_json::from_str(&text).map_err(|err| TopologyError::Snapshot(err.to_string()))
    }
}
