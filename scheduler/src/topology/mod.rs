// Host topology model and its platform readers.

pub mod cpuset;
pub mod explorer;
pub mod memset;
pub mod snapshot;

pub use cpuset::{Cpu, CpuDistance, CpuSet, CpuTimeSample};
pub use explorer::{parse_id_list, CpuExplorer, MemoryExplorer};
pub use memset::MemSet;
pub use snapshot::TopologySnapshot;

use std::fmt;
use std::path::PathBuf;

/// Topology failures are configuration-fatal: the scheduler refuses to start
/// on a host it cannot fully describe.
#[derive(Debug)]
pub enum TopologyError {
    MissingFile(PathBuf),
    Unparsable(PathBuf, String),
    HeterogeneousCacheLevels { cpu_a: u32, cpu_b: u32 },
    UnknownNumaNode(u32),
    NoCpus,
    BadMemoryReserve { total_mb: u64, private_mb: u64 },
    Snapshot(String),
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingFile(path) => write!(f, "missing topology file {}", path.display()),
            Self::Unparsable(path, text) => {
                write!(f, "unparsable value {:?} in {}", text, path.display())
            }
            Self::HeterogeneousCacheLevels { cpu_a, cpu_b } => write!(
                f,
                "heterogeneous cache levels between cpu{} and cpu{}",
                cpu_a, cpu_b
            ),
            Self::UnknownNumaNode(node) => write!(f, "no distance row for numa node {}", node),
            Self::NoCpus => write!(f, "no CPU left after include/exclude filtering"),
            Self::BadMemoryReserve { total_mb, private_mb } => write!(
                f,
                "private memory reserve {}MB exceeds host total {}MB",
                private_mb, total_mb
            ),
            Self::Snapshot(reason) => write!(f, "topology snapshot error: {}", reason),
        }
    }
}

impl std::error::Error for TopologyError {}
