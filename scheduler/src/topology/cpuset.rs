// Immutable host CPU model with a locality metric between cores.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::TopologyError;

/// Last observed `/proc/stat` tick counts, kept per CPU to compute Δ-based
/// usage. Transient: excluded from snapshots, cleared when the CPU changes
/// subset membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimeSample {
    pub idle: u64,
    pub not_idle: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cpu {
    pub cpu_id: u32,
    pub numa_node: u32,
    pub sib_smt: BTreeSet<u32>,
    pub sib_cpu: BTreeSet<u32>,
    pub cache_level: BTreeMap<u32, u32>,
    pub max_freq: u64,
    #[serde(skip)]
    pub time_sample: Option<CpuTimeSample>,
}

impl Cpu {
    /// Locality distance to another core, from tightest sharing to loosest:
    /// cache levels innermost first, then SMT siblings, then socket siblings,
    /// then the NUMA distance table.
    fn distance_to(
        &self,
        other: &Cpu,
        numa_distances: &BTreeMap<u32, Vec<u32>>,
    ) -> Result<u32, TopologyError> {
        if self.cache_level.len() != other.cache_level.len() {
            return Err(TopologyError::HeterogeneousCacheLevels {
                cpu_a: self.cpu_id,
                cpu_b: other.cpu_id,
            });
        }
        let mut distance = 0;
        let step = 10;
        for (level, cache_id) in &self.cache_level {
            distance += step;
            if other.cache_level.get(level) == Some(cache_id) {
                return Ok(distance);
            }
        }
        distance += 10;
        if self.sib_smt.contains(&other.cpu_id) {
            return Ok(distance);
        }
        distance += 10;
        if self.sib_cpu.contains(&other.cpu_id) {
            return Ok(distance);
        }
        let row = numa_distances
            .get(&self.numa_node)
            .ok_or(TopologyError::UnknownNumaNode(self.numa_node))?;
        let numa = row
            .get(other.numa_node as usize)
            .ok_or(TopologyError::UnknownNumaNode(other.numa_node))?;
        Ok(distance + numa)
    }

    pub fn clear_time_sample(&mut self) {
        self.time_sample = None;
    }
}

impl fmt::Display for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu{} {}MHz on numa node {}",
            self.cpu_id,
            self.max_freq / 1000,
            self.numa_node
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuDistance {
    pub cpu_id: u32,
    pub distance: u32,
}

/// Host CPU set, read-only after construction. Distances are materialized
/// once here; this is the only place the metric is evaluated. Each unordered
/// pair is computed once and written in both directions, so the metric is
/// symmetric by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuSet {
    #[serde(rename = "cpu_list")]
    cpus: Vec<Cpu>,
    numa_distances: BTreeMap<u32, Vec<u32>>,
    distances: BTreeMap<u32, Vec<CpuDistance>>,
}

impl CpuSet {
    pub fn build(
        cpus: Vec<Cpu>,
        numa_distances: BTreeMap<u32, Vec<u32>>,
    ) -> Result<Self, TopologyError> {
        if cpus.is_empty() {
            return Err(TopologyError::NoCpus);
        }
        let mut distances: BTreeMap<u32, Vec<CpuDistance>> =
            cpus.iter().map(|cpu| (cpu.cpu_id, Vec::new())).collect();
        for (i, cpu) in cpus.iter().enumerate() {
            for other in &cpus[i + 1..] {
                let distance = cpu.distance_to(other, &numa_distances)?;
                if let Some(row) = distances.get_mut(&cpu.cpu_id) {
                    row.push(CpuDistance { cpu_id: other.cpu_id, distance });
                }
                if let Some(row) = distances.get_mut(&other.cpu_id) {
                    row.push(CpuDistance { cpu_id: cpu.cpu_id, distance });
                }
            }
        }
        for row in distances.values_mut() {
            row.sort_by(|a, b| a.distance.cmp(&b.distance).then(a.cpu_id.cmp(&b.cpu_id)));
        }
        Ok(Self { cpus, numa_distances, distances })
    }

    pub fn cpus(&self) -> &[Cpu] {
        &self.cpus
    }

    pub fn cpu(&self, cpu_id: u32) -> Option<&Cpu> {
        self.cpus.iter().find(|cpu| cpu.cpu_id == cpu_id)
    }

    pub fn host_count(&self) -> u32 {
        self.cpus.len() as u32
    }

    /// Neighbors of `cpu_id` in non-decreasing distance order.
    pub fn distances_from(&self, cpu_id: u32) -> Option<&[CpuDistance]> {
        self.distances.get(&cpu_id).map(Vec::as_slice)
    }

    pub fn distance_between(&self, a: u32, b: u32) -> Option<u32> {
        self.distances_from(a)?
            .iter()
            .find(|entry| entry.cpu_id == b)
            .map(|entry| entry.distance)
    }

    pub fn numa_distances(&self) -> &BTreeMap<u32, Vec<u32>> {
        &self.numa_distances
    }
}
