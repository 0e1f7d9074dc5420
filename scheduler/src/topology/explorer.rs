// Topology discovery from the Linux sysfs/procfs trees.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use super::cpuset::{Cpu, CpuSet, CpuTimeSample};
use super::memset::MemSet;
use super::TopologyError;

const DEFAULT_CPU_ROOT: &str = "/sys/devices/system/cpu";
const DEFAULT_NODE_ROOT: &str = "/sys/devices/system/node";
const DEFAULT_STAT_PATH: &str = "/proc/stat";
const DEFAULT_MEMINFO_PATH: &str = "/proc/meminfo";

/// Parse a sysfs id list (`0-3,8,10-11`). Ranges are inclusive on both ends,
/// matching the kernel's documented format.
pub fn parse_id_list(text: &str) -> Result<Vec<u32>, String> {
    let mut ids = Vec::new();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(ids);
    }
    for part in trimmed.split(',') {
        let part = part.trim();
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().map_err(|_| part.to_string())?;
                let hi: u32 = hi.trim().parse().map_err(|_| part.to_string())?;
                if hi < lo {
                    return Err(part.to_string());
                }
                ids.extend(lo..=hi);
            }
            None => ids.push(part.parse().map_err(|_| part.to_string())?),
        }
    }
    Ok(ids)
}

fn read_trimmed(path: &Path) -> Result<String, TopologyError> {
    fs::read_to_string(path)
        .map(|text| text.trim().to_string())
        .map_err(|_| TopologyError::MissingFile(path.to_path_buf()))
}

fn read_u32(path: &Path) -> Result<u32, TopologyError> {
    let text = read_trimmed(path)?;
    text.parse()
        .map_err(|_| TopologyError::Unparsable(path.to_path_buf(), text))
}

fn read_u64(path: &Path) -> Result<u64, TopologyError> {
    let text = read_trimmed(path)?;
    text.parse()
        .map_err(|_| TopologyError::Unparsable(path.to_path_buf(), text))
}

/// Reads the per-CPU sysfs tree and `/proc/stat`. The roots are overridable
/// so the reader can be pointed at a fabricated tree.
#[derive(Debug, Clone)]
pub struct CpuExplorer {
    cpu_root: PathBuf,
    node_root: PathBuf,
    stat_path: PathBuf,
    include: BTreeSet<u32>,
    exclude: BTreeSet<u32>,
    global_sample: Option<CpuTimeSample>,
}

impl CpuExplorer {
    pub fn new(include: BTreeSet<u32>, exclude: BTreeSet<u32>) -> Self {
        Self::with_roots(
            DEFAULT_CPU_ROOT.into(),
            DEFAULT_NODE_ROOT.into(),
            DEFAULT_STAT_PATH.into(),
            include,
            exclude,
        )
    }

    pub fn with_roots(
        cpu_root: PathBuf,
        node_root: PathBuf,
        stat_path: PathBuf,
        include: BTreeSet<u32>,
        exclude: BTreeSet<u32>,
    ) -> Self {
        Self {
            cpu_root,
            node_root,
            stat_path,
            include,
            exclude,
            global_sample: None,
        }
    }

    pub fn build_cpuset(&self) -> Result<CpuSet, TopologyError> {
        let conform = self.conform_cpu_ids()?;
        let conform_set: BTreeSet<u32> = conform.iter().copied().collect();
        let mut cpus = Vec::with_capacity(conform.len());
        for cpu_id in &conform {
            cpus.push(self.read_cpu(*cpu_id, &conform_set)?);
        }
        let numa_distances = self.read_numa_distances()?;
        CpuSet::build(cpus, numa_distances)
    }

    /// CPU ids present on the host, filtered: (found \ exclude) ∩ include
    /// when include is non-empty, sorted ascending.
    fn conform_cpu_ids(&self) -> Result<Vec<u32>, TopologyError> {
        let entries = fs::read_dir(&self.cpu_root)
            .map_err(|_| TopologyError::MissingFile(self.cpu_root.clone()))?;
        let mut found = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix("cpu") else { continue };
            if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            if let Ok(cpu_id) = rest.parse::<u32>() {
                found.push(cpu_id);
            }
        }
        let mut conform: Vec<u32> = found
            .into_iter()
            .filter(|id| !self.exclude.contains(id))
            .filter(|id| self.include.is_empty() || self.include.contains(id))
            .collect();
        conform.sort_unstable();
        if conform.is_empty() {
            return Err(TopologyError::NoCpus);
        }
        Ok(conform)
    }

    fn read_cpu(&self, cpu_id: u32, conform: &BTreeSet<u32>) -> Result<Cpu, TopologyError> {
        let topology = self.cpu_root.join(format!("cpu{}/topology", cpu_id));
        let numa_node = read_u32(&topology.join("physical_package_id"))?;
        let sib_smt = self.read_sibling_list(&topology.join("thread_siblings_list"), cpu_id, conform)?;
        let sib_cpu = self.read_sibling_list(&topology.join("core_siblings_list"), cpu_id, conform)?;
        let cache_level = self.read_cache_levels(cpu_id)?;
        let max_freq = read_u64(&self.cpu_root.join(format!("cpu{}/cpufreq/cpuinfo_max_freq", cpu_id)))?;
        Ok(Cpu {
            cpu_id,
            numa_node,
            sib_smt,
            sib_cpu,
            cache_level,
            max_freq,
            time_sample: None,
        })
    }

    fn read_sibling_list(
        &self,
        path: &Path,
        cpu_id: u32,
        conform: &BTreeSet<u32>,
    ) -> Result<BTreeSet<u32>, TopologyError> {
        let text = read_trimmed(path)?;
        let ids = parse_id_list(&text)
            .map_err(|bad| TopologyError::Unparsable(path.to_path_buf(), bad))?;
        Ok(ids
            .into_iter()
            .filter(|id| *id != cpu_id && conform.contains(id))
            .collect())
    }

    /// `cache/index<N>/id` for N = 0, 1, ... until the file is missing.
    fn read_cache_levels(&self, cpu_id: u32) -> Result<BTreeMap<u32, u32>, TopologyError> {
        let mut levels = BTreeMap::new();
        let mut level = 0;
        loop {
            let path = self.cpu_root.join(format!("cpu{}/cache/index{}/id", cpu_id, level));
            if !path.exists() {
                break;
            }
            levels.insert(level, read_u32(&path)?);
            level += 1;
        }
        Ok(levels)
    }

    fn read_numa_distances(&self) -> Result<BTreeMap<u32, Vec<u32>>, TopologyError> {
        let mut distances = BTreeMap::new();
        let mut node = 0;
        loop {
            let path = self.node_root.join(format!("node{}/distance", node));
            if !path.exists() {
                break;
            }
            let text = read_trimmed(&path)?;
            let mut row = Vec::new();
            for field in text.split_whitespace() {
                row.push(
                    field
                        .parse()
                        .map_err(|_| TopologyError::Unparsable(path.clone(), field.to_string()))?,
                );
            }
            distances.insert(node, row);
            node += 1;
        }
        Ok(distances)
    }

    /// Δ-based usage over the given CPUs, in [0, n]. `None` until every CPU
    /// has a prior sample; samples are refreshed either way.
    pub fn usage_of(&self, cpus: &mut [Cpu]) -> Option<f64> {
        let stat = self.read_stat()?;
        let mut cumulated = Some(0.0);
        for cpu in cpus.iter_mut() {
            let Some(&sample) = stat.get(&format!("cpu{}", cpu.cpu_id)) else {
                continue;
            };
            let usage = cpu.time_sample.and_then(|prev| delta_usage(prev, sample));
            cpu.time_sample = Some(sample);
            cumulated = match (cumulated, usage) {
                (Some(total), Some(usage)) => Some(total + usage),
                _ => None,
            };
        }
        cumulated
    }

    /// Host-wide usage in [0, 1] from the aggregate `cpu` line.
    pub fn usage_global(&mut self) -> Option<f64> {
        let stat = self.read_stat()?;
        let sample = *stat.get("cpu")?;
        let usage = self
            .global_sample
            .and_then(|prev| delta_usage(prev, sample));
        self.global_sample = Some(sample);
        usage
    }

    fn read_stat(&self) -> Option<BTreeMap<String, CpuTimeSample>> {
        let text = match fs::read_to_string(&self.stat_path) {
            Ok(text) => text,
            Err(err) => {
                log::debug!("cannot read {}: {}", self.stat_path.display(), err);
                return None;
            }
        };
        let mut samples = BTreeMap::new();
        for line in text.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() || !fields[0].starts_with("cpu") {
                continue;
            }
            if fields.len() < 9 {
                continue;
            }
            let tick = |index: usize| fields[index].parse::<u64>().unwrap_or(0);
            // idle = idle + iowait; not_idle = user + nice + system + irq
            // + softirq + steal, per the kernel's /proc/stat layout.
            let idle = tick(4) + tick(5);
            let not_idle = tick(1) + tick(2) + tick(3) + tick(6) + tick(7) + tick(8);
            samples.insert(fields[0].to_string(), CpuTimeSample { idle, not_idle });
        }
        Some(samples)
    }
}

fn delta_usage(prev: CpuTimeSample, current: CpuTimeSample) -> Option<f64> {
    let delta_idle = current.idle.saturating_sub(prev.idle);
    let delta_total = (current.idle + current.not_idle).saturating_sub(prev.idle + prev.not_idle);
    if delta_total == 0 {
        return None;
    }
    Some((delta_total - delta_idle.min(delta_total)) as f64 / delta_total as f64)
}

/// Reads `/proc/meminfo`.
#[derive(Debug, Clone)]
pub struct MemoryExplorer {
    meminfo: PathBuf,
    private_mb: u64,
}

impl MemoryExplorer {
    pub fn new(private_mb: u64) -> Self {
        Self::with_path(DEFAULT_MEMINFO_PATH.into(), private_mb)
    }

    pub fn with_path(meminfo: PathBuf, private_mb: u64) -> Self {
        Self { meminfo, private_mb }
    }

    pub fn build_memset(&self) -> Result<MemSet, TopologyError> {
        let total_kb = self.read_field_kb("MemTotal")?;
        MemSet::new(total_kb / 1024, self.private_mb)
    }

    /// Host-wide usage in [0, 1]. The memory tracker is logical: ranges are
    /// not physically attributed, so per-range usage is the host fraction.
    pub fn usage_of(&self, _ranges: &[(u64, u64)]) -> Option<f64> {
        self.usage_global()
    }

    pub fn usage_global(&self) -> Option<f64> {
        let total = self.read_field_kb("MemTotal").ok()?;
        let available = self.read_field_kb("MemAvailable").ok()?;
        if total == 0 {
            return None;
        }
        Some(1.0 - available.min(total) as f64 / total as f64)
    }

    fn read_field_kb(&self, key: &str) -> Result<u64, TopologyError> {
        let text = fs::read_to_string(&self.meminfo)
            .map_err(|_| TopologyError::MissingFile(self.meminfo.clone()))?;
        for line in text.lines() {
            let Some(rest) = line.strip_prefix(key) else { continue };
            let Some(rest) = rest.strip_prefix(':') else { continue };
            let value = rest.trim().trim_end_matches("kB").trim();
            return value
                .parse()
                .map_err(|_| TopologyError::Unparsable(self.meminfo.clone(), value.to_string()));
        }
        Err(TopologyError::Unparsable(self.meminfo.clone(), key.to_string()))
    }
}
