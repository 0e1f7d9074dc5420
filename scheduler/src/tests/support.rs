// Shared fixtures: the canonical two-node host and offline explorers.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::domain::{Vm, VmHandle};
use crate::endpoint::EndpointPool;
use crate::hypervisor::{InMemoryHypervisor, DEFAULT_CALL_TIMEOUT};
use crate::oversubscription::Ratio;
use crate::subset::manager::{CpuSubsetManager, MemSubsetManager};
use crate::subset::pool::SubsetManagerPool;
use crate::topology::{Cpu, CpuExplorer, CpuSet, MemSet, MemoryExplorer};

pub fn ratio(value: f32) -> Ratio {
    Ratio::new(value).expect("test ratio")
}

pub fn vm(name: &str, cpu: u32, mem_mb: u64, r: f32) -> VmHandle {
    Vm::new(name, cpu, mem_mb, ratio(r))
        .expect("test vm")
        .into_handle()
}

/// Eight CPUs on two NUMA nodes (0-3 and 4-7), SMT pairs (0,1) (2,3) (4,5)
/// (6,7), L1 and L2 private to each pair, L3 shared per node, NUMA distance
/// table [[10, 20], [20, 10]].
pub fn canonical_cpuset() -> CpuSet {
    let mut cpus = Vec::new();
    for id in 0..8u32 {
        let node = id / 4;
        let pair = id / 2;
        let partner = if id % 2 == 0 { id + 1 } else { id - 1 };
        let socket: BTreeSet<u32> = (node * 4..node * 4 + 4).filter(|sib| *sib != id).collect();
        cpus.push(Cpu {
            cpu_id: id,
            numa_node: node,
            sib_smt: BTreeSet::from([partner]),
            sib_cpu: socket,
            cache_level: BTreeMap::from([(0, pair), (1, pair), (2, node)]),
            max_freq: 2_000_000,
            time_sample: None,
        });
    }
    let numa = BTreeMap::from([(0, vec![10, 20]), (1, vec![20, 10])]);
    CpuSet::build(cpus, numa).expect("canonical host")
}

pub fn memset(allowed_mb: u64) -> MemSet {
    MemSet::new(allowed_mb, 0).expect("test memset")
}

pub fn endpoint_pool() -> Arc<EndpointPool> {
    Arc::new(EndpointPool::live(None))
}

static DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

pub fn scratch_dir(tag: &str) -> PathBuf {
    let seq = DIR_SEQ.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!(
        "vmsched-test-{}-{}-{}",
        std::process::id(),
        tag,
        seq
    ));
    fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

/// Explorer whose roots point nowhere: usage probes return `None`.
pub fn offline_cpu_explorer() -> CpuExplorer {
    let dir = scratch_dir("offline-cpu");
    CpuExplorer::with_roots(
        dir.join("cpu"),
        dir.join("node"),
        dir.join("stat"),
        BTreeSet::new(),
        BTreeSet::new(),
    )
}

pub fn offline_mem_explorer() -> MemoryExplorer {
    MemoryExplorer::with_path(scratch_dir("offline-mem").join("meminfo"), 0)
}

pub fn hypervisor() -> Arc<InMemoryHypervisor> {
    Arc::new(InMemoryHypervisor::new(DEFAULT_CALL_TIMEOUT))
}

pub fn cpu_manager(connector: Arc<InMemoryHypervisor>) -> CpuSubsetManager {
    CpuSubsetManager::new(
        connector,
        endpoint_pool(),
        Arc::new(canonical_cpuset()),
        50,
        offline_cpu_explorer(),
    )
}

pub fn mem_manager(connector: Arc<InMemoryHypervisor>, allowed_mb: u64) -> MemSubsetManager {
    MemSubsetManager::new(
        connector,
        endpoint_pool(),
        memset(allowed_mb),
        offline_mem_explorer(),
    )
}

pub fn pool(connector: Arc<InMemoryHypervisor>, allowed_mb: u64) -> SubsetManagerPool {
    SubsetManagerPool::new(
        connector,
        endpoint_pool(),
        Arc::new(canonical_cpuset()),
        memset(allowed_mb),
        offline_cpu_explorer(),
        offline_mem_explorer(),
        50,
    )
}
