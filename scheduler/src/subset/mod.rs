// Subsets: slices of one physical resource dedicated to consumers sharing an
// oversubscription ratio.

pub mod manager;
pub mod pool;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::domain::{Vm, VmHandle};
use crate::endpoint::{EndpointPool, MonitoredSubset};
use crate::hypervisor::{Hypervisor, HypervisorError};
use crate::oversubscription::{OversubscriptionPolicy, Ratio, StaticRatio, SubsetAccounting};
use crate::topology::{Cpu, CpuExplorer, MemoryExplorer};

/// A refused or impossible placement. Carries the reason surfaced to the
/// API caller; no state was mutated.
#[derive(Debug)]
pub enum PlacementError {
    ZeroCapacity,
    NotEnoughResources { res: &'static str },
    NotEnoughSpace { res: &'static str, requested: u64 },
    AlreadyPlaced(String),
    DuplicateResource(&'static str),
    SubsetExists(Ratio),
}

impl fmt::Display for PlacementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroCapacity => write!(f, "cannot create a subset without capacity"),
            Self::NotEnoughResources { res } => {
                write!(f, "not enough free {} resources on the host", res)
            }
            Self::NotEnoughSpace { res, requested } => {
                write!(f, "not enough {} space available for a request of {}", res, requested)
            }
            Self::AlreadyPlaced(name) => write!(f, "VM {} is already placed", name),
            Self::DuplicateResource(res) => {
                write!(f, "{} resource attributed twice to one subset", res)
            }
            Self::SubsetExists(id) => write!(f, "subset {} already exists", id),
        }
    }
}

impl std::error::Error for PlacementError {}

/// Keyed set of subsets for one resource kind. The key is the
/// oversubscription ratio.
pub struct SubsetCollection<S> {
    subsets: BTreeMap<Ratio, S>,
}

impl<S> SubsetCollection<S> {
    pub fn new() -> Self {
        Self { subsets: BTreeMap::new() }
    }

    pub fn contains(&self, id: Ratio) -> bool {
        self.subsets.contains_key(&id)
    }

    pub fn insert(&mut self, id: Ratio, subset: S) -> Result<(), PlacementError> {
        if self.subsets.contains_key(&id) {
            return Err(PlacementError::SubsetExists(id));
        }
        self.subsets.insert(id, subset);
        Ok(())
    }

    pub fn remove(&mut self, id: Ratio) -> Option<S> {
        self.subsets.remove(&id)
    }

    pub fn get(&self, id: Ratio) -> Option<&S> {
        self.subsets.get(&id)
    }

    pub fn get_mut(&mut self, id: Ratio) -> Option<&mut S> {
        self.subsets.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<Ratio> {
        self.subsets.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Ratio, &S)> {
        self.subsets.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Ratio, &mut S)> {
        self.subsets.iter_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.subsets.is_empty()
    }
}

fn find_consumer(consumers: &[VmHandle], vm: &Vm) -> Option<usize> {
    consumers.iter().position(|handle| handle.lock().matches(vm))
}

fn consumer_by_name(consumers: &[VmHandle], name: &str) -> Option<VmHandle> {
    consumers
        .iter()
        .find(|handle| handle.lock().name() == name)
        .cloned()
}

/// A group of physical CPUs attributed to consumers of one ratio. Every
/// membership change re-emits pinning for all consumers and invalidates the
/// per-CPU usage samples.
pub struct CpuSubset {
    res_list: Vec<Cpu>,
    consumer_list: Vec<VmHandle>,
    policy: StaticRatio,
    connector: Arc<dyn Hypervisor>,
    explorer: CpuExplorer,
    endpoint_pool: Arc<EndpointPool>,
    last_monitor_ts: Option<u64>,
}

impl CpuSubset {
    pub fn new(
        ratio: Ratio,
        connector: Arc<dyn Hypervisor>,
        explorer: CpuExplorer,
        endpoint_pool: Arc<EndpointPool>,
    ) -> Self {
        Self {
            res_list: Vec::new(),
            consumer_list: Vec::new(),
            policy: StaticRatio::new(ratio),
            connector,
            explorer,
            endpoint_pool,
            last_monitor_ts: None,
        }
    }

    pub fn vm_allocation(vm: &Vm) -> u64 {
        vm.cpu() as u64
    }

    pub fn add_res(&mut self, cpu: Cpu) -> Result<(), PlacementError> {
        if self.res_list.iter().any(|held| held.cpu_id == cpu.cpu_id) {
            return Err(PlacementError::DuplicateResource("cpu"));
        }
        self.res_list.push(cpu);
        Ok(())
    }

    /// LIFO removal used by shrink: the seed CPU is the last to go.
    pub fn remove_last_res(&mut self) -> Option<Cpu> {
        self.res_list.pop()
    }

    pub fn res(&self) -> &[Cpu] {
        &self.res_list
    }

    pub fn res_ids(&self) -> Vec<u32> {
        self.res_list.iter().map(|cpu| cpu.cpu_id).collect()
    }

    pub fn count_res(&self) -> usize {
        self.res_list.len()
    }

    pub fn count_consumers(&self) -> usize {
        self.consumer_list.len()
    }

    pub fn consumers(&self) -> &[VmHandle] {
        &self.consumer_list
    }

    pub fn has_vm(&self, vm: &Vm) -> bool {
        find_consumer(&self.consumer_list, vm).is_some()
    }

    pub fn vm_by_name(&self, name: &str) -> Option<VmHandle> {
        consumer_by_name(&self.consumer_list, name)
    }

    pub fn additional_needed_for(&self, vm: &Vm) -> u64 {
        self.policy.additional_needed(self, Self::vm_allocation(vm))
    }

    pub fn unused_resources(&self) -> u64 {
        self.policy.unused_resources(self)
    }

    pub fn available(&self) -> f64 {
        self.policy.available(self)
    }

    /// Admission: enough virtual units must be left. On success the consumer
    /// joins the subset, pinning is re-emitted and usage samples restart.
    pub fn deploy(&mut self, vm: &VmHandle) -> Result<(), PlacementError> {
        let probe = vm.lock().clone();
        let requested = Self::vm_allocation(&probe);
        if self.available() < requested as f64 {
            return Err(PlacementError::NotEnoughSpace { res: "cpu", requested });
        }
        if self.has_vm(&probe) {
            return Err(PlacementError::AlreadyPlaced(probe.name().to_string()));
        }
        self.consumer_list.push(vm.clone());
        self.sync_pinning();
        for cpu in &mut self.res_list {
            cpu.clear_time_sample();
        }
        Ok(())
    }

    pub fn remove_consumer(&mut self, vm: &Vm) -> bool {
        match find_consumer(&self.consumer_list, vm) {
            Some(index) => {
                self.consumer_list.remove(index);
                true
            }
            None => false,
        }
    }

    /// Re-emit the pin template to every consumer. Consumers that are not
    /// alive are skipped; transient connector failures are retried on the
    /// next membership change or tick.
    pub fn sync_pinning(&self) {
        let template: BTreeSet<u32> = self.res_list.iter().map(|cpu| cpu.cpu_id).collect();
        for consumer in &self.consumer_list {
            let (uuid, deployed) = {
                let mut guard = consumer.lock();
                guard.set_cpu_pin(template.clone());
                (guard.uuid().cloned(), guard.is_deployed())
            };
            let Some(uuid) = uuid else { continue };
            if !deployed {
                continue;
            }
            match self.connector.pin(&uuid, &template) {
                Ok(()) => {}
                Err(HypervisorError::ConsumerNotAlive(_)) => {}
                Err(err) => log::warn!("re-pinning {} failed: {}", uuid, err),
            }
        }
    }

    /// Pull one monitoring sample. Returns true when a deployed consumer
    /// vanished out-of-band and a shrink is due. Stale timestamps are
    /// discarded.
    pub fn update_monitoring(&mut self, timestamp: u64) -> bool {
        if let Some(previous) = self.last_monitor_ts {
            if timestamp <= previous {
                log::debug!("discarding stale cpu sample at ts {}", timestamp);
                return false;
            }
        }
        self.last_monitor_ts = Some(timestamp);
        let pool = self.endpoint_pool.clone();
        let sample = pool.load_subset(timestamp, self);
        let mut clean_needed = false;
        self.consumer_list.retain(|consumer| {
            let guard = consumer.lock();
            let gone = guard.is_deployed()
                && !guard.is_being_destroyed()
                && guard
                    .uuid()
                    .map_or(false, |uuid| !sample.vm_usage.contains_key(uuid));
            if gone {
                log::warn!("VM {} left without passing through the scheduler", guard.name());
                clean_needed = true;
            }
            !gone
        });
        clean_needed
    }
}

impl SubsetAccounting for CpuSubset {
    fn capacity(&self) -> u64 {
        self.res_list.len() as u64
    }

    fn allocation(&self) -> u64 {
        self.consumer_list
            .iter()
            .map(|consumer| Self::vm_allocation(&consumer.lock()))
            .sum()
    }

    fn max_consumer_allocation(&self) -> u64 {
        self.consumer_list
            .iter()
            .map(|consumer| Self::vm_allocation(&consumer.lock()))
            .max()
            .unwrap_or(0)
    }
}

impl MonitoredSubset for CpuSubset {
    fn res_name(&self) -> &'static str {
        "cpu"
    }

    fn subset_id(&self) -> Ratio {
        self.policy.id()
    }

    fn current_resources_usage(&mut self) -> Option<f64> {
        self.explorer.usage_of(&mut self.res_list)
    }

    fn current_consumers_usage(&self) -> BTreeMap<String, (VmHandle, f64)> {
        let mut usage = BTreeMap::new();
        for consumer in &self.consumer_list {
            let (uuid, deployed) = {
                let guard = consumer.lock();
                (guard.uuid().cloned(), guard.is_deployed())
            };
            if !deployed {
                continue;
            }
            let Some(uuid) = uuid else { continue };
            match self.connector.usage_cpu(&uuid) {
                Ok(value) => {
                    usage.insert(uuid, (consumer.clone(), value));
                }
                Err(HypervisorError::ConsumerNotAlive(_)) => {}
                Err(err) => log::debug!("cpu usage probe of {} failed: {}", uuid, err),
            }
        }
        usage
    }
}

impl fmt::Display for CpuSubset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cpus: Vec<u32> = self.res().iter().map(|cpu| cpu.cpu_id).collect();
        let vms: Vec<String> = self
            .consumer_list
            .iter()
            .map(|consumer| consumer.lock().name().to_string())
            .collect();
        write!(
            f,
            "CpuSubset {} alloc:{} capacity:{} res:{:?} vm:{:?}",
            self.policy,
            self.allocation(),
            self.capacity(),
            cpus,
            vms
        )
    }
}

/// A division of the host memory pool: half-open `(lo, hi)` MB ranges,
/// disjoint across all memory subsets. The tracker is logical; the host
/// enforces nothing per-range.
pub struct MemSubset {
    res_list: Vec<(u64, u64)>,
    consumer_list: Vec<VmHandle>,
    policy: StaticRatio,
    connector: Arc<dyn Hypervisor>,
    explorer: MemoryExplorer,
    endpoint_pool: Arc<EndpointPool>,
    last_monitor_ts: Option<u64>,
}

impl MemSubset {
    pub fn new(
        ratio: Ratio,
        connector: Arc<dyn Hypervisor>,
        explorer: MemoryExplorer,
        endpoint_pool: Arc<EndpointPool>,
    ) -> Self {
        Self {
            res_list: Vec::new(),
            consumer_list: Vec::new(),
            policy: StaticRatio::new(ratio),
            connector,
            explorer,
            endpoint_pool,
            last_monitor_ts: None,
        }
    }

    pub fn vm_allocation(vm: &Vm) -> u64 {
        vm.mem_mb()
    }

    pub fn add_res(&mut self, range: (u64, u64)) -> Result<(), PlacementError> {
        if self.res_list.contains(&range) {
            return Err(PlacementError::DuplicateResource("mem"));
        }
        self.res_list.push(range);
        Ok(())
    }

    pub fn remove_res(&mut self, range: (u64, u64)) -> bool {
        match self.res_list.iter().position(|held| *held == range) {
            Some(index) => {
                self.res_list.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn res(&self) -> &[(u64, u64)] {
        &self.res_list
    }

    pub fn count_res(&self) -> usize {
        self.res_list.len()
    }

    pub fn count_consumers(&self) -> usize {
        self.consumer_list.len()
    }

    pub fn consumers(&self) -> &[VmHandle] {
        &self.consumer_list
    }

    pub fn has_vm(&self, vm: &Vm) -> bool {
        find_consumer(&self.consumer_list, vm).is_some()
    }

    pub fn vm_by_name(&self, name: &str) -> Option<VmHandle> {
        consumer_by_name(&self.consumer_list, name)
    }

    pub fn additional_needed_for(&self, vm: &Vm) -> u64 {
        self.policy.additional_needed(self, Self::vm_allocation(vm))
    }

    pub fn unused_resources(&self) -> u64 {
        self.policy.unused_resources(self)
    }

    pub fn available(&self) -> f64 {
        self.policy.available(self)
    }

    pub fn deploy(&mut self, vm: &VmHandle) -> Result<(), PlacementError> {
        let probe = vm.lock().clone();
        let requested = Self::vm_allocation(&probe);
        if self.available() < requested as f64 {
            return Err(PlacementError::NotEnoughSpace { res: "mem", requested });
        }
        if self.has_vm(&probe) {
            return Err(PlacementError::AlreadyPlaced(probe.name().to_string()));
        }
        self.consumer_list.push(vm.clone());
        Ok(())
    }

    pub fn remove_consumer(&mut self, vm: &Vm) -> bool {
        match find_consumer(&self.consumer_list, vm) {
            Some(index) => {
                self.consumer_list.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn update_monitoring(&mut self, timestamp: u64) -> bool {
        if let Some(previous) = self.last_monitor_ts {
            if timestamp <= previous {
                log::debug!("discarding stale mem sample at ts {}", timestamp);
                return false;
            }
        }
        self.last_monitor_ts = Some(timestamp);
        let pool = self.endpoint_pool.clone();
        let sample = pool.load_subset(timestamp, self);
        let mut clean_needed = false;
        self.consumer_list.retain(|consumer| {
            let guard = consumer.lock();
            let gone = guard.is_deployed()
                && !guard.is_being_destroyed()
                && guard
                    .uuid()
                    .map_or(false, |uuid| !sample.vm_usage.contains_key(uuid));
            if gone {
                log::warn!("VM {} left without passing through the scheduler", guard.name());
                clean_needed = true;
            }
            !gone
        });
        clean_needed
    }
}

impl SubsetAccounting for MemSubset {
    fn capacity(&self) -> u64 {
        self.res_list.iter().map(|(lo, hi)| hi - lo).sum()
    }

    fn allocation(&self) -> u64 {
        self.consumer_list
            .iter()
            .map(|consumer| Self::vm_allocation(&consumer.lock()))
            .sum()
    }

    fn max_consumer_allocation(&self) -> u64 {
        self.consumer_list
            .iter()
            .map(|consumer| Self::vm_allocation(&consumer.lock()))
            .max()
            .unwrap_or(0)
    }
}

impl MonitoredSubset for MemSubset {
    fn res_name(&self) -> &'static str {
        "mem"
    }

    fn subset_id(&self) -> Ratio {
        self.policy.id()
    }

    fn current_resources_usage(&mut self) -> Option<f64> {
        self.explorer.usage_of(&self.res_list)
    }

    fn current_consumers_usage(&self) -> BTreeMap<String, (VmHandle, f64)> {
        let mut usage = BTreeMap::new();
        for consumer in &self.consumer_list {
            let (uuid, deployed) = {
                let guard = consumer.lock();
                (guard.uuid().cloned(), guard.is_deployed())
            };
            if !deployed {
                continue;
            }
            let Some(uuid) = uuid else { continue };
            match self.connector.usage_mem(&uuid) {
                Ok(value) => {
                    usage.insert(uuid, (consumer.clone(), value));
                }
                Err(HypervisorError::ConsumerNotAlive(_)) => {}
                Err(err) => log::debug!("mem usage probe of {} failed: {}", uuid, err),
            }
        }
        usage
    }
}

impl fmt::Display for MemSubset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vms: Vec<String> = self
            .consumer_list
            .iter()
            .map(|consumer| consumer.lock().name().to_string())
            .collect();
        write!(
            f,
            "MemSubset {} alloc:{} capacity:{} res:{:?} vm:{:?}",
            self.policy,
            self.allocation(),
            self.capacity(),
            self.res_list,
            vms
        )
    }
}
