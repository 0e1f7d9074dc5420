// Per-resource placement state machines: pick, grow, shrink.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::domain::{Vm, VmHandle, VmId};
use crate::endpoint::{EndpointPool, MonitoredManager};
use crate::hypervisor::Hypervisor;
use crate::oversubscription::Ratio;
use crate::topology::{CpuExplorer, CpuSet, MemSet, MemoryExplorer};

use super::{CpuSubset, MemSubset, PlacementError, SubsetCollection};

/// One manager per resource kind. The pool dispatches to managers in a fixed
/// order and expects every mutating operation to either succeed or leave the
/// manager untouched.
pub trait SubsetManager: fmt::Display {
    fn res_name(&self) -> &'static str;
    fn deploy(&mut self, vm: &VmHandle) -> Result<(), PlacementError>;
    fn remove(&mut self, vm: &Vm) -> bool;
    fn has_vm(&self, vm: &Vm) -> bool;
    fn vm_matching(&self, id: &VmId) -> Option<VmHandle>;
    fn update_monitoring(&mut self, timestamp: u64);
    fn shrink(&mut self);
    fn host_capacity(&self) -> u64;
}

pub struct CpuSubsetManager {
    connector: Arc<dyn Hypervisor>,
    endpoint_pool: Arc<EndpointPool>,
    cpuset: Arc<CpuSet>,
    distance_max: u32,
    explorer: CpuExplorer,
    collection: SubsetCollection<CpuSubset>,
}

impl CpuSubsetManager {
    pub fn new(
        connector: Arc<dyn Hypervisor>,
        endpoint_pool: Arc<EndpointPool>,
        cpuset: Arc<CpuSet>,
        distance_max: u32,
        explorer: CpuExplorer,
    ) -> Self {
        Self {
            connector,
            endpoint_pool,
            cpuset,
            distance_max,
            explorer,
            collection: SubsetCollection::new(),
        }
    }

    pub fn collection(&self) -> &SubsetCollection<CpuSubset> {
        &self.collection
    }

    /// CPUs currently attributed to any subset of this manager.
    pub fn allocated_ids(&self) -> BTreeSet<u32> {
        self.collection
            .iter()
            .flat_map(|(_, subset)| subset.res_ids())
            .collect()
    }

    fn deploy_on_existing(&mut self, id: Ratio, vm: &VmHandle) -> Result<(), PlacementError> {
        let probe = vm.lock().clone();
        let needed = {
            let subset = self
                .collection
                .get(id)
                .ok_or(PlacementError::NotEnoughResources { res: "cpu" })?;
            subset.additional_needed_for(&probe)
        };
        if needed > 0 {
            self.try_extend_subset(id, needed)?;
        }
        self.collection
            .get_mut(id)
            .ok_or(PlacementError::NotEnoughResources { res: "cpu" })?
            .deploy(vm)
    }

    fn deploy_on_new(&mut self, id: Ratio, vm: &VmHandle) -> Result<(), PlacementError> {
        let request = vm.lock().cpu() as u64;
        let subset = self.try_create_subset(request, id)?;
        self.collection.insert(id, subset)?;
        let result = self
            .collection
            .get_mut(id)
            .ok_or(PlacementError::NotEnoughResources { res: "cpu" })?
            .deploy(vm);
        if result.is_err() {
            self.collection.remove(id);
        }
        result
    }

    /// Seed with the farthest available CPU, then densify around the seed.
    /// The seed capacity is the raw vCPU request so no VM ends up
    /// oversubscribed with itself.
    pub fn try_create_subset(
        &self,
        initial_capacity: u64,
        ratio: Ratio,
    ) -> Result<CpuSubset, PlacementError> {
        if initial_capacity == 0 {
            return Err(PlacementError::ZeroCapacity);
        }
        let allocated = self.allocated_ids();
        let ordered = self.farthest_available(&allocated);
        if (ordered.len() as u64) < initial_capacity {
            return Err(PlacementError::NotEnoughResources { res: "cpu" });
        }
        let seed = ordered[0];
        let mut subset = CpuSubset::new(
            ratio,
            self.connector.clone(),
            self.explorer.clone(),
            self.endpoint_pool.clone(),
        );
        subset.add_res(self.cpu_clone(seed)?)?;
        let remaining = initial_capacity - 1;
        if remaining > 0 {
            let mut taken = allocated;
            taken.insert(seed);
            let closest = self.closest_available(&taken, &[seed]);
            if (closest.len() as u64) < remaining {
                return Err(PlacementError::NotEnoughResources { res: "cpu" });
            }
            for cpu_id in closest.into_iter().take(remaining as usize) {
                subset.add_res(self.cpu_clone(cpu_id)?)?;
            }
        }
        Ok(subset)
    }

    /// Grow by `amount` CPUs closest to the subset, all or nothing.
    pub fn try_extend_subset(&mut self, id: Ratio, amount: u64) -> Result<(), PlacementError> {
        let allocated = self.allocated_ids();
        let targets = self
            .collection
            .get(id)
            .ok_or(PlacementError::NotEnoughResources { res: "cpu" })?
            .res_ids();
        let closest = self.closest_available(&allocated, &targets);
        if (closest.len() as u64) < amount {
            return Err(PlacementError::NotEnoughResources { res: "cpu" });
        }
        let picks: Result<Vec<_>, _> = closest
            .into_iter()
            .take(amount as usize)
            .map(|cpu_id| self.cpu_clone(cpu_id))
            .collect();
        let picks = picks?;
        let subset = self
            .collection
            .get_mut(id)
            .ok_or(PlacementError::NotEnoughResources { res: "cpu" })?;
        for cpu in picks {
            subset.add_res(cpu)?;
        }
        Ok(())
    }

    pub fn shrink_subset(&mut self, id: Ratio) {
        let Some(subset) = self.collection.get_mut(id) else { return };
        let unused = subset.unused_resources();
        if unused > 0 {
            for _ in 0..unused {
                subset.remove_last_res();
            }
            subset.sync_pinning();
        }
        if subset.count_res() == 0 && subset.count_consumers() == 0 {
            self.collection.remove(id);
        }
    }

    fn cpu_clone(&self, cpu_id: u32) -> Result<crate::topology::Cpu, PlacementError> {
        self.cpuset
            .cpu(cpu_id)
            .cloned()
            .ok_or(PlacementError::NotEnoughResources { res: "cpu" })
    }

    /// Available CPUs ordered for subset creation: the farther from every
    /// allocated CPU, the better the isolation of the new subset. On an
    /// empty host the top of the id space seeds first.
    fn farthest_available(&self, allocated: &BTreeSet<u32>) -> Vec<u32> {
        let candidates: Vec<u32> = self
            .cpuset
            .cpus()
            .iter()
            .map(|cpu| cpu.cpu_id)
            .filter(|cpu_id| !allocated.contains(cpu_id))
            .collect();
        if allocated.is_empty() {
            let mut seeds = candidates;
            seeds.sort_unstable_by(|a, b| b.cmp(a));
            return seeds;
        }
        let mut weighted: Vec<(u32, f64)> = candidates
            .into_iter()
            .filter_map(|candidate| {
                self.mean_distance(candidate, allocated.iter().copied(), false)
                    .map(|mean| (candidate, mean))
            })
            .collect();
        weighted.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        weighted.into_iter().map(|(cpu_id, _)| cpu_id).collect()
    }

    /// Available CPUs ordered for growth: the closer to the subset's own
    /// CPUs, the denser it stays. Candidates beyond `distance_max` from any
    /// subset CPU are excluded.
    fn closest_available(&self, allocated: &BTreeSet<u32>, targets: &[u32]) -> Vec<u32> {
        let mut weighted: Vec<(u32, f64)> = self
            .cpuset
            .cpus()
            .iter()
            .map(|cpu| cpu.cpu_id)
            .filter(|cpu_id| !allocated.contains(cpu_id))
            .filter_map(|candidate| {
                self.mean_distance(candidate, targets.iter().copied(), true)
                    .map(|mean| (candidate, mean))
            })
            .collect();
        weighted.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        weighted.into_iter().map(|(cpu_id, _)| cpu_id).collect()
    }

    /// Mean distance of `candidate` to `targets`; `None` drops the
    /// candidate (identical CPU, or a leg past `distance_max` when capped).
    fn mean_distance(
        &self,
        candidate: u32,
        targets: impl Iterator<Item = u32>,
        cap: bool,
    ) -> Option<f64> {
        let mut total = 0u64;
        let mut count = 0u64;
        for target in targets {
            if target == candidate {
                return None;
            }
            let distance = self.cpuset.distance_between(candidate, target)?;
            if cap && distance >= self.distance_max {
                return None;
            }
            total += distance as u64;
            count += 1;
        }
        if count == 0 {
            Some(0.0)
        } else {
            Some(total as f64 / count as f64)
        }
    }
}

impl SubsetManager for CpuSubsetManager {
    fn res_name(&self) -> &'static str {
        "cpu"
    }

    fn deploy(&mut self, vm: &VmHandle) -> Result<(), PlacementError> {
        let id = vm.lock().cpu_ratio();
        if self.collection.contains(id) {
            self.deploy_on_existing(id, vm)
        } else {
            self.deploy_on_new(id, vm)
        }
    }

    fn remove(&mut self, vm: &Vm) -> bool {
        let id = vm.cpu_ratio();
        let removed = match self.collection.get_mut(id) {
            Some(subset) => subset.remove_consumer(vm),
            None => false,
        };
        if removed {
            self.shrink_subset(id);
        }
        removed
    }

    fn has_vm(&self, vm: &Vm) -> bool {
        self.collection.iter().any(|(_, subset)| subset.has_vm(vm))
    }

    fn vm_matching(&self, id: &VmId) -> Option<VmHandle> {
        for (_, subset) in self.collection.iter() {
            let found = match id {
                VmId::ByName(name) => subset.vm_by_name(name),
                VmId::ByUuid(_) => subset
                    .consumers()
                    .iter()
                    .find(|consumer| consumer.lock().matches_id(id))
                    .cloned(),
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }

    fn update_monitoring(&mut self, timestamp: u64) {
        let pool = self.endpoint_pool.clone();
        pool.load_global(timestamp, self);
        let mut clean_needed = Vec::new();
        for (id, subset) in self.collection.iter_mut() {
            if subset.update_monitoring(timestamp) {
                clean_needed.push(*id);
            }
        }
        for id in clean_needed {
            self.shrink_subset(id);
        }
    }

    fn shrink(&mut self) {
        for id in self.collection.ids() {
            self.shrink_subset(id);
        }
    }

    fn host_capacity(&self) -> u64 {
        self.cpuset.host_count() as u64
    }
}

impl MonitoredManager for CpuSubsetManager {
    fn res_name(&self) -> &'static str {
        "cpu"
    }

    fn host_capacity(&self) -> u64 {
        self.cpuset.host_count() as u64
    }

    fn current_resources_usage(&mut self) -> Option<f64> {
        self.explorer.usage_global()
    }
}

impl fmt::Display for CpuSubsetManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CpuSubsetManager:")?;
        for (_, subset) in self.collection.iter() {
            writeln!(f, "|_>{}", subset)?;
        }
        Ok(())
    }
}

/// Memory is a single logical pool split into disjoint ranges; the premium
/// policy is fixed, so a single subset keyed by ratio 1 holds every VM.
pub struct MemSubsetManager {
    connector: Arc<dyn Hypervisor>,
    endpoint_pool: Arc<EndpointPool>,
    memset: MemSet,
    explorer: MemoryExplorer,
    collection: SubsetCollection<MemSubset>,
}

impl MemSubsetManager {
    pub const SUBSET_ID: Ratio = Ratio::ONE;

    pub fn new(
        connector: Arc<dyn Hypervisor>,
        endpoint_pool: Arc<EndpointPool>,
        memset: MemSet,
        explorer: MemoryExplorer,
    ) -> Self {
        Self {
            connector,
            endpoint_pool,
            memset,
            explorer,
            collection: SubsetCollection::new(),
        }
    }

    pub fn collection(&self) -> &SubsetCollection<MemSubset> {
        &self.collection
    }

    fn all_ranges(&self) -> Vec<(u64, u64)> {
        self.collection
            .iter()
            .flat_map(|(_, subset)| subset.res().to_vec())
            .collect()
    }

    pub fn try_create_subset(
        &self,
        initial_capacity: u64,
        ratio: Ratio,
    ) -> Result<MemSubset, PlacementError> {
        if initial_capacity == 0 {
            return Err(PlacementError::ZeroCapacity);
        }
        let lo = self
            .all_ranges()
            .iter()
            .map(|(_, hi)| hi + 1)
            .max()
            .unwrap_or(0);
        let range = (lo, lo + initial_capacity);
        self.check_capacity_bound(range)?;
        self.check_overlap(range, None)?;
        let mut subset = MemSubset::new(
            ratio,
            self.connector.clone(),
            self.explorer.clone(),
            self.endpoint_pool.clone(),
        );
        subset.add_res(range)?;
        Ok(subset)
    }

    pub fn try_extend_subset(&mut self, id: Ratio, amount: u64) -> Result<(), PlacementError> {
        let initial = {
            let subset = self
                .collection
                .get(id)
                .ok_or(PlacementError::NotEnoughResources { res: "mem" })?;
            subset
                .res()
                .first()
                .copied()
                .ok_or(PlacementError::NotEnoughResources { res: "mem" })?
        };
        let range = (initial.0, initial.1 + amount);
        self.check_capacity_bound(range)?;
        self.check_overlap(range, Some(initial))?;
        let subset = self
            .collection
            .get_mut(id)
            .ok_or(PlacementError::NotEnoughResources { res: "mem" })?;
        subset.remove_res(initial);
        subset.add_res(range)
    }

    fn check_capacity_bound(&self, range: (u64, u64)) -> Result<(), PlacementError> {
        if range.1 > self.memset.allowed_mb() {
            return Err(PlacementError::NotEnoughResources { res: "mem" });
        }
        Ok(())
    }

    /// Overlap against every range of every other subset; the range being
    /// replaced is skipped.
    fn check_overlap(
        &self,
        range: (u64, u64),
        replacing: Option<(u64, u64)>,
    ) -> Result<(), PlacementError> {
        for other in self.all_ranges() {
            if Some(other) == replacing {
                continue;
            }
            let overlap_lo = range.0.max(other.0);
            let overlap_hi = range.1.min(other.1);
            if overlap_hi > overlap_lo {
                return Err(PlacementError::NotEnoughResources { res: "mem" });
            }
        }
        Ok(())
    }

    pub fn shrink_subset(&mut self, id: Ratio) {
        let Some(subset) = self.collection.get_mut(id) else { return };
        let unused = subset.unused_resources();
        if unused > 0 {
            if let Some(initial) = subset.res().first().copied() {
                let (lo, hi) = initial;
                subset.remove_res(initial);
                let new_size = (hi - lo).saturating_sub(unused);
                if new_size > 0 {
                    if let Err(err) = subset.add_res((lo, lo + new_size)) {
                        log::error!("memory shrink re-insertion failed: {}", err);
                    }
                }
            }
        }
        if subset.count_res() == 0 && subset.count_consumers() == 0 {
            self.collection.remove(id);
        }
    }
}

impl SubsetManager for MemSubsetManager {
    fn res_name(&self) -> &'static str {
        "mem"
    }

    fn deploy(&mut self, vm: &VmHandle) -> Result<(), PlacementError> {
        let id = Self::SUBSET_ID;
        let probe = vm.lock().clone();
        let request = probe.mem_mb();
        if self.collection.contains(id) {
            let needed = {
                let subset = self
                    .collection
                    .get(id)
                    .ok_or(PlacementError::NotEnoughResources { res: "mem" })?;
                subset.additional_needed_for(&probe)
            };
            if needed > 0 {
                self.try_extend_subset(id, needed)?;
            }
            self.collection
                .get_mut(id)
                .ok_or(PlacementError::NotEnoughResources { res: "mem" })?
                .deploy(vm)
        } else {
            let subset = self.try_create_subset(request, id)?;
            self.collection.insert(id, subset)?;
            let result = self
                .collection
                .get_mut(id)
                .ok_or(PlacementError::NotEnoughResources { res: "mem" })?
                .deploy(vm);
            if result.is_err() {
                self.collection.remove(id);
            }
            result
        }
    }

    fn remove(&mut self, vm: &Vm) -> bool {
        let id = Self::SUBSET_ID;
        let removed = match self.collection.get_mut(id) {
            Some(subset) => subset.remove_consumer(vm),
            None => false,
        };
        if removed {
            self.shrink_subset(id);
        }
        removed
    }

    fn has_vm(&self, vm: &Vm) -> bool {
        self.collection.iter().any(|(_, subset)| subset.has_vm(vm))
    }

    fn vm_matching(&self, id: &VmId) -> Option<VmHandle> {
        for (_, subset) in self.collection.iter() {
            let found = match id {
                VmId::ByName(name) => subset.vm_by_name(name),
                VmId::ByUuid(_) => subset
                    .consumers()
                    .iter()
                    .find(|consumer| consumer.lock().matches_id(id))
                    .cloned(),
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }

    fn update_monitoring(&mut self, timestamp: u64) {
        let pool = self.endpoint_pool.clone();
        pool.load_global(timestamp, self);
        let mut clean_needed = Vec::new();
        for (id, subset) in self.collection.iter_mut() {
            if subset.update_monitoring(timestamp) {
                clean_needed.push(*id);
            }
        }
        for id in clean_needed {
            self.shrink_subset(id);
        }
    }

    fn shrink(&mut self) {
        for id in self.collection.ids() {
            self.shrink_subset(id);
        }
    }

    fn host_capacity(&self) -> u64 {
        self.memset.allowed_mb()
    }
}

impl MonitoredManager for MemSubsetManager {
    fn res_name(&self) -> &'static str {
        "mem"
    }

    fn host_capacity(&self) -> u64 {
        self.memset.allowed_mb()
    }

    fn current_resources_usage(&mut self) -> Option<f64> {
        self.explorer.usage_global()
    }
}

impl fmt::Display for MemSubsetManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MemSubsetManager:")?;
        for (_, subset) in self.collection.iter() {
            writeln!(f, "|_>{}", subset)?;
        }
        Ok(())
    }
}
