// The manager pool makes multi-resource operations atomic: a VM is placed on
// every resource or on none.

use std::fmt;
use std::sync::Arc;

use crate::domain::{Vm, VmHandle, VmId};
use crate::endpoint::EndpointPool;
use crate::hypervisor::{Hypervisor, HypervisorError};
use crate::topology::{CpuExplorer, CpuSet, MemSet, MemoryExplorer};

use super::manager::{CpuSubsetManager, MemSubsetManager, SubsetManager};
use super::PlacementError;

#[derive(Debug)]
pub enum PoolError {
    AlreadyPlaced(String),
    Placement { res: &'static str, source: PlacementError },
    Hypervisor(HypervisorError),
    /// A VM is present in some resource subsets but not all of them outside
    /// of a destroy window. Never repaired silently.
    Inconsistency(String),
    UnknownVm(VmId),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyPlaced(name) => write!(f, "VM {} is already placed", name),
            Self::Placement { res, source } => {
                write!(f, "not enough space on res {}: {}", res, source)
            }
            Self::Hypervisor(err) => write!(f, "hypervisor failure: {}", err),
            Self::Inconsistency(reason) => write!(f, "invalid state encountered: {}", reason),
            Self::UnknownVm(id) => write!(f, "no VM matching {}", id),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Placement { source, .. } => Some(source),
            Self::Hypervisor(err) => Some(err),
            _ => None,
        }
    }
}

pub struct SubsetManagerPool {
    connector: Arc<dyn Hypervisor>,
    managers: Vec<Box<dyn SubsetManager>>,
    pending_destroy: Vec<VmHandle>,
    prev_status: Option<String>,
}

impl SubsetManagerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector: Arc<dyn Hypervisor>,
        endpoint_pool: Arc<EndpointPool>,
        cpuset: Arc<CpuSet>,
        memset: MemSet,
        cpu_explorer: CpuExplorer,
        mem_explorer: MemoryExplorer,
        distance_max: u32,
    ) -> Self {
        let managers: Vec<Box<dyn SubsetManager>> = vec![
            Box::new(CpuSubsetManager::new(
                connector.clone(),
                endpoint_pool.clone(),
                cpuset,
                distance_max,
                cpu_explorer,
            )),
            Box::new(MemSubsetManager::new(
                connector.clone(),
                endpoint_pool,
                memset,
                mem_explorer,
            )),
        ];
        Self {
            connector,
            managers,
            pending_destroy: Vec::new(),
            prev_status: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn managers_mut(&mut self) -> &mut [Box<dyn SubsetManager>] {
        &mut self.managers
    }

    /// Place a VM on every resource manager, then create the domain if it
    /// does not exist yet. Any failure rolls back the managers already
    /// treated and leaves no trace of the VM.
    pub fn deploy(&mut self, vm: &VmHandle) -> Result<(), PoolError> {
        let probe = vm.lock().clone();
        if self.has_vm(&probe)? {
            return Err(PoolError::AlreadyPlaced(probe.name().to_string()));
        }
        let mut treated = 0;
        let mut failure: Option<PoolError> = None;
        for manager in &mut self.managers {
            match manager.deploy(vm) {
                Ok(()) => treated += 1,
                Err(source) => {
                    failure = Some(PoolError::Placement { res: manager.res_name(), source });
                    break;
                }
            }
        }
        let already_deployed = vm.lock().is_deployed();
        if failure.is_none() && !already_deployed {
            match self.connector.create(vm) {
                Ok(uuid) => {
                    let mut guard = vm.lock();
                    guard.set_uuid(uuid);
                    guard.set_deployed(true);
                }
                Err(err) => failure = Some(PoolError::Hypervisor(err)),
            }
        }
        let Some(failure) = failure else { return Ok(()) };
        let probe = vm.lock().clone();
        for manager in self.managers.iter_mut().take(treated) {
            if !manager.remove(&probe) {
                return Err(PoolError::Inconsistency(format!(
                    "rollback of {} failed on res {}",
                    probe.name(),
                    manager.res_name()
                )));
            }
        }
        Err(failure)
    }

    /// Remove a VM from every manager, then delete the domain. A failed
    /// delete leaves the VM flagged for destruction and is retried on the
    /// next tick.
    pub fn remove(&mut self, id: &VmId) -> Result<(), PoolError> {
        let handle = self
            .lookup(id)?
            .ok_or_else(|| PoolError::UnknownVm(id.clone()))?;
        handle.lock().set_being_destroyed(true);
        let probe = handle.lock().clone();
        let mut removed = 0;
        for manager in &mut self.managers {
            if manager.remove(&probe) {
                removed += 1;
            } else if removed > 0 {
                return Err(PoolError::Inconsistency(format!(
                    "VM {} vanished from res {} mid-removal",
                    probe.name(),
                    manager.res_name()
                )));
            } else {
                handle.lock().set_being_destroyed(false);
                return Err(PoolError::UnknownVm(id.clone()));
            }
        }
        let Some(uuid) = probe.uuid().cloned() else { return Ok(()) };
        match self.connector.delete(&uuid) {
            Ok(()) | Err(HypervisorError::UnknownDomain(_)) => Ok(()),
            Err(err) => {
                log::warn!("delete of {} failed, retrying next tick: {}", uuid, err);
                self.pending_destroy.push(handle);
                Err(PoolError::Hypervisor(err))
            }
        }
    }

    fn retry_pending_destroy(&mut self) {
        let pending = std::mem::take(&mut self.pending_destroy);
        for handle in pending {
            let uuid = handle.lock().uuid().cloned();
            let Some(uuid) = uuid else { continue };
            match self.connector.delete(&uuid) {
                Ok(()) | Err(HypervisorError::UnknownDomain(_)) => {
                    log::info!("deferred delete of {} completed", uuid);
                }
                Err(err) => {
                    log::warn!("deferred delete of {} still failing: {}", uuid, err);
                    self.pending_destroy.push(handle);
                }
            }
        }
    }

    /// Absorb VMs created outside the scheduler. The inverse direction,
    /// VMs destroyed outside of it, is detected per-subset during
    /// monitoring.
    pub fn reconcile(&mut self) -> Result<(), PoolError> {
        let alive = match self.connector.list_alive() {
            Ok(list) => list,
            Err(err) => {
                log::warn!("cannot list alive domains: {}", err);
                return Ok(());
            }
        };
        for handle in alive {
            let probe = handle.lock().clone();
            if probe.is_being_destroyed() {
                continue;
            }
            if self.has_vm(&probe)? {
                continue;
            }
            match self.deploy(&handle) {
                Ok(()) => {
                    log::warn!("VM deployed out of scope was integrated: {}", probe);
                }
                Err(PoolError::Inconsistency(reason)) => {
                    return Err(PoolError::Inconsistency(reason));
                }
                Err(err) => {
                    log::warn!("out-of-band VM {} not integrated: {}", probe.name(), err);
                }
            }
        }
        Ok(())
    }

    /// A VM must be present on every resource or on none; a partial
    /// presence outside a destroy window is a hard error.
    pub fn has_vm(&self, vm: &Vm) -> Result<bool, PoolError> {
        let count = self
            .managers
            .iter()
            .filter(|manager| manager.has_vm(vm))
            .count();
        if count == 0 {
            Ok(false)
        } else if count == self.managers.len() {
            Ok(true)
        } else if vm.is_being_destroyed() {
            log::warn!(
                "VM {} unequally present in subsets while being destroyed",
                vm.name()
            );
            Ok(true)
        } else {
            Err(PoolError::Inconsistency(format!(
                "VM {} unequally present in subsets ({}/{})",
                vm.id(),
                count,
                self.managers.len()
            )))
        }
    }

    pub fn vm_by_name(&self, name: &str) -> Result<Option<VmHandle>, PoolError> {
        self.lookup(&VmId::ByName(name.to_string()))
    }

    fn lookup(&self, id: &VmId) -> Result<Option<VmHandle>, PoolError> {
        let mut found = None;
        let mut count = 0;
        let mut being_destroyed = false;
        for manager in &self.managers {
            if let Some(handle) = manager.vm_matching(id) {
                count += 1;
                being_destroyed = being_destroyed || handle.lock().is_being_destroyed();
                found = Some(handle);
            }
        }
        if count != 0 && count != self.managers.len() {
            if being_destroyed {
                log::warn!("VM {} unequally present in subsets while being destroyed", id);
                return Ok(None);
            }
            return Err(PoolError::Inconsistency(format!(
                "VM {} unequally present in subsets ({}/{})",
                id,
                count,
                self.managers.len()
            )));
        }
        Ok(found)
    }

    /// One scheduler tick over the pool. Reconciliation runs first so VMs
    /// observed this tick are monitored this tick.
    pub fn iterate(&mut self, timestamp: u64) -> Result<(), PoolError> {
        self.reconcile()?;
        self.retry_pending_destroy();
        for manager in &mut self.managers {
            manager.update_monitoring(timestamp);
        }
        for manager in &mut self.managers {
            manager.shrink();
        }
        let status = self.to_string();
        if self.prev_status.as_deref() != Some(status.as_str()) {
            log::info!("{}", status.trim_end());
            self.prev_status = Some(status);
        }
        Ok(())
    }
}

impl fmt::Display for SubsetManagerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for manager in &self.managers {
            write!(f, "{}", manager)?;
        }
        Ok(())
    }
}
