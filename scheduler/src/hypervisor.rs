// Hypervisor collaborator seam. The scheduler core only talks to this trait;
// the in-memory implementation backs tests and standalone runs.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use spin::Mutex;

use crate::domain::{Vm, VmHandle};
use crate::oversubscription::Ratio;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum HypervisorError {
    /// The addressed domain is not running; callers skip the consumer and
    /// keep iterating.
    ConsumerNotAlive(String),
    /// The call exceeded its time budget; transient, retried next tick.
    Timeout(&'static str),
    Unavailable(String),
    CreateRejected(String),
    UnknownDomain(String),
}

impl fmt::Display for HypervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConsumerNotAlive(id) => write!(f, "domain {} is not alive", id),
            Self::Timeout(op) => write!(f, "hypervisor call {} timed out", op),
            Self::Unavailable(reason) => write!(f, "hypervisor unavailable: {}", reason),
            Self::CreateRejected(reason) => write!(f, "domain creation rejected: {}", reason),
            Self::UnknownDomain(id) => write!(f, "unknown domain {}", id),
        }
    }
}

impl std::error::Error for HypervisorError {}

/// Control-plane operations the scheduler needs. Implementations must bound
/// every call with the timeout they were constructed with and surface an
/// expired budget as `HypervisorError::Timeout`; no call may block the tick
/// loop indefinitely.
pub trait Hypervisor {
    /// Running domains as fully-described shared entities. Repeated calls
    /// return the same handles for the same domains.
    fn list_alive(&self) -> Result<Vec<VmHandle>, HypervisorError>;

    /// Defined-but-shut-down domains.
    fn list_defined(&self) -> Result<Vec<VmHandle>, HypervisorError>;

    fn pin(&self, uuid: &str, cpus: &BTreeSet<u32>) -> Result<(), HypervisorError>;

    /// Create the domain described by the entity and return its UUID.
    fn create(&self, vm: &VmHandle) -> Result<String, HypervisorError>;

    fn delete(&self, uuid: &str) -> Result<(), HypervisorError>;

    /// Current CPU usage of the domain, in [0, 1].
    fn usage_cpu(&self, uuid: &str) -> Result<f64, HypervisorError>;

    /// Current memory usage of the domain, in [0, 1].
    fn usage_mem(&self, uuid: &str) -> Result<f64, HypervisorError>;
}

#[derive(Default)]
struct Registry {
    alive: BTreeMap<String, VmHandle>,
    defined: BTreeMap<String, VmHandle>,
    usage: BTreeMap<String, (f64, f64)>,
    pins: BTreeMap<String, BTreeSet<u32>>,
    next_id: u64,
    fail_create: bool,
    fail_delete: bool,
}

/// In-process hypervisor with deterministic UUIDs. Serves as the standalone
/// backend of the binary and as the test fixture; `boot`, `kill`,
/// `set_usage` and the failure toggles simulate out-of-band activity.
pub struct InMemoryHypervisor {
    registry: Mutex<Registry>,
    call_timeout: Duration,
}

impl InMemoryHypervisor {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            call_timeout,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Register a running domain that did not pass through the scheduler.
    /// A missing premium policy falls back to no oversubscription, the same
    /// default a connector writes back into absent domain metadata.
    pub fn boot(
        &self,
        name: &str,
        cpu: u32,
        mem_mb: u64,
        ratio: Option<Ratio>,
    ) -> Result<VmHandle, crate::domain::DomainError> {
        let ratio = ratio.unwrap_or_else(|| {
            log::warn!("no oversubscription policy on domain {}: defaults applied", name);
            Ratio::ONE
        });
        let mut vm = Vm::new(name, cpu, mem_mb, ratio)?;
        let mut registry = self.registry.lock();
        let uuid = next_uuid(&mut registry);
        vm.set_uuid(uuid.clone());
        vm.set_deployed(true);
        let handle = vm.into_handle();
        registry.alive.insert(uuid.clone(), handle.clone());
        registry.usage.insert(uuid, (0.0, 0.0));
        Ok(handle)
    }

    /// Destroy a domain behind the scheduler's back.
    pub fn kill(&self, uuid: &str) {
        let mut registry = self.registry.lock();
        registry.alive.remove(uuid);
        registry.usage.remove(uuid);
        registry.pins.remove(uuid);
    }

    pub fn set_usage(&self, uuid: &str, cpu: f64, mem: f64) {
        self.registry.lock().usage.insert(uuid.to_string(), (cpu, mem));
    }

    pub fn pinning_of(&self, uuid: &str) -> Option<BTreeSet<u32>> {
        self.registry.lock().pins.get(uuid).cloned()
    }

    pub fn alive_count(&self) -> usize {
        self.registry.lock().alive.len()
    }

    pub fn fail_next_create(&self, fail: bool) {
        self.registry.lock().fail_create = fail;
    }

    pub fn fail_delete(&self, fail: bool) {
        self.registry.lock().fail_delete = fail;
    }
}

fn next_uuid(registry: &mut Registry) -> String {
    registry.next_id += 1;
    format!("00000000-0000-0000-0000-{:012}", registry.next_id)
}

impl Hypervisor for InMemoryHypervisor {
    fn list_alive(&self) -> Result<Vec<VmHandle>, HypervisorError> {
        Ok(self.registry.lock().alive.values().cloned().collect())
    }

    fn list_defined(&self) -> Result<Vec<VmHandle>, HypervisorError> {
        Ok(self.registry.lock().defined.values().cloned().collect())
    }

    fn pin(&self, uuid: &str, cpus: &BTreeSet<u32>) -> Result<(), HypervisorError> {
        let mut registry = self.registry.lock();
        if !registry.alive.contains_key(uuid) {
            return Err(HypervisorError::ConsumerNotAlive(uuid.to_string()));
        }
        registry.pins.insert(uuid.to_string(), cpus.clone());
        Ok(())
    }

    fn create(&self, vm: &VmHandle) -> Result<String, HypervisorError> {
        let pin = vm.lock().cpu_pin().cloned();
        let mut registry = self.registry.lock();
        if registry.fail_create {
            registry.fail_create = false;
            return Err(HypervisorError::Timeout("create"));
        }
        let uuid = next_uuid(&mut registry);
        registry.alive.insert(uuid.clone(), vm.clone());
        registry.usage.insert(uuid.clone(), (0.0, 0.0));
        if let Some(pin) = pin {
            registry.pins.insert(uuid.clone(), pin);
        }
        Ok(uuid)
    }

    fn delete(&self, uuid: &str) -> Result<(), HypervisorError> {
        let mut registry = self.registry.lock();
        if registry.fail_delete {
            return Err(HypervisorError::Timeout("delete"));
        }
        if registry.alive.remove(uuid).is_none() {
            return Err(HypervisorError::UnknownDomain(uuid.to_string()));
        }
        registry.usage.remove(uuid);
        registry.pins.remove(uuid);
        Ok(())
    }

    fn usage_cpu(&self, uuid: &str) -> Result<f64, HypervisorError> {
        self.registry
            .lock()
            .usage
            .get(uuid)
            .map(|(cpu, _)| *cpu)
            .ok_or_else(|| HypervisorError::ConsumerNotAlive(uuid.to_string()))
    }

    fn usage_mem(&self, uuid: &str) -> Result<f64, HypervisorError> {
        self.registry
            .lock()
            .usage
            .get(uuid)
            .map(|(_, mem)| *mem)
            .ok_or_else(|| HypervisorError::ConsumerNotAlive(uuid.to_string()))
    }
}
