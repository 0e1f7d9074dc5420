// VM entity shared between the resource subsets and the hypervisor registry.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use spin::Mutex;

use crate::oversubscription::Ratio;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u8 {
        const DEPLOYED = 1 << 0;
        const BEING_DESTROYED = 1 << 1;
    }
}

/// Identity usable before and after hypervisor creation: a VM that has not
/// been created yet has no UUID and is addressed by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmId {
    ByUuid(String),
    ByName(String),
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByUuid(uuid) => write!(f, "uuid:{}", uuid),
            Self::ByName(name) => write!(f, "name:{}", name),
        }
    }
}

#[derive(Debug)]
pub enum DomainError {
    EmptyName,
    ZeroCpu(String),
    ZeroMem(String),
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyName => write!(f, "VM name must not be empty"),
            Self::ZeroCpu(name) => write!(f, "VM {} requests zero vCPUs", name),
            Self::ZeroMem(name) => write!(f, "VM {} requests zero memory", name),
        }
    }
}

impl std::error::Error for DomainError {}

/// The same `Vm` instance is referenced by the CPU subset, the memory subset
/// and the hypervisor registry, so lifecycle flags stay consistent across all
/// three. Never call into a manager or subset while holding the lock.
pub type VmHandle = Arc<Mutex<Vm>>;

#[derive(Debug, Clone)]
pub struct Vm {
    uuid: Option<String>,
    name: String,
    cpu: u32,
    mem_mb: u64,
    cpu_ratio: Ratio,
    cpu_pin: Option<BTreeSet<u32>>,
    flags: VmFlags,
}

impl Vm {
    pub fn new(name: &str, cpu: u32, mem_mb: u64, cpu_ratio: Ratio) -> Result<Self, DomainError> {
        if name.is_empty() {
            return Err(DomainError::EmptyName);
        }
        if cpu == 0 {
            return Err(DomainError::ZeroCpu(name.to_string()));
        }
        if mem_mb == 0 {
            return Err(DomainError::ZeroMem(name.to_string()));
        }
        Ok(Self {
            uuid: None,
            name: name.to_string(),
            cpu,
            mem_mb,
            cpu_ratio,
            cpu_pin: None,
            flags: VmFlags::empty(),
        })
    }

    pub fn into_handle(self) -> VmHandle {
        Arc::new(Mutex::new(self))
    }

    pub fn uuid(&self) -> Option<&String> {
        self.uuid.as_ref()
    }

    pub fn set_uuid(&mut self, uuid: String) {
        self.uuid = Some(uuid);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    pub fn mem_mb(&self) -> u64 {
        self.mem_mb
    }

    pub fn cpu_ratio(&self) -> Ratio {
        self.cpu_ratio
    }

    pub fn cpu_pin(&self) -> Option<&BTreeSet<u32>> {
        self.cpu_pin.as_ref()
    }

    pub fn set_cpu_pin(&mut self, template: BTreeSet<u32>) {
        self.cpu_pin = Some(template);
    }

    pub fn is_deployed(&self) -> bool {
        self.flags.contains(VmFlags::DEPLOYED)
    }

    pub fn set_deployed(&mut self, deployed: bool) {
        self.flags.set(VmFlags::DEPLOYED, deployed);
    }

    pub fn is_being_destroyed(&self) -> bool {
        self.flags.contains(VmFlags::BEING_DESTROYED)
    }

    pub fn set_being_destroyed(&mut self, destroyed: bool) {
        self.flags.set(VmFlags::BEING_DESTROYED, destroyed);
    }

    pub fn id(&self) -> VmId {
        match &self.uuid {
            Some(uuid) => VmId::ByUuid(uuid.clone()),
            None => VmId::ByName(self.name.clone()),
        }
    }

    /// Entity matching rule: UUIDs when both sides carry one, names otherwise.
    pub fn matches(&self, other: &Vm) -> bool {
        match (&self.uuid, &other.uuid) {
            (Some(a), Some(b)) => a == b,
            _ => self.name == other.name,
        }
    }

    pub fn matches_id(&self, id: &VmId) -> bool {
        match id {
            VmId::ByUuid(uuid) => self.uuid.as_ref() == Some(uuid),
            VmId::ByName(name) => &self.name == name,
        }
    }
}

impl fmt::Display for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cpu:{} mem:{}MB oc:{}",
            self.name, self.cpu, self.mem_mb, self.cpu_ratio
        )
    }
}
