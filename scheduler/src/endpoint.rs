// Telemetry seam: a loader pulls usage samples, an optional store persists
// them. The scheduler only depends on the pair, never on a backend.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use spin::Mutex;

use crate::domain::VmHandle;
use crate::oversubscription::{Ratio, SubsetAccounting};

#[derive(Debug)]
pub enum EndpointError {
    Open(PathBuf, String),
    Store(String),
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open(path, reason) => {
                write!(f, "cannot open telemetry sink {}: {}", path.display(), reason)
            }
            Self::Store(reason) => write!(f, "telemetry store failed: {}", reason),
        }
    }
}

impl std::error::Error for EndpointError {}

/// One monitoring pull over a subset: physical usage plus per-consumer usage
/// keyed by UUID. A consumer absent from the map was not reported alive.
pub struct SubsetSample {
    pub resource_usage: Option<f64>,
    pub vm_usage: BTreeMap<String, (VmHandle, f64)>,
}

/// Flattened record handed to the store.
#[derive(Debug, Serialize)]
pub struct UsageRecord {
    pub timestamp: u64,
    pub resource: &'static str,
    pub scope: String,
    pub capacity: u64,
    pub allocation: Option<u64>,
    pub usage: Option<f64>,
    pub consumers: BTreeMap<String, f64>,
}

/// What the loader may ask of a subset during a monitoring pull.
pub trait MonitoredSubset: SubsetAccounting {
    fn res_name(&self) -> &'static str;
    fn subset_id(&self) -> Ratio;
    fn current_resources_usage(&mut self) -> Option<f64>;
    fn current_consumers_usage(&self) -> BTreeMap<String, (VmHandle, f64)>;
}

/// What the loader may ask of a whole manager.
pub trait MonitoredManager {
    fn res_name(&self) -> &'static str;
    fn host_capacity(&self) -> u64;
    fn current_resources_usage(&mut self) -> Option<f64>;
}

pub trait EndpointLoader {
    fn load_subset(&self, timestamp: u64, subset: &mut dyn MonitoredSubset) -> SubsetSample;
    fn load_global(&self, timestamp: u64, manager: &mut dyn MonitoredManager) -> Option<f64>;
}

pub trait EndpointStore {
    fn store(&self, record: &UsageRecord) -> Result<(), EndpointError>;
}

/// Reads the live system through the monitored traits. Cannot store.
pub struct LiveLoader;

impl EndpointLoader for LiveLoader {
    fn load_subset(&self, _timestamp: u64, subset: &mut dyn MonitoredSubset) -> SubsetSample {
        SubsetSample {
            resource_usage: subset.current_resources_usage(),
            vm_usage: subset.current_consumers_usage(),
        }
    }

    fn load_global(&self, _timestamp: u64, manager: &mut dyn MonitoredManager) -> Option<f64> {
        manager.current_resources_usage()
    }
}

/// Appends one JSON record per line. Failures are the caller's to tolerate.
pub struct JsonLinesStore {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesStore {
    pub fn create(path: &Path) -> Result<Self, EndpointError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| EndpointError::Open(path.to_path_buf(), err.to_string()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EndpointStore for JsonLinesStore {
    fn store(&self, record: &UsageRecord) -> Result<(), EndpointError> {
        let line = serde_json::to_string(record)
            .map_err(|err| EndpointError::Store(err.to_string()))?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", line).map_err(|err| EndpointError::Store(err.to_string()))?;
        writer
            .flush()
            .map_err(|err| EndpointError::Store(err.to_string()))
    }
}

/// Loader/store pair. Loads always go through; stores are best-effort and
/// only logged on failure.
pub struct EndpointPool {
    loader: Box<dyn EndpointLoader>,
    saver: Option<Box<dyn EndpointStore>>,
}

impl EndpointPool {
    pub fn new(loader: Box<dyn EndpointLoader>, saver: Option<Box<dyn EndpointStore>>) -> Self {
        Self { loader, saver }
    }

    pub fn live(saver: Option<Box<dyn EndpointStore>>) -> Self {
        Self::new(Box::new(LiveLoader), saver)
    }

    pub fn load_subset(&self, timestamp: u64, subset: &mut dyn MonitoredSubset) -> SubsetSample {
        let sample = self.loader.load_subset(timestamp, subset);
        if let Some(saver) = &self.saver {
            let consumers = sample
                .vm_usage
                .iter()
                .map(|(uuid, (_, usage))| (uuid.clone(), *usage))
                .collect();
            let record = UsageRecord {
                timestamp,
                resource: subset.res_name(),
                scope: format!("subset:{}", subset.subset_id()),
                capacity: subset.capacity(),
                allocation: Some(subset.allocation()),
                usage: sample.resource_usage,
                consumers,
            };
            if let Err(err) = saver.store(&record) {
                log::warn!("{}", err);
            }
        }
        sample
    }

    pub fn load_global(&self, timestamp: u64, manager: &mut dyn MonitoredManager) -> Option<f64> {
        let usage = self.loader.load_global(timestamp, manager);
        if let Some(saver) = &self.saver {
            let record = UsageRecord {
                timestamp,
                resource: manager.res_name(),
                scope: "host".to_string(),
                capacity: manager.host_capacity(),
                allocation: None,
                usage,
                consumers: BTreeMap::new(),
            };
            if let Err(err) = saver.store(&record) {
                log::warn!("{}", err);
            }
        }
        usage
    }
}
