// Explicit configuration record. Every field is validated at construction;
// nothing is deferred to first use.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    BadTickRate(f64),
    BadDistanceMax(u32),
    BadCpuList(&'static str, String),
    OverlappingFilters,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadTickRate(rate) => write!(f, "tick rate must be positive, got {}", rate),
            Self::BadDistanceMax(max) => write!(f, "distance max must be positive, got {}", max),
            Self::BadCpuList(which, part) => {
                write!(f, "invalid cpu id in --{} list: {:?}", which, part)
            }
            Self::OverlappingFilters => {
                write!(f, "a cpu id cannot be both included and excluded")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub include: BTreeSet<u32>,
    pub exclude: BTreeSet<u32>,
    pub topology_file: Option<PathBuf>,
    pub private_mem_mb: u64,
    pub tick_rate: f64,
    pub distance_max: u32,
    pub debug_level: u8,
    pub telemetry_out: Option<PathBuf>,
    pub call_timeout: Duration,
}

impl SchedulerConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        include: BTreeSet<u32>,
        exclude: BTreeSet<u32>,
        topology_file: Option<PathBuf>,
        private_mem_mb: u64,
        tick_rate: f64,
        distance_max: u32,
        debug_level: u8,
        telemetry_out: Option<PathBuf>,
        call_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if !tick_rate.is_finite() || tick_rate <= 0.0 {
            return Err(ConfigError::BadTickRate(tick_rate));
        }
        if distance_max == 0 {
            return Err(ConfigError::BadDistanceMax(distance_max));
        }
        if include.intersection(&exclude).next().is_some() {
            return Err(ConfigError::OverlappingFilters);
        }
        Ok(Self {
            include,
            exclude,
            topology_file,
            private_mem_mb,
            tick_rate,
            distance_max,
            debug_level,
            telemetry_out,
            call_timeout,
        })
    }
}
