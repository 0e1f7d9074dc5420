// vmsched: local host scheduler for oversubscribed virtual machines.
//
// Discovers the host CPU/memory topology, partitions physical resources into
// per-ratio subsets and keeps placement, pinning and capacity in sync with
// the hypervisor on a fixed tick.

mod config;
mod domain;
mod endpoint;
mod hypervisor;
mod logging;
mod oversubscription;
mod scheduler;
mod subset;
mod topology;

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::error::Error;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::config::{ConfigError, SchedulerConfig};
use crate::endpoint::{EndpointPool, EndpointStore, JsonLinesStore};
use crate::hypervisor::{InMemoryHypervisor, DEFAULT_CALL_TIMEOUT};
use crate::scheduler::Scheduler;
use crate::subset::pool::SubsetManagerPool;
use crate::topology::{parse_id_list, CpuExplorer, MemoryExplorer, TopologySnapshot};

const SNAPSHOT_DUMP_PATH: &str = "topology_snapshot.json";

#[derive(Parser, Debug)]
#[command(name = "vmsched", about = "Local host scheduler for oversubscribed virtual machines")]
struct Args {
    /// Only manage these CPU ids (`a,b,c` and inclusive `a-b` ranges)
    #[arg(long)]
    include: Option<String>,

    /// Keep these CPU ids out of scheduling
    #[arg(long)]
    exclude: Option<String>,

    /// Load the host topology from a snapshot instead of live discovery
    #[arg(long)]
    topology_file: Option<PathBuf>,

    /// Host memory reserved for non-VM usage, in MB
    #[arg(long, default_value_t = 0)]
    private_mem_mb: u64,

    /// Scheduler iterations per second
    #[arg(long, default_value_t = 2.0)]
    tick_rate: f64,

    /// Highest CPU distance tolerated inside a single subset
    #[arg(long, default_value_t = 50)]
    distance_max: u32,

    /// 0 = info, 1 = debug, 2 = trace
    #[arg(long, default_value_t = 0)]
    debug_level: u8,

    /// Append telemetry records to this file, one JSON object per line
    #[arg(long)]
    telemetry_out: Option<PathBuf>,

    /// Upper bound, in seconds, on a single hypervisor or telemetry call
    #[arg(long, default_value_t = DEFAULT_CALL_TIMEOUT.as_secs())]
    call_timeout_secs: u64,
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signum: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn cpu_filter(which: &'static str, text: &Option<String>) -> Result<BTreeSet<u32>, ConfigError> {
    match text {
        None => Ok(BTreeSet::new()),
        Some(text) => parse_id_list(text)
            .map(|ids| ids.into_iter().collect())
            .map_err(|part| ConfigError::BadCpuList(which, part)),
    }
}

fn build_config(args: &Args) -> Result<SchedulerConfig, ConfigError> {
    SchedulerConfig::new(
        cpu_filter("include", &args.include)?,
        cpu_filter("exclude", &args.exclude)?,
        args.topology_file.clone(),
        args.private_mem_mb,
        args.tick_rate,
        args.distance_max,
        args.debug_level,
        args.telemetry_out.clone(),
        Duration::from_secs(args.call_timeout_secs),
    )
}

fn run(config: SchedulerConfig) -> Result<(), Box<dyn Error>> {
    install_signal_handlers();

    let cpu_explorer = CpuExplorer::new(config.include.clone(), config.exclude.clone());
    let mem_explorer = MemoryExplorer::new(config.private_mem_mb);

    let (cpuset, memset) = match &config.topology_file {
        Some(path) => {
            let snapshot = TopologySnapshot::load(path)?;
            log::info!("topology loaded from snapshot {}", path.display());
            (snapshot.cpuset, snapshot.memset)
        }
        None => {
            let cpuset = cpu_explorer.build_cpuset()?;
            let memset = mem_explorer.build_memset()?;
            if config.debug_level > 0 {
                let snapshot = TopologySnapshot {
                    cpuset: cpuset.clone(),
                    memset: memset.clone(),
                };
                snapshot.dump(std::path::Path::new(SNAPSHOT_DUMP_PATH))?;
                log::debug!("topology snapshot dumped to {}", SNAPSHOT_DUMP_PATH);
            }
            (cpuset, memset)
        }
    };
    log::info!(
        "host model: {} CPUs, {}MB memory of which {}MB allowed",
        cpuset.host_count(),
        memset.total_mb(),
        memset.allowed_mb()
    );
    log::debug!("numa distance table: {:?}", cpuset.numa_distances());

    let saver: Option<Box<dyn EndpointStore>> = match &config.telemetry_out {
        Some(path) => {
            let store = JsonLinesStore::create(path)?;
            log::info!("telemetry records go to {}", store.path().display());
            Some(Box::new(store))
        }
        None => None,
    };
    let endpoint_pool = Arc::new(EndpointPool::live(saver));

    let connector = Arc::new(InMemoryHypervisor::new(config.call_timeout));
    log::debug!("hypervisor call timeout: {:?}", connector.call_timeout());
    let pool = SubsetManagerPool::new(
        connector,
        endpoint_pool,
        Arc::new(cpuset),
        memset,
        cpu_explorer,
        mem_explorer,
        config.distance_max,
    );

    let mut scheduler = Scheduler::new(pool, config.tick_rate);
    log::info!(
        "scheduler running, one tick every {:?}",
        scheduler.period()
    );
    scheduler.run(&STOP)?;
    Ok(())
}

fn main() {
    let args = Args::parse();
    let config = match build_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {}", err);
            process::exit(2);
        }
    };
    logging::init(config.debug_level);
    if let Err(err) = run(config) {
        log::error!("fatal: {}", err);
        process::exit(1);
    }
}
