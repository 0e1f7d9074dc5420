// Telemetry pool: live loads, best-effort JSON store.

use std::fs;

use crate::endpoint::{EndpointPool, JsonLinesStore};
use crate::subset::CpuSubset;

use super::support;

#[test]
fn subset_loads_are_stored_as_json_lines() {
    let dir = support::scratch_dir("telemetry");
    let path = dir.join("records.jsonl");
    let store = JsonLinesStore::create(&path).expect("store");
    let pool = std::sync::Arc::new(EndpointPool::live(Some(Box::new(store))));

    let hv = support::hypervisor();
    let cpuset = support::canonical_cpuset();
    let mut subset = CpuSubset::new(support::ratio(3.0), hv.clone(), support::offline_cpu_explorer(), pool.clone());
    for id in [6, 7] {
        subset
            .add_res(cpuset.cpu(id).expect("cpu").clone())
            .expect("add res");
    }
    let vm = hv
        .boot("vm-a", 2, 512, Some(support::ratio(3.0)))
        .expect("boot");
    let uuid = vm.lock().uuid().cloned().expect("uuid");
    hv.set_usage(&uuid, 0.25, 0.5);
    subset.deploy(&vm).expect("deploy");

    let sample = pool.load_subset(1, &mut subset);
    assert!(sample.vm_usage.contains_key(&uuid));
    let (_, cpu_usage) = &sample.vm_usage[&uuid];
    assert!((cpu_usage - 0.25).abs() < 1e-9);

    let text = fs::read_to_string(&path).expect("records file");
    let line = text.lines().last().expect("one record");
    let record: serde_json::Value = serde_json::from_str(line).expect("valid json");
    assert_eq!(record["timestamp"], 1);
    assert_eq!(record["resource"], "cpu");
    assert_eq!(record["scope"], "subset:3");
    assert_eq!(record["capacity"], 2);
    assert_eq!(record["allocation"], 2);
    assert!((record["consumers"][&uuid].as_f64().expect("usage") - 0.25).abs() < 1e-9);
}

#[test]
fn a_missing_sink_never_breaks_monitoring() {
    let pool = std::sync::Arc::new(EndpointPool::live(None));
    let hv = support::hypervisor();
    let cpuset = support::canonical_cpuset();
    let mut subset = CpuSubset::new(support::ratio(1.0), hv, support::offline_cpu_explorer(), pool.clone());
    subset
        .add_res(cpuset.cpu(7).expect("cpu").clone())
        .expect("add res");
    let sample = pool.load_subset(0, &mut subset);
    assert!(sample.vm_usage.is_empty());
    assert!(sample.resource_usage.is_none());
}
