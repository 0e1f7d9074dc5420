// Subset admission, identity matching and side effects.

use std::collections::BTreeSet;

use crate::domain::Vm;
use crate::oversubscription::SubsetAccounting;
use crate::subset::{CpuSubset, MemSubset, PlacementError};

use super::support;

fn cpu_subset(r: f32, cpu_ids: &[u32]) -> (std::sync::Arc<crate::hypervisor::InMemoryHypervisor>, CpuSubset) {
    let hv = support::hypervisor();
    let cpuset = support::canonical_cpuset();
    let mut subset = CpuSubset::new(
        support::ratio(r),
        hv.clone(),
        support::offline_cpu_explorer(),
        support::endpoint_pool(),
    );
    for id in cpu_ids {
        let cpu = cpuset.cpu(*id).expect("cpu").clone();
        subset.add_res(cpu).expect("add res");
    }
    (hv, subset)
}

#[test]
fn deploy_admits_within_virtual_availability() {
    let (_hv, mut subset) = cpu_subset(2.0, &[6, 7]);
    let first = support::vm("vm-a", 2, 512, 2.0);
    let second = support::vm("vm-b", 2, 512, 2.0);
    subset.deploy(&first).expect("fits in 2*2 virtual units");
    subset.deploy(&second).expect("fills the virtual capacity");
    assert_eq!(subset.allocation(), 4);
    assert!(subset.available().abs() < 1e-9);
    let third = support::vm("vm-c", 1, 512, 2.0);
    assert!(subset.deploy(&third).is_err());
}

#[test]
fn deploy_refuses_without_state_change() {
    let (_hv, mut subset) = cpu_subset(1.0, &[7]);
    let vm = support::vm("vm-big", 2, 512, 1.0);
    match subset.deploy(&vm) {
        Err(PlacementError::NotEnoughSpace { res: "cpu", requested: 2 }) => {}
        other => panic!("expected refusal, got {:?}", other),
    }
    assert_eq!(subset.count_consumers(), 0);
    assert_eq!(subset.allocation(), 0);
}

#[test]
fn resources_cannot_be_attributed_twice() {
    let (_hv, mut subset) = cpu_subset(1.0, &[6, 7]);
    let duplicate = support::canonical_cpuset().cpu(7).expect("cpu").clone();
    assert!(matches!(
        subset.add_res(duplicate),
        Err(PlacementError::DuplicateResource("cpu"))
    ));
}

#[test]
fn a_consumer_cannot_be_deployed_twice() {
    let (_hv, mut subset) = cpu_subset(2.0, &[6, 7]);
    let vm = support::vm("vm-a", 1, 512, 2.0);
    subset.deploy(&vm).expect("first deploy");
    assert!(matches!(
        subset.deploy(&vm),
        Err(PlacementError::AlreadyPlaced(_))
    ));
    assert_eq!(subset.count_consumers(), 1);
}

#[test]
fn identity_matches_by_uuid_then_name() {
    let (_hv, mut subset) = cpu_subset(2.0, &[6, 7]);
    let vm = support::vm("vm-a", 1, 512, 2.0);
    vm.lock().set_uuid("uuid-1".to_string());
    subset.deploy(&vm).expect("deploy");

    // Same UUID, different name: still the same VM.
    let mut renamed = Vm::new("vm-renamed", 1, 512, support::ratio(2.0)).expect("vm");
    renamed.set_uuid("uuid-1".to_string());
    assert!(subset.has_vm(&renamed));

    // Different UUID, same name: a different VM.
    let mut impostor = Vm::new("vm-a", 1, 512, support::ratio(2.0)).expect("vm");
    impostor.set_uuid("uuid-2".to_string());
    assert!(!subset.has_vm(&impostor));

    // No UUID on the probe side: fall back to the name.
    let by_name = Vm::new("vm-a", 1, 512, support::ratio(2.0)).expect("vm");
    assert!(subset.has_vm(&by_name));
    assert!(subset.vm_by_name("vm-a").is_some());
    assert!(subset.vm_by_name("vm-z").is_none());
}

#[test]
fn deploy_pins_alive_consumers_to_the_subset_cpus() {
    let hv = support::hypervisor();
    let cpuset = support::canonical_cpuset();
    let mut subset = CpuSubset::new(
        support::ratio(1.0),
        hv.clone(),
        support::offline_cpu_explorer(),
        support::endpoint_pool(),
    );
    for id in [6, 7] {
        subset
            .add_res(cpuset.cpu(id).expect("cpu").clone())
            .expect("add res");
    }
    let handle = hv
        .boot("vm-alive", 2, 512, Some(support::ratio(1.0)))
        .expect("boot");
    subset.deploy(&handle).expect("deploy");
    let uuid = handle.lock().uuid().cloned().expect("uuid");
    assert_eq!(hv.pinning_of(&uuid), Some(BTreeSet::from([6, 7])));
    assert_eq!(
        handle.lock().cpu_pin().cloned(),
        Some(BTreeSet::from([6, 7]))
    );
    // Membership changes restart the usage sampling window.
    assert!(subset.res().iter().all(|cpu| cpu.time_sample.is_none()));
}

#[test]
fn monitoring_drops_consumers_the_hypervisor_lost() {
    let hv = support::hypervisor();
    let cpuset = support::canonical_cpuset();
    let mut subset = CpuSubset::new(
        support::ratio(1.0),
        hv.clone(),
        support::offline_cpu_explorer(),
        support::endpoint_pool(),
    );
    subset
        .add_res(cpuset.cpu(7).expect("cpu").clone())
        .expect("add res");
    let handle = hv
        .boot("vm-doomed", 1, 256, Some(support::ratio(1.0)))
        .expect("boot");
    subset.deploy(&handle).expect("deploy");
    assert!(!subset.update_monitoring(0));
    let uuid = handle.lock().uuid().cloned().expect("uuid");
    hv.kill(&uuid);
    // A stale timestamp is discarded, the departure goes unnoticed.
    assert!(!subset.update_monitoring(0));
    assert_eq!(subset.count_consumers(), 1);
    // The next fresh sample reports the VM gone and asks for a shrink.
    assert!(subset.update_monitoring(1));
    assert_eq!(subset.count_consumers(), 0);
}

#[test]
fn mem_subset_capacity_sums_disjoint_ranges() {
    let hv = support::hypervisor();
    let mut subset = MemSubset::new(
        support::ratio(1.0),
        hv,
        support::offline_mem_explorer(),
        support::endpoint_pool(),
    );
    subset.add_res((0, 512)).expect("first range");
    subset.add_res((1024, 1536)).expect("second range");
    assert_eq!(subset.capacity(), 1024);
    assert!(matches!(
        subset.add_res((0, 512)),
        Err(PlacementError::DuplicateResource("mem"))
    ));
    assert!(subset.remove_res((1024, 1536)));
    assert!(!subset.remove_res((1024, 1536)));
    assert_eq!(subset.capacity(), 512);
}
