// Pool-level atomicity: all resources or none, reconciliation, destruction.

use std::collections::BTreeSet;

use crate::domain::VmId;
use crate::subset::manager::SubsetManager;
use crate::subset::pool::PoolError;

use super::support;

#[test]
fn deploy_creates_the_domain_and_pins_it() {
    let hv = support::hypervisor();
    let mut pool = support::pool(hv.clone(), 4096);
    let vm = support::vm("vm-a", 2, 512, 1.0);
    pool.deploy(&vm).expect("deploy");

    let guard = vm.lock();
    assert!(guard.is_deployed());
    let uuid = guard.uuid().cloned().expect("uuid assigned");
    drop(guard);

    assert_eq!(hv.alive_count(), 1);
    assert_eq!(hv.pinning_of(&uuid), Some(BTreeSet::from([6, 7])));
    let probe = vm.lock().clone();
    assert!(pool.has_vm(&probe).expect("consistent"));
}

#[test]
fn a_second_deploy_is_refused_with_a_reason() {
    let hv = support::hypervisor();
    let mut pool = support::pool(hv.clone(), 4096);
    let vm = support::vm("vm-a", 2, 512, 1.0);
    pool.deploy(&vm).expect("first deploy");
    match pool.deploy(&vm) {
        Err(PoolError::AlreadyPlaced(name)) => assert_eq!(name, "vm-a"),
        other => panic!("expected refusal, got {:?}", other.map(|_| ())),
    }
    assert_eq!(hv.alive_count(), 1);
}

#[test]
fn a_failing_resource_rolls_back_the_others() {
    let hv = support::hypervisor();
    // Memory pool too small: the CPU manager accepts, memory refuses.
    let mut pool = support::pool(hv.clone(), 1024);
    let vm = support::vm("vm-big", 2, 2048, 1.0);
    match pool.deploy(&vm) {
        Err(PoolError::Placement { res: "mem", .. }) => {}
        other => panic!("expected mem refusal, got {:?}", other.map(|_| ())),
    }
    let probe = vm.lock().clone();
    assert!(!pool.has_vm(&probe).expect("consistent"));
    assert_eq!(hv.alive_count(), 0);

    // The rolled-back CPUs are free again: the next VM gets the same seed.
    let next = support::vm("vm-next", 2, 512, 1.0);
    pool.deploy(&next).expect("deploy after rollback");
    let uuid = next.lock().uuid().cloned().expect("uuid");
    assert_eq!(hv.pinning_of(&uuid), Some(BTreeSet::from([6, 7])));
}

#[test]
fn a_failing_create_rolls_back_every_manager() {
    let hv = support::hypervisor();
    let mut pool = support::pool(hv.clone(), 4096);
    hv.fail_next_create(true);
    let vm = support::vm("vm-a", 2, 512, 1.0);
    assert!(matches!(pool.deploy(&vm), Err(PoolError::Hypervisor(_))));
    let probe = vm.lock().clone();
    assert!(!probe.is_deployed());
    assert!(!pool.has_vm(&probe).expect("consistent"));

    // Transient failure: the same request goes through afterwards.
    pool.deploy(&vm).expect("deploy after transient failure");
}

#[test]
fn reconcile_absorbs_out_of_band_domains() {
    let hv = support::hypervisor();
    let mut pool = support::pool(hv.clone(), 4096);
    let ghost = hv.boot("vm-ghost", 1, 128, None).expect("boot");
    pool.iterate(0).expect("tick");
    let probe = ghost.lock().clone();
    assert!(pool.has_vm(&probe).expect("consistent"));
    assert_eq!(hv.alive_count(), 1);
}

#[test]
fn monitoring_releases_domains_destroyed_out_of_band() {
    let hv = support::hypervisor();
    let mut pool = support::pool(hv.clone(), 4096);
    let vm = support::vm("vm-a", 2, 512, 1.0);
    pool.deploy(&vm).expect("deploy");
    pool.iterate(0).expect("tick");

    let uuid = vm.lock().uuid().cloned().expect("uuid");
    hv.kill(&uuid);
    pool.iterate(1).expect("tick");

    let probe = vm.lock().clone();
    assert!(!pool.has_vm(&probe).expect("consistent"));
    // The freed subset was shrunk away: a new VM seeds from scratch.
    let next = support::vm("vm-next", 2, 512, 1.0);
    pool.deploy(&next).expect("deploy");
    let next_uuid = next.lock().uuid().cloned().expect("uuid");
    assert_eq!(hv.pinning_of(&next_uuid), Some(BTreeSet::from([6, 7])));
}

#[test]
fn remove_deletes_the_domain() {
    let hv = support::hypervisor();
    let mut pool = support::pool(hv.clone(), 4096);
    let vm = support::vm("vm-a", 2, 512, 1.0);
    pool.deploy(&vm).expect("deploy");
    pool.remove(&VmId::ByName("vm-a".to_string()))
        .expect("remove");
    assert_eq!(hv.alive_count(), 0);
    let probe = vm.lock().clone();
    assert!(!pool.has_vm(&probe).expect("consistent"));
    assert!(matches!(
        pool.remove(&VmId::ByName("vm-a".to_string())),
        Err(PoolError::UnknownVm(_))
    ));
}

#[test]
fn a_failed_delete_is_retried_on_the_next_tick() {
    let hv = support::hypervisor();
    let mut pool = support::pool(hv.clone(), 4096);
    let vm = support::vm("vm-a", 2, 512, 1.0);
    pool.deploy(&vm).expect("deploy");

    hv.fail_delete(true);
    assert!(matches!(
        pool.remove(&VmId::ByName("vm-a".to_string())),
        Err(PoolError::Hypervisor(_))
    ));
    // The managers no longer track the VM, the domain still exists, and the
    // destroy flag marks the window.
    assert_eq!(hv.alive_count(), 1);
    assert!(vm.lock().is_being_destroyed());

    hv.fail_delete(false);
    pool.iterate(0).expect("tick");
    assert_eq!(hv.alive_count(), 0);
}

#[test]
fn unequal_presence_is_a_hard_error() {
    let hv = support::hypervisor();
    let mut pool = support::pool(hv.clone(), 4096);
    let vm = support::vm("vm-a", 2, 512, 1.0);
    pool.deploy(&vm).expect("deploy");

    // Drop the VM from the CPU manager only: the pool must refuse to look
    // the other way.
    let probe = vm.lock().clone();
    assert!(pool.managers_mut()[0].remove(&probe));
    assert!(matches!(
        pool.has_vm(&probe),
        Err(PoolError::Inconsistency(_))
    ));
}

#[test]
fn lookup_by_name_finds_the_shared_entity() {
    let hv = support::hypervisor();
    let mut pool = support::pool(hv.clone(), 4096);
    let vm = support::vm("vm-a", 2, 512, 1.0);
    pool.deploy(&vm).expect("deploy");
    let found = pool
        .vm_by_name("vm-a")
        .expect("consistent")
        .expect("present");
    assert!(std::sync::Arc::ptr_eq(&found, &vm));
    assert!(pool.vm_by_name("vm-z").expect("consistent").is_none());
}
