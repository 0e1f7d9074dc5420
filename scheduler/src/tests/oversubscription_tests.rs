// Policy arithmetic: available, unused, additional-needed.

use crate::oversubscription::{OversubscriptionPolicy, Ratio, StaticRatio, SubsetAccounting};

use super::support;

struct Accounting {
    capacity: u64,
    allocation: u64,
    max_allocation: u64,
}

impl SubsetAccounting for Accounting {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn allocation(&self) -> u64 {
        self.allocation
    }

    fn max_consumer_allocation(&self) -> u64 {
        self.max_allocation
    }
}

fn policy(r: f32) -> StaticRatio {
    StaticRatio::new(support::ratio(r))
}

#[test]
fn ratio_orders_and_compares_totally() {
    assert!(Ratio::new(0.0).is_none());
    assert!(Ratio::new(-1.0).is_none());
    assert!(Ratio::new(f32::NAN).is_none());
    assert!(support::ratio(1.0) < support::ratio(3.0));
    assert_eq!(support::ratio(1.0), Ratio::ONE);
}

#[test]
fn available_is_virtual_capacity_minus_allocation() {
    let policy = policy(3.0);
    let subset = Accounting { capacity: 4, allocation: 6, max_allocation: 4 };
    assert!((policy.available(&subset) - 6.0).abs() < 1e-9);
    let empty = Accounting { capacity: 2, allocation: 0, max_allocation: 0 };
    assert!((policy.available(&empty) - 6.0).abs() < 1e-9);
}

#[test]
fn additional_needed_covers_the_raw_request_first() {
    let policy = policy(3.0);
    // Capacity below the request: force physical coverage of the VM.
    let small = Accounting { capacity: 2, allocation: 2, max_allocation: 2 };
    assert_eq!(policy.additional_needed(&small, 4), 2);
    // Fits in the virtual slack: nothing to add.
    assert_eq!(policy.additional_needed(&small, 2), 0);
    // Virtual slack short by 2: one more physical unit at ratio 3.
    let tight = Accounting { capacity: 2, allocation: 6, max_allocation: 2 };
    assert_eq!(policy.additional_needed(&tight, 2), 1);
}

#[test]
fn unused_resources_generic_case() {
    let policy = policy(1.0);
    let subset = Accounting { capacity: 4, allocation: 2, max_allocation: 2 };
    assert_eq!(policy.unused_resources(&subset), 2);
    let idle = Accounting { capacity: 2, allocation: 0, max_allocation: 0 };
    assert_eq!(policy.unused_resources(&idle), 2);
}

#[test]
fn unused_resources_clamps_to_the_largest_consumer() {
    // Capacity 4 at ratio 3 with allocations {4, 2}: the floor would free 2
    // CPUs, but that would drop capacity below the 4-wide consumer.
    let policy = policy(3.0);
    let subset = Accounting { capacity: 4, allocation: 6, max_allocation: 4 };
    assert_eq!(policy.unused_resources(&subset), 0);
    // Same shape with a smaller top consumer frees the difference.
    let subset = Accounting { capacity: 4, allocation: 6, max_allocation: 2 };
    assert_eq!(policy.unused_resources(&subset), 2);
}
