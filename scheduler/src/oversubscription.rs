// Oversubscription arithmetic: virtual capacity versus physical capacity.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// An oversubscription ratio, total-ordered so it can key a subset
/// collection. `Ratio(1.0)` means no oversubscription, `Ratio(3.0)` up to
/// three virtual units per physical one. Always strictly positive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ratio(f32);

impl Ratio {
    pub const ONE: Ratio = Ratio(1.0);

    pub fn new(value: f32) -> Option<Self> {
        if value.is_finite() && value > 0.0 {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn value(self) -> f32 {
        self.0
    }
}

impl PartialEq for Ratio {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for Ratio {}

impl PartialOrd for Ratio {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ratio {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for Ratio {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-side contract a subset exposes to its policy. Capacity and
/// allocation are expressed in physical units of the subset's resource
/// (CPUs, MB), allocation ignoring the ratio.
pub trait SubsetAccounting {
    fn capacity(&self) -> u64;
    fn allocation(&self) -> u64;
    fn max_consumer_allocation(&self) -> u64;
}

pub trait OversubscriptionPolicy {
    fn id(&self) -> Ratio;

    /// Virtual units left: `capacity * ratio - allocation`.
    fn available(&self, subset: &dyn SubsetAccounting) -> f64;

    /// Physical units that could be released without breaking any consumer.
    fn unused_resources(&self, subset: &dyn SubsetAccounting) -> u64;

    /// Physical units to add before `request` more virtual units fit.
    fn additional_needed(&self, subset: &dyn SubsetAccounting, request: u64) -> u64;
}

/// Fixed-ratio policy; the only strategy the scheduler currently carries.
#[derive(Debug, Clone)]
pub struct StaticRatio {
    ratio: Ratio,
}

impl StaticRatio {
    pub fn new(ratio: Ratio) -> Self {
        Self { ratio }
    }
}

impl OversubscriptionPolicy for StaticRatio {
    fn id(&self) -> Ratio {
        self.ratio
    }

    fn available(&self, subset: &dyn SubsetAccounting) -> f64 {
        subset.capacity() as f64 * self.ratio.value() as f64 - subset.allocation() as f64
    }

    fn unused_resources(&self, subset: &dyn SubsetAccounting) -> u64 {
        let available = self.available(subset).max(0.0);
        let unused = (available / self.ratio.value() as f64).floor() as u64;
        let capacity = subset.capacity();
        let used = capacity.saturating_sub(unused);
        let max_alloc = subset.max_consumer_allocation();
        if used < max_alloc {
            // Do not let the shrink drop capacity below the largest single
            // consumer: a VM must never be oversubscribed with itself.
            return capacity.saturating_sub(max_alloc);
        }
        unused
    }

    fn additional_needed(&self, subset: &dyn SubsetAccounting, request: u64) -> u64 {
        let capacity = subset.capacity();
        if capacity < request {
            return request - capacity;
        }
        let missing = request as f64 - self.available(subset);
        if missing > 0.0 {
            (missing / self.ratio.value() as f64).ceil() as u64
        } else {
            0
        }
    }
}

impl fmt::Display for StaticRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "static oc:{}", self.ratio)
    }
}
