//! Runtime quotas of the schedulable stages and the bounds transfers must respect.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::BoundCheck;

/// Transfer step and runtime bounds for one run.
///
/// All values are in nanoseconds:
/// - `offset = period / stages / fraction`
/// - `min = period * bandwidth_min + offset`
/// - `max = period * (1 - bandwidth_min) - offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    /// Runtime moved from donor to receiver by one transfer.
    pub offset: u64,
    pub min: u64,
    pub max: u64,
    pub period: u64,
}

impl Bounds {
    pub fn new(period: u64, stages: usize, fraction: u64, bandwidth_min: f64) -> Self {
        let offset = period / stages.max(1) as u64 / fraction.max(1);
        let floor = (period as f64 * bandwidth_min).round() as u64;
        let ceiling = (period as f64 * (1.0 - bandwidth_min)).round() as u64;
        Bounds {
            offset,
            min: floor.saturating_add(offset),
            max: ceiling.saturating_sub(offset),
            period,
        }
    }

    /// `true` if moving `offset` from `donor` to `receiver` is allowed under `check`.
    ///
    /// Whatever the check, the committed values must stay inside `(0, period)`.
    pub fn permits(&self, check: BoundCheck, donor: u64, receiver: u64) -> bool {
        let Some(donor_after) = donor.checked_sub(self.offset) else {
            return false;
        };
        let receiver_after = receiver.saturating_add(self.offset);
        if donor_after == 0 || receiver_after >= self.period {
            return false;
        }
        match check {
            BoundCheck::PreTransfer => donor >= self.min && receiver <= self.max,
            BoundCheck::PostTransfer => donor_after >= self.min && receiver_after <= self.max,
        }
    }

    pub fn contains(&self, runtime: u64) -> bool {
        (self.min..=self.max).contains(&runtime)
    }
}

const UNKNOWN: u64 = u64::MAX;

/// Last-known runtime of every stage that owns an outbound queue.
///
/// Slots start out unknown and are seeded from each stage's live attributes. The controller
/// thread is the only writer; other threads may read a snapshot at any time.
#[derive(Debug)]
pub struct QuotaTable {
    slots: Vec<AtomicU64>,
}

impl QuotaTable {
    /// Table of `len` unknown quotas.
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| AtomicU64::new(UNKNOWN)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Quota of `stage`, or `None` when it is unknown or out of range.
    pub fn get(&self, stage: usize) -> Option<u64> {
        match self.slots.get(stage)?.load(Ordering::Acquire) {
            UNKNOWN => None,
            runtime => Some(runtime),
        }
    }

    pub fn is_known(&self, stage: usize) -> bool {
        self.get(stage).is_some()
    }

    pub(crate) fn set(&self, stage: usize, runtime: u64) {
        debug_assert_ne!(runtime, UNKNOWN);
        if let Some(slot) = self.slots.get(stage) {
            slot.store(runtime, Ordering::Release);
        }
    }

    pub(crate) fn mark_unknown(&self, stage: usize) {
        if let Some(slot) = self.slots.get(stage) {
            slot.store(UNKNOWN, Ordering::Release);
        }
    }

    pub fn snapshot(&self) -> Vec<Option<u64>> {
        (0..self.len()).map(|stage| self.get(stage)).collect()
    }

    /// Copy the table into `out`, writing `0` for unknown slots. Does not allocate.
    pub fn copy_into(&self, out: &mut [u64]) {
        for (stage, value) in out.iter_mut().enumerate() {
            *value = self.get(stage).unwrap_or(0);
        }
    }

    /// Sum of every known quota.
    pub fn known_total(&self) -> u64 {
        (0..self.len()).filter_map(|stage| self.get(stage)).sum()
    }

    pub fn unknown_count(&self) -> usize {
        (0..self.len()).filter(|&stage| !self.is_known(stage)).count()
    }
}
