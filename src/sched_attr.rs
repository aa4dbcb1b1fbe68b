//! Kernel scheduling attributes for deadline-policy threads.
//!
//! Mirrors the layout of `struct sched_attr` from `<linux/sched/types.h>` so the same value can be
//! handed straight to `sched_setattr(2)`. Only `runtime` moves during a run; `period` and
//! `deadline` are fixed and equal for every stage.

use serde::{Deserialize, Serialize};

/// `SCHED_DEADLINE` policy number (not exported by `libc`).
pub const SCHED_DEADLINE: u32 = 6;

/// `SCHED_OTHER` policy number, reported for threads that never switched policy.
pub const SCHED_OTHER: u32 = 0;

/// Scheduling attributes of one thread.
///
/// `#[repr(C)]` keeps the field order of the kernel ABI (`SCHED_ATTR_SIZE_VER0`, 48 bytes, without the
/// utilization clamp extension).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchedAttr {
    pub size: u32,
    pub policy: u32,
    pub flags: u64,
    pub nice: i32,
    pub priority: u32,
    /// CPU-time budget per period, in nanoseconds.
    pub runtime: u64,
    pub deadline: u64,
    pub period: u64,
}

impl SchedAttr {
    /// Size of the structure as passed to the kernel.
    pub const SIZE: u32 = std::mem::size_of::<SchedAttr>() as u32;

    /// Build deadline-policy attributes with `deadline == period`.
    pub fn deadline(runtime: u64, period: u64) -> Self {
        SchedAttr {
            size: Self::SIZE,
            policy: SCHED_DEADLINE,
            flags: 0,
            nice: 0,
            priority: 0,
            runtime,
            deadline: period,
            period,
        }
    }

    /// Equal share of `period` across `stages` threads, the budget every stage starts with.
    pub fn equal_share(period: u64, stages: usize) -> Self {
        Self::deadline(period / stages.max(1) as u64, period)
    }

    /// Same attributes with a different runtime budget.
    pub fn with_runtime(mut self, runtime: u64) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn is_deadline(&self) -> bool {
        self.policy == SCHED_DEADLINE
    }

    /// `0 < runtime < period == deadline` on a deadline-policy attribute set.
    pub fn is_valid(&self) -> bool {
        self.is_deadline()
            && self.runtime > 0
            && self.runtime < self.period
            && self.period == self.deadline
    }

    /// Fraction of one CPU this budget claims.
    pub fn utilization(&self) -> f64 {
        if self.period == 0 {
            0.0
        } else {
            self.runtime as f64 / self.period as f64
        }
    }
}
