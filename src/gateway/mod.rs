//! Narrow seam over the scheduler-attribute syscalls.
//!
//! The controller talks to the kernel only through [`SchedulingGateway`], which lets the whole
//! feedback loop run against [`InMemoryGateway`] in tests and dry runs, and against
//! [`LinuxGateway`] in production.

mod linux;
mod memory;

pub use linux::{kernel_admission_ratio, LinuxGateway};
pub use memory::{GatewayCall, InMemoryGateway};

use std::sync::Arc;

use crate::error::GatewayError;
use crate::runtime::StageTid;
use crate::sched_attr::SchedAttr;

/// Get/set access to a thread's scheduling attributes.
///
/// Implementations own no controller state; each call maps to one kernel operation.
pub trait SchedulingGateway: Send + Sync {
    /// Read the current attributes of `tid`.
    fn get_attributes(&self, tid: StageTid) -> Result<SchedAttr, GatewayError>;

    /// Commit `attr` on `tid`.
    ///
    /// When `set_affinity` is `true` the thread's CPU mask is widened to all online CPUs before the
    /// policy is applied. A thread's first-ever deadline commit must pass `true`.
    fn set_attributes(
        &self,
        tid: StageTid,
        attr: &SchedAttr,
        set_affinity: bool,
    ) -> Result<(), GatewayError>;
}

impl<T: SchedulingGateway + ?Sized> SchedulingGateway for Arc<T> {
    fn get_attributes(&self, tid: StageTid) -> Result<SchedAttr, GatewayError> {
        (**self).get_attributes(tid)
    }

    fn set_attributes(
        &self,
        tid: StageTid,
        attr: &SchedAttr,
        set_affinity: bool,
    ) -> Result<(), GatewayError> {
        (**self).set_attributes(tid, attr, set_affinity)
    }
}
