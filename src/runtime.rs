//! Interface the controller consumes from the pipeline runtime.
//!
//! The controller never creates or destroys stages; it only needs each stage's OS thread id and
//! a cheap, approximate reading of the stage's outbound queue length.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Kernel thread id of a stage (`gettid()`), as accepted by `sched_setattr(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageTid(pub i32);

impl StageTid {
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for StageTid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A running linear pipeline as seen by the bandwidth controller.
///
/// Stages are indexed `0..stage_count()` in pipeline order. Stage `i < stage_count() - 1` owns
/// exactly one outbound queue feeding stage `i + 1`; the terminal stage owns none.
pub trait PipelineRuntime: Send + Sync {
    /// Total number of stages, source and sink included.
    fn stage_count(&self) -> usize;

    /// OS thread id of stage `stage`, or `None` before the stage thread has started.
    fn stage_thread_id(&self, stage: usize) -> Option<StageTid>;

    /// Items buffered between `stage` and `stage + 1`.
    ///
    /// Returns `None` when the queue handle is unavailable (terminal stage, index out of range, or
    /// pipeline torn down). Callers must treat `None` as "no sample".
    fn outbound_queue_len(&self, stage: usize) -> Option<usize>;
}

impl<T: PipelineRuntime + ?Sized> PipelineRuntime for Arc<T> {
    fn stage_count(&self) -> usize {
        (**self).stage_count()
    }

    fn stage_thread_id(&self, stage: usize) -> Option<StageTid> {
        (**self).stage_thread_id(stage)
    }

    fn outbound_queue_len(&self, stage: usize) -> Option<usize> {
        (**self).outbound_queue_len(stage)
    }
}
