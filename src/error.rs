//! Error types shared by the gateway, the controller, and the pipeline runtime.

use std::io;

use crate::runtime::StageTid;

/// Failure reported by a [`SchedulingGateway`](crate::gateway::SchedulingGateway) call.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The underlying syscall returned an error.
    #[error("{op} failed for tid {tid}: {source}")]
    Os {
        /// Name of the failing operation (`sched_getattr`, `sched_setattr`, ...).
        op: &'static str,
        /// Thread the call targeted.
        tid: StageTid,
        #[source]
        source: io::Error,
    },

    /// Deadline scheduling is not available on this platform.
    #[error("SCHED_DEADLINE is not supported on this platform")]
    Unsupported,

    /// The gateway has never seen this thread (in-memory gateway only).
    #[error("unknown thread {0}")]
    UnknownThread(StageTid),
}

impl GatewayError {
    pub(crate) fn os(op: &'static str, tid: StageTid, source: io::Error) -> Self {
        GatewayError::Os { op, tid, source }
    }

    /// Raw errno of the failing syscall, when there is one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            GatewayError::Os { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// `true` when the process lacks the capability to apply a real-time policy.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            GatewayError::Os { source, .. } => {
                source.kind() == io::ErrorKind::PermissionDenied
                    || matches!(source.raw_os_error(), Some(libc::EPERM) | Some(libc::EACCES))
            }
            GatewayError::Unsupported => true,
            GatewayError::UnknownThread(_) => false,
        }
    }
}

/// Rejected controller or pipeline configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("pipeline needs at least 2 stages, got {0}")]
    TooFewStages(usize),

    #[error("period must be non-zero")]
    ZeroPeriod,

    #[error("tick interval must be non-zero")]
    ZeroTickInterval,

    #[error("runtime fraction must be non-zero")]
    ZeroRuntimeFraction,

    #[error("minimum bandwidth fraction {0} must lie in (0, 0.5)")]
    BandwidthMinOutOfRange(f64),

    #[error("history capacity must be non-zero")]
    ZeroHistoryCapacity,

    #[error("history of {capacity} samples x {width} stages does not fit in memory")]
    HistoryTooLarge { capacity: usize, width: usize },

    #[error("transfer offset rounds to zero (period {period_ns} ns, {stages} stages, fraction {fraction})")]
    ZeroOffset {
        period_ns: u64,
        stages: usize,
        fraction: u64,
    },

    #[error("runtime bounds are empty: min {min_ns} ns >= max {max_ns} ns")]
    EmptyBounds { min_ns: u64, max_ns: u64 },

    #[error("admission limit must lie in (0, 1], got {0}")]
    AdmissionLimitOutOfRange(f64),

    #[error(
        "aggregate deadline utilization {utilization:.3} exceeds admission capacity {capacity:.3}"
    )]
    AggregateUtilization { utilization: f64, capacity: f64 },

    #[error("pipeline needs at least one worker stage")]
    NoWorkers,
}

/// Reasons the controller refuses to start or stops early.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("invalid controller configuration: {0}")]
    Config(#[from] ConfigError),

    /// A stage could not commit its initial deadline policy for lack of privilege.
    #[error("stage {stage} was denied SCHED_DEADLINE: {source}")]
    PolicyDenied {
        stage: usize,
        #[source]
        source: GatewayError,
    },

    /// Bootstrap quotas already exceed the admissible aggregate bandwidth.
    #[error("bootstrap utilization {utilization:.3} exceeds admission capacity {capacity:.3}")]
    AdmissionRisk { utilization: f64, capacity: f64 },

    /// Every bootstrap read failed; there is no bandwidth to reallocate.
    #[error("no stage reported a readable deadline quota")]
    NoSchedulableStage,

    /// The runtime reports a different number of stages than configured.
    #[error("runtime reports {actual} stages, controller configured for {expected}")]
    StageCountMismatch { expected: usize, actual: usize },

    /// The start gate was abandoned before every party arrived.
    #[error("run abandoned before the start gate opened")]
    Abandoned,

    #[error("failed to spawn controller thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("controller thread panicked")]
    Panicked,
}

/// Failures of the bundled pipeline runtime.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid pipeline configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to spawn stage {stage}: {source}")]
    Spawn {
        stage: usize,
        #[source]
        source: io::Error,
    },

    #[error("stage {0} panicked")]
    StagePanicked(usize),

    #[error("pipeline already started")]
    AlreadyStarted,
}
