//! Runtime `SCHED_DEADLINE` bandwidth rebalancer for linear worker pipelines.
//!
//! Every stage of a [`Pipeline`] runs on its own thread under the deadline policy with a fixed
//! period. The [`BandwidthController`] samples the queues between stages once per tick and moves
//! small slices of runtime from stages that keep up to stages that fall behind.

pub mod clock;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod pipeline;
pub mod policy;
pub mod queue;
pub mod quota;
pub mod recorder;
pub mod runtime;
pub mod sched_attr;
pub mod threading;

pub use config::{BoundCheck, ControllerConfig, HistoryPolicy, PipelineConfig};
pub use context::ControllerContext;
pub use controller::{BandwidthController, ControllerReport, ControllerRun, TickOutcome};
pub use error::{ConfigError, ControllerError, GatewayError, PipelineError};
pub use gateway::{InMemoryGateway, LinuxGateway, SchedulingGateway};
pub use pipeline::Pipeline;
pub use policy::TransferPolicy;
pub use runtime::{PipelineRuntime, StageTid};
pub use sched_attr::SchedAttr;
