//! Controller and pipeline configuration.
//!
//! Both configuration objects carry sensible defaults (the values of the reference experiment:
//! five stages, 1 ms period, 1 ms tick, 1% bandwidth floor, offset fraction 20) and can be loaded
//! from JSON through serde.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;
use crate::gateway::kernel_admission_ratio;
use crate::policy::TransferPolicy;
use crate::quota::Bounds;
use crate::recorder::SampleRecorder;
use crate::threading::online_cpus;

/// Default kernel admission ratio (`sched_rt_runtime_us / sched_rt_period_us` = 950000/1000000).
pub const DEFAULT_ADMISSION_RATIO: f64 = 0.95;

/// CPUs assumed by [`AdmissionConfig::default`]. One CPU at the default ratio cannot hold a full
/// equal split of the period, so the smallest useful root domain is two.
pub const DEFAULT_ADMISSION_CPUS: usize = 2;

/// Whether the transfer bounds are checked against quotas before or after the transfer.
///
/// With [`BoundCheck::PreTransfer`] the donor may end one offset below `runtimeMin` and the
/// receiver one offset above `runtimeMax`. Both stay strictly inside `(0, period)` because the
/// bounds already include one offset of headroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BoundCheck {
    #[default]
    PreTransfer,
    PostTransfer,
}

/// What happens once the sample history is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryPolicy {
    /// Stop recording, keep rebalancing until the stop flag.
    #[default]
    KeepBalancing,
    /// Stop the controller loop altogether.
    StopController,
}

/// Global admission-control parameters used by the startup precondition check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// CPUs in the root domain the stages may run on.
    pub cpu_count: usize,
    /// Fraction of each CPU deadline tasks may reserve.
    pub max_utilization: f64,
}

impl AdmissionConfig {
    /// Read the limits of the running system, falling back to [`DEFAULT_ADMISSION_RATIO`].
    pub fn detect() -> Self {
        Self {
            cpu_count: online_cpus(),
            max_utilization: kernel_admission_ratio().unwrap_or(DEFAULT_ADMISSION_RATIO),
        }
    }

    /// Aggregate bandwidth (in CPUs) the kernel will admit.
    pub fn capacity(&self) -> f64 {
        self.cpu_count as f64 * self.max_utilization
    }
}

/// Fixed, host-independent limits. The binary calls [`AdmissionConfig::detect`] instead unless
/// the configuration file sets them.
impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            cpu_count: DEFAULT_ADMISSION_CPUS,
            max_utilization: DEFAULT_ADMISSION_RATIO,
        }
    }
}

/// Configuration consumed by [`BandwidthController`](crate::controller::BandwidthController).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Stages in the pipeline, source and sink included.
    pub stage_count: usize,
    /// Deadline period (and deadline) of every stage, in nanoseconds.
    pub period_ns: u64,
    /// Interval between controller ticks, in nanoseconds.
    pub tick_interval_ns: u64,
    /// Fraction of the period no stage is driven below.
    pub bandwidth_min: f64,
    /// Divisor applied to the equal share to obtain the per-tick transfer offset.
    pub runtime_fraction: u64,
    /// Samples the history can hold before it is exhausted.
    pub history_capacity: usize,
    pub transfer_policy: TransferPolicy,
    pub bound_check: BoundCheck,
    pub history_policy: HistoryPolicy,
    pub admission: AdmissionConfig,
    /// Tasks the run will push through the pipeline. Informational only.
    pub total_tasks: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            stage_count: 5,
            period_ns: 1_000_000,
            tick_interval_ns: 1_000_000,
            bandwidth_min: 0.01,
            runtime_fraction: 20,
            history_capacity: 20_000,
            transfer_policy: TransferPolicy::default(),
            bound_check: BoundCheck::default(),
            history_policy: HistoryPolicy::default(),
            admission: AdmissionConfig::default(),
            total_tasks: 1000,
        }
    }
}

impl ControllerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_nanos(self.tick_interval_ns)
    }

    /// Quotas tracked by the controller: one per stage that owns an outbound queue.
    pub fn schedulable_stages(&self) -> usize {
        self.stage_count.saturating_sub(1)
    }

    /// Runtime every stage commits at startup (`period / stage_count`).
    pub fn initial_runtime(&self) -> u64 {
        self.period_ns / self.stage_count.max(1) as u64
    }

    /// Transfer offset and runtime bounds derived from this configuration.
    pub fn bounds(&self) -> Bounds {
        Bounds::new(
            self.period_ns,
            self.stage_count,
            self.runtime_fraction,
            self.bandwidth_min,
        )
    }

    /// Size the history to cover `duration` at the configured tick interval.
    pub fn history_for(mut self, duration: Duration) -> Self {
        let ticks = duration.as_nanos() / u128::from(self.tick_interval_ns.max(1));
        self.history_capacity = ticks.clamp(1, usize::MAX as u128) as usize;
        self
    }

    /// Check every static precondition, including the global admission ceiling.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stage_count < 2 {
            return Err(ConfigError::TooFewStages(self.stage_count));
        }
        if self.period_ns == 0 {
            return Err(ConfigError::ZeroPeriod);
        }
        if self.tick_interval_ns == 0 {
            return Err(ConfigError::ZeroTickInterval);
        }
        if self.runtime_fraction == 0 {
            return Err(ConfigError::ZeroRuntimeFraction);
        }
        if !(self.bandwidth_min > 0.0 && self.bandwidth_min < 0.5) {
            return Err(ConfigError::BandwidthMinOutOfRange(self.bandwidth_min));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::ZeroHistoryCapacity);
        }
        if SampleRecorder::footprint(self.schedulable_stages(), self.history_capacity).is_none() {
            return Err(ConfigError::HistoryTooLarge {
                capacity: self.history_capacity,
                width: self.schedulable_stages(),
            });
        }

        let bounds = self.bounds();
        if bounds.offset == 0 {
            return Err(ConfigError::ZeroOffset {
                period_ns: self.period_ns,
                stages: self.stage_count,
                fraction: self.runtime_fraction,
            });
        }
        if bounds.min >= bounds.max {
            return Err(ConfigError::EmptyBounds {
                min_ns: bounds.min,
                max_ns: bounds.max,
            });
        }

        let limit = self.admission.max_utilization;
        if !(limit > 0.0 && limit <= 1.0) {
            return Err(ConfigError::AdmissionLimitOutOfRange(limit));
        }
        // Transfers conserve the sum, so the equal split is the aggregate for the whole run.
        let aggregate =
            self.initial_runtime() as f64 * self.stage_count as f64 / self.period_ns as f64;
        let capacity = self.admission.capacity();
        if aggregate > capacity {
            return Err(ConfigError::AggregateUtilization {
                utilization: aggregate,
                capacity,
            });
        }
        Ok(())
    }
}

/// Shape and cost of the bundled test pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Items emitted by the source.
    pub tasks: u64,
    /// Worker stages between source and sink.
    pub workers: usize,
    /// Busy-wait cost per item on the source.
    #[serde(with = "duration_us")]
    pub source_cost: Duration,
    /// Busy-wait cost per item on the sink.
    #[serde(with = "duration_us")]
    pub sink_cost: Duration,
    /// Worker `i` (1-based) spends `i * stage_cost_step` per item.
    #[serde(with = "duration_us")]
    pub stage_cost_step: Duration,
    /// Capacity of every inter-stage queue; `None` for unbounded queues.
    pub queue_capacity: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tasks: 1000,
            workers: 3,
            source_cost: Duration::from_micros(1),
            sink_cost: Duration::from_micros(1),
            stage_cost_step: Duration::from_micros(2),
            queue_capacity: None,
        }
    }
}

impl PipelineConfig {
    /// Total stages: source, workers, sink.
    pub fn stage_count(&self) -> usize {
        self.workers + 2
    }

    /// Per-item busy-wait of stage `stage`.
    pub fn stage_cost(&self, stage: usize) -> Duration {
        let last = self.stage_count() - 1;
        match stage {
            0 => self.source_cost,
            s if s == last => self.sink_cost,
            s => self.stage_cost_step * s as u32,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        Ok(())
    }
}

/// Serialize a `Duration` as integer microseconds.
mod duration_us {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_micros() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let micros = u64::deserialize(deserializer)?;
        Ok(Duration::from_micros(micros))
    }
}
