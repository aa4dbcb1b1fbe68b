//! Runs the test pipeline under `SCHED_DEADLINE` with the bandwidth controller attached.
//!
//! The controller's sample history is written as CSV, the run report is printed to stdout as
//! JSON, and the wall time of the run can be appended to a times file for batch comparisons.

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use deadline_rebalancer::config::{
    AdmissionConfig, BoundCheck, ControllerConfig, HistoryPolicy, PipelineConfig,
};
use deadline_rebalancer::gateway::{InMemoryGateway, LinuxGateway, SchedulingGateway};
use deadline_rebalancer::logging::{self, Verbosity};
use deadline_rebalancer::{BandwidthController, Pipeline, TransferPolicy};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    TowardMinDelta,
    TowardMaxDelta,
    RotatingDonor,
}

impl From<PolicyArg> for TransferPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::TowardMinDelta => TransferPolicy::TowardMinDelta,
            PolicyArg::TowardMaxDelta => TransferPolicy::TowardMaxDelta,
            PolicyArg::RotatingDonor => TransferPolicy::RotatingDonor,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BoundCheckArg {
    Pre,
    Post,
}

impl From<BoundCheckArg> for BoundCheck {
    fn from(arg: BoundCheckArg) -> Self {
        match arg {
            BoundCheckArg::Pre => BoundCheck::PreTransfer,
            BoundCheckArg::Post => BoundCheck::PostTransfer,
        }
    }
}

/// Rebalance SCHED_DEADLINE runtime across the stages of a test pipeline.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Items the source emits.
    tasks: Option<u64>,
    /// Worker stages between source and sink.
    nodes: Option<usize>,
    /// Deadline period (and deadline) of every stage, in nanoseconds.
    period_ns: Option<u64>,

    /// JSON file with `controller` and `pipeline` sections; flags override it.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Controller tick interval in nanoseconds.
    #[arg(long)]
    tick_ns: Option<u64>,

    /// Fraction of the period no stage is driven below.
    #[arg(long)]
    bw_min: Option<f64>,

    /// Divisor of the equal share giving the per-tick transfer.
    #[arg(long)]
    fraction: Option<u64>,

    /// Seconds of history to pre-allocate.
    #[arg(long)]
    history_secs: Option<u64>,

    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,

    /// Check transfer bounds before or after the move.
    #[arg(long, value_enum)]
    bound_check: Option<BoundCheckArg>,

    /// Stop the controller once the history is full instead of balancing unrecorded.
    #[arg(long)]
    stop_on_full_history: bool,

    /// Capacity of every inter-stage queue (unbounded when omitted).
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Where to write the sample history.
    #[arg(long, value_name = "FILE", default_value = "samples.csv")]
    csv: PathBuf,

    /// Append `tasks,nodes,seconds` to this file after the run.
    #[arg(long, value_name = "FILE")]
    times: Option<PathBuf>,

    /// Use an in-memory scheduler instead of the kernel (no privileges needed).
    #[arg(long)]
    dry_run: bool,

    /// More output (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Errors only.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RunConfig {
    controller: ControllerConfig,
    pipeline: PipelineConfig,
}

impl Cli {
    fn run_config(&self) -> Result<RunConfig, Box<dyn std::error::Error>> {
        let (mut run, admission_given) = match &self.config {
            Some(path) => {
                let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(path)?)?;
                let given = value.pointer("/controller/admission").is_some();
                (serde_json::from_value::<RunConfig>(value)?, given)
            }
            None => (RunConfig::default(), false),
        };
        if !admission_given {
            run.controller.admission = AdmissionConfig::detect();
        }
        let (controller, pipeline) = (&mut run.controller, &mut run.pipeline);

        if let Some(tasks) = self.tasks {
            pipeline.tasks = tasks;
        }
        if let Some(nodes) = self.nodes {
            pipeline.workers = nodes;
        }
        if self.queue_capacity.is_some() {
            pipeline.queue_capacity = self.queue_capacity;
        }
        if let Some(period) = self.period_ns {
            controller.period_ns = period;
        }
        if let Some(tick) = self.tick_ns {
            controller.tick_interval_ns = tick;
        }
        if let Some(bw_min) = self.bw_min {
            controller.bandwidth_min = bw_min;
        }
        if let Some(fraction) = self.fraction {
            controller.runtime_fraction = fraction;
        }
        if let Some(policy) = self.policy {
            controller.transfer_policy = policy.into();
        }
        if let Some(check) = self.bound_check {
            controller.bound_check = check.into();
        }
        if self.stop_on_full_history {
            controller.history_policy = HistoryPolicy::StopController;
        }
        controller.stage_count = pipeline.stage_count();
        controller.total_tasks = pipeline.tasks;
        if let Some(secs) = self.history_secs {
            run.controller = run.controller.history_for(Duration::from_secs(secs));
        }
        Ok(run)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(Verbosity::from_flags(cli.verbose, cli.quiet))?;

    let RunConfig {
        controller: controller_config,
        pipeline: pipeline_config,
    } = cli.run_config()?;
    let tasks = pipeline_config.tasks;
    let workers = pipeline_config.workers;

    let gateway: Arc<dyn SchedulingGateway> = if cli.dry_run {
        info!("dry run, scheduling attributes are simulated");
        Arc::new(InMemoryGateway::new())
    } else {
        Arc::new(LinuxGateway::new())
    };

    let pipeline = Arc::new(Pipeline::new(
        pipeline_config,
        controller_config.period_ns,
        gateway.clone(),
    )?);
    let context = pipeline.context();
    let controller =
        BandwidthController::new(controller_config, gateway, pipeline.clone(), context.clone())?;

    {
        let context = context.clone();
        ctrlc::set_handler(move || {
            warn!("interrupted, stopping the source");
            context.request_stop();
        })?;
    }

    let handle = controller.spawn()?;
    if let Err(e) = pipeline.start() {
        error!(error = %e, "pipeline failed to start");
        let _ = handle.join();
        return Err(e.into());
    }

    let processed = pipeline.join()?;
    let run = match handle.join() {
        Ok(run) => run,
        Err(e) => {
            error!(error = %e, "controller failed");
            return Err(e.into());
        }
    };

    let seconds = context.run_time().unwrap_or_default().as_secs_f64();
    info!(processed, seconds, "run finished");

    run.history.save_csv(&cli.csv)?;
    if let Some(path) = &cli.times {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{tasks},{workers},{seconds}")?;
    }

    println!("{}", serde_json::to_string_pretty(&run.report)?);
    Ok(())
}
