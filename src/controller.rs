//! Queue-depth feedback loop that moves deadline runtime between pipeline stages.
//!
//! The controller waits at the start gate with the stages, seeds its [`QuotaTable`] from the
//! stages' live attributes, and then ticks at a fixed interval. Each tick samples the inter-stage
//! queue lengths, lets the [`TransferSelector`] pick a donor and a receiver, checks the pair
//! against the run's [`Bounds`], moves one offset of runtime from donor to receiver through the
//! [`SchedulingGateway`], and appends a sample to the history.
//!
//! Gateway failures are never fatal once the loop runs: the failed stage's table entry is rolled
//! back so the table keeps mirroring what the kernel actually holds.
//!
//! [`QuotaTable`]: crate::quota::QuotaTable

use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::clock::SamplingClock;
use crate::config::{BoundCheck, ControllerConfig, HistoryPolicy};
use crate::context::{ControllerContext, InitStatus};
use crate::error::{ControllerError, GatewayError};
use crate::gateway::SchedulingGateway;
use crate::policy::{Transfer, TransferPolicy, TransferSelector};
use crate::quota::Bounds;
use crate::recorder::{Append, SampleRecorder};
use crate::runtime::{PipelineRuntime, StageTid};
use crate::sched_attr::SchedAttr;

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A queue length (or a stage thread id) was unavailable; nothing else happened.
    NoSample { stage: usize },
    /// The policy found no donor/receiver pair.
    Idle,
    /// The pair failed the bound check; no gateway call was issued.
    OutOfBounds(Transfer),
    /// Both gateway calls succeeded.
    Transferred(Transfer),
    /// A gateway call failed and the affected table entries were rolled back.
    GatewayFailed(Transfer),
}

/// Counters accumulated over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ControllerStats {
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub idle_ticks: u64,
    pub rejected_transfers: u64,
    pub transfers: u64,
    pub gateway_failures: u64,
    pub rollbacks: u64,
    pub reseeded: u64,
    pub missed_ticks: u64,
}

/// Summary of one controller run, printed by the binary as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerReport {
    pub stage_count: usize,
    pub period_ns: u64,
    pub offset_ns: u64,
    pub runtime_min_ns: u64,
    pub runtime_max_ns: u64,
    pub transfer_policy: TransferPolicy,
    pub bound_check: BoundCheck,
    #[serde(flatten)]
    pub stats: ControllerStats,
    pub samples_recorded: usize,
    pub history_capacity: usize,
    pub history_exhausted: bool,
    pub bootstrap_quotas: Vec<Option<u64>>,
    pub final_quotas: Vec<Option<u64>>,
    /// Start gate to sink completion, when the pipeline reported both.
    pub run_time_secs: Option<f64>,
}

/// Report plus the recorded history, handed back when the loop ends.
#[derive(Debug)]
pub struct ControllerRun {
    pub report: ControllerReport,
    pub history: SampleRecorder,
}

/// Feedback controller for one pipeline run.
pub struct BandwidthController<G, R> {
    config: ControllerConfig,
    bounds: Bounds,
    gateway: G,
    runtime: R,
    context: Arc<ControllerContext>,
    selector: TransferSelector,
    recorder: SampleRecorder,
    stats: ControllerStats,
    bootstrap_quotas: Vec<Option<u64>>,
    baseline: Instant,
    lengths: Vec<usize>,
    mirror: Vec<u64>,
}

impl<G, R> BandwidthController<G, R>
where
    G: SchedulingGateway,
    R: PipelineRuntime,
{
    /// Validate `config` against the runtime and pre-allocate the history.
    ///
    /// # Arguments
    /// * `config` - Period, tick, bounds and policy of the run
    /// * `gateway` - Scheduler access used for bootstrap reads and transfers
    /// * `runtime` - Source of stage thread ids and queue lengths
    /// * `context` - Stop flag, start gate and quota table shared with the stages
    pub fn new(
        config: ControllerConfig,
        gateway: G,
        runtime: R,
        context: Arc<ControllerContext>,
    ) -> Result<Self, ControllerError> {
        config.validate()?;
        for actual in [runtime.stage_count(), context.stage_count()] {
            if actual != config.stage_count {
                return Err(ControllerError::StageCountMismatch {
                    expected: config.stage_count,
                    actual,
                });
            }
        }

        let width = config.schedulable_stages();
        Ok(Self {
            bounds: config.bounds(),
            selector: TransferSelector::new(config.transfer_policy),
            recorder: SampleRecorder::new(width, config.history_capacity),
            stats: ControllerStats::default(),
            bootstrap_quotas: vec![None; width],
            baseline: Instant::now(),
            lengths: vec![0; width],
            mirror: vec![0; width],
            config,
            gateway,
            runtime,
            context,
        })
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    pub fn history(&self) -> &SampleRecorder {
        &self.recorder
    }

    /// Current quota table.
    pub fn quotas(&self) -> Vec<Option<u64>> {
        self.context.quotas().snapshot()
    }

    /// Table as it stood right after [`bootstrap`](Self::bootstrap).
    pub fn bootstrap_quotas(&self) -> &[Option<u64>] {
        &self.bootstrap_quotas
    }

    /// Set the instant sample timestamps are measured from.
    pub fn set_baseline(&mut self, baseline: Instant) {
        self.baseline = baseline;
    }

    /// Seed the quota table from the stages' live attributes.
    ///
    /// Fails when a stage was refused the deadline policy for lack of privilege, when no stage
    /// yielded a readable quota, or when the stages already reserve more bandwidth than the
    /// kernel will admit.
    pub fn bootstrap(&mut self) -> Result<(), ControllerError> {
        if let Some((stage, InitStatus::Denied { errno })) = self.context.first_denied() {
            let source = match (errno, self.runtime.stage_thread_id(stage)) {
                (Some(errno), Some(tid)) => {
                    GatewayError::os("sched_setattr", tid, io::Error::from_raw_os_error(errno))
                }
                _ => GatewayError::Unsupported,
            };
            error!(stage, error = %source, "stage lacks SCHED_DEADLINE, controller will not start");
            return Err(ControllerError::PolicyDenied { stage, source });
        }

        let mut utilization = 0.0;
        for stage in 0..self.config.stage_count {
            let attr = match self.read_attributes(stage) {
                Some(attr) => attr,
                None => {
                    if stage < self.config.schedulable_stages() {
                        self.context.quotas().mark_unknown(stage);
                    }
                    continue;
                }
            };
            utilization += attr.utilization();
            if stage < self.config.schedulable_stages() {
                self.context.quotas().set(stage, attr.runtime);
            }
        }

        let quotas = self.context.quotas();
        if quotas.unknown_count() == quotas.len() {
            return Err(ControllerError::NoSchedulableStage);
        }
        let capacity = self.config.admission.capacity();
        if utilization > capacity {
            error!(utilization, capacity, "bootstrap quotas exceed admission capacity");
            return Err(ControllerError::AdmissionRisk {
                utilization,
                capacity,
            });
        }

        self.bootstrap_quotas = quotas.snapshot();
        info!(
            quotas = ?self.bootstrap_quotas,
            offset_ns = self.bounds.offset,
            runtime_min_ns = self.bounds.min,
            runtime_max_ns = self.bounds.max,
            utilization,
            "quota table seeded"
        );
        Ok(())
    }

    /// Live attributes of `stage`, if they describe a deadline thread on this run's period.
    fn read_attributes(&self, stage: usize) -> Option<SchedAttr> {
        let tid = self.runtime.stage_thread_id(stage)?;
        match self.gateway.get_attributes(tid) {
            Ok(attr) if attr.is_deadline() && attr.period == self.config.period_ns => Some(attr),
            Ok(attr) => {
                debug!(stage, %tid, policy = attr.policy, period_ns = attr.period, "stage not on the run's deadline policy");
                None
            }
            Err(e) => {
                warn!(stage, %tid, errno = ?e.errno(), error = %e, "failed to read stage attributes");
                None
            }
        }
    }

    /// Retry the bootstrap read for every stage whose quota is still unknown.
    fn reseed_unknown(&mut self) {
        for stage in 0..self.config.schedulable_stages() {
            if self.context.quotas().is_known(stage) {
                continue;
            }
            if let Some(attr) = self.read_attributes(stage) {
                self.context.quotas().set(stage, attr.runtime);
                self.stats.reseeded += 1;
                debug!(stage, runtime_ns = attr.runtime, "quota re-seeded");
            }
        }
    }

    /// Run one iteration of the loop as if the tick boundary `now` had just been reached.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        self.stats.ticks += 1;
        if self.context.quotas().unknown_count() > 0 {
            self.reseed_unknown();
        }

        for stage in 0..self.lengths.len() {
            match self.runtime.outbound_queue_len(stage) {
                Some(len) => self.lengths[stage] = len,
                None => {
                    self.stats.skipped_ticks += 1;
                    trace!(stage, "queue unavailable, tick skipped");
                    return TickOutcome::NoSample { stage };
                }
            }
        }

        let quotas = self.context.quotas();
        let outcome = match self.selector.select(&self.lengths, |stage| quotas.is_known(stage)) {
            None => {
                self.stats.idle_ticks += 1;
                TickOutcome::Idle
            }
            Some(transfer) => self.apply(transfer),
        };
        trace!(lengths = ?self.lengths, ?outcome, "tick");

        self.record(now);
        outcome
    }

    fn apply(&mut self, transfer: Transfer) -> TickOutcome {
        let Transfer { donor, receiver } = transfer;
        let quotas = self.context.quotas();
        let (Some(donor_before), Some(receiver_before)) = (quotas.get(donor), quotas.get(receiver))
        else {
            self.stats.idle_ticks += 1;
            return TickOutcome::Idle;
        };
        if !self
            .bounds
            .permits(self.config.bound_check, donor_before, receiver_before)
        {
            self.stats.rejected_transfers += 1;
            trace!(donor, receiver, donor_before, receiver_before, "transfer out of bounds");
            return TickOutcome::OutOfBounds(transfer);
        }
        let Some(donor_tid) = self.runtime.stage_thread_id(donor) else {
            self.stats.skipped_ticks += 1;
            return TickOutcome::NoSample { stage: donor };
        };
        let Some(receiver_tid) = self.runtime.stage_thread_id(receiver) else {
            self.stats.skipped_ticks += 1;
            return TickOutcome::NoSample { stage: receiver };
        };

        let donor_after = donor_before - self.bounds.offset;
        let receiver_after = receiver_before + self.bounds.offset;

        quotas.set(donor, donor_after);
        if let Err(e) = self.commit(donor, donor_tid, donor_after) {
            quotas.set(donor, donor_before);
            self.stats.gateway_failures += 1;
            self.stats.rollbacks += 1;
            warn!(stage = donor, tid = %donor_tid, runtime_ns = donor_after, errno = ?e.errno(), error = %e, "donor update failed, rolled back");
            return TickOutcome::GatewayFailed(transfer);
        }

        quotas.set(receiver, receiver_after);
        if let Err(e) = self.commit(receiver, receiver_tid, receiver_after) {
            quotas.set(receiver, receiver_before);
            self.stats.gateway_failures += 1;
            self.stats.rollbacks += 1;
            warn!(stage = receiver, tid = %receiver_tid, runtime_ns = receiver_after, errno = ?e.errno(), error = %e, "receiver update failed, rolled back");

            // Give the donor its runtime back; if that fails too the table keeps the reduced
            // value, which is what the kernel holds.
            match self.commit(donor, donor_tid, donor_before) {
                Ok(()) => {
                    quotas.set(donor, donor_before);
                    self.stats.rollbacks += 1;
                }
                Err(e) => {
                    self.stats.gateway_failures += 1;
                    warn!(stage = donor, tid = %donor_tid, runtime_ns = donor_after, errno = ?e.errno(), error = %e, "donor restore failed, keeping reduced quota");
                }
            }
            return TickOutcome::GatewayFailed(transfer);
        }

        self.stats.transfers += 1;
        debug!(
            donor,
            receiver,
            donor_runtime_ns = donor_after,
            receiver_runtime_ns = receiver_after,
            "runtime transferred"
        );
        TickOutcome::Transferred(transfer)
    }

    fn commit(&self, stage: usize, tid: StageTid, runtime: u64) -> Result<(), GatewayError> {
        let attr = SchedAttr::deadline(runtime, self.config.period_ns);
        debug_assert!(attr.is_valid(), "stage {stage} runtime {runtime} outside the period");
        self.gateway.set_attributes(tid, &attr, false)
    }

    fn record(&mut self, now: Instant) {
        if self.recorder.is_exhausted() {
            return;
        }
        self.context.quotas().copy_into(&mut self.mirror);
        let elapsed = now.saturating_duration_since(self.baseline);
        if let Append::Exhausted { first: true } =
            self.recorder
                .push(elapsed, &self.lengths, &self.mirror)
        {
            warn!(
                capacity = self.recorder.capacity(),
                keep_balancing = self.config.history_policy == HistoryPolicy::KeepBalancing,
                "sample history exhausted, recording stopped"
            );
        }
    }

    fn history_stops_loop(&self) -> bool {
        self.recorder.is_exhausted() && self.config.history_policy == HistoryPolicy::StopController
    }

    /// Rendezvous with the stages, bootstrap, and tick until the stop flag is raised.
    pub fn run(mut self) -> Result<ControllerRun, ControllerError> {
        if !self.context.rendezvous() {
            return Err(ControllerError::Abandoned);
        }
        self.context.mark_started(Instant::now());
        let baseline = self.context.started_at().unwrap_or_else(Instant::now);
        self.baseline = baseline;
        if let Some(wall) = self.context.started_wall() {
            self.recorder.set_epoch(wall);
        }

        self.bootstrap()?;
        info!(
            stages = self.config.stage_count,
            policy = ?self.config.transfer_policy,
            tick_ns = self.config.tick_interval_ns,
            "controller sampling"
        );

        let mut clock = SamplingClock::starting_at(baseline, self.config.tick_interval());
        while !self.context.should_stop() {
            let now = clock.wait();
            if self.context.should_stop() {
                break;
            }
            self.tick(now);
            if self.history_stops_loop() {
                info!("history exhausted, controller stopping");
                break;
            }
        }
        self.stats.missed_ticks = clock.missed();

        let run = self.finish();
        info!(
            ticks = run.report.stats.ticks,
            transfers = run.report.stats.transfers,
            samples = run.report.samples_recorded,
            "controller stopped"
        );
        Ok(run)
    }

    /// Build the report and hand back the history.
    pub fn finish(self) -> ControllerRun {
        let report = ControllerReport {
            stage_count: self.config.stage_count,
            period_ns: self.config.period_ns,
            offset_ns: self.bounds.offset,
            runtime_min_ns: self.bounds.min,
            runtime_max_ns: self.bounds.max,
            transfer_policy: self.config.transfer_policy,
            bound_check: self.config.bound_check,
            stats: self.stats,
            samples_recorded: self.recorder.len(),
            history_capacity: self.recorder.capacity(),
            history_exhausted: self.recorder.is_exhausted(),
            bootstrap_quotas: self.bootstrap_quotas,
            final_quotas: self.context.quotas().snapshot(),
            run_time_secs: self.context.run_time().map(|d| d.as_secs_f64()),
        };
        ControllerRun {
            report,
            history: self.recorder,
        }
    }
}

impl<G, R> BandwidthController<G, R>
where
    G: SchedulingGateway + 'static,
    R: PipelineRuntime + 'static,
{
    /// Run the controller on its own thread.
    ///
    /// If the thread cannot be spawned the run is aborted so the stages are released from the
    /// start gate.
    pub fn spawn(self) -> Result<ControllerHandle, ControllerError> {
        let context = self.context.clone();
        std::thread::Builder::new()
            .name("Bandwidth-Controller".to_string())
            .spawn(move || self.run())
            .map(|handle| ControllerHandle { handle })
            .map_err(|e| {
                context.abort();
                ControllerError::Spawn(e)
            })
    }
}

/// Join handle of a spawned controller.
pub struct ControllerHandle {
    handle: JoinHandle<Result<ControllerRun, ControllerError>>,
}

impl ControllerHandle {
    pub fn join(self) -> Result<ControllerRun, ControllerError> {
        self.handle.join().map_err(|_| ControllerError::Panicked)?
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdmissionConfig;
    use crate::gateway::InMemoryGateway;
    use parking_lot::Mutex;

    const PERIOD: u64 = 1_000_000;

    struct FakeRuntime {
        stages: usize,
        lengths: Mutex<Vec<Option<usize>>>,
        hidden_tid: Mutex<Option<usize>>,
    }

    impl FakeRuntime {
        fn new(stages: usize) -> Self {
            Self {
                stages,
                lengths: Mutex::new(vec![Some(0); stages - 1]),
                hidden_tid: Mutex::new(None),
            }
        }

        fn set_lengths(&self, lengths: &[usize]) {
            *self.lengths.lock() = lengths.iter().copied().map(Some).collect();
        }
    }

    impl PipelineRuntime for FakeRuntime {
        fn stage_count(&self) -> usize {
            self.stages
        }

        fn stage_thread_id(&self, stage: usize) -> Option<StageTid> {
            if *self.hidden_tid.lock() == Some(stage) {
                return None;
            }
            (stage < self.stages).then(|| StageTid(100 + stage as i32))
        }

        fn outbound_queue_len(&self, stage: usize) -> Option<usize> {
            *self.lengths.lock().get(stage)?
        }
    }

    fn config(stages: usize) -> ControllerConfig {
        ControllerConfig {
            stage_count: stages,
            period_ns: PERIOD,
            admission: AdmissionConfig {
                cpu_count: 4,
                max_utilization: 0.95,
            },
            ..ControllerConfig::default()
        }
    }

    fn controller(
        runtimes: &[u64],
    ) -> (
        BandwidthController<Arc<InMemoryGateway>, Arc<FakeRuntime>>,
        Arc<InMemoryGateway>,
        Arc<FakeRuntime>,
    ) {
        let stages = runtimes.len();
        let gateway = Arc::new(InMemoryGateway::recording());
        for (stage, runtime) in runtimes.iter().enumerate() {
            gateway.insert(StageTid(100 + stage as i32), SchedAttr::deadline(*runtime, PERIOD));
        }
        let runtime = Arc::new(FakeRuntime::new(stages));
        let context = Arc::new(ControllerContext::new(stages));
        let mut controller =
            BandwidthController::new(config(stages), gateway.clone(), runtime.clone(), context)
                .unwrap();
        controller.bootstrap().unwrap();
        gateway.clear_calls();
        (controller, gateway, runtime)
    }

    #[test]
    fn rejects_mismatched_stage_count() {
        let runtime = Arc::new(FakeRuntime::new(4));
        let context = Arc::new(ControllerContext::new(5));
        let result = BandwidthController::new(
            config(5),
            Arc::new(InMemoryGateway::new()),
            runtime,
            context,
        );
        assert!(matches!(
            result,
            Err(ControllerError::StageCountMismatch {
                expected: 5,
                actual: 4
            })
        ));
    }

    #[test]
    fn bootstrap_seeds_all_but_terminal_stage() {
        let (controller, _, _) = controller(&[200_000; 5]);
        assert_eq!(controller.quotas(), vec![Some(200_000); 4]);
        assert_eq!(controller.bootstrap_quotas(), &[Some(200_000); 4][..]);
    }

    #[test]
    fn transfer_moves_one_offset() {
        let (mut controller, gateway, runtime) = controller(&[200_000; 4]);
        runtime.set_lengths(&[10, 50, 12]);
        let outcome = controller.tick(Instant::now());
        let transfer = Transfer {
            donor: 1,
            receiver: 2,
        };
        assert_eq!(outcome, TickOutcome::Transferred(transfer));

        let offset = controller.bounds().offset;
        assert_eq!(offset, 12_500);
        let quotas = controller.quotas();
        assert_eq!(quotas[1], Some(200_000 - offset));
        assert_eq!(quotas[2], Some(200_000 + offset));
        assert_eq!(gateway.attributes(StageTid(102)).unwrap().runtime, 212_500);
        assert_eq!(gateway.set_count(), 2);
        assert_eq!(controller.history().len(), 1);
    }

    #[test]
    fn unavailable_queue_skips_everything() {
        let (mut controller, gateway, runtime) = controller(&[200_000; 4]);
        runtime.lengths.lock()[1] = None;
        assert_eq!(
            controller.tick(Instant::now()),
            TickOutcome::NoSample { stage: 1 }
        );
        assert_eq!(gateway.set_count(), 0);
        assert!(controller.history().is_empty());
        assert_eq!(controller.stats().skipped_ticks, 1);
    }

    #[test]
    fn missing_receiver_tid_names_the_receiver() {
        let (mut controller, gateway, runtime) = controller(&[200_000; 4]);
        runtime.set_lengths(&[10, 50, 12]);
        *runtime.hidden_tid.lock() = Some(2);
        assert_eq!(
            controller.tick(Instant::now()),
            TickOutcome::NoSample { stage: 2 }
        );

        *runtime.hidden_tid.lock() = Some(1);
        assert_eq!(
            controller.tick(Instant::now()),
            TickOutcome::NoSample { stage: 1 }
        );
        assert_eq!(gateway.set_count(), 0);
        assert_eq!(controller.quotas(), vec![Some(200_000); 3]);
    }

    #[test]
    fn denied_stage_is_fatal() {
        let gateway = Arc::new(InMemoryGateway::recording());
        let runtime = Arc::new(FakeRuntime::new(3));
        let context = Arc::new(ControllerContext::new(3));
        context.record_init(1, InitStatus::Denied {
            errno: Some(libc::EPERM),
        });
        let mut controller =
            BandwidthController::new(config(3), gateway.clone(), runtime, context).unwrap();
        let err = controller.bootstrap().unwrap_err();
        assert!(matches!(err, ControllerError::PolicyDenied { stage: 1, .. }));
        assert_eq!(gateway.set_count(), 0);
    }

    #[test]
    fn no_readable_quota_is_fatal() {
        let gateway = Arc::new(InMemoryGateway::new());
        let runtime = Arc::new(FakeRuntime::new(3));
        let context = Arc::new(ControllerContext::new(3));
        let mut controller =
            BandwidthController::new(config(3), gateway, runtime, context).unwrap();
        assert!(matches!(
            controller.bootstrap(),
            Err(ControllerError::NoSchedulableStage)
        ));
    }

    #[test]
    fn overcommitted_bootstrap_is_rejected() {
        let gateway = Arc::new(InMemoryGateway::new());
        for stage in 0..3 {
            gateway.insert(StageTid(100 + stage), SchedAttr::deadline(900_000, PERIOD));
        }
        let runtime = Arc::new(FakeRuntime::new(3));
        let context = Arc::new(ControllerContext::new(3));
        let mut cfg = config(3);
        cfg.admission.cpu_count = 2;
        let mut controller = BandwidthController::new(cfg, gateway, runtime, context).unwrap();
        assert!(matches!(
            controller.bootstrap(),
            Err(ControllerError::AdmissionRisk { .. })
        ));
    }

    #[test]
    fn report_serializes_flat_stats() {
        let (mut controller, _, runtime) = controller(&[200_000; 4]);
        runtime.set_lengths(&[10, 50, 12]);
        controller.tick(Instant::now());
        let run = controller.finish();
        let json = serde_json::to_value(&run.report).unwrap();
        assert_eq!(json["transfers"], 1);
        assert_eq!(json["transfer_policy"], "toward-min-delta");
        assert_eq!(json["samples_recorded"], 1);
        assert_eq!(run.history.len(), 1);
    }
}
