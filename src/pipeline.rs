//! Thread-per-stage test pipeline.
//!
//! Source → workers → sink, connected by [`StageQueue`]s. Every stage commits its initial
//! `SCHED_DEADLINE` budget (an equal share of the period) from its own thread, records the result
//! in the shared [`ControllerContext`], and then waits at the start gate until all stages and the
//! controller have arrived. The source captures the timing baseline, the sink captures the end
//! of the run and raises the stop flag once the stream is drained.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::context::{ControllerContext, InitStatus};
use crate::error::PipelineError;
use crate::gateway::SchedulingGateway;
use crate::queue::{QueueProbe, StageQueue};
use crate::runtime::{PipelineRuntime, StageTid};
use crate::sched_attr::SchedAttr;
use crate::threading::{busy_wait, current_tid};

/// Role of a stage in the linear pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    Source,
    Worker,
    Sink,
}

impl StageRole {
    fn of(stage: usize, stage_count: usize) -> Self {
        if stage == 0 {
            StageRole::Source
        } else if stage + 1 == stage_count {
            StageRole::Sink
        } else {
            StageRole::Worker
        }
    }

    fn thread_name(self, stage: usize) -> String {
        match self {
            StageRole::Source => "Stage-Source".to_string(),
            StageRole::Worker => format!("Stage-Worker-{stage}"),
            StageRole::Sink => "Stage-Sink".to_string(),
        }
    }
}

/// Everything one stage thread needs, moved into the thread at spawn time.
struct StageSpec {
    stage: usize,
    role: StageRole,
    cost: Duration,
    input: Option<Receiver<u64>>,
    output: Option<Sender<u64>>,
}

/// Running pipeline; implements [`PipelineRuntime`] for the controller.
pub struct Pipeline {
    config: PipelineConfig,
    period_ns: u64,
    gateway: Arc<dyn SchedulingGateway>,
    context: Arc<ControllerContext>,
    /// `gettid()` of each stage, `0` until the stage thread has started.
    tids: Arc<Vec<AtomicI32>>,
    probes: RwLock<Vec<Option<QueueProbe>>>,
    handles: Mutex<Vec<(usize, JoinHandle<()>)>>,
    processed: Arc<AtomicU64>,
    started: AtomicBool,
}

impl Pipeline {
    /// Build the pipeline without starting any threads.
    ///
    /// # Arguments
    /// * `config` - Shape and per-item costs of the stages
    /// * `period_ns` - Deadline period every stage commits at init
    /// * `gateway` - Scheduler access used by the stage init callbacks
    pub fn new(
        config: PipelineConfig,
        period_ns: u64,
        gateway: Arc<dyn SchedulingGateway>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let stage_count = config.stage_count();
        Ok(Self {
            period_ns,
            gateway,
            context: Arc::new(ControllerContext::new(stage_count)),
            tids: Arc::new((0..stage_count).map(|_| AtomicI32::new(0)).collect()),
            probes: RwLock::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            processed: Arc::new(AtomicU64::new(0)),
            started: AtomicBool::new(false),
            config,
        })
    }

    /// Context shared with the controller for this run.
    pub fn context(&self) -> Arc<ControllerContext> {
        self.context.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Items the sink has consumed so far.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Spawn one thread per stage.
    ///
    /// The stages block at the start gate until the controller arrives as well. If any spawn
    /// fails the run is aborted so already-spawned stages do not wait forever.
    pub fn start(&self) -> Result<(), PipelineError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::AlreadyStarted);
        }
        let stage_count = self.config.stage_count();

        let mut inputs: Vec<Option<Receiver<u64>>> = vec![None];
        let mut outputs: Vec<Option<Sender<u64>>> = Vec::with_capacity(stage_count);
        let mut probes = Vec::with_capacity(stage_count);
        for _ in 0..stage_count - 1 {
            let queue = StageQueue::new(self.config.queue_capacity);
            probes.push(Some(queue.probe()));
            let (tx, rx) = queue.split();
            outputs.push(Some(tx));
            inputs.push(Some(rx));
        }
        outputs.push(None);
        *self.probes.write() = probes;

        let specs = inputs
            .into_iter()
            .zip(outputs)
            .enumerate()
            .map(|(stage, (input, output))| StageSpec {
                stage,
                role: StageRole::of(stage, stage_count),
                cost: self.config.stage_cost(stage),
                input,
                output,
            });

        let init_attr = SchedAttr::equal_share(self.period_ns, stage_count);
        for spec in specs {
            let stage = spec.stage;
            let name = spec.role.thread_name(stage);
            let gateway = self.gateway.clone();
            let context = self.context.clone();
            let tids = self.tids.clone();
            let processed = self.processed.clone();
            let tasks = self.config.tasks;

            let spawned = std::thread::Builder::new().name(name).spawn(move || {
                let tid = current_tid();
                tids[spec.stage].store(tid.as_raw(), Ordering::Release);
                init_stage(spec.stage, tid, &init_attr, gateway.as_ref(), &context);
                if !context.rendezvous() {
                    debug!(stage = spec.stage, "start gate abandoned, stage exits");
                    return;
                }
                run_stage(spec, tasks, &context, &processed);
            });

            match spawned {
                Ok(handle) => self.handles.lock().push((stage, handle)),
                Err(source) => {
                    error!(stage, error = %source, "failed to spawn stage thread");
                    self.context.abort();
                    return Err(PipelineError::Spawn { stage, source });
                }
            }
        }
        info!(
            stages = stage_count,
            tasks = self.config.tasks,
            runtime_ns = init_attr.runtime,
            period_ns = self.period_ns,
            "pipeline started"
        );
        Ok(())
    }

    /// Join every stage thread and release the queue probes.
    ///
    /// Returns the number of items the sink consumed.
    pub fn join(&self) -> Result<u64, PipelineError> {
        let handles = std::mem::take(&mut *self.handles.lock());
        let mut panicked = None;
        for (stage, handle) in handles {
            if handle.join().is_err() {
                error!(stage, "stage thread panicked");
                panicked.get_or_insert(stage);
                self.context.abort();
            }
        }
        self.probes.write().clear();
        match panicked {
            Some(stage) => Err(PipelineError::StagePanicked(stage)),
            None => Ok(self.processed()),
        }
    }
}

/// Commit the stage's initial deadline budget and publish the outcome.
fn init_stage(
    stage: usize,
    tid: StageTid,
    attr: &SchedAttr,
    gateway: &dyn SchedulingGateway,
    context: &ControllerContext,
) {
    let result = gateway.set_attributes(tid, attr, true);
    let status = InitStatus::from_result(&result);
    match &result {
        Ok(()) => debug!(stage, %tid, runtime_ns = attr.runtime, "stage committed deadline policy"),
        Err(e) if e.is_permission_denied() => {
            error!(stage, %tid, errno = ?e.errno(), error = %e, "stage denied deadline policy")
        }
        Err(e) => warn!(stage, %tid, errno = ?e.errno(), error = %e, "stage init failed"),
    }
    context.record_init(stage, status);
}

fn run_stage(spec: StageSpec, tasks: u64, context: &ControllerContext, processed: &AtomicU64) {
    let StageSpec {
        stage,
        role,
        cost,
        input,
        output,
    } = spec;

    match role {
        StageRole::Source => {
            context.mark_started(Instant::now());
            let Some(output) = output else { return };
            for item in 1..=tasks {
                if context.should_stop() {
                    info!(stage, emitted = item - 1, "source stopped early");
                    break;
                }
                busy_wait(cost);
                if output.send(item).is_err() {
                    break;
                }
            }
        }
        StageRole::Worker => {
            let (Some(input), Some(output)) = (input, output) else {
                return;
            };
            for item in input.iter() {
                busy_wait(cost);
                if output.send(item).is_err() {
                    break;
                }
            }
        }
        StageRole::Sink => {
            if let Some(input) = input {
                for _ in input.iter() {
                    busy_wait(cost);
                    processed.fetch_add(1, Ordering::Relaxed);
                }
            }
            context.mark_finished(Instant::now());
            context.request_stop();
            info!(
                stage,
                processed = processed.load(Ordering::Relaxed),
                "sink drained, stop requested"
            );
        }
    }
}

impl PipelineRuntime for Pipeline {
    fn stage_count(&self) -> usize {
        self.config.stage_count()
    }

    fn stage_thread_id(&self, stage: usize) -> Option<StageTid> {
        match self.tids.get(stage)?.load(Ordering::Acquire) {
            0 => None,
            raw => Some(StageTid(raw)),
        }
    }

    fn outbound_queue_len(&self, stage: usize) -> Option<usize> {
        self.probes.read().get(stage)?.as_ref().map(QueueProbe::len)
    }
}
