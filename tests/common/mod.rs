// Shared fixtures for the integration tests: a scripted pipeline runtime and a controller
// wired to an in-memory gateway.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use deadline_rebalancer::config::{AdmissionConfig, ControllerConfig};
use deadline_rebalancer::{
    BandwidthController, ControllerContext, InMemoryGateway, PipelineRuntime, SchedAttr, StageTid,
};

pub const PERIOD: u64 = 1_000_000;

/// Runtime whose queue lengths are set by the test.
pub struct ScriptedRuntime {
    stages: usize,
    lengths: Mutex<Vec<Option<usize>>>,
}

impl ScriptedRuntime {
    pub fn new(stages: usize) -> Self {
        Self {
            stages,
            lengths: Mutex::new(vec![Some(0); stages - 1]),
        }
    }

    pub fn set_lengths(&self, lengths: &[usize]) {
        *self.lengths.lock() = lengths.iter().copied().map(Some).collect();
    }

    pub fn make_unavailable(&self, queue: usize) {
        self.lengths.lock()[queue] = None;
    }
}

impl PipelineRuntime for ScriptedRuntime {
    fn stage_count(&self) -> usize {
        self.stages
    }

    fn stage_thread_id(&self, stage: usize) -> Option<StageTid> {
        (stage < self.stages).then(|| tid(stage))
    }

    fn outbound_queue_len(&self, stage: usize) -> Option<usize> {
        *self.lengths.lock().get(stage)?
    }
}

pub fn tid(stage: usize) -> StageTid {
    StageTid(1000 + stage as i32)
}

pub fn config(stages: usize) -> ControllerConfig {
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

pub type Controller = BandwidthController<Arc<InMemoryGateway>, Arc<ScriptedRuntime>>;

pub struct Harness {
    pub gateway: Arc<InMemoryGateway>,
    pub runtime: Arc<ScriptedRuntime>,
    pub context: Arc<ControllerContext>,
}

impl Harness {
    /// One deadline thread per entry of `runtimes`, all on [`PERIOD`].
    pub fn new(runtimes: &[u64]) -> Self {
        let stages = runtimes.len();
        let gateway = Arc::new(InMemoryGateway::recording());
        for (stage, runtime) in runtimes.iter().enumerate() {
            gateway.insert(tid(stage), SchedAttr::deadline(*runtime, PERIOD));
        }
        Self {
            gateway,
            runtime: Arc::new(ScriptedRuntime::new(stages)),
            context: Arc::new(ControllerContext::new(stages)),
        }
    }

    pub fn stages(&self) -> usize {
        self.runtime.stage_count()
    }

    pub fn controller(&self, config: ControllerConfig) -> Controller {
        BandwidthController::new(
            config,
            self.gateway.clone(),
            self.runtime.clone(),
            self.context.clone(),
        )
        .unwrap()
    }

    /// Controller that has already seeded its quota table.
    pub fn bootstrapped(&self, config: ControllerConfig) -> Controller {
        let mut controller = self.controller(config);
        controller.bootstrap().unwrap();
        self.gateway.clear_calls();
        controller
    }

    /// Stand in for the stage threads at the start gate.
    pub fn arrive_as_stages(&self) -> Vec<JoinHandle<bool>> {
        (0..self.stages())
            .map(|_| {
                let context = self.context.clone();
                thread::spawn(move || context.rendezvous())
            })
            .collect()
    }

    pub fn runtime_of(&self, stage: usize) -> u64 {
        self.gateway.attributes(tid(stage)).unwrap().runtime
    }
}
