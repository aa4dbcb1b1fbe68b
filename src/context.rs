//! State shared by the controller thread and the pipeline stages for one run.
//!
//! A [`ControllerContext`] is built once per run, handed out as `Arc<ControllerContext>` to the
//! controller and to every stage's init callback, and dropped after both sides are joined.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime};

use crate::error::GatewayError;
use crate::quota::QuotaTable;

/// Outcome of a stage's one-time deadline-policy commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    /// The stage has not reached its init callback yet.
    Pending,
    Committed,
    /// The kernel refused the policy for lack of privilege.
    Denied { errno: Option<i32> },
    /// Any other failure; the stage runs under its previous policy.
    Failed { errno: Option<i32> },
}

impl InitStatus {
    pub fn from_result(result: &Result<(), GatewayError>) -> Self {
        match result {
            Ok(()) => InitStatus::Committed,
            Err(e) if e.is_permission_denied() => InitStatus::Denied { errno: e.errno() },
            Err(e) => InitStatus::Failed { errno: e.errno() },
        }
    }
}

#[derive(Debug, Default)]
struct GateState {
    arrived: usize,
    open: bool,
    abandoned: bool,
}

/// One-shot rendezvous of the stages and the controller.
///
/// Unlike `std::sync::Barrier` it can be abandoned, releasing every waiter, when one party will
/// never arrive (e.g. the controller thread failed to spawn).
#[derive(Debug)]
pub struct StartGate {
    parties: usize,
    state: Mutex<GateState>,
    cvar: Condvar,
}

impl StartGate {
    pub fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(GateState::default()),
            cvar: Condvar::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Block until every party has arrived. Returns `false` if the gate was abandoned.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        state.arrived += 1;
        if state.arrived >= self.parties {
            state.open = true;
            self.cvar.notify_all();
        }
        while !state.open && !state.abandoned {
            self.cvar.wait(&mut state);
        }
        !state.abandoned
    }

    /// Release every current and future waiter without opening the gate.
    pub fn abandon(&self) {
        let mut state = self.state.lock();
        if !state.open {
            state.abandoned = true;
            self.cvar.notify_all();
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

/// Stop flag, start gate, quota table, and run timing of one controller run.
#[derive(Debug)]
pub struct ControllerContext {
    stop: AtomicBool,
    gate: StartGate,
    quotas: QuotaTable,
    init: Mutex<Vec<InitStatus>>,
    started: Mutex<Option<(Instant, SystemTime)>>,
    finished: Mutex<Option<Instant>>,
}

impl ControllerContext {
    /// Context for a pipeline of `stage_count` stages plus one controller.
    pub fn new(stage_count: usize) -> Self {
        Self {
            stop: AtomicBool::new(false),
            gate: StartGate::new(stage_count + 1),
            quotas: QuotaTable::new(stage_count.saturating_sub(1)),
            init: Mutex::new(vec![InitStatus::Pending; stage_count]),
            started: Mutex::new(None),
            finished: Mutex::new(None),
        }
    }

    pub fn stage_count(&self) -> usize {
        self.init.lock().len()
    }

    pub fn quotas(&self) -> &QuotaTable {
        &self.quotas
    }

    pub fn gate(&self) -> &StartGate {
        &self.gate
    }

    /// Arrive at the start gate. `false` means the run was abandoned before it began.
    pub fn rendezvous(&self) -> bool {
        self.gate.wait()
    }

    /// Ask the controller (and any stage that polls the flag) to stop.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Stop everything, including parties still waiting at the start gate.
    pub fn abort(&self) {
        self.request_stop();
        self.gate.abandon();
    }

    pub fn record_init(&self, stage: usize, status: InitStatus) {
        if let Some(slot) = self.init.lock().get_mut(stage) {
            *slot = status;
        }
    }

    pub fn init_status(&self, stage: usize) -> Option<InitStatus> {
        self.init.lock().get(stage).copied()
    }

    /// First stage whose init was refused for lack of privilege.
    pub fn first_denied(&self) -> Option<(usize, InitStatus)> {
        self.init
            .lock()
            .iter()
            .enumerate()
            .find(|(_, status)| matches!(status, InitStatus::Denied { .. }))
            .map(|(stage, status)| (stage, *status))
    }

    /// Record the timing baseline. Only the first call has an effect.
    pub fn mark_started(&self, at: Instant) {
        let mut started = self.started.lock();
        if started.is_none() {
            *started = Some((at, SystemTime::now()));
        }
    }

    pub fn mark_finished(&self, at: Instant) {
        let mut finished = self.finished.lock();
        if finished.is_none() {
            *finished = Some(at);
        }
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started.lock().map(|(at, _)| at)
    }

    /// Wall-clock time of the timing baseline.
    pub fn started_wall(&self) -> Option<SystemTime> {
        self.started.lock().map(|(_, wall)| wall)
    }

    /// Time between the start gate and the sink draining its last item.
    pub fn run_time(&self) -> Option<std::time::Duration> {
        let start = self.started_at()?;
        let end = (*self.finished.lock())?;
        Some(end.saturating_duration_since(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn gate_opens_when_all_arrive() {
        let gate = Arc::new(StartGate::new(3));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let gate = gate.clone();
                thread::spawn(move || gate.wait())
            })
            .collect();
        assert!(gate.wait());
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert!(gate.is_open());
    }

    #[test]
    fn abandoned_gate_releases_waiters() {
        let gate = Arc::new(StartGate::new(2));
        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait())
        };
        thread::sleep(Duration::from_millis(10));
        gate.abandon();
        assert!(!waiter.join().unwrap());
        assert!(!gate.wait());
    }

    #[test]
    fn stop_flag_round_trip() {
        let ctx = ControllerContext::new(4);
        assert!(!ctx.should_stop());
        ctx.request_stop();
        assert!(ctx.should_stop());
        assert_eq!(ctx.quotas().len(), 3);
    }

    #[test]
    fn first_denied_stage_is_reported() {
        let ctx = ControllerContext::new(3);
        ctx.record_init(0, InitStatus::Committed);
        ctx.record_init(2, InitStatus::Denied { errno: Some(1) });
        assert_eq!(ctx.init_status(1), Some(InitStatus::Pending));
        assert_eq!(
            ctx.first_denied(),
            Some((2, InitStatus::Denied { errno: Some(1) }))
        );
    }

    #[test]
    fn run_time_needs_both_marks() {
        let ctx = ControllerContext::new(2);
        let start = Instant::now();
        assert_eq!(ctx.run_time(), None);
        ctx.mark_started(start);
        ctx.mark_started(start + Duration::from_secs(9));
        ctx.mark_finished(start + Duration::from_millis(30));
        assert_eq!(ctx.run_time(), Some(Duration::from_millis(30)));
    }
}
