//! In-memory gateway used for dry runs and tests.
//!
//! Behaves like the kernel for the checks the controller depends on: attributes outside
//! `0 < runtime < period == deadline` fail with `EINVAL`, a first deadline commit without
//! affinity fails with `EPERM`, and an optional aggregate admission limit fails with `EBUSY`.
//! Failures can be injected per thread. The call log is opt-in ([`InMemoryGateway::recording`]),
//! so a dry run keeps its memory flat no matter how long it runs.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;

use super::SchedulingGateway;
use crate::error::GatewayError;
use crate::runtime::StageTid;
use crate::sched_attr::SchedAttr;

/// One recorded gateway invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayCall {
    Get(StageTid),
    Set {
        tid: StageTid,
        runtime: u64,
        set_affinity: bool,
        ok: bool,
    },
}

#[derive(Default)]
struct State {
    threads: HashMap<StageTid, SchedAttr>,
    failing_gets: HashMap<StageTid, i32>,
    /// Successful sets still allowed before the injected failure, and its errno.
    failing_sets: HashMap<StageTid, (u32, i32)>,
    deny_all: bool,
    admission_capacity: Option<f64>,
    /// `None` unless built with [`InMemoryGateway::recording`].
    calls: Option<Vec<GatewayCall>>,
}

impl State {
    fn log(&mut self, call: GatewayCall) {
        if let Some(calls) = self.calls.as_mut() {
            calls.push(call);
        }
    }
}

/// Fake scheduler keeping attributes in a map keyed by thread id.
#[derive(Default)]
pub struct InMemoryGateway {
    state: Mutex<State>,
}

impl InMemoryGateway {
    /// Gateway without a call log, as used for dry runs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gateway that keeps every call for [`calls`](Self::calls) and [`set_count`](Self::set_count).
    pub fn recording() -> Self {
        let gateway = Self::default();
        gateway.state.lock().calls = Some(Vec::new());
        gateway
    }

    /// Reject any set that would push the summed utilization of all deadline threads above
    /// `capacity` (in CPUs), like the kernel's root-domain admission test.
    pub fn with_admission_capacity(capacity: f64) -> Self {
        let gateway = Self::default();
        gateway.state.lock().admission_capacity = Some(capacity);
        gateway
    }

    /// Seed a thread's attributes without going through `set_attributes`.
    pub fn insert(&self, tid: StageTid, attr: SchedAttr) {
        self.state.lock().threads.insert(tid, attr);
    }

    /// Current attributes of `tid`, if known.
    pub fn attributes(&self, tid: StageTid) -> Option<SchedAttr> {
        self.state.lock().threads.get(&tid).copied()
    }

    /// Make every `get_attributes(tid)` fail with `errno` until [`clear_get_failure`] is called.
    ///
    /// [`clear_get_failure`]: InMemoryGateway::clear_get_failure
    pub fn fail_gets(&self, tid: StageTid, errno: i32) {
        self.state.lock().failing_gets.insert(tid, errno);
    }

    pub fn clear_get_failure(&self, tid: StageTid) {
        self.state.lock().failing_gets.remove(&tid);
    }

    /// Make the next `set_attributes(tid, ..)` fail once with `errno`.
    pub fn fail_next_set(&self, tid: StageTid, errno: i32) {
        self.fail_nth_set(tid, 1, errno);
    }

    /// Let `nth - 1` sets on `tid` succeed, then fail the next one once with `errno`.
    pub fn fail_nth_set(&self, tid: StageTid, nth: u32, errno: i32) {
        self.state
            .lock()
            .failing_sets
            .insert(tid, (nth.saturating_sub(1), errno));
    }

    /// Reject every set with `EPERM`, as for a process without `CAP_SYS_NICE`.
    pub fn deny_all(&self) {
        self.state.lock().deny_all = true;
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().calls.is_some()
    }

    /// Every call issued so far, in order. Empty unless the gateway is recording.
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().calls.clone().unwrap_or_default()
    }

    /// Number of `set_attributes` calls issued so far (successful or not).
    pub fn set_count(&self) -> usize {
        self.state.lock().calls.as_deref().map_or(0, |calls| {
            calls
                .iter()
                .filter(|call| matches!(call, GatewayCall::Set { .. }))
                .count()
        })
    }

    /// Thread ids with stored attributes, sorted.
    pub fn known_threads(&self) -> Vec<StageTid> {
        let mut tids: Vec<StageTid> = self.state.lock().threads.keys().copied().collect();
        tids.sort();
        tids
    }

    pub fn clear_calls(&self) {
        if let Some(calls) = self.state.lock().calls.as_mut() {
            calls.clear();
        }
    }

    /// Summed utilization of every deadline thread.
    pub fn total_utilization(&self) -> f64 {
        total_utilization(&self.state.lock().threads, None)
    }
}

fn total_utilization(threads: &HashMap<StageTid, SchedAttr>, replacing: Option<StageTid>) -> f64 {
    threads
        .iter()
        .filter(|(tid, attr)| attr.is_deadline() && Some(**tid) != replacing)
        .map(|(_, attr)| attr.utilization())
        .sum()
}

fn errno_error(op: &'static str, tid: StageTid, errno: i32) -> GatewayError {
    GatewayError::os(op, tid, io::Error::from_raw_os_error(errno))
}

impl SchedulingGateway for InMemoryGateway {
    fn get_attributes(&self, tid: StageTid) -> Result<SchedAttr, GatewayError> {
        let mut state = self.state.lock();
        state.log(GatewayCall::Get(tid));
        if let Some(errno) = state.failing_gets.get(&tid) {
            return Err(errno_error("sched_getattr", tid, *errno));
        }
        state
            .threads
            .get(&tid)
            .copied()
            .ok_or(GatewayError::UnknownThread(tid))
    }

    fn set_attributes(
        &self,
        tid: StageTid,
        attr: &SchedAttr,
        set_affinity: bool,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        let was_deadline = state
            .threads
            .get(&tid)
            .map(SchedAttr::is_deadline)
            .unwrap_or(false);

        let injected = match state.failing_sets.get_mut(&tid) {
            Some((0, errno)) => {
                let errno = *errno;
                state.failing_sets.remove(&tid);
                Some(errno)
            }
            Some((remaining, _)) => {
                *remaining -= 1;
                None
            }
            None => None,
        };

        let failure = if state.deny_all {
            Some(libc::EPERM)
        } else if injected.is_some() {
            injected
        } else if attr.is_deadline() && !attr.is_valid() {
            Some(libc::EINVAL)
        } else if attr.is_deadline() && !was_deadline && !set_affinity {
            Some(libc::EPERM)
        } else if let Some(capacity) = state.admission_capacity {
            let others = total_utilization(&state.threads, Some(tid));
            if attr.is_deadline() && others + attr.utilization() > capacity + f64::EPSILON {
                Some(libc::EBUSY)
            } else {
                None
            }
        } else {
            None
        };

        state.log(GatewayCall::Set {
            tid,
            runtime: attr.runtime,
            set_affinity,
            ok: failure.is_none(),
        });
        if let Some(errno) = failure {
            return Err(errno_error("sched_setattr", tid, errno));
        }
        let mut stored = *attr;
        stored.size = SchedAttr::SIZE;
        state.threads.insert(tid, stored);
        Ok(())
    }
}
