//! `sched_getattr(2)` / `sched_setattr(2)` gateway.

use std::io;

use super::SchedulingGateway;
use crate::error::GatewayError;
use crate::runtime::StageTid;
use crate::sched_attr::SchedAttr;
use crate::threading::set_full_affinity;

/// Gateway issuing the raw scheduler syscalls. Stateless; every call hits the kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxGateway;

impl LinuxGateway {
    pub fn new() -> Self {
        LinuxGateway
    }
}

#[cfg(target_os = "linux")]
impl SchedulingGateway for LinuxGateway {
    fn get_attributes(&self, tid: StageTid) -> Result<SchedAttr, GatewayError> {
        let mut attr = SchedAttr::default();
        // SAFETY: attr is a valid, writable sched_attr of the advertised size.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_sched_getattr,
                tid.as_raw(),
                &mut attr as *mut SchedAttr,
                SchedAttr::SIZE,
                0u32,
            )
        };
        if rc != 0 {
            return Err(GatewayError::os(
                "sched_getattr",
                tid,
                io::Error::last_os_error(),
            ));
        }
        Ok(attr)
    }

    fn set_attributes(
        &self,
        tid: StageTid,
        attr: &SchedAttr,
        set_affinity: bool,
    ) -> Result<(), GatewayError> {
        if set_affinity {
            set_full_affinity(tid).map_err(|e| GatewayError::os("sched_setaffinity", tid, e))?;
        }
        let mut attr = *attr;
        attr.size = SchedAttr::SIZE;
        // SAFETY: attr is a valid sched_attr that outlives the call.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_sched_setattr,
                tid.as_raw(),
                &attr as *const SchedAttr,
                0u32,
            )
        };
        if rc != 0 {
            return Err(GatewayError::os(
                "sched_setattr",
                tid,
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl SchedulingGateway for LinuxGateway {
    fn get_attributes(&self, _tid: StageTid) -> Result<SchedAttr, GatewayError> {
        Err(GatewayError::Unsupported)
    }

    fn set_attributes(
        &self,
        _tid: StageTid,
        _attr: &SchedAttr,
        _set_affinity: bool,
    ) -> Result<(), GatewayError> {
        Err(GatewayError::Unsupported)
    }
}

/// Fraction of each CPU the kernel admits for real-time and deadline tasks.
///
/// Reads `sched_rt_runtime_us / sched_rt_period_us` from procfs. A runtime of `-1` disables
/// throttling and yields `1.0`. Returns `None` when the files are missing or unparsable.
pub fn kernel_admission_ratio() -> Option<f64> {
    let runtime = read_proc_i64("/proc/sys/kernel/sched_rt_runtime_us")?;
    let period = read_proc_i64("/proc/sys/kernel/sched_rt_period_us")?;
    parse_admission_ratio(runtime, period)
}

fn read_proc_i64(path: &str) -> Option<i64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn parse_admission_ratio(runtime_us: i64, period_us: i64) -> Option<f64> {
    if runtime_us < 0 {
        return Some(1.0);
    }
    if period_us <= 0 {
        return None;
    }
    Some((runtime_us as f64 / period_us as f64).min(1.0))
}
