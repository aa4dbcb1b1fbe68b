//! Thread identity, CPU affinity and busy-wait helpers shared by the pipeline and the gateway.

use std::io;
use std::time::{Duration, Instant};

use crate::runtime::StageTid;

/// Kernel thread id of the calling thread.
///
/// On Linux this is `gettid()`, the id `sched_setattr(2)` expects. Other platforms have no
/// equivalent; a process-unique counter stands in so in-memory gateways can still key on it.
pub fn current_tid() -> StageTid {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: SYS_gettid takes no arguments and cannot fail.
        let tid = unsafe { libc::syscall(libc::SYS_gettid) };
        StageTid(tid as i32)
    }
    #[cfg(not(target_os = "linux"))]
    {
        use std::sync::atomic::{AtomicI32, Ordering};
        static NEXT: AtomicI32 = AtomicI32::new(1);
        thread_local! {
            static TID: i32 = NEXT.fetch_add(1, Ordering::Relaxed);
        }
        StageTid(TID.with(|tid| *tid))
    }
}

/// Number of CPUs the process may run on.
pub fn online_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Widen the affinity of `tid` to every online CPU.
///
/// The kernel rejects `sched_setattr` with `EPERM` when a deadline thread's mask is narrower
/// than its root domain, so the mask must be full before the first deadline-policy commit.
///
/// # Platform Support
/// - **Linux**: `sched_setaffinity(tid, full mask)`
/// - **Other platforms**: no-op
pub fn set_full_affinity(tid: StageTid) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use libc::{cpu_set_t, sched_setaffinity, CPU_SET, CPU_SETSIZE, CPU_ZERO};

        let cpus = online_cpus().min(CPU_SETSIZE as usize);
        // SAFETY: cpu_set_t is plain data; CPU_* only touch bits inside the set.
        let rc = unsafe {
            let mut set: cpu_set_t = std::mem::zeroed();
            CPU_ZERO(&mut set);
            for cpu in 0..cpus {
                CPU_SET(cpu, &mut set);
            }
            sched_setaffinity(tid.as_raw(), std::mem::size_of::<cpu_set_t>(), &set)
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = tid;
    }
    Ok(())
}

/// Spin for `cost`, simulating CPU-bound work on a stage. The thread stays runnable throughout.
pub fn busy_wait(cost: Duration) {
    if cost.is_zero() {
        return;
    }
    let start = Instant::now();
    while start.elapsed() < cost {
        std::hint::spin_loop();
    }
}
