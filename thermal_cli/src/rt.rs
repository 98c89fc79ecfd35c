//! Real-time setup for the cadence threads: SCHED_FIFO, CPU affinity and
//! mlockall on Linux, mlockall alone on other unix targets.
//!
//! Must run before the thermal system is built: the cadence and PWM threads
//! inherit scheduling policy and affinity from the thread that spawns them.

use std::sync::OnceLock;

use crate::cli::RtLock;

static RT_ONCE: OnceLock<()> = OnceLock::new();

#[derive(Copy, Clone, Debug)]
pub struct RtOpts {
    pub prio: Option<i32>,
    pub lock: RtLock,
    pub cpu: Option<usize>,
}

#[cfg(unix)]
fn os_result(rc: libc::c_int) -> std::io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn apply_mem_lock(lock: RtLock) -> eyre::Result<()> {
    use libc::{MCL_CURRENT, MCL_FUTURE, mlockall};

    let flags = match lock {
        RtLock::None => return Ok(()),
        RtLock::Current => MCL_CURRENT,
        RtLock::All => MCL_CURRENT | MCL_FUTURE,
    };
    let Err(err) = os_result(unsafe { mlockall(flags) }) else {
        return Ok(());
    };
    let retryable = matches!(err.raw_os_error(), Some(code) if code == libc::EPERM || code == libc::ENOMEM);
    // Locking future pages is the first thing a tight memlock limit refuses.
    if lock == RtLock::All && retryable && os_result(unsafe { mlockall(MCL_CURRENT) }).is_ok() {
        tracing::warn!(error = %err, "mlockall(current|future) refused, locked current pages only");
        return Ok(());
    }
    let mut msg = format!("mlockall failed: {err}");
    if retryable {
        msg.push_str("; hint: needs CAP_IPC_LOCK (or root) and a sufficient 'ulimit -l'");
    }
    Err(eyre::eyre!(msg))
}

#[cfg(target_os = "linux")]
fn apply_fifo_priority(prio: Option<i32>) -> eyre::Result<()> {
    use libc::{SCHED_FIFO, sched_get_priority_max, sched_get_priority_min, sched_param, sched_setscheduler};

    let (min, max) = unsafe {
        let min = sched_get_priority_min(SCHED_FIFO);
        let max = sched_get_priority_max(SCHED_FIFO);
        if min < 0 || max < 0 { (1, 99) } else { (min, max) }
    };
    let param = sched_param {
        sched_priority: prio.unwrap_or(max).clamp(min, max),
    };
    os_result(unsafe { sched_setscheduler(0, SCHED_FIFO, &param) }).map_err(|e| {
        eyre::eyre!("sched_setscheduler(SCHED_FIFO) failed: {e}; hint: needs CAP_SYS_NICE or root")
    })
}

#[cfg(target_os = "linux")]
fn apply_affinity(cpu: Option<usize>) -> eyre::Result<()> {
    use libc::{CPU_ISSET, CPU_SET, CPU_ZERO, cpu_set_t, sched_getaffinity, sched_setaffinity};

    let bits = std::mem::size_of::<cpu_set_t>() * 8;
    let target = cpu.unwrap_or(0);
    if target >= bits {
        eyre::bail!("requested CPU {target} exceeds cpu_set_t capacity {bits}");
    }
    let mut allowed: cpu_set_t = unsafe { std::mem::zeroed() };
    os_result(unsafe { sched_getaffinity(0, std::mem::size_of::<cpu_set_t>(), &mut allowed) })
        .map_err(|e| eyre::eyre!("sched_getaffinity failed: {e}"))?;
    if !unsafe { CPU_ISSET(target, &allowed) } {
        eyre::bail!("CPU {target} not permitted by current affinity mask");
    }
    let mut desired: cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe {
        CPU_ZERO(&mut desired);
        CPU_SET(target, &mut desired);
    }
    os_result(unsafe { sched_setaffinity(0, std::mem::size_of::<cpu_set_t>(), &desired) })
        .map_err(|e| eyre::eyre!("sched_setaffinity failed: {e}"))
}

/// Apply the real-time settings once per process. Failures are logged and
/// the controller keeps running with normal scheduling.
pub fn setup_rt_once(opts: RtOpts) {
    RT_ONCE.get_or_init(|| {
        #[cfg(unix)]
        {
            match apply_mem_lock(opts.lock) {
                Ok(()) => tracing::info!(lock = ?opts.lock, "RT: memory lock applied"),
                Err(err) => tracing::warn!(error = %err, "RT: memory not locked"),
            }
        }

        #[cfg(target_os = "linux")]
        {
            if let Err(err) = apply_fifo_priority(opts.prio) {
                tracing::warn!(error = %err, "RT: SCHED_FIFO not applied");
            }
            if let Err(err) = apply_affinity(opts.cpu) {
                tracing::warn!(error = %err, "RT: affinity not applied");
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            tracing::warn!(
                prio = ?opts.prio,
                cpu = ?opts.cpu,
                "RT: SCHED_FIFO and affinity are unavailable on this OS"
            );
        }
    });
}
