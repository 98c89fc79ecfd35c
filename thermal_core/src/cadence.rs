//! Sampling cadence and the background threads that drive it.
//!
//! `Cadence` is the state shared between the periodic cadence context and
//! the task side. The cadence context takes the pending frame, restarts the
//! sampling peripheral and runs the manager; a task-side `CadenceGuard`
//! excludes it for the duration of a critical section.
//!
//! Safety: each `Periodic` owns exactly one thread, shut down and joined when
//! the `Periodic` is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thermal_traits::{AnalogSampler, Clock};

use crate::bridge::SampleBridge;
use crate::guard::CadenceGuard;
use crate::hw_error::map_hw_error;
use crate::manager::TempMgr;

pub struct Cadence {
    mgr: Mutex<TempMgr>,
    enabled: AtomicBool,
    samples_ready: AtomicBool,
    bridge: SampleBridge,
    sampler: Mutex<Box<dyn AnalogSampler>>,
}

impl Cadence {
    pub(crate) fn new(mgr: TempMgr, bridge: SampleBridge, sampler: Box<dyn AnalogSampler>) -> Self {
        Self {
            mgr: Mutex::new(mgr),
            enabled: AtomicBool::new(true),
            samples_ready: AtomicBool::new(false),
            bridge,
            sampler: Mutex::new(sampler),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TempMgr> {
        self.mgr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn enabled_flag(&self) -> &AtomicBool {
        &self.enabled
    }

    /// Exclude the cadence until the guard is dropped.
    pub fn guard(&self) -> CadenceGuard<'_> {
        CadenceGuard::new(self)
    }

    /// Periodic entry point. Returns true when a frame was processed.
    pub fn tick(&self) -> bool {
        let mut mgr = self.lock();
        if !self.enabled.load(Ordering::Acquire) {
            return false;
        }
        self.tick_locked(&mut mgr)
    }

    /// Process the pending frame with the manager already held. Used by the
    /// cadence itself and by procedures that drive cycles by hand.
    pub(crate) fn tick_locked(&self, mgr: &mut TempMgr) -> bool {
        let Some(frame) = self.bridge.take() else {
            return false;
        };
        self.start_cycle();
        mgr.tick(&frame);
        self.samples_ready.store(true, Ordering::Release);
        true
    }

    /// Request the next conversion cycle from the peripheral.
    pub(crate) fn start_cycle(&self) {
        let mut sampler = self.sampler.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = sampler.start_cycle() {
            let err = map_hw_error(e.as_ref());
            tracing::warn!(error = %err, "failed to start sampling cycle");
        }
    }

    /// Consume the "new temperatures" flag.
    pub(crate) fn take_ready(&self) -> bool {
        self.samples_ready.swap(false, Ordering::AcqRel)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.bridge.dropped()
    }
}

/// A thread calling `f` every `period` until dropped.
pub struct Periodic {
    shutdown: Arc<AtomicBool>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl Periodic {
    pub fn spawn<C, F>(name: &str, period: Duration, clock: C, mut f: F) -> std::io::Result<Self>
    where
        C: Clock + Send + 'static,
        F: FnMut() + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);
        let join_handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut next = clock.now();
                loop {
                    if shutdown_clone.load(Ordering::Relaxed) {
                        break;
                    }
                    f();
                    next += period;
                    let now = clock.now();
                    if next > now {
                        clock.sleep(next - now);
                    } else {
                        // overran; do not try to catch up
                        next = now;
                    }
                }
                tracing::trace!("periodic thread exiting cleanly");
            })?;
        Ok(Self {
            shutdown,
            join_handle: Some(join_handle),
        })
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.join_handle.take() {
            match handle.join() {
                Ok(()) => tracing::trace!("periodic thread joined"),
                Err(e) => tracing::warn!(?e, "periodic thread panicked during shutdown"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use thermal_traits::ManualClock;

    #[test]
    fn periodic_runs_and_joins_on_drop() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let p = Periodic::spawn("test-periodic", Duration::from_millis(1), ManualClock::new(), move || {
            c.fetch_add(1, Ordering::Relaxed);
        })
        .expect("spawn");
        while count.load(Ordering::Relaxed) < 10 {
            std::thread::yield_now();
        }
        drop(p);
        let after = count.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(count.load(Ordering::Relaxed), after);
    }
}
