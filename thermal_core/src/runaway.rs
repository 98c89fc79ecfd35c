//! Rate-of-rise supervision per heat zone.
//!
//! Polled from the cadence; acts at most once per `poll_ms`. While a zone
//! heats towards a new target it must gain a minimum number of degrees per
//! preheat window. Once it has arrived, it must stay within the hysteresis
//! band while power is applied.

use crate::fault::FaultKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunawayPhase {
    #[default]
    Inactive,
    Preheating,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunawayParams {
    pub hysteresis: f32,
    pub timeout_ms: u64,
    pub poll_ms: u64,
    /// Polls per preheat window.
    pub preheat_window: u16,
    /// Failing windows tolerated before PREHEAT is raised.
    pub preheat_violations: u16,
    pub is_bed: bool,
}

impl RunawayParams {
    /// Minimum rise expected over one preheat window at `current` °C.
    pub fn preheat_delta(&self, current: f32) -> f32 {
        if !self.is_bed {
            2.0
        } else if current > 105.0 {
            0.6
        } else if current > 90.0 {
            2.0
        } else {
            3.0
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Preheat {
    baseline: f32,
    samples: u16,
    violations: u16,
}

#[derive(Debug, Clone)]
pub struct RunawayTracker {
    params: RunawayParams,
    phase: RunawayPhase,
    target_snapshot: f32,
    last_poll_ms: Option<u64>,
    error_counter: u32,
    check_active: bool,
    preheat: Preheat,
}

impl RunawayTracker {
    pub fn new(params: RunawayParams) -> Self {
        Self {
            params,
            phase: RunawayPhase::Inactive,
            target_snapshot: 0.0,
            last_poll_ms: None,
            error_counter: 0,
            check_active: false,
            preheat: Preheat::default(),
        }
    }

    pub fn phase(&self) -> RunawayPhase {
        self.phase
    }

    pub fn error_counter(&self) -> u32 {
        self.error_counter
    }

    /// Evaluate one cadence cycle. Returns the fault to raise, if any.
    pub fn poll(&mut self, now_ms: u64, current: f32, target: f32, output: u8) -> Option<FaultKind> {
        if let Some(last) = self.last_poll_ms
            && now_ms.saturating_sub(last) < self.params.poll_ms
        {
            return None;
        }
        self.last_poll_ms = Some(now_ms);

        if output == 0 {
            self.check_active = false;
            self.error_counter = 0;
        }

        if (target - self.target_snapshot).abs() > f32::EPSILON {
            if target > 0.0 {
                self.phase = RunawayPhase::Preheating;
                self.target_snapshot = target;
                self.preheat = Preheat {
                    baseline: current,
                    ..Preheat::default()
                };
            } else {
                self.phase = RunawayPhase::Inactive;
                self.target_snapshot = 0.0;
            }
        }

        let mut fault = None;
        if self.phase == RunawayPhase::Preheating && current < target {
            self.preheat.samples += 1;
            if self.preheat.samples >= self.params.preheat_window {
                if current - self.preheat.baseline < self.params.preheat_delta(current) {
                    self.preheat.violations += 1;
                    if self.preheat.violations > self.params.preheat_violations {
                        tracing::warn!(current, target, "heating too slowly");
                        fault = Some(FaultKind::Preheat);
                        self.preheat.violations = 0;
                    }
                } else {
                    self.preheat.violations = 0;
                }
                self.preheat.baseline = current;
                self.preheat.samples = 0;
            }
        }

        if self.phase == RunawayPhase::Preheating && current > target - self.params.hysteresis {
            self.phase = RunawayPhase::Active;
            self.check_active = false;
            self.error_counter = 0;
        }

        if output > 0 {
            self.check_active = true;
        }
        if self.check_active {
            let in_band = current < target + self.params.hysteresis
                && current > target - self.params.hysteresis;
            if in_band {
                self.error_counter = 0;
            } else if self.phase == RunawayPhase::Active {
                self.error_counter += 1;
                let elapsed = u64::from(self.error_counter) * self.params.poll_ms * 2;
                if elapsed > self.params.timeout_ms {
                    tracing::warn!(current, target, "temperature left the regulation band");
                    fault = fault.or(Some(FaultKind::Runaway));
                }
            }
        }
        fault
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hotend() -> RunawayTracker {
        RunawayTracker::new(RunawayParams {
            hysteresis: 15.0,
            timeout_ms: 45_000,
            poll_ms: 2_000,
            preheat_window: 8,
            preheat_violations: 5,
            is_bed: false,
        })
    }

    #[test]
    fn target_change_enters_preheat() {
        let mut t = hotend();
        assert_eq!(t.poll(0, 25.0, 200.0, 255), None);
        assert_eq!(t.phase(), RunawayPhase::Preheating);
        t.poll(2_000, 25.0, 0.0, 0);
        assert_eq!(t.phase(), RunawayPhase::Inactive);
    }

    #[test]
    fn polls_are_rate_limited() {
        let mut t = hotend();
        t.poll(0, 25.0, 200.0, 255);
        // second call within the poll period does not count a sample
        for ms in (270..2_000).step_by(270) {
            assert_eq!(t.poll(ms, 25.0, 200.0, 255), None);
        }
        assert_eq!(t.preheat.samples, 1);
    }

    #[test]
    fn stuck_preheat_raises_after_tolerated_windows() {
        let mut t = hotend();
        let mut raised = None;
        let mut polls = 0u64;
        while raised.is_none() && polls < 100 {
            raised = t.poll(polls * 2_000, 25.0, 200.0, 255);
            polls += 1;
        }
        assert_eq!(raised, Some(FaultKind::Preheat));
        // six failing windows of eight polls
        assert_eq!(polls, 6 * 8);
    }

    #[test]
    fn preheat_is_raised_once_per_streak() {
        let mut t = hotend();
        let raised = (0..48u64)
            .filter_map(|i| t.poll(i * 2_000, 25.0, 200.0, 255))
            .collect::<Vec<_>>();
        assert_eq!(raised, vec![FaultKind::Preheat]);
        // the fault path drops the target and the heater output
        for i in 48..200u64 {
            assert_eq!(t.poll(i * 2_000, 25.0, 0.0, 0), None);
        }
        assert_eq!(t.phase(), RunawayPhase::Inactive);
    }

    #[test]
    fn steady_heating_passes_preheat() {
        let mut t = hotend();
        for i in 0..80u64 {
            let current = 25.0 + i as f32 * 3.0;
            assert_eq!(t.poll(i * 2_000, current.min(199.0), 200.0, 255), None);
        }
        assert_eq!(t.phase(), RunawayPhase::Active);
    }

    #[test]
    fn leaving_band_while_powered_raises_runaway() {
        let mut t = hotend();
        t.poll(0, 195.0, 200.0, 100);
        assert_eq!(t.phase(), RunawayPhase::Active);
        let mut n = 0u64;
        let mut raised = None;
        while raised.is_none() && n < 50 {
            n += 1;
            raised = t.poll(n * 2_000, 150.0, 200.0, 255);
        }
        assert_eq!(raised, Some(FaultKind::Runaway));
        // counter * 2000 * 2 > 45000 first holds at counter 12
        assert_eq!(t.error_counter(), 12);
    }

    #[test]
    fn in_band_or_unpowered_resets_counter() {
        let mut t = hotend();
        t.poll(0, 195.0, 200.0, 100);
        t.poll(2_000, 150.0, 200.0, 255);
        t.poll(4_000, 150.0, 200.0, 255);
        assert_eq!(t.error_counter(), 2);
        t.poll(6_000, 199.0, 200.0, 255);
        assert_eq!(t.error_counter(), 0);
        t.poll(8_000, 150.0, 200.0, 255);
        t.poll(10_000, 150.0, 200.0, 0);
        assert_eq!(t.error_counter(), 0);
    }

    #[test]
    fn bed_delta_schedule() {
        let p = RunawayParams {
            hysteresis: 5.0,
            timeout_ms: 360_000,
            poll_ms: 2_000,
            preheat_window: 16,
            preheat_violations: 3,
            is_bed: true,
        };
        assert_eq!(p.preheat_delta(60.0), 3.0);
        assert_eq!(p.preheat_delta(95.0), 2.0);
        assert_eq!(p.preheat_delta(110.0), 0.6);
    }
}
