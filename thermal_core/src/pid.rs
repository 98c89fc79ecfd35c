//! Heater regulation strategies.
//!
//! A zone owns exactly one `RegulationStrategy`, chosen at startup from the
//! configured capability (PID, bang-bang or open loop). The cadence feeds it
//! the freshly linearized temperature once per cycle; the returned output is
//! on the 0..=255 scale and gets halved into the 7-bit PWM duty downstream.

use std::fmt::Debug;

/// Filter weight of the previous derivative term.
pub const PID_K1: f32 = 0.95;
/// Largest output the integral term alone may drive.
pub const INTEGRAL_DRIVE_MAX: f32 = 255.0;

/// Gains in per-second units, as an operator enters them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

pub trait RegulationStrategy: Send + Debug {
    /// Compute this cycle's output (0..=255) for `input` against `target`.
    fn output(&mut self, input: f32, target: f32, now_ms: u64) -> u8;

    /// Replace gains. Strategies without gains ignore the call and return false.
    fn set_gains(&mut self, _gains: PidGains) -> bool {
        false
    }

    fn gains(&self) -> Option<PidGains> {
        None
    }

    /// Forget accumulated state (integral, filtered derivative, timers).
    fn reset(&mut self);

    fn name(&self) -> &'static str;

    /// Full-scale output of this zone.
    fn max_output(&self) -> u8;
}

/// Internal PID bookkeeping, exposed read-only for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PidState {
    pub error: f32,
    pub integral_sum: f32,
    pub integral_min: f32,
    pub integral_max: f32,
    pub derivative_filtered: f32,
    pub previous_input: f32,
    pub reset_pending: bool,
}

/// Positional PID with derivative-on-measurement and conditional
/// un-integration at saturation.
#[derive(Debug, Clone)]
pub struct Pid {
    gains: PidGains,
    dt_s: f32,
    kp: f32,
    ki: f32,
    kd: f32,
    max_output: f32,
    state: PidState,
}

impl Pid {
    pub fn new(gains: PidGains, dt_s: f32, max_output: u8) -> Self {
        let mut pid = Self {
            gains,
            dt_s,
            kp: 0.0,
            ki: 0.0,
            kd: 0.0,
            max_output: f32::from(max_output),
            state: PidState {
                reset_pending: true,
                ..PidState::default()
            },
        };
        pid.apply_gains(gains);
        pid
    }

    fn apply_gains(&mut self, gains: PidGains) {
        self.gains = gains;
        self.kp = gains.kp;
        self.ki = gains.ki * self.dt_s;
        self.kd = if self.dt_s > 0.0 {
            gains.kd / self.dt_s
        } else {
            0.0
        };
        self.state.integral_min = 0.0;
        self.state.integral_max = if self.ki > 0.0 {
            INTEGRAL_DRIVE_MAX / self.ki
        } else {
            0.0
        };
        self.state.integral_sum = self
            .state
            .integral_sum
            .clamp(self.state.integral_min, self.state.integral_max);
    }

    pub fn state(&self) -> &PidState {
        &self.state
    }
}

impl RegulationStrategy for Pid {
    fn output(&mut self, input: f32, target: f32, _now_ms: u64) -> u8 {
        let s = &mut self.state;
        let out = if target <= 0.0 {
            s.reset_pending = true;
            0.0
        } else {
            s.error = target - input;
            if s.reset_pending {
                s.integral_sum = 0.0;
                s.derivative_filtered = 0.0;
                s.reset_pending = false;
            }
            let p = self.kp * s.error;
            s.integral_sum = (s.integral_sum + s.error).clamp(s.integral_min, s.integral_max);
            let i = self.ki * s.integral_sum;
            s.derivative_filtered =
                (self.kd * (input - s.previous_input)) * (1.0 - PID_K1) + PID_K1 * s.derivative_filtered;
            let mut out = p + i - s.derivative_filtered;
            if out > self.max_output {
                if s.error > 0.0 {
                    s.integral_sum -= s.error;
                }
                out = self.max_output;
            } else if out < 0.0 {
                if s.error < 0.0 {
                    s.integral_sum -= s.error;
                }
                out = 0.0;
            }
            s.integral_sum = s.integral_sum.clamp(s.integral_min, s.integral_max);
            out
        };
        s.previous_input = input;
        if out.is_nan() { 0 } else { out as u8 }
    }

    fn set_gains(&mut self, gains: PidGains) -> bool {
        self.apply_gains(gains);
        true
    }

    fn gains(&self) -> Option<PidGains> {
        Some(self.gains)
    }

    fn reset(&mut self) {
        self.state.integral_sum = 0.0;
        self.state.derivative_filtered = 0.0;
        self.state.reset_pending = true;
    }

    fn name(&self) -> &'static str {
        "pid"
    }

    fn max_output(&self) -> u8 {
        self.max_output as u8
    }
}

/// Full power below target, off at or above it, re-evaluated no more often
/// than `check_interval_ms`. A non-zero `hysteresis` holds the previous
/// decision inside `target ± hysteresis`.
#[derive(Debug, Clone)]
pub struct BangBang {
    max_output: u8,
    check_interval_ms: u64,
    hysteresis: f32,
    last_check_ms: Option<u64>,
    last_output: u8,
}

impl BangBang {
    pub fn new(max_output: u8, check_interval_ms: u64, hysteresis: f32) -> Self {
        Self {
            max_output,
            check_interval_ms,
            hysteresis,
            last_check_ms: None,
            last_output: 0,
        }
    }
}

impl RegulationStrategy for BangBang {
    fn output(&mut self, input: f32, target: f32, now_ms: u64) -> u8 {
        if target <= 0.0 {
            self.last_output = 0;
            return 0;
        }
        if let Some(last) = self.last_check_ms
            && now_ms.saturating_sub(last) < self.check_interval_ms
        {
            return self.last_output;
        }
        self.last_check_ms = Some(now_ms);
        self.last_output = if self.hysteresis > 0.0 {
            if input > target + self.hysteresis {
                0
            } else if input <= target - self.hysteresis {
                self.max_output
            } else {
                self.last_output
            }
        } else if input < target {
            self.max_output
        } else {
            0
        };
        self.last_output
    }

    fn reset(&mut self) {
        self.last_check_ms = None;
        self.last_output = 0;
    }

    fn name(&self) -> &'static str {
        "bang-bang"
    }

    fn max_output(&self) -> u8 {
        self.max_output
    }
}

/// Drives the target value straight through as output.
#[derive(Debug, Clone)]
pub struct OpenLoop {
    max_output: u8,
}

impl OpenLoop {
    pub fn new(max_output: u8) -> Self {
        Self { max_output }
    }
}

impl RegulationStrategy for OpenLoop {
    fn output(&mut self, _input: f32, target: f32, _now_ms: u64) -> u8 {
        target.clamp(0.0, f32::from(self.max_output)) as u8
    }

    fn reset(&mut self) {}

    fn name(&self) -> &'static str {
        "open-loop"
    }

    fn max_output(&self) -> u8 {
        self.max_output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOTEND: PidGains = PidGains {
        kp: 16.13,
        ki: 1.1625,
        kd: 56.23,
    };

    #[test]
    fn zero_target_outputs_zero_and_arms_reset() {
        let mut pid = Pid::new(HOTEND, 0.27, 255);
        for _ in 0..10 {
            pid.output(100.0, 200.0, 0);
        }
        assert!(pid.state().integral_sum > 0.0);
        assert_eq!(pid.output(100.0, 0.0, 0), 0);
        assert!(pid.state().reset_pending);
        pid.output(190.0, 200.0, 0);
        // integral restarted from zero with a single error sample
        assert!((pid.state().integral_sum - 10.0).abs() < 1e-4);
    }

    #[test]
    fn saturates_and_unwinds_integral() {
        let mut pid = Pid::new(HOTEND, 0.27, 255);
        let out = pid.output(20.0, 250.0, 0);
        assert_eq!(out, 255);
        // error was added and removed again
        assert_eq!(pid.state().integral_sum, 0.0);
    }

    #[test]
    fn integral_clamp_follows_ki() {
        let mut pid = Pid::new(HOTEND, 0.27, 255);
        let before = pid.state().integral_max;
        pid.set_gains(PidGains {
            ki: HOTEND.ki * 2.0,
            ..HOTEND
        });
        assert!((pid.state().integral_max - before / 2.0).abs() < 1e-3);
    }

    #[test]
    fn derivative_opposes_rising_input() {
        let mut pid = Pid::new(
            PidGains {
                kp: 0.0,
                ki: 0.0,
                kd: 10.0,
            },
            1.0,
            255,
        );
        pid.output(100.0, 200.0, 0);
        pid.output(110.0, 200.0, 0);
        assert!(pid.state().derivative_filtered > 0.0);
    }

    #[test]
    fn bang_bang_respects_interval_and_band() {
        let mut bb = BangBang::new(255, 5_000, 2.0);
        assert_eq!(bb.output(50.0, 60.0, 0), 255);
        // inside the interval the decision is held
        assert_eq!(bb.output(70.0, 60.0, 1_000), 255);
        assert_eq!(bb.output(63.0, 60.0, 5_000), 0);
        // inside the band keeps the last decision
        assert_eq!(bb.output(59.0, 60.0, 10_000), 0);
        assert_eq!(bb.output(58.0, 60.0, 15_000), 255);
    }

    #[test]
    fn open_loop_passes_target_through() {
        let mut ol = OpenLoop::new(200);
        assert_eq!(ol.output(0.0, 120.0, 0), 120);
        assert_eq!(ol.output(0.0, 300.0, 0), 200);
        assert_eq!(ol.output(0.0, -5.0, 0), 0);
    }
}
