//! Relay PID autotune.
//!
//! The zone is driven bang-bang around the target with an adaptive bias.
//! Once the oscillation is established the ultimate gain and period are
//! measured and Ziegler-Nichols gains derived from them. The result is
//! returned, not applied.

use std::f32::consts::PI;

use crate::error::CalibrationError;
use crate::fault::FaultKind;
use crate::manager::ZoneId;
use crate::pid::PidGains;
use crate::status::{StatusEvent, StatusReport};
use crate::system::ThermalSystem;
use crate::util;

/// Minimum time between relay transitions.
const DWELL_MS: u64 = 5_000;
/// Abort when the zone overshoots the target by this much.
const OVERSHOOT: f32 = 20.0;
/// Total relay time limit.
const TIMEOUT_MS: u64 = 20 * 60 * 1000;
/// Spacing of the no-rise safety polls.
const SAFETY_POLL_MS: u64 = 2_000;
const SAFETY_POLLS_HOTEND: u8 = 10;
const SAFETY_POLLS_BED: u8 = 45;
/// Minimum rise expected over the safety window.
const SAFETY_MIN_RISE: f32 = 5.0;
/// The adaptive bias stays this far from either rail.
const BIAS_MARGIN: i64 = 20;

/// Ultimate gain and period of a relay oscillation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Oscillation {
    pub ku: f32,
    pub tu: f32,
}

impl Oscillation {
    /// Relay amplitude `d` and the observed temperature swing.
    pub fn measure(d: i64, max: f32, min: f32, t_low_ms: u64, t_high_ms: u64) -> Self {
        let ku = (4.0 * d as f32) / (PI * (max - min) * 0.5);
        let tu = (t_low_ms + t_high_ms) as f32 / 1000.0;
        Self { ku, tu }
    }

    /// Classic Ziegler-Nichols PID gains.
    pub fn gains(self) -> PidGains {
        let kp = 0.6 * self.ku;
        PidGains {
            kp,
            ki: 2.0 * kp / self.tu,
            kd: kp * self.tu / 8.0,
        }
    }
}

/// Relay state between cadence cycles.
#[derive(Debug)]
struct Relay {
    max_out: i64,
    bias: i64,
    d: i64,
    heating: bool,
    t1: u64,
    t2: u64,
    t_high: u64,
    t_low: u64,
    max: f32,
    min: f32,
    cycle: u8,
    gains: Option<PidGains>,
}

impl Relay {
    fn new(max_out: u8, now: u64) -> Self {
        let max_out = i64::from(max_out);
        Self {
            max_out,
            bias: max_out / 2,
            d: max_out / 2,
            heating: true,
            t1: now,
            t2: now,
            t_high: 0,
            t_low: 0,
            max: 0.0,
            min: 10_000.0,
            cycle: 0,
            gains: None,
        }
    }

    fn output(&self) -> u8 {
        let out = if self.heating { self.bias + self.d } else { self.bias - self.d };
        u8::try_from(out.clamp(0, self.max_out)).unwrap_or(u8::MAX)
    }

    /// Feed one reading. Returns the new output when the relay switched.
    fn step(&mut self, input: f32, target: f32, now: u64) -> Option<u8> {
        self.max = self.max.max(input);
        self.min = self.min.min(input);

        if self.heating && input > target && now - self.t2 > DWELL_MS {
            self.heating = false;
            self.t1 = now;
            self.t_high = self.t1 - self.t2;
            self.max = target;
            return Some(self.output());
        }
        if !self.heating && input < target && now - self.t1 > DWELL_MS {
            self.heating = true;
            self.t2 = now;
            self.t_low = self.t2 - self.t1;
            if self.cycle > 0 {
                self.adapt();
            }
            self.cycle += 1;
            self.min = target;
            return Some(self.output());
        }
        None
    }

    fn adapt(&mut self) {
        let total = i64::try_from(self.t_low + self.t_high).unwrap_or(i64::MAX).max(1);
        let skew = i64::try_from(self.t_high).unwrap_or(i64::MAX) - i64::try_from(self.t_low).unwrap_or(i64::MAX);
        self.bias += self.d * skew / total;
        self.bias = self.bias.clamp(BIAS_MARGIN, self.max_out - BIAS_MARGIN);
        self.d = if self.bias > self.max_out / 2 {
            self.max_out - 1 - self.bias
        } else {
            self.bias
        };
        tracing::debug!(bias = self.bias, d = self.d, min = self.min, max = self.max, "relay adapted");
        if self.cycle > 2 {
            let osc = Oscillation::measure(self.d, self.max, self.min, self.t_low, self.t_high);
            let gains = osc.gains();
            tracing::info!(ku = osc.ku, tu = osc.tu, kp = gains.kp, ki = gains.ki, kd = gains.kd, "relay cycle");
            self.gains = Some(gains);
        }
    }

    fn elapsed(&self, now: u64) -> u64 {
        (now - self.t1) + (now - self.t2)
    }
}

/// Detects a heater that is powered but not warming up.
#[derive(Debug, Default)]
struct NoRiseCheck {
    polls: u8,
    start: f32,
    next_ms: u64,
}

impl NoRiseCheck {
    /// Returns true when the window elapsed without enough rise.
    fn poll(&mut self, input: f32, now: u64, window: u8) -> bool {
        if now < self.next_ms {
            return false;
        }
        self.next_ms = now + SAFETY_POLL_MS;
        if self.polls == 0 {
            self.start = input;
        }
        if self.polls < window {
            self.polls += 1;
            return false;
        }
        if self.polls == window {
            self.polls += 1;
            return (input - self.start).abs() < SAFETY_MIN_RISE;
        }
        false
    }
}

impl ThermalSystem {
    /// Run a relay autotune on `zone` around `temperature` °C for `cycles`
    /// oscillations (config default when `None`). The zone is handed back
    /// to its regulator with a zero target afterwards.
    pub fn pid_autotune(
        &mut self,
        zone: ZoneId,
        temperature: f32,
        cycles: Option<u8>,
    ) -> Result<PidGains, CalibrationError> {
        if self.busy() {
            tracing::warn!("printer busy, refusing PID autotune");
            return Err(CalibrationError::Busy);
        }
        self.target(zone).map_err(|_| CalibrationError::InvalidZone)?;
        let ncycles = cycles.unwrap_or(self.autotune.pid_cycles);
        tracing::info!(?zone, temperature, ncycles, "PID autotune start");
        self.notify(StatusReport::new(StatusEvent::AutotuneStarted));

        let res = self.relay(zone, temperature, ncycles);

        self.cadence.guard().set_manual(zone, None);
        if let Err(e) = self.set_target(zone, 0) {
            tracing::warn!(error = %e, ?zone, "could not clear the autotune target");
        }

        match res {
            Ok(gains) => {
                tracing::info!(kp = gains.kp, ki = gains.ki, kd = gains.kd, "PID autotune finished");
                self.notify(StatusReport::new(StatusEvent::AutotuneFinished));
                Ok(gains)
            }
            Err(e) => {
                tracing::warn!(error = %e, "PID autotune failed");
                self.notify(StatusReport::new(StatusEvent::AutotuneFailed));
                Err(e)
            }
        }
    }

    fn relay(&mut self, zone: ZoneId, target: f32, ncycles: u8) -> Result<PidGains, CalibrationError> {
        let interval_ms = util::interval_ms(self.interval);
        let now = |cycles: u64| util::cycles_to_ms(cycles, interval_ms);
        let window = match zone {
            ZoneId::Hotend(_) => SAFETY_POLLS_HOTEND,
            ZoneId::Bed => SAFETY_POLLS_BED,
        };
        let mut relay = {
            let mut mgr = self.cadence.guard();
            let max_out = mgr.zone(zone).map_or(u8::MAX, |z| z.regulator.max_output());
            let relay = Relay::new(max_out, now(self.cycles));
            mgr.set_manual(zone, Some(relay.output()));
            relay
        };
        let mut no_rise = NoRiseCheck::default();
        self.set_target(zone, target.clamp(0.0, f32::from(u16::MAX)) as u16)
            .map_err(|_| CalibrationError::InvalidZone)?;

        let mut seen = self.cycles;
        loop {
            self.idle();
            if self.fault().is_some() {
                return Err(CalibrationError::Interrupted);
            }
            if self.cycles == seen {
                continue;
            }
            seen = self.cycles;
            let t = now(seen);
            let input = self.temperature(zone).unwrap_or(f32::NAN);

            if let Some(out) = relay.step(input, target, t) {
                self.cadence.guard().set_manual(zone, Some(out));
            }
            if input > target + OVERSHOOT {
                return Err(CalibrationError::Overshoot);
            }
            if no_rise.poll(input, t, window) {
                let index = match zone {
                    ZoneId::Hotend(i) => i,
                    ZoneId::Bed => 0,
                };
                self.cadence.guard().raise(zone.source(), index, FaultKind::Preheat);
                return Err(CalibrationError::NoRise);
            }
            if relay.elapsed(t) > TIMEOUT_MS {
                return Err(CalibrationError::TimedOut);
            }
            if relay.cycle > ncycles {
                return relay.gains.ok_or(CalibrationError::NotConverged("pid gains"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn ziegler_nichols_from_oscillation() {
        // d = 127, swing 4 K, period 40 s
        let osc = Oscillation::measure(127, 202.0, 198.0, 20_000, 20_000);
        assert!((osc.tu - 40.0).abs() < 1e-4);
        let expected_ku = 4.0 * 127.0 / (PI * 2.0);
        assert!((osc.ku - expected_ku).abs() < 1e-3);
        let g = osc.gains();
        assert!((g.kp - 0.6 * expected_ku).abs() < 1e-3);
        assert!((g.ki - 2.0 * g.kp / 40.0).abs() < 1e-4);
        assert!((g.kd - g.kp * 5.0).abs() < 1e-3);
    }

    #[test]
    fn relay_respects_dwell_time() {
        let mut r = Relay::new(255, 0);
        assert_eq!(r.output(), 254);
        // above target but too soon after the last switch
        assert_eq!(r.step(210.0, 200.0, 4_000), None);
        assert_eq!(r.step(210.0, 200.0, 6_000), Some(0));
        assert!(!r.heating);
        assert_eq!(r.t_high, 6_000);
        // below target but too soon
        assert_eq!(r.step(190.0, 200.0, 10_000), None);
        assert_eq!(r.step(190.0, 200.0, 12_000), Some(254));
        assert_eq!(r.t_low, 6_000);
        assert_eq!(r.cycle, 1);
    }

    #[rstest]
    #[case(30_000, 10_000)]
    #[case(10_000, 30_000)]
    #[case(1, 100_000)]
    fn adapted_bias_stays_off_the_rails(#[case] t_high: u64, #[case] t_low: u64) {
        let mut r = Relay::new(255, 0);
        r.cycle = 1;
        r.t_high = t_high;
        r.t_low = t_low;
        r.adapt();
        assert!((BIAS_MARGIN..=255 - BIAS_MARGIN).contains(&r.bias));
        assert!(r.bias + r.d <= 255);
        assert!(r.bias - r.d >= 0);
        assert!(r.gains.is_none());
    }

    #[test]
    fn gains_appear_after_third_cycle() {
        let mut r = Relay::new(255, 0);
        r.cycle = 3;
        r.t_high = 20_000;
        r.t_low = 20_000;
        r.max = 203.0;
        r.min = 197.0;
        r.adapt();
        let g = r.gains.expect("gains");
        assert!(g.kp > 0.0 && g.ki > 0.0 && g.kd > 0.0);
    }

    #[test]
    fn no_rise_fires_after_window() {
        let mut c = NoRiseCheck::default();
        let mut fired = false;
        for i in 0..=u64::from(SAFETY_POLLS_HOTEND) {
            fired |= c.poll(25.0 + i as f32 * 0.1, i * SAFETY_POLL_MS, SAFETY_POLLS_HOTEND);
        }
        assert!(fired);
    }

    #[test]
    fn rising_zone_passes_safety_window() {
        let mut c = NoRiseCheck::default();
        let mut fired = false;
        for i in 0..=u64::from(SAFETY_POLLS_HOTEND) * 3 {
            fired |= c.poll(25.0 + i as f32, i * SAFETY_POLL_MS, SAFETY_POLLS_HOTEND);
        }
        assert!(!fired);
    }
}
