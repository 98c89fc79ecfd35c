//! Absolute temperature limits evaluated on raw readings.
//!
//! Thresholds are derived once at startup by walking the sensor's raw range
//! in oversample-sized steps until the linearized value crosses the limit.
//! The cadence then compares raw counts only.

use crate::error::BuildError;
use crate::sensor::{OVERSAMPLE, Polarity, RAW_FULL_SCALE, Sensor};

/// Margin above MINTEMP that marks a zone as having heated up this session.
pub const MINTEMP_HYSTERESIS: f32 = 5.0;

/// A raw count standing in for a temperature limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawThreshold {
    pub raw: u16,
    polarity: Polarity,
}

impl RawThreshold {
    /// Threshold for "colder than `celsius`", probed from the cold end.
    pub fn cold(sensor: &Sensor, celsius: f32, name: &'static str) -> Result<Self, BuildError> {
        let polarity = sensor.polarity();
        let (mut raw, step): (i32, i32) = match polarity {
            Polarity::Falling => (i32::from(RAW_FULL_SCALE), -i32::from(OVERSAMPLE)),
            Polarity::Rising => (0, i32::from(OVERSAMPLE)),
        };
        while sensor.to_celsius(clamp_raw(raw)) < celsius {
            raw += step;
            if !(0..=i32::from(RAW_FULL_SCALE)).contains(&raw) {
                return Err(BuildError::LimitOutOfRange(name));
            }
        }
        Ok(Self {
            raw: clamp_raw(raw),
            polarity,
        })
    }

    /// Threshold for "hotter than `celsius`", probed from the hot end.
    pub fn hot(sensor: &Sensor, celsius: f32, name: &'static str) -> Result<Self, BuildError> {
        let polarity = sensor.polarity();
        let (mut raw, step): (i32, i32) = match polarity {
            Polarity::Falling => (0, i32::from(OVERSAMPLE)),
            Polarity::Rising => (i32::from(RAW_FULL_SCALE), -i32::from(OVERSAMPLE)),
        };
        while sensor.to_celsius(clamp_raw(raw)) > celsius {
            raw += step;
            if !(0..=i32::from(RAW_FULL_SCALE)).contains(&raw) {
                return Err(BuildError::LimitOutOfRange(name));
            }
        }
        Ok(Self {
            raw: clamp_raw(raw),
            polarity,
        })
    }

    /// Reading is at or beyond the threshold on the cold side.
    pub fn is_colder(&self, raw: u16) -> bool {
        match self.polarity {
            Polarity::Falling => raw >= self.raw,
            Polarity::Rising => raw <= self.raw,
        }
    }

    /// Reading is at or beyond the threshold on the hot side.
    pub fn is_hotter(&self, raw: u16) -> bool {
        match self.polarity {
            Polarity::Falling => raw <= self.raw,
            Polarity::Rising => raw >= self.raw,
        }
    }
}

fn clamp_raw(raw: i32) -> u16 {
    u16::try_from(raw.clamp(0, i32::from(RAW_FULL_SCALE))).unwrap_or(RAW_FULL_SCALE)
}

/// MINTEMP/MAXTEMP pair for one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawLimits {
    pub min: RawThreshold,
    pub max: RawThreshold,
    pub mintemp: f32,
    pub maxtemp: f32,
}

impl RawLimits {
    pub fn probe(sensor: &Sensor, mintemp: f32, maxtemp: f32) -> Result<Self, BuildError> {
        Ok(Self {
            min: RawThreshold::cold(sensor, mintemp, "mintemp")?,
            max: RawThreshold::hot(sensor, maxtemp, "maxtemp")?,
            mintemp,
            maxtemp,
        })
    }
}

/// Delays MINTEMP enforcement after heating is switched on.
///
/// The check runs once the grace timer has expired, or immediately when the
/// zone has already been above `mintemp + MINTEMP_HYSTERESIS` while heating.
#[derive(Debug, Clone, Default)]
pub struct MinTempGate {
    delay_ms: u64,
    checking: bool,
    timer_start: Option<u64>,
}

impl MinTempGate {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            checking: false,
            timer_start: None,
        }
    }

    /// Returns true when MINTEMP must be evaluated this cycle.
    pub fn should_check(&mut self, now_ms: u64, current: f32, target: f32, mintemp: f32) -> bool {
        if target > mintemp {
            self.checking |= current > mintemp + MINTEMP_HYSTERESIS;
            let expired = match self.timer_start {
                Some(start) if now_ms.saturating_sub(start) >= self.delay_ms => {
                    self.timer_start = None;
                    true
                }
                _ => false,
            };
            if expired || self.timer_start.is_none() || self.checking {
                self.checking = true;
                return true;
            }
            false
        } else {
            self.timer_start = Some(now_ms);
            self.checking = false;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::EPCOS_100K;
    use std::borrow::Cow;

    fn ntc() -> Sensor {
        Sensor::Table(Cow::Borrowed(&EPCOS_100K))
    }

    #[test]
    fn ntc_limits_bracket_the_configured_temperatures() {
        let s = ntc();
        let lim = RawLimits::probe(&s, 15.0, 275.0).expect("probe");
        assert!(s.to_celsius(lim.min.raw) >= 15.0);
        assert!(s.to_celsius(lim.min.raw + OVERSAMPLE) < 15.0);
        assert!(s.to_celsius(lim.max.raw) <= 275.0);
        assert!(s.to_celsius(lim.max.raw - OVERSAMPLE) > 275.0);
        // open thermistor reads full scale, shorted reads 0
        assert!(lim.min.is_colder(RAW_FULL_SCALE));
        assert!(lim.max.is_hotter(0));
        assert!(!lim.min.is_colder(700 * 16));
        assert!(!lim.max.is_hotter(700 * 16));
    }

    #[test]
    fn rising_sensor_limits() {
        let lim = RawLimits::probe(&Sensor::Max6675, 10.0, 400.0).expect("probe");
        assert!(lim.min.is_colder(0));
        assert!(lim.max.is_hotter(1600));
        assert!(!lim.max.is_hotter(800));
    }

    #[test]
    fn unreachable_limit_is_a_build_error() {
        assert_eq!(
            RawLimits::probe(&ntc(), 350.0, 400.0),
            Err(BuildError::LimitOutOfRange("mintemp"))
        );
    }

    #[test]
    fn gate_waits_for_delay_then_checks_every_cycle() {
        let mut gate = MinTempGate::new(15_000);
        assert!(!gate.should_check(0, 20.0, 0.0, 15.0));
        assert!(!gate.should_check(1_000, 20.0, 200.0, 15.0));
        assert!(!gate.should_check(15_999, 20.0, 200.0, 15.0));
        assert!(gate.should_check(16_000, 20.0, 200.0, 15.0));
        assert!(gate.should_check(16_270, 20.0, 200.0, 15.0));
    }

    #[test]
    fn gate_short_circuits_once_heated() {
        let mut gate = MinTempGate::new(15_000);
        assert!(!gate.should_check(0, 20.0, 0.0, 15.0));
        assert!(gate.should_check(270, 21.0, 200.0, 15.0));
        // stays armed even after cooling while the target remains set
        assert!(gate.should_check(540, 10.0, 200.0, 15.0));
        // target off resets the session
        assert!(!gate.should_check(810, 10.0, 0.0, 15.0));
        assert!(!gate.should_check(1_080, 10.0, 200.0, 15.0));
    }
}
