//! Thermal model self-calibration.
//!
//! The hotend is heated while the cadence is driven by hand and every cycle
//! is recorded. Capacity and resistance are then fitted one at a time with a
//! golden-section search that minimizes the model's mean absolute residual
//! over the recording. Fan losses are sampled at a few fan speeds and the
//! rest of the resistance table is interpolated.
//!
//! Waits are counted in cadence cycles.

use std::sync::Arc;

use crate::error::CalibrationError;
use crate::manager::{FALLBACK_AMBIENT, ZoneId};
use crate::model::{ModelInput, ModelSettings, ModelVar, R_SIZE, ThermalModel};
use crate::status::{StatusEvent, StatusReport};
use crate::system::{Drive, ThermalSystem};
use crate::util;

pub const GOLDEN_RATIO: f32 = 0.618_034;

const C_MIN: f32 = 5.0;
const C_MAX: f32 = 20.0;
const C_THRESHOLD: f32 = 0.01;
const C_ITERATIONS: u16 = 30;
const R_MIN: f32 = 5.0;
const R_MAX: f32 = 45.0;
const R_THRESHOLD: f32 = 0.01;
const R_ITERATIONS: u16 = 30;
/// Fan buckets between sampled resistance entries.
pub const R_STEP: usize = 4;
/// Settle margin below the target for `wait_temp`.
const TEMP_HYSTERESIS: f32 = 5.0;
/// Upper bound on any single heating/cooling wait.
const MAX_WAIT_MS: u64 = 20 * 60 * 1000;

/// One recorded cadence cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecEntry {
    pub temperature: f32,
    /// Hotend duty applied during the cycle (0..=127).
    pub duty: u8,
}

fn input(e: &RecEntry, fan_index: usize, ambient: f32) -> ModelInput {
    ModelInput {
        temperature: e.temperature,
        ambient,
        duty: e.duty,
        fan_speed: u8::try_from(fan_index << 4).unwrap_or(u8::MAX),
    }
}

/// Mean absolute model residual over `rec` with `var` set to `value`.
pub fn cost(
    model: &mut ThermalModel,
    rec: &[RecEntry],
    var: ModelVar,
    value: f32,
    fan_index: usize,
    ambient: f32,
) -> f32 {
    model.set_var(var, value);
    let Some((first, rest)) = rec.split_first() else {
        return f32::NAN;
    };
    model.reset(input(first, fan_index, ambient));
    let mut sum = 0.0;
    let mut count = 0u32;
    for e in rest {
        model.step(input(e, fan_index, ambient));
        let r = model.residual();
        if !r.is_nan() {
            sum += r.abs();
            count += 1;
        }
    }
    if count == 0 {
        f32::NAN
    } else {
        sum / count as f32
    }
}

fn section(bounds: [f32; 2]) -> [f32; 2] {
    let d = GOLDEN_RATIO * (bounds[1] - bounds[0]);
    [bounds[0] + d, bounds[1] - d]
}

/// Search `[min, max]` for the value of `var` minimizing [`cost`].
///
/// Returns `(value, relative_error)` once the bracket is narrower than
/// `threshold`, or `None` when the iteration budget runs out or the optimum
/// sits on a bound. `model` is left with `var` at the last probed value.
#[allow(clippy::too_many_arguments)]
pub fn golden_section(
    model: &mut ThermalModel,
    rec: &[RecEntry],
    var: ModelVar,
    min: f32,
    max: f32,
    threshold: f32,
    iterations: u16,
    fan_index: usize,
    ambient: f32,
) -> Option<(f32, f32)> {
    let mut bounds = [min, max];
    let mut points = section(bounds);
    for it in 0..iterations {
        let c1 = cost(model, rec, var, points[0], fan_index, ambient);
        let c2 = cost(model, rec, var, points[1], fan_index, ambient);
        let dir = usize::from(c2 < c1);
        bounds[dir] = points[1 - dir];
        points = section(bounds);
        let x = points[1 - dir];
        let e = (1.0 - GOLDEN_RATIO) * ((bounds[0] - bounds[1]) / x).abs();
        tracing::debug!(it, value = x, e, "estimate iteration");
        if e < threshold {
            if x <= min || x >= max {
                // optimum likely outside the search range
                break;
            }
            return Some((x, e));
        }
    }
    None
}

/// Fill resistance entries between sampled fan steps by linear interpolation.
/// Entries `R_SIZE-1, R_SIZE-1-R_STEP, ...` and `0` must already be set.
pub fn interpolate_resistance(r: &mut [f32; R_SIZE]) {
    let mut next = R_SIZE - 1;
    for i in (1..R_SIZE - 1).rev() {
        if (R_SIZE - i - 1) % R_STEP == 0 {
            next = i;
            continue;
        }
        let prev = next.saturating_sub(R_STEP);
        let f = (i - prev) as f32 / R_STEP as f32;
        let d = r[next] - r[prev];
        r[i] = r[prev] + d * f;
    }
}

impl ThermalSystem {
    /// Calibrate the thermal model of hotend 0 at `temperature` (°C, default
    /// from config). On success the model is re-enabled if it was before and
    /// the settings are saved when a store is configured.
    pub fn model_autotune(&mut self, temperature: Option<f32>) -> Result<ModelSettings, CalibrationError> {
        if self.busy() {
            tracing::warn!("printer busy, refusing model autotune");
            return Err(CalibrationError::Busy);
        }
        let cal_temp = temperature.unwrap_or(self.autotune.model_temperature);
        tracing::info!(cal_temp, "thermal model autotune start");
        self.notify(StatusReport::new(StatusEvent::AutotuneStarted));

        let was_enabled = {
            let mut mgr = self.cadence.guard();
            let enabled = mgr.model().enabled();
            mgr.model_mut().set_enabled(false);
            enabled
        };

        let res = self.autotune_passes(cal_temp);
        self.set_hotend0_target(0);

        match res {
            Err(e) => {
                if self.fault().is_some() {
                    self.set_fan_speed(u8::MAX);
                }
                tracing::warn!(error = %e, "thermal model autotune failed");
                self.notify(StatusReport::new(StatusEvent::AutotuneFailed));
                Err(e)
            }
            Ok(()) => {
                self.set_fan_speed(0);
                self.cadence.guard().model_mut().set_enabled(was_enabled);
                let settings = self.model_report();
                self.notify(StatusReport::new(StatusEvent::AutotuneFinished));
                if self.has_store()
                    && let Err(e) = self.model_save()
                {
                    tracing::warn!(error = %e, "failed to persist calibrated model");
                }
                Ok(settings)
            }
        }
    }

    fn autotune_passes(&mut self, cal_temp: f32) -> Result<(), CalibrationError> {
        let low = self.autotune.model_low_temperature;
        let target = cal_temp.clamp(0.0, f32::from(u16::MAX)) as u16;
        self.set_fan_speed(0);

        for pass in 0..2 {
            let verb = if pass == 0 { "initial" } else { "refining" };
            self.set_hotend0_target(0);
            if self.temperatures().hotends[0] >= low {
                tracing::info!(low, "cooling down");
                self.cooldown(low)?;
                self.wait_ms(10_000)?;
            }

            tracing::info!(verb, "capacity estimation");
            self.set_hotend0_target(target);
            self.record()?;
            self.estimate(ModelVar::Capacity, C_MIN, C_MAX, C_THRESHOLD, C_ITERATIONS, 0)?;
            self.wait_temp()?;
            if pass == 1 {
                break;
            }

            self.wait_ms(30_000)?;
            tracing::info!(verb, cal_temp, "resistance estimation");
            self.record()?;
            self.estimate(ModelVar::Resistance(0), R_MIN, R_MAX, R_THRESHOLD, R_ITERATIONS, 0)?;
        }

        // start from full fan speed and step down
        self.set_fan_speed(u8::MAX);
        self.wait_ms(30_000)?;
        let r0 = self.cadence.guard().model().var(ModelVar::Resistance(0));
        for i in (1..R_SIZE).rev().step_by(R_STEP) {
            let speed = u8::try_from(256 / R_SIZE * (i + 1) - 1).unwrap_or(u8::MAX);
            self.set_fan_speed(speed);
            self.wait_ms(10_000)?;
            tracing::info!(index = i, speed, "fan resistance estimation");
            self.record()?;
            self.estimate(ModelVar::Resistance(i), R_MIN, r0, R_THRESHOLD, R_ITERATIONS, i)?;
        }

        let mut mgr = self.cadence.guard();
        let mut r = mgr.model().params().r;
        interpolate_resistance(&mut r);
        for (i, v) in r.iter().enumerate() {
            mgr.model_mut().set_var(ModelVar::Resistance(i), *v);
        }
        Ok(())
    }

    fn estimate(
        &mut self,
        var: ModelVar,
        min: f32,
        max: f32,
        threshold: f32,
        iterations: u16,
        fan_index: usize,
    ) -> Result<f32, CalibrationError> {
        let ambient = self.temperatures().ambient.unwrap_or(FALLBACK_AMBIENT);
        let mut model = self.cadence.guard().model().clone();
        // a high resistance gives a usable initial capacity guess
        if matches!(var, ModelVar::Capacity) && model.var(ModelVar::Resistance(0)).is_nan() {
            model.set_var(ModelVar::Resistance(0), R_MAX);
        }
        let name = match var {
            ModelVar::Capacity => "capacity",
            ModelVar::Resistance(_) => "resistance",
        };
        match golden_section(&mut model, &self.rec, var, min, max, threshold, iterations, fan_index, ambient) {
            Some((value, e)) => {
                tracing::info!(?var, value, e, "estimate converged");
                self.cadence.guard().model_mut().set_var(var, value);
                Ok(value)
            }
            None => {
                tracing::warn!(?var, "estimate did not converge");
                Err(CalibrationError::NotConverged(name))
            }
        }
    }

    /// Record `record_samples` cycles with the cadence driven by hand.
    fn record(&mut self) -> Result<usize, CalibrationError> {
        let samples = self.autotune.record_samples;
        let max_idle = self.cycles_for(MAX_WAIT_MS) * 4;
        self.rec.clear();

        let cadence = Arc::clone(&self.cadence);
        let mut mgr = cadence.guard();
        let mut idle = 0u64;
        while self.rec.len() < samples {
            if !cadence.tick_locked(&mut mgr) {
                idle += 1;
                if idle > max_idle {
                    return Err(CalibrationError::TimedOut);
                }
                self.clock.sleep(self.interval / 4);
                continue;
            }
            if mgr.fault().active() {
                return Err(CalibrationError::Interrupted);
            }
            self.rec.push(RecEntry {
                temperature: mgr.temperatures().hotends[0],
                duty: self.duties.heater(0),
            });
            match &mut self.drive {
                Drive::Manual { pwm } => pwm.run_period(),
                Drive::Threaded { .. } => self.clock.sleep(self.interval),
            }
        }
        Ok(self.rec.len())
    }

    fn cycles_for(&self, ms: u64) -> u64 {
        util::cycles_for(ms, util::interval_ms(self.interval))
    }

    fn wait_ms(&mut self, ms: u64) -> Result<(), CalibrationError> {
        let n = self.cycles_for(ms);
        if self.wait_cycles(n) {
            Ok(())
        } else {
            Err(CalibrationError::Interrupted)
        }
    }

    /// Wait until hotend 0 is within `TEMP_HYSTERESIS` of its target.
    fn wait_temp(&mut self) -> Result<(), CalibrationError> {
        let limit = self.cycles + self.cycles_for(MAX_WAIT_MS);
        loop {
            let target = f32::from(self.target(ZoneId::Hotend(0)).unwrap_or(0));
            if self.temperatures().hotends[0] >= target - TEMP_HYSTERESIS {
                return Ok(());
            }
            if self.fault().is_some() {
                return Err(CalibrationError::Interrupted);
            }
            if self.cycles > limit {
                return Err(CalibrationError::TimedOut);
            }
            self.idle();
        }
    }

    /// Cool hotend 0 below `temp` with the fan at full speed. Stops early
    /// close to ambient so it cannot get stuck.
    fn cooldown(&mut self, temp: f32) -> Result<(), CalibrationError> {
        let old_speed = self.fan_speed();
        self.set_fan_speed(u8::MAX);
        let limit = self.cycles + self.cycles_for(MAX_WAIT_MS);
        let res = loop {
            let current = self.temperatures().hotends[0];
            if current < temp {
                break Ok(());
            }
            if self.fault().is_some() {
                break Err(CalibrationError::Interrupted);
            }
            let ta_corr = self.cadence.guard().model().params().ta_corr;
            let ambient = self.temperatures().ambient.unwrap_or(FALLBACK_AMBIENT) + ta_corr;
            if current < ambient + TEMP_HYSTERESIS {
                break Ok(());
            }
            if self.cycles > limit {
                break Err(CalibrationError::TimedOut);
            }
            self.idle();
        };
        self.set_fan_speed(old_speed);
        res
    }
}
