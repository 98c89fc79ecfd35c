//! Lumped first-order thermal model of hotend 0.
//!
//! Each cycle predicts the temperature change from heater power and losses
//! to ambient through a fan-dependent resistance, delays the prediction
//! through a short lag line to match sensor latency, and compares it with
//! the measured change. The filtered residual drives a warning and a fatal
//! fault threshold (both expressed in K/s and scaled to the cycle).

use crate::error::ThermalError;

/// Resistance table entries (fan speed buckets).
pub const R_SIZE: usize = 16;
/// Lag-line depth in cycles.
pub const LAG_SIZE: usize = 8;
/// Prediction smoothing weight.
pub const FILTER_S: f32 = 0.065;
/// Residual smoothing weight.
pub const FILTER_E: f32 = 0.05;
/// Full-scale heater duty.
const DUTY_FULL: f32 = 127.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    /// Heater power (W).
    pub p: f32,
    /// Heat capacity (J/K).
    pub c: f32,
    /// Ambient correction (K).
    pub ta_corr: f32,
    /// Thermal resistance per fan bucket (K/W).
    pub r: [f32; R_SIZE],
    /// Warning threshold (K/s).
    pub warn: f32,
    /// Error threshold (K/s).
    pub err: f32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            p: 38.0,
            c: f32::NAN,
            ta_corr: -7.0,
            r: [f32::NAN; R_SIZE],
            warn: 1.2,
            err: 1.74,
        }
    }
}

impl ModelParams {
    /// True when every parameter the prediction needs is non-negative and
    /// set (`NaN` fails every comparison).
    pub fn calibrated(&self) -> bool {
        self.p >= 0.0
            && self.c >= 0.0
            && self.r.iter().all(|r| *r >= 0.0)
            && !self.ta_corr.is_nan()
            && !self.warn.is_nan()
            && !self.err.is_nan()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub params: ModelParams,
    pub enabled: bool,
    pub warn_beep: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            params: ModelParams::default(),
            enabled: false,
            warn_beep: true,
        }
    }
}

/// Inputs sampled by the cadence for one model step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelInput {
    pub temperature: f32,
    pub ambient: f32,
    /// Heater duty applied during the last interval (0..=127).
    pub duty: u8,
    /// Fan speed (0..=255).
    pub fan_speed: u8,
}

/// Model variable tuned by the calibration search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVar {
    Capacity,
    Resistance(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModelCheck {
    pub fault: bool,
    /// Filtered residual (K per cycle) while above the warning threshold.
    pub warning: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct ThermalModel {
    settings: ModelSettings,
    interval_s: f32,
    c_i: f32,
    warn_s: f32,
    err_s: f32,
    lag: [f32; LAG_SIZE],
    lag_idx: usize,
    prev_t: f32,
    err_filtered: f32,
    uninitialized: bool,
    warning: bool,
    error: bool,
}

pub fn fan_bucket(fan_speed: u8) -> usize {
    usize::from(fan_speed >> 4)
}

impl ThermalModel {
    pub fn new(settings: ModelSettings, interval_s: f32) -> Self {
        let mut m = Self {
            settings,
            interval_s,
            c_i: 0.0,
            warn_s: 0.0,
            err_s: 0.0,
            lag: [0.0; LAG_SIZE],
            lag_idx: 0,
            prev_t: 0.0,
            err_filtered: 0.0,
            uninitialized: true,
            warning: false,
            error: false,
        };
        m.setup();
        m
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    pub fn params(&self) -> &ModelParams {
        &self.settings.params
    }

    pub fn calibrated(&self) -> bool {
        self.settings.params.calibrated()
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn interval_s(&self) -> f32 {
        self.interval_s
    }

    /// Filtered residual of the last step (K per cycle).
    pub fn residual(&self) -> f32 {
        self.err_filtered
    }

    /// Re-evaluate the enable gate and request a re-seed on the next check.
    /// The warning threshold is clamped to the error threshold here.
    pub fn setup(&mut self) {
        let params = &mut self.settings.params;
        if params.warn > params.err {
            params.warn = params.err;
        }
        if !self.calibrated() {
            self.settings.enabled = false;
        }
        self.uninitialized = true;
    }

    /// Enable or disable detection. Enabling an uncalibrated model is refused.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        self.settings.enabled = enabled;
        self.setup();
        self.settings.enabled == enabled
    }

    pub fn set_warn_beep(&mut self, beep: bool) {
        self.settings.warn_beep = beep;
    }

    /// Update any subset of the scalar parameters. Values that are NaN or not
    /// positive are ignored (the ambient correction only has to be a number).
    /// The warning threshold is kept at or below the error threshold.
    pub fn set_params(
        &mut self,
        c: Option<f32>,
        p: Option<f32>,
        ta_corr: Option<f32>,
        warn: Option<f32>,
        err: Option<f32>,
    ) {
        let params = &mut self.settings.params;
        let positive = |v: Option<f32>| v.filter(|v| *v > 0.0);
        if let Some(c) = positive(c) {
            params.c = c;
        }
        if let Some(p) = positive(p) {
            params.p = p;
        }
        if let Some(t) = ta_corr.filter(|t| !t.is_nan()) {
            params.ta_corr = t;
        }
        if let Some(e) = positive(err) {
            params.err = e;
        }
        if let Some(w) = positive(warn) {
            params.warn = w;
        }
        self.setup();
    }

    pub fn set_resistance(&mut self, index: usize, r: f32) -> Result<(), ThermalError> {
        if index >= R_SIZE {
            return Err(ThermalError::InvalidParameter("resistance index out of range"));
        }
        if !(r > 0.0) {
            return Err(ThermalError::InvalidParameter("resistance must be > 0"));
        }
        self.settings.params.r[index] = r;
        self.setup();
        Ok(())
    }

    /// Restore factory defaults (uncalibrated, disabled, beep on).
    pub fn reset_settings(&mut self) {
        self.settings = ModelSettings::default();
        self.setup();
    }

    /// Adopt persisted settings, reverting to defaults when they are not usable.
    pub fn load(&mut self, settings: ModelSettings) {
        self.settings = settings;
        if !self.calibrated() {
            tracing::info!("stored thermal model is not calibrated, using defaults");
            self.settings = ModelSettings::default();
        }
        self.setup();
    }

    pub fn var(&self, var: ModelVar) -> f32 {
        match var {
            ModelVar::Capacity => self.settings.params.c,
            ModelVar::Resistance(i) => self.settings.params.r.get(i).copied().unwrap_or(f32::NAN),
        }
    }

    /// Raw write used by the calibration search; bypasses validation.
    pub fn set_var(&mut self, var: ModelVar, value: f32) {
        match var {
            ModelVar::Capacity => self.settings.params.c = value,
            ModelVar::Resistance(i) => {
                if let Some(slot) = self.settings.params.r.get_mut(i) {
                    *slot = value;
                }
            }
        }
    }

    /// Seed the filters from the current reading and run one step.
    pub fn reset(&mut self, input: ModelInput) {
        let params = &self.settings.params;
        self.c_i = self.interval_s / params.c;
        self.warn_s = params.warn * self.interval_s;
        self.err_s = params.err * self.interval_s;
        self.lag = [0.0; LAG_SIZE];
        self.lag_idx = 0;
        self.err_filtered = 0.0;
        self.prev_t = input.temperature;
        self.step(input);
        self.uninitialized = false;
    }

    /// Advance the model by one cycle.
    pub fn step(&mut self, input: ModelInput) {
        let params = &self.settings.params;
        let heater_scale = f32::from(input.duty) / DUTY_FULL;
        let ambient = input.ambient + params.ta_corr;
        let r = params.r[fan_bucket(input.fan_speed).min(R_SIZE - 1)];

        let d_p = params.p * heater_scale;
        let d_pl = (input.temperature - ambient) / r;
        let d_t = (d_p - d_pl) * self.c_i;

        let next = (self.lag_idx + 1) % LAG_SIZE;
        let d_t_lag = self.lag[next];
        let d_t_f = self.lag[self.lag_idx] * (1.0 - FILTER_S) + d_t * FILTER_S;
        self.lag[next] = d_t_f;
        self.lag_idx = next;

        let d_t_err = (input.temperature - self.prev_t) - d_t_lag;
        self.err_filtered = self.err_filtered * (1.0 - FILTER_E) + d_t_err * FILTER_E;
        self.prev_t = input.temperature;

        self.error = self.err_filtered.abs() > self.err_s;
        self.warning = self.err_filtered.abs() > self.warn_s;
    }

    /// Cadence entry point: no-op unless enabled, re-seeds when required.
    pub fn check(&mut self, input: ModelInput) -> ModelCheck {
        if !self.settings.enabled {
            return ModelCheck::default();
        }
        if self.uninitialized {
            self.reset(input);
        }
        self.step(input);
        ModelCheck {
            fault: self.error,
            warning: self.warning.then_some(self.err_filtered),
        }
    }
}
