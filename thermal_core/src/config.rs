//! Runtime configuration for the thermal core.
//!
//! These are the resolved structs the builder consumes. They are separate
//! from the TOML-deserialized config in `thermal_config`; sensors are already
//! turned into conversion tables here.

use std::borrow::Cow;
use std::time::Duration;

use crate::model::ModelSettings;
use crate::pid::PidGains;
use crate::runaway::RunawayParams;
use crate::sensor::{BedOffset, Sensor};
use crate::tables::EPCOS_100K;

/// Sampling cadence and PWM modulator timing.
#[derive(Debug, Clone)]
pub struct CadenceCfg {
    /// Period of one sampling cycle (ms).
    pub interval_ms: u64,
    /// Period of one software PWM tick.
    pub pwm_tick: Duration,
}

impl Default for CadenceCfg {
    fn default() -> Self {
        Self {
            interval_ms: 270,
            pwm_tick: Duration::from_micros(500),
        }
    }
}

impl CadenceCfg {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn interval_s(&self) -> f32 {
        self.interval_ms as f32 / 1000.0
    }
}

/// Regulation capability of a zone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegulationCfg {
    Pid(PidGains),
    BangBang {
        check_interval_ms: u64,
        hysteresis: f32,
    },
    OpenLoop,
}

/// One heat zone (hotend or bed).
#[derive(Debug, Clone)]
pub struct ZoneCfg {
    pub sensor: Sensor,
    pub mintemp: f32,
    pub maxtemp: f32,
    /// Grace period before MINTEMP is enforced after heating starts.
    pub min_delay_ms: u64,
    pub regulation: RegulationCfg,
    /// Output ceiling on the 0..=255 scale.
    pub max_output: u8,
    pub runaway: RunawayParams,
}

impl ZoneCfg {
    pub fn hotend() -> Self {
        Self {
            sensor: Sensor::Table(Cow::Borrowed(&EPCOS_100K)),
            mintemp: 15.0,
            maxtemp: 305.0,
            min_delay_ms: 15_000,
            regulation: RegulationCfg::Pid(PidGains {
                kp: 16.13,
                ki: 1.1625,
                kd: 56.23,
            }),
            max_output: 255,
            runaway: RunawayParams {
                hysteresis: 15.0,
                timeout_ms: 45_000,
                poll_ms: 2_000,
                preheat_window: 8,
                preheat_violations: 5,
                is_bed: false,
            },
        }
    }

    pub fn bed() -> Self {
        Self {
            sensor: Sensor::Table(Cow::Borrowed(&EPCOS_100K)),
            mintemp: 10.0,
            maxtemp: 125.0,
            min_delay_ms: 50_000,
            regulation: RegulationCfg::Pid(PidGains {
                kp: 126.13,
                ki: 4.30,
                kd: 924.76,
            }),
            max_output: 255,
            runaway: RunawayParams {
                hysteresis: 5.0,
                timeout_ms: 360_000,
                poll_ms: 2_000,
                preheat_window: 16,
                preheat_violations: 3,
                is_bed: true,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct AmbientCfg {
    pub sensor: Sensor,
    pub mintemp: f32,
    pub maxtemp: f32,
    /// Below this the MINTEMP grace logic applies; above it MINTEMP is immediate.
    pub low_ambient: f32,
}

#[derive(Debug, Clone)]
pub struct PindaCfg {
    pub sensor: Sensor,
    /// Minimum reading for probe temperature compensation to be usable.
    pub compensation_min: f32,
}

/// Model autotune and PID autotune settings.
#[derive(Debug, Clone)]
pub struct AutotuneCfg {
    pub model_temperature: f32,
    pub model_low_temperature: f32,
    pub record_samples: usize,
    pub pid_cycles: u8,
}

impl Default for AutotuneCfg {
    fn default() -> Self {
        Self {
            model_temperature: 230.0,
            model_low_temperature: 50.0,
            record_samples: 256,
            pid_cycles: 5,
        }
    }
}

/// Everything the builder needs besides the collaborators.
#[derive(Debug, Clone)]
pub struct ThermalConfig {
    pub cadence: CadenceCfg,
    pub hotends: Vec<ZoneCfg>,
    pub bed: ZoneCfg,
    pub bed_offset: Option<BedOffset>,
    pub ambient: Option<AmbientCfg>,
    pub pinda: Option<PindaCfg>,
    /// Model seed used when the settings store has nothing usable.
    pub model: ModelSettings,
    pub autotune: AutotuneCfg,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            cadence: CadenceCfg::default(),
            hotends: vec![ZoneCfg::hotend()],
            bed: ZoneCfg::bed(),
            bed_offset: None,
            ambient: None,
            pinda: None,
            model: ModelSettings::default(),
            autotune: AutotuneCfg::default(),
        }
    }
}
