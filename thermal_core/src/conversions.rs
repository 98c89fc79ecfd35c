//! Conversions from `thermal_config` types to `thermal_core` types.
//!
//! Sensor specs can fail to resolve (unknown table name, unreadable CSV), so
//! the top-level conversion is a `TryFrom`; everything below it is a plain
//! `From`.

use std::borrow::Cow;

use eyre::WrapErr;

use crate::config::{AmbientCfg, AutotuneCfg, CadenceCfg, PindaCfg, RegulationCfg, ThermalConfig, ZoneCfg};
use crate::error::{BuildError, Report, Result};
use crate::model::{ModelParams, ModelSettings, R_SIZE};
use crate::pid::PidGains;
use crate::runaway::RunawayParams;
use crate::sensor::{BedOffset, Breakpoint, Sensor};
use crate::tables;

// ── Sensors ──────────────────────────────────────────────────────────────────

/// Resolve a configured sensor into its conversion.
pub fn sensor_from_spec(spec: &thermal_config::SensorSpec) -> Result<Sensor> {
    use thermal_config::SensorSpec;
    match spec {
        SensorSpec::Table { name } => tables::builtin(name)
            .map(|t| Sensor::Table(Cow::Borrowed(t)))
            .ok_or_else(|| Report::new(BuildError::UnknownSensorTable(name.clone()))),
        SensorSpec::Csv { path } => {
            let rows = thermal_config::load_sensor_table_csv(path)
                .wrap_err_with(|| format!("sensor table {}", path.display()))?;
            let points = rows
                .iter()
                .map(|r| Breakpoint {
                    raw: r.raw,
                    celsius: r.celsius,
                })
                .collect::<Vec<_>>();
            Ok(Sensor::Table(Cow::Owned(points)))
        }
        SensorSpec::Ad595 { gain, offset } => Ok(Sensor::Ad595 {
            gain: *gain,
            offset: *offset,
        }),
        SensorSpec::Max6675 => Ok(Sensor::Max6675),
    }
}

// ── Gains / cadence ──────────────────────────────────────────────────────────

impl From<&thermal_config::PidGains> for PidGains {
    fn from(g: &thermal_config::PidGains) -> Self {
        Self {
            kp: g.kp,
            ki: g.ki,
            kd: g.kd,
        }
    }
}

impl From<&thermal_config::CadenceCfg> for CadenceCfg {
    fn from(c: &thermal_config::CadenceCfg) -> Self {
        Self {
            interval_ms: c.interval_ms,
            pwm_tick: std::time::Duration::from_micros(c.pwm_tick_us),
        }
    }
}

impl From<&thermal_config::AutotuneCfg> for AutotuneCfg {
    fn from(c: &thermal_config::AutotuneCfg) -> Self {
        Self {
            model_temperature: c.model_temperature,
            model_low_temperature: c.model_low_temperature,
            record_samples: c.record_samples,
            pid_cycles: c.pid_cycles,
        }
    }
}

fn runaway_params(c: &thermal_config::RunawayZoneCfg, is_bed: bool) -> RunawayParams {
    RunawayParams {
        hysteresis: c.hysteresis,
        timeout_ms: c.timeout_s.saturating_mul(1_000),
        poll_ms: c.poll_ms,
        preheat_window: c.preheat_window,
        preheat_violations: c.preheat_violations,
        is_bed,
    }
}

fn regulation(
    kind: thermal_config::Regulation,
    pid: &thermal_config::PidGains,
    check_interval_ms: u64,
    hysteresis: f32,
) -> RegulationCfg {
    match kind {
        thermal_config::Regulation::Pid => RegulationCfg::Pid(pid.into()),
        thermal_config::Regulation::BangBang => RegulationCfg::BangBang {
            check_interval_ms,
            hysteresis,
        },
        thermal_config::Regulation::OpenLoop => RegulationCfg::OpenLoop,
    }
}

// ── Thermal model ────────────────────────────────────────────────────────────

impl From<&thermal_config::PersistedModel> for ModelSettings {
    fn from(m: &thermal_config::PersistedModel) -> Self {
        let mut r = [f32::NAN; R_SIZE];
        for (slot, v) in r.iter_mut().zip(&m.r) {
            *slot = *v;
        }
        Self {
            params: ModelParams {
                p: m.p,
                c: m.c,
                ta_corr: m.ta_corr,
                r,
                warn: m.warn,
                err: m.err,
            },
            enabled: m.enabled,
            warn_beep: m.warn_beep,
        }
    }
}

impl From<&ModelSettings> for thermal_config::PersistedModel {
    fn from(s: &ModelSettings) -> Self {
        Self {
            enabled: s.enabled,
            warn_beep: s.warn_beep,
            p: s.params.p,
            c: s.params.c,
            ta_corr: s.params.ta_corr,
            r: s.params.r.to_vec(),
            warn: s.params.warn,
            err: s.params.err,
        }
    }
}

// ── Whole config ─────────────────────────────────────────────────────────────

impl TryFrom<&thermal_config::Config> for ThermalConfig {
    type Error = Report;

    fn try_from(c: &thermal_config::Config) -> Result<Self> {
        let hotends = c
            .hotend
            .iter()
            .enumerate()
            .map(|(i, h)| {
                Ok(ZoneCfg {
                    sensor: sensor_from_spec(&h.sensor).wrap_err_with(|| format!("hotend[{i}].sensor"))?,
                    mintemp: h.mintemp,
                    maxtemp: h.maxtemp,
                    min_delay_ms: h.min_delay_ms,
                    regulation: regulation(h.regulation, &h.pid, h.check_interval_ms, 0.0),
                    max_output: h.max_output,
                    runaway: runaway_params(&c.runaway.hotend, false),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let b = &c.bed;
        let bed = ZoneCfg {
            sensor: sensor_from_spec(&b.sensor).wrap_err("bed.sensor")?,
            mintemp: b.mintemp,
            maxtemp: b.maxtemp,
            min_delay_ms: b.min_delay_ms,
            regulation: regulation(b.regulation, &b.pid, b.check_interval_ms, b.hysteresis),
            max_output: b.max_output,
            runaway: runaway_params(&c.runaway.bed, true),
        };

        let ambient = if c.ambient.enabled {
            Some(AmbientCfg {
                sensor: sensor_from_spec(&c.ambient.sensor).wrap_err("ambient.sensor")?,
                mintemp: c.ambient.mintemp,
                maxtemp: c.ambient.maxtemp,
                low_ambient: c.ambient.low_ambient,
            })
        } else {
            None
        };

        let pinda = if c.pinda.enabled {
            Some(PindaCfg {
                sensor: sensor_from_spec(&c.pinda.sensor).wrap_err("pinda.sensor")?,
                compensation_min: c.pinda.compensation_min,
            })
        } else {
            None
        };

        Ok(Self {
            cadence: (&c.cadence).into(),
            hotends,
            bed,
            bed_offset: b.offset.map(|o| BedOffset {
                start: o.start,
                center: o.center,
                offset: o.offset,
            }),
            ambient,
            pinda,
            model: (&c.model.defaults).into(),
            autotune: (&c.autotune).into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let cfg = ThermalConfig::try_from(&thermal_config::Config::default()).expect("convert");
        assert_eq!(cfg.hotends.len(), 1);
        assert_eq!(cfg.cadence.interval_ms, 270);
        assert!(cfg.ambient.is_none());
        assert_eq!(cfg.hotends[0].runaway.timeout_ms, 45_000);
        assert!(cfg.bed.runaway.is_bed);
    }

    #[test]
    fn unknown_table_is_reported() {
        let spec = thermal_config::SensorSpec::Table {
            name: "nope".into(),
        };
        let err = sensor_from_spec(&spec).expect_err("unknown");
        assert_eq!(
            err.downcast_ref::<BuildError>(),
            Some(&BuildError::UnknownSensorTable("nope".into()))
        );
    }

    #[test]
    fn short_persisted_resistance_list_pads_with_nan() {
        let p = thermal_config::PersistedModel {
            r: vec![20.0; 4],
            ..Default::default()
        };
        let s = ModelSettings::from(&p);
        assert_eq!(s.params.r[3], 20.0);
        assert!(s.params.r[4].is_nan());
    }

    #[test]
    fn bang_bang_bed_keeps_hysteresis() {
        let mut c = thermal_config::Config::default();
        c.bed.regulation = thermal_config::Regulation::BangBang;
        c.bed.hysteresis = 2.0;
        let cfg = ThermalConfig::try_from(&c).expect("convert");
        assert_eq!(
            cfg.bed.regulation,
            RegulationCfg::BangBang {
                check_interval_ms: 5_000,
                hysteresis: 2.0
            }
        );
    }
}
