//! A thermal system wired to the simulated plant, and the `run` loop.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use eyre::{Result, WrapErr};
use serde_json::json;
use thermal_core::bridge;
use thermal_core::persist::TomlFileStore;
use thermal_core::sensor::RAW_FULL_SCALE;
use thermal_core::{
    FaultRecord, Halt, Report, StatusReport, StatusSink, ThermalConfig, ThermalError, ThermalSystem,
    ZoneId,
};
use thermal_hardware::{PlantParams, SimAdc, SimChannel, SimHandle};
use thermal_ui::{ConsoleStatus, MessageStyle, render};

#[derive(Clone, Debug)]
pub struct SessionOpts {
    pub settings: Option<PathBuf>,
    pub style: MessageStyle,
    pub json: bool,
    /// Drive the cadence from background threads at wall-clock pace.
    pub realtime: bool,
}

#[derive(Copy, Clone, Debug)]
pub struct RunOpts {
    pub hotend: Option<u16>,
    pub bed: Option<u16>,
    pub fan: Option<u8>,
    pub seconds: u64,
    pub report_every: u64,
}

#[derive(Clone, Debug)]
pub struct RunSummary {
    pub cycles: u64,
    pub hotends: Vec<f32>,
    pub bed: f32,
    pub interrupted: bool,
}

pub struct Session {
    pub sys: ThermalSystem,
    pub plant: SimHandle,
    json: bool,
}

// ── Status output ────────────────────────────────────────────────────────────

fn emit(value: &serde_json::Value) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{value}");
}

/// Status sink printing one JSON object per report.
struct JsonStatus {
    style: MessageStyle,
}

impl StatusSink for JsonStatus {
    fn report(&mut self, report: &StatusReport) {
        emit(&json!({
            "event": "status",
            "code": format!("{:?}", report.event),
            "message": render(report, self.style),
            "zone": report.zone,
            "current": report.current,
            "target": report.target,
            "serious": report.serious,
        }));
    }

    fn set_beeper(&mut self, on: bool) {
        emit(&json!({ "event": "beeper", "on": on }));
    }

    fn halt(&mut self, halt: Halt) {
        let mode = match halt {
            Halt::Stop => "stop",
            Halt::ThermalStop => "thermal_stop",
        };
        emit(&json!({ "event": "halt", "mode": mode }));
    }
}

// ── Plant wiring ─────────────────────────────────────────────────────────────

/// Raw counts each configured sensor would report for a plant temperature.
fn encoder(cfg: &ThermalConfig) -> impl Fn(SimChannel, f32) -> u16 + Send + 'static {
    let hotends: Vec<_> = cfg.hotends.iter().map(|z| z.sensor.clone()).collect();
    let bed = cfg.bed.sensor.clone();
    let ambient = cfg.ambient.as_ref().map(|a| a.sensor.clone());
    let pinda = cfg.pinda.as_ref().map(|p| p.sensor.clone());
    move |ch, celsius| {
        let sensor = match ch {
            SimChannel::Hotend(i) => hotends.get(i).unwrap_or(&bed),
            SimChannel::Bed => &bed,
            SimChannel::Ambient => ambient.as_ref().unwrap_or(&bed),
            SimChannel::Pinda => pinda.as_ref().unwrap_or(&bed),
        };
        sensor.to_raw(celsius)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Fault injection used by the integration tests.
fn apply_test_hooks(plant: &SimHandle) {
    if let Some(zone) = env_parse::<usize>("THERMAL_TEST_HEATER_FAIL") {
        tracing::warn!(zone, "test hook: heater failed");
        plant.fail_heater(zone, true);
    }
    if let Some(slot) = env_parse::<usize>("THERMAL_TEST_SENSOR_OPEN") {
        tracing::warn!(slot, "test hook: sensor open");
        plant.force_raw(slot, Some(RAW_FULL_SCALE));
    }
    if let Some(celsius) = env_parse::<f32>("THERMAL_TEST_AMBIENT") {
        plant.set_ambient(celsius);
    }
}

pub fn fault_error(fault: FaultRecord) -> Report {
    Report::new(ThermalError::Fault {
        kind: fault.kind,
        origin: fault.source,
        index: fault.index,
    })
}

impl Session {
    pub fn open(cfg: &thermal_config::Config, opts: &SessionOpts) -> Result<Self> {
        let thermal = ThermalConfig::try_from(cfg).wrap_err("invalid configuration")?;
        let plant = SimHandle::new(PlantParams {
            interval: thermal.cadence.interval(),
            ..PlantParams::default()
        });
        apply_test_hooks(&plant);

        let (publisher, bridge) = bridge::channel();
        let adc = SimAdc::new(publisher, plant.clone(), encoder(&thermal));
        let mut builder = ThermalSystem::builder()
            .with_sampler(adc, bridge)
            .with_outputs(plant.outputs())
            .with_config(thermal);
        builder = if opts.json {
            builder.with_status(JsonStatus { style: opts.style })
        } else {
            builder.with_status(ConsoleStatus::new(std::io::stdout(), opts.style))
        };
        if let Some(path) = &opts.settings {
            builder = builder.with_settings_store(TomlFileStore::new(path));
        }
        if !opts.realtime {
            builder = builder.manual_drive();
        }
        let sys = builder.build()?;
        tracing::info!(realtime = opts.realtime, interval_ms = sys.interval().as_millis(), "thermal system ready");
        Ok(Self {
            sys,
            plant,
            json: opts.json,
        })
    }

    fn cycles_for(&self, seconds: u64) -> u64 {
        let interval_ms = u64::try_from(self.sys.interval().as_millis()).unwrap_or(u64::MAX).max(1);
        seconds.saturating_mul(1_000) / interval_ms
    }

    /// Print one temperature line: `T0:200.1/200 B:59.8/60 @0:87 B@:128`.
    pub fn print_temps(&self) -> Result<()> {
        let n = self.sys.hotend_count();
        let mut hotends = Vec::with_capacity(n);
        for i in 0..n {
            let zone = ZoneId::Hotend(i);
            hotends.push((
                self.sys.temperature(zone)?,
                self.sys.target(zone)?,
                self.sys.heater_power(zone)?,
            ));
        }
        let bed = (
            self.sys.temperature(ZoneId::Bed)?,
            self.sys.target(ZoneId::Bed)?,
            self.sys.heater_power(ZoneId::Bed)?,
        );

        if self.json {
            let zones: Vec<_> = hotends
                .iter()
                .map(|(t, target, power)| json!({ "temp": t, "target": target, "power": power }))
                .collect();
            emit(&json!({
                "event": "temps",
                "cycle": self.sys.cycles(),
                "hotends": zones,
                "bed": { "temp": bed.0, "target": bed.1, "power": bed.2 },
                "ambient": self.sys.ambient_temperature(),
            }));
        } else {
            let mut line = String::new();
            for (i, (t, target, _)) in hotends.iter().enumerate() {
                line.push_str(&format!("T{i}:{t:.1}/{target} "));
            }
            line.push_str(&format!("B:{:.1}/{}", bed.0, bed.1));
            for (i, (_, _, power)) in hotends.iter().enumerate() {
                line.push_str(&format!(" @{i}:{power}"));
            }
            line.push_str(&format!(" B@:{}", bed.2));
            println!("{line}");
        }
        Ok(())
    }

    /// Hold the requested targets for `opts.seconds` of plant time.
    ///
    /// A latched fault ends the run with `ThermalError::Fault`; `stop`
    /// ends it early without error.
    pub fn run(&mut self, opts: &RunOpts, stop: &AtomicBool) -> Result<RunSummary> {
        let total = self.cycles_for(opts.seconds);
        let every = self.cycles_for(opts.report_every);

        // first readings before any target goes live
        if !self.sys.wait_cycles(2)
            && let Some(fault) = self.sys.fault()
        {
            return Err(fault_error(fault));
        }
        if let Some(t) = opts.hotend {
            for i in 0..self.sys.hotend_count() {
                self.sys.set_target(ZoneId::Hotend(i), t)?;
            }
        }
        if let Some(t) = opts.bed {
            self.sys.set_target(ZoneId::Bed, t)?;
        }
        if let Some(speed) = opts.fan {
            self.sys.set_fan_speed(speed);
        }
        tracing::info!(hotend = ?opts.hotend, bed = ?opts.bed, cycles = total, "run started");

        let start = self.sys.cycles();
        let mut last_report = start;
        let mut interrupted = false;
        while self.sys.cycles() - start < total {
            if stop.load(Ordering::Relaxed) {
                interrupted = true;
                tracing::warn!("run interrupted");
                break;
            }
            self.sys.idle();
            if let Some(fault) = self.sys.fault() {
                tracing::error!(?fault, "run ended by thermal fault");
                return Err(fault_error(fault));
            }
            if every > 0 && self.sys.cycles() - last_report >= every {
                last_report = self.sys.cycles();
                self.print_temps()?;
            }
        }

        let hotends = (0..self.sys.hotend_count())
            .map(|i| self.sys.temperature(ZoneId::Hotend(i)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RunSummary {
            cycles: self.sys.cycles() - start,
            hotends,
            bed: self.sys.temperature(ZoneId::Bed)?,
            interrupted,
        })
    }
}
