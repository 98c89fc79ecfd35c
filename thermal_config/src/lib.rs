#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas, sensor-table parsing and persisted model settings for the
//! heater controller.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - Sensor table CSV loader enforces headers and monotonic raw values.
//! - `PersistedModel` is the on-disk form of the thermal-model settings.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Highest number of hotends a single controller manages.
pub const MAX_HOTENDS: usize = 4;
/// Number of fan-speed buckets in the thermal model resistance table.
pub const MODEL_R_SIZE: usize = 16;

/// Sensor table CSV schema.
///
/// Expected headers:
/// raw,celsius
///
/// `raw` is the oversampled ADC sum (16 conversions per cycle).
///
/// Example:
/// raw,celsius
/// 368,300.0
/// 16128,0.0
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct TableRow {
    pub raw: u16,
    pub celsius: f32,
}

/// How a channel's raw reading maps to degrees.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorSpec {
    /// Built-in thermistor table by name.
    Table { name: String },
    /// Breakpoint table loaded from a `raw,celsius` CSV file.
    Csv { path: PathBuf },
    /// Linear amplifier: `raw * (500/1024) / 16 * gain + offset`.
    Ad595 {
        #[serde(default = "one")]
        gain: f32,
        #[serde(default)]
        offset: f32,
    },
    /// Thermocouple converter, 0.25 °C per count.
    Max6675,
}

fn one() -> f32 {
    1.0
}

impl Default for SensorSpec {
    fn default() -> Self {
        Self::Table {
            name: "epcos100k".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Regulation {
    #[default]
    Pid,
    BangBang,
    OpenLoop,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CadenceCfg {
    /// Control cadence interval in milliseconds.
    pub interval_ms: u64,
    /// Software PWM tick period in microseconds (128 ticks per PWM period).
    pub pwm_tick_us: u64,
}

impl Default for CadenceCfg {
    fn default() -> Self {
        Self {
            interval_ms: 270,
            pwm_tick_us: 500,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 16.13,
            ki: 1.1625,
            kd: 56.23,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HotendCfg {
    pub sensor: SensorSpec,
    pub mintemp: f32,
    pub maxtemp: f32,
    /// Grace period after heating is enabled before MINTEMP is enforced.
    pub min_delay_ms: u64,
    pub regulation: Regulation,
    pub pid: PidGains,
    /// PID output ceiling (0..=255 before halving to the 7-bit duty).
    pub max_output: u8,
    /// Minimum re-evaluation interval for bang-bang regulation.
    pub check_interval_ms: u64,
}

impl Default for HotendCfg {
    fn default() -> Self {
        Self {
            sensor: SensorSpec::default(),
            mintemp: 15.0,
            maxtemp: 305.0,
            min_delay_ms: 15_000,
            regulation: Regulation::Pid,
            pid: PidGains::default(),
            max_output: 255,
            check_interval_ms: 0,
        }
    }
}

/// Bed thermistor offset correction, applied after linearization.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct BedOffsetCfg {
    pub start: f32,
    pub center: f32,
    pub offset: f32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BedCfg {
    pub sensor: SensorSpec,
    pub mintemp: f32,
    pub maxtemp: f32,
    pub min_delay_ms: u64,
    pub regulation: Regulation,
    pub pid: PidGains,
    pub max_output: u8,
    /// Minimum re-evaluation interval for bang-bang regulation.
    pub check_interval_ms: u64,
    /// Bang-bang switching band around the target; 0 switches exactly at target.
    pub hysteresis: f32,
    pub offset: Option<BedOffsetCfg>,
}

impl Default for BedCfg {
    fn default() -> Self {
        Self {
            sensor: SensorSpec::default(),
            mintemp: 10.0,
            maxtemp: 125.0,
            min_delay_ms: 50_000,
            regulation: Regulation::Pid,
            pid: PidGains {
                kp: 126.13,
                ki: 4.30,
                kd: 924.76,
            },
            max_output: 255,
            check_interval_ms: 5_000,
            hysteresis: 0.0,
            offset: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AmbientCfg {
    pub enabled: bool,
    pub sensor: SensorSpec,
    pub mintemp: f32,
    pub maxtemp: f32,
    /// Below this ambient temperature the MINTEMP grace period applies.
    pub low_ambient: f32,
}

impl Default for AmbientCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            sensor: SensorSpec::default(),
            mintemp: -30.0,
            maxtemp: 80.0,
            low_ambient: 10.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PindaCfg {
    pub enabled: bool,
    pub sensor: SensorSpec,
    /// Probe temperature above which compensation data is meaningful.
    pub compensation_min: f32,
}

impl Default for PindaCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            sensor: SensorSpec::default(),
            compensation_min: 35.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunawayZoneCfg {
    /// Band around target inside which the zone counts as holding.
    pub hysteresis: f32,
    pub timeout_s: u64,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    /// Preheat window length in polls.
    pub preheat_window: u16,
    /// Consecutive failing windows tolerated before PREHEAT is raised.
    pub preheat_violations: u16,
}

fn default_poll_ms() -> u64 {
    2_000
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RunawayCfg {
    pub hotend: RunawayZoneCfg,
    pub bed: RunawayZoneCfg,
}

impl Default for RunawayCfg {
    fn default() -> Self {
        Self {
            hotend: RunawayZoneCfg {
                hysteresis: 15.0,
                timeout_s: 45,
                poll_ms: 2_000,
                preheat_window: 8,
                preheat_violations: 5,
            },
            bed: RunawayZoneCfg {
                hysteresis: 5.0,
                timeout_s: 360,
                poll_ms: 2_000,
                preheat_window: 16,
                preheat_violations: 3,
            },
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ModelCfg {
    /// Where the model settings are persisted (TOML).
    pub settings_path: Option<PathBuf>,
    /// Seed values used when nothing valid is persisted.
    pub defaults: PersistedModel,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AutotuneCfg {
    /// Hot calibration temperature for model autotune.
    pub model_temperature: f32,
    /// Cold temperature every model pass starts from.
    pub model_low_temperature: f32,
    /// Samples recorded per estimation pass.
    pub record_samples: usize,
    /// Relay cycles for PID autotune.
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

/// BCM pin numbers of the switched outputs (hardware builds only).
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct PinsCfg {
    /// One heater pin per configured hotend, in hotend order.
    pub heaters: Vec<u8>,
    pub bed: u8,
    /// Optional hardware PWM pin driven with the bed duty.
    pub bed_pwm: Option<u8>,
    pub fan: u8,
}

/// Highest BCM GPIO number on the 40-pin header.
pub const MAX_BCM_PIN: u8 = 27;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cadence: CadenceCfg,
    #[serde(default = "default_hotends")]
    pub hotend: Vec<HotendCfg>,
    #[serde(default)]
    pub bed: BedCfg,
    #[serde(default)]
    pub ambient: AmbientCfg,
    #[serde(default)]
    pub pinda: PindaCfg,
    #[serde(default)]
    pub runaway: RunawayCfg,
    #[serde(default)]
    pub model: ModelCfg,
    #[serde(default)]
    pub autotune: AutotuneCfg,
    #[serde(default)]
    pub pins: Option<PinsCfg>,
    #[serde(default)]
    pub logging: Logging,
}

fn default_hotends() -> Vec<HotendCfg> {
    vec![HotendCfg::default()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cadence: CadenceCfg::default(),
            hotend: default_hotends(),
            bed: BedCfg::default(),
            ambient: AmbientCfg::default(),
            pinda: PindaCfg::default(),
            runaway: RunawayCfg::default(),
            model: ModelCfg::default(),
            autotune: AutotuneCfg::default(),
            pins: None,
            logging: Logging::default(),
        }
    }
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    let mut cfg = toml::from_str::<Config>(s)?;
    cfg.model.defaults.clamp_thresholds();
    Ok(cfg)
}

/// Persisted thermal-model settings.
///
/// Unset capacity/resistance values are stored as `nan`; a model carrying
/// them is "uncalibrated" and stays disabled.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PersistedModel {
    pub enabled: bool,
    pub warn_beep: bool,
    /// Heater power (W).
    pub p: f32,
    /// Heat capacity (J/K).
    pub c: f32,
    /// Ambient correction (K).
    pub ta_corr: f32,
    /// Thermal resistance per fan bucket (K/W).
    pub r: Vec<f32>,
    /// Warning threshold (K/s).
    pub warn: f32,
    /// Error threshold (K/s).
    pub err: f32,
}

impl Default for PersistedModel {
    fn default() -> Self {
        Self {
            enabled: false,
            warn_beep: true,
            p: 38.0,
            c: f32::NAN,
            ta_corr: -7.0,
            r: vec![f32::NAN; MODEL_R_SIZE],
            warn: 1.2,
            err: 1.74,
        }
    }
}

impl PersistedModel {
    /// Keep the warning threshold at or below the error threshold.
    pub fn clamp_thresholds(&mut self) {
        if self.warn > self.err {
            self.warn = self.err;
        }
    }

    pub fn from_toml_str(s: &str) -> eyre::Result<Self> {
        let mut m: Self = toml::from_str(s).map_err(|e| eyre::eyre!("parse model settings: {e}"))?;
        m.clamp_thresholds();
        if m.r.len() != MODEL_R_SIZE {
            eyre::bail!(
                "model settings must carry {MODEL_R_SIZE} resistance values, got {}",
                m.r.len()
            );
        }
        Ok(m)
    }

    pub fn to_toml_string(&self) -> eyre::Result<String> {
        toml::to_string(self).map_err(|e| eyre::eyre!("serialize model settings: {e}"))
    }
}

/// Load a sensor breakpoint table from CSV.
///
/// Rows must be strictly increasing in `raw`; at least two rows are required.
pub fn load_sensor_table_csv(path: &Path) -> eyre::Result<Vec<TableRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open sensor table CSV {:?}: {}", path, e))?;

    // Enforce exact headers
    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let expected = ["raw", "celsius"];
    let actual: Vec<String> = headers.iter().map(ToString::to_string).collect();
    if actual != expected {
        eyre::bail!(
            "sensor table CSV must have headers 'raw,celsius', got: {}",
            actual.join(",")
        );
    }

    let mut rows: Vec<TableRow> = Vec::new();
    for (idx, rec) in rdr.deserialize::<TableRow>().enumerate() {
        match rec {
            Ok(row) => rows.push(row),
            Err(e) => {
                eyre::bail!("invalid CSV row {}: {}", idx + 2, e);
            }
        }
    }
    check_table_rows(&rows)?;
    Ok(rows)
}

/// Validate breakpoint ordering: at least two rows, strictly increasing raw,
/// finite temperatures.
pub fn check_table_rows(rows: &[TableRow]) -> eyre::Result<()> {
    if rows.len() < 2 {
        eyre::bail!("sensor table requires at least two rows, got {}", rows.len());
    }
    for (i, w) in rows.windows(2).enumerate() {
        if w[1].raw <= w[0].raw {
            eyre::bail!(
                "sensor table raw values must be strictly increasing (rows {} and {})",
                i + 2,
                i + 3
            );
        }
    }
    if rows.iter().any(|r| !r.celsius.is_finite()) {
        eyre::bail!("sensor table temperatures must be finite");
    }
    Ok(())
}

fn validate_sensor(key: &str, s: &SensorSpec) -> eyre::Result<()> {
    match s {
        SensorSpec::Table { name } if name.trim().is_empty() => {
            eyre::bail!("{key}.sensor.name must not be empty")
        }
        SensorSpec::Ad595 { gain, offset } if !gain.is_finite() || !offset.is_finite() => {
            eyre::bail!("{key}.sensor gain/offset must be finite")
        }
        _ => Ok(()),
    }
}

fn validate_gains(key: &str, g: &PidGains) -> eyre::Result<()> {
    for (name, v) in [("kp", g.kp), ("ki", g.ki), ("kd", g.kd)] {
        if !v.is_finite() || v < 0.0 {
            eyre::bail!("{key}.pid.{name} must be a finite value >= 0");
        }
    }
    Ok(())
}

fn validate_runaway(key: &str, r: &RunawayZoneCfg) -> eyre::Result<()> {
    if !(r.hysteresis > 0.0) {
        eyre::bail!("{key}.hysteresis must be > 0");
    }
    if r.timeout_s == 0 {
        eyre::bail!("{key}.timeout_s must be >= 1");
    }
    if r.poll_ms == 0 {
        eyre::bail!("{key}.poll_ms must be >= 1");
    }
    if r.preheat_window == 0 {
        eyre::bail!("{key}.preheat_window must be >= 1");
    }
    if r.preheat_violations == 0 {
        eyre::bail!("{key}.preheat_violations must be >= 1");
    }
    Ok(())
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Cadence
        if !(50..=2_000).contains(&self.cadence.interval_ms) {
            eyre::bail!("cadence.interval_ms must be in [50, 2000]");
        }
        if self.cadence.pwm_tick_us == 0 {
            eyre::bail!("cadence.pwm_tick_us must be >= 1");
        }

        // Hotends
        if self.hotend.is_empty() {
            eyre::bail!("at least one [[hotend]] is required");
        }
        if self.hotend.len() > MAX_HOTENDS {
            eyre::bail!("at most {MAX_HOTENDS} hotends are supported");
        }
        for (i, h) in self.hotend.iter().enumerate() {
            let key = format!("hotend[{i}]");
            validate_sensor(&key, &h.sensor)?;
            if !(h.mintemp < h.maxtemp) {
                eyre::bail!("{key}.mintemp must be < {key}.maxtemp");
            }
            if h.min_delay_ms == 0 {
                eyre::bail!("{key}.min_delay_ms must be >= 1");
            }
            if h.max_output == 0 {
                eyre::bail!("{key}.max_output must be > 0");
            }
            validate_gains(&key, &h.pid)?;
        }

        // Bed
        validate_sensor("bed", &self.bed.sensor)?;
        if !(self.bed.mintemp < self.bed.maxtemp) {
            eyre::bail!("bed.mintemp must be < bed.maxtemp");
        }
        if self.bed.min_delay_ms == 0 {
            eyre::bail!("bed.min_delay_ms must be >= 1");
        }
        if self.bed.max_output == 0 {
            eyre::bail!("bed.max_output must be > 0");
        }
        if self.bed.hysteresis.is_sign_negative() {
            eyre::bail!("bed.hysteresis must be >= 0");
        }
        validate_gains("bed", &self.bed.pid)?;
        if let Some(o) = self.bed.offset
            && !(o.start < o.center && o.center < 100.0)
        {
            eyre::bail!("bed.offset must satisfy start < center < 100");
        }

        // Ambient
        if self.ambient.enabled {
            validate_sensor("ambient", &self.ambient.sensor)?;
            if !(self.ambient.mintemp < self.ambient.maxtemp) {
                eyre::bail!("ambient.mintemp must be < ambient.maxtemp");
            }
        }
        if self.pinda.enabled {
            validate_sensor("pinda", &self.pinda.sensor)?;
        }

        // Runaway
        validate_runaway("runaway.hotend", &self.runaway.hotend)?;
        validate_runaway("runaway.bed", &self.runaway.bed)?;

        // Model
        let m = &self.model.defaults;
        if m.r.len() != MODEL_R_SIZE {
            eyre::bail!("model.defaults.r must have {MODEL_R_SIZE} entries");
        }
        if !(m.warn > 0.0) || !(m.err > 0.0) {
            eyre::bail!("model.defaults.warn and model.defaults.err must be > 0");
        }
        if !(m.p > 0.0) {
            eyre::bail!("model.defaults.p must be > 0");
        }

        // Autotune
        let a = &self.autotune;
        if !(a.model_low_temperature < a.model_temperature) {
            eyre::bail!("autotune.model_low_temperature must be < autotune.model_temperature");
        }
        if a.record_samples < 16 {
            eyre::bail!("autotune.record_samples must be >= 16");
        }
        if a.pid_cycles < 3 {
            eyre::bail!("autotune.pid_cycles must be >= 3");
        }

        // Pins
        if let Some(p) = &self.pins {
            if p.heaters.len() != self.hotend.len() {
                eyre::bail!(
                    "pins.heaters must list one pin per hotend ({} configured)",
                    self.hotend.len()
                );
            }
            let mut all: Vec<u8> = p.heaters.clone();
            all.push(p.bed);
            all.push(p.fan);
            all.extend(p.bed_pwm);
            if let Some(bad) = all.iter().find(|n| **n > MAX_BCM_PIN) {
                eyre::bail!("pin {bad} is outside the BCM range 0..={MAX_BCM_PIN}");
            }
            let n = all.len();
            all.sort_unstable();
            all.dedup();
            if all.len() != n {
                eyre::bail!("pins must be distinct");
            }
        }

        // Logging
        if let Some(rot) = self.logging.rotation.as_deref()
            && !matches!(rot, "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be one of never|daily|hourly");
        }

        Ok(())
    }
}
