use std::marker::PhantomData;
use std::sync::Arc;

use eyre::WrapErr;
use thermal_traits::{AnalogSampler, Clock, MonotonicClock, PowerOutputs};

use crate::MAX_HOTENDS;
use crate::bridge::SampleBridge;
use crate::cadence::{Cadence, Periodic};
use crate::config::{RegulationCfg, ThermalConfig, ZoneCfg};
use crate::error::{BuildError, Report, Result};
use crate::limits::{RawLimits, RawThreshold};
use crate::manager::{AmbientChannel, HeatZone, TempMgr};
use crate::model::ThermalModel;
use crate::pid::{BangBang, OpenLoop, Pid, RegulationStrategy};
use crate::ports::{BusySignal, LogStatus, SettingsStore, StatusSink};
use crate::runaway::RunawayTracker;
use crate::sensor::Linearizer;
use crate::softpwm::{Duties, SoftPwm};
use crate::system::{Drive, ThermalSystem};

impl ThermalSystem {
    /// Start building a controller. Sampler, outputs and config are required.
    pub fn builder() -> ThermalBuilder<Missing, Missing, Missing> {
        ThermalBuilder::default()
    }
}

// Type-state markers
pub struct Missing;
pub struct Set;

/// Builder for `ThermalSystem`. Everything is validated on `build()`.
pub struct ThermalBuilder<S, O, K> {
    sampler: Option<(Box<dyn AnalogSampler>, SampleBridge)>,
    outputs: Option<Box<dyn PowerOutputs>>,
    config: Option<ThermalConfig>,
    status: Option<Box<dyn StatusSink>>,
    store: Option<Box<dyn SettingsStore>>,
    busy: Option<Box<dyn BusySignal>>,
    clock: Option<Box<dyn Clock + Send + Sync>>,
    manual_drive: bool,
    _s: PhantomData<S>,
    _o: PhantomData<O>,
    _k: PhantomData<K>,
}

impl Default for ThermalBuilder<Missing, Missing, Missing> {
    fn default() -> Self {
        Self {
            sampler: None,
            outputs: None,
            config: None,
            status: None,
            store: None,
            busy: None,
            clock: None,
            manual_drive: false,
            _s: PhantomData,
            _o: PhantomData,
            _k: PhantomData,
        }
    }
}

fn regulator(cfg: &ZoneCfg, interval_s: f32) -> Box<dyn RegulationStrategy> {
    match cfg.regulation {
        RegulationCfg::Pid(gains) => Box::new(Pid::new(gains, interval_s, cfg.max_output)),
        RegulationCfg::BangBang {
            check_interval_ms,
            hysteresis,
        } => Box::new(BangBang::new(cfg.max_output, check_interval_ms, hysteresis)),
        RegulationCfg::OpenLoop => Box::new(OpenLoop::new(cfg.max_output)),
    }
}

fn validate_zone(z: &ZoneCfg) -> Result<()> {
    if !(z.mintemp < z.maxtemp) {
        return Err(Report::new(BuildError::InvalidConfig("mintemp must be below maxtemp")));
    }
    if z.max_output == 0 {
        return Err(Report::new(BuildError::InvalidConfig("max_output must be > 0")));
    }
    if z.runaway.poll_ms == 0 {
        return Err(Report::new(BuildError::InvalidConfig("runaway poll_ms must be > 0")));
    }
    if let RegulationCfg::Pid(g) = z.regulation
        && !(g.kp >= 0.0 && g.ki >= 0.0 && g.kd >= 0.0)
    {
        return Err(Report::new(BuildError::InvalidConfig("PID gains must be >= 0")));
    }
    Ok(())
}

fn heat_zone(z: &ZoneCfg, interval_s: f32) -> Result<HeatZone> {
    let limits = RawLimits::probe(&z.sensor, z.mintemp, z.maxtemp).map_err(Report::new)?;
    Ok(HeatZone::new(
        regulator(z, interval_s),
        limits,
        z.min_delay_ms,
        RunawayTracker::new(z.runaway),
    ))
}

/// Validate configuration, wire the cadence and start the drive.
///
/// Single path used by `try_build()` and `build()`.
#[allow(clippy::too_many_arguments)]
fn validate_and_build(
    sampler: Box<dyn AnalogSampler>,
    bridge: SampleBridge,
    outputs: Box<dyn PowerOutputs>,
    config: ThermalConfig,
    status: Option<Box<dyn StatusSink>>,
    mut store: Option<Box<dyn SettingsStore>>,
    busy: Option<Box<dyn BusySignal>>,
    clock: Option<Box<dyn Clock + Send + Sync>>,
    manual_drive: bool,
) -> Result<ThermalSystem> {
    // ── Validation ───────────────────────────────────────────────────────────
    if config.hotends.is_empty() {
        return Err(Report::new(BuildError::InvalidConfig("at least one hotend is required")));
    }
    if config.hotends.len() > MAX_HOTENDS {
        return Err(Report::new(BuildError::InvalidConfig("too many hotends")));
    }
    if config.cadence.interval_ms == 0 {
        return Err(Report::new(BuildError::InvalidConfig("interval_ms must be > 0")));
    }
    if config.cadence.pwm_tick.is_zero() {
        return Err(Report::new(BuildError::InvalidConfig("pwm tick must be > 0")));
    }
    if config.autotune.record_samples < 2 {
        return Err(Report::new(BuildError::InvalidConfig("record_samples must be >= 2")));
    }
    for z in config.hotends.iter().chain(std::iter::once(&config.bed)) {
        validate_zone(z)?;
    }

    // ── Cadence state ────────────────────────────────────────────────────────
    let interval_s = config.cadence.interval_s();
    let hotends = config
        .hotends
        .iter()
        .map(|z| heat_zone(z, interval_s))
        .collect::<Result<Vec<_>>>()?;
    let bed = heat_zone(&config.bed, interval_s)?;

    let mut linearizer = Linearizer::new(
        config.hotends.iter().map(|z| z.sensor.clone()).collect(),
        config.bed.sensor.clone(),
    );
    if let Some(offset) = config.bed_offset {
        linearizer = linearizer.with_bed_offset(offset);
    }
    let ambient = match &config.ambient {
        Some(a) => {
            if !(a.mintemp < a.maxtemp) {
                return Err(Report::new(BuildError::InvalidConfig(
                    "ambient mintemp must be below maxtemp",
                )));
            }
            linearizer = linearizer.with_ambient(a.sensor.clone());
            Some(AmbientChannel {
                limits: RawLimits::probe(&a.sensor, a.mintemp, a.maxtemp).map_err(Report::new)?,
                low: RawThreshold::cold(&a.sensor, a.low_ambient, "low_ambient").map_err(Report::new)?,
            })
        }
        None => None,
    };
    if let Some(p) = &config.pinda {
        linearizer = linearizer.with_pinda(p.sensor.clone());
    }

    let mut model = ThermalModel::new(config.model.clone(), interval_s);
    if let Some(store) = store.as_mut() {
        match store.load() {
            Ok(Some(settings)) => model.load(settings),
            Ok(None) => tracing::debug!("no stored model settings, using config seed"),
            Err(e) => tracing::warn!(error = %e, "failed to load model settings, using config seed"),
        }
    }

    let duties = Arc::new(Duties::default());
    let mgr = TempMgr::new(
        hotends,
        bed,
        ambient,
        linearizer,
        model,
        Arc::clone(&duties),
        config.cadence.interval_ms,
    );
    let cadence = Arc::new(Cadence::new(mgr, bridge, sampler));
    // first conversion; the cadence restarts the peripheral from then on
    cadence.start_cycle();

    // ── Drive ────────────────────────────────────────────────────────────────
    let clock: Arc<dyn Clock + Send + Sync> = match clock {
        Some(b) => Arc::from(b),
        None => Arc::new(MonotonicClock::new()),
    };
    let hotend_count = config.hotends.len();
    let mut pwm = SoftPwm::new(outputs, Arc::clone(&duties), hotend_count);
    let drive = if manual_drive {
        Drive::Manual { pwm }
    } else {
        let c = Arc::clone(&cadence);
        let cadence_thread = Periodic::spawn("thermal-cadence", config.cadence.interval(), Arc::clone(&clock), move || {
            c.tick();
        })
        .wrap_err("spawn cadence thread")?;
        let pwm_thread = Periodic::spawn("thermal-pwm", config.cadence.pwm_tick, Arc::clone(&clock), move || {
            pwm.tick();
        })
        .wrap_err("spawn pwm thread")?;
        Drive::Threaded {
            _cadence: cadence_thread,
            _pwm: pwm_thread,
        }
    };

    tracing::info!(
        hotends = hotend_count,
        interval_ms = config.cadence.interval_ms,
        ambient = config.ambient.is_some(),
        manual_drive,
        "thermal controller ready"
    );

    Ok(ThermalSystem::assemble(
        cadence,
        drive,
        duties,
        clock,
        config.cadence.interval(),
        config.autotune,
        hotend_count,
        config.pinda.as_ref().map(|p| p.compensation_min),
        status.unwrap_or_else(|| Box::new(LogStatus)),
        store,
        busy.unwrap_or_else(|| Box::new(|| false)),
    ))
}

impl<S, O, K> ThermalBuilder<S, O, K> {
    /// Fallible build available in any type-state; reports missing pieces.
    pub fn try_build(self) -> Result<ThermalSystem> {
        let (sampler, bridge) = self
            .sampler
            .ok_or_else(|| Report::new(BuildError::MissingSampler))?;
        let outputs = self
            .outputs
            .ok_or_else(|| Report::new(BuildError::MissingOutputs))?;
        let config = self
            .config
            .ok_or_else(|| Report::new(BuildError::MissingConfig))?;
        validate_and_build(
            sampler,
            bridge,
            outputs,
            config,
            self.status,
            self.store,
            self.busy,
            self.clock,
            self.manual_drive,
        )
    }

    /// Chainable setters that do not affect type-state.
    pub fn with_status(mut self, status: impl StatusSink + 'static) -> Self {
        self.status = Some(Box::new(status));
        self
    }

    pub fn with_settings_store(mut self, store: impl SettingsStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn with_busy_signal(mut self, busy: impl BusySignal + 'static) -> Self {
        self.busy = Some(Box::new(busy));
        self
    }

    /// Provide a custom clock; defaults to `MonotonicClock`.
    pub fn with_clock(mut self, clock: Box<dyn Clock + Send + Sync>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Step the cadence and the PWM modulator from `ThermalSystem::idle()`
    /// instead of background threads.
    pub fn manual_drive(mut self) -> Self {
        self.manual_drive = true;
        self
    }
}

// Setters that advance type-state
impl<O, K> ThermalBuilder<Missing, O, K> {
    /// `bridge` must be the consumer half of the channel whose publisher the
    /// sampler delivers to.
    pub fn with_sampler(
        self,
        sampler: impl AnalogSampler + 'static,
        bridge: SampleBridge,
    ) -> ThermalBuilder<Set, O, K> {
        ThermalBuilder {
            sampler: Some((Box::new(sampler), bridge)),
            outputs: self.outputs,
            config: self.config,
            status: self.status,
            store: self.store,
            busy: self.busy,
            clock: self.clock,
            manual_drive: self.manual_drive,
            _s: PhantomData,
            _o: PhantomData,
            _k: PhantomData,
        }
    }
}

impl<S, K> ThermalBuilder<S, Missing, K> {
    pub fn with_outputs(self, outputs: impl PowerOutputs + 'static) -> ThermalBuilder<S, Set, K> {
        ThermalBuilder {
            sampler: self.sampler,
            outputs: Some(Box::new(outputs)),
            config: self.config,
            status: self.status,
            store: self.store,
            busy: self.busy,
            clock: self.clock,
            manual_drive: self.manual_drive,
            _s: PhantomData,
            _o: PhantomData,
            _k: PhantomData,
        }
    }
}

impl<S, O> ThermalBuilder<S, O, Missing> {
    pub fn with_config(self, config: ThermalConfig) -> ThermalBuilder<S, O, Set> {
        ThermalBuilder {
            sampler: self.sampler,
            outputs: self.outputs,
            config: Some(config),
            status: self.status,
            store: self.store,
            busy: self.busy,
            clock: self.clock,
            manual_drive: self.manual_drive,
            _s: PhantomData,
            _o: PhantomData,
            _k: PhantomData,
        }
    }
}

impl ThermalBuilder<Set, Set, Set> {
    /// Validate and build. Only available once sampler, outputs and config are set.
    pub fn build(self) -> Result<ThermalSystem> {
        self.try_build()
    }
}
