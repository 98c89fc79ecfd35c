//! Task-side thermal controller.
//!
//! `ThermalSystem` owns the task copies of temperatures and targets, the
//! collaborators (status sink, settings store, busy signal) and the drive
//! that keeps the cadence and the PWM modulator running. Everything that
//! touches cadence-side state goes through a `CadenceGuard`.

use std::sync::Arc;
use std::time::Duration;

use thermal_traits::{Clock, PowerOutputs};

use crate::MAX_HOTENDS;
use crate::alert::MinTempAlert;
use crate::cadence::{Cadence, Periodic};
use crate::calibration::RecEntry;
use crate::config::AutotuneCfg;
use crate::error::{Report, Result, ThermalError};
use crate::fault::{FaultKind, FaultRecord, FaultSource, RecoverySnapshot};
use crate::limits::MINTEMP_HYSTERESIS;
use crate::manager::{TempMgr, ZoneId};
use crate::model::ModelSettings;
use crate::pid::PidGains;
use crate::ports::{BusySignal, SettingsStore, StatusSink};
use crate::sensor::Temperatures;
use crate::softpwm::{Duties, SoftPwm};
use crate::status::{Halt, StatusEvent, StatusReport};

/// How the cadence and PWM modulator are driven.
pub(crate) enum Drive {
    /// Background threads at the configured periods.
    Threaded {
        _cadence: Periodic,
        _pwm: Periodic,
    },
    /// Stepped from `idle()`: one cadence tick and one PWM period per call.
    Manual {
        pwm: SoftPwm<Box<dyn PowerOutputs>>,
    },
}

/// Partial update of the scalar model parameters. `None` leaves a value as is.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModelParamUpdate {
    pub p: Option<f32>,
    pub c: Option<f32>,
    pub ta_corr: Option<f32>,
    pub warn: Option<f32>,
    pub err: Option<f32>,
}

pub struct ThermalSystem {
    pub(crate) cadence: Arc<Cadence>,
    pub(crate) drive: Drive,
    pub(crate) duties: Arc<Duties>,
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
    pub(crate) interval: Duration,
    pub(crate) autotune: AutotuneCfg,
    pub(crate) rec: Vec<RecEntry>,
    pub(crate) cycles: u64,
    hotend_count: usize,
    temps: Temperatures,
    targets: [u16; MAX_HOTENDS],
    bed_target: u16,
    pinda_compensation_min: Option<f32>,
    status: Box<dyn StatusSink>,
    store: Option<Box<dyn SettingsStore>>,
    busy: Box<dyn BusySignal>,
    alert: MinTempAlert,
    last_event: Option<StatusEvent>,
    halted: Option<FaultRecord>,
    warning_first: bool,
    beeper: bool,
}

impl std::fmt::Debug for ThermalSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThermalSystem")
            .field("hotends", &self.hotend_count)
            .field("temps", &self.temps)
            .field("targets", &&self.targets[..self.hotend_count])
            .field("bed_target", &self.bed_target)
            .field("cycles", &self.cycles)
            .finish_non_exhaustive()
    }
}

impl ThermalSystem {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        cadence: Arc<Cadence>,
        drive: Drive,
        duties: Arc<Duties>,
        clock: Arc<dyn Clock + Send + Sync>,
        interval: Duration,
        autotune: AutotuneCfg,
        hotend_count: usize,
        pinda_compensation_min: Option<f32>,
        status: Box<dyn StatusSink>,
        store: Option<Box<dyn SettingsStore>>,
        busy: Box<dyn BusySignal>,
    ) -> Self {
        Self {
            cadence,
            drive,
            duties,
            clock,
            interval,
            rec: Vec::with_capacity(autotune.record_samples),
            autotune,
            hotend_count,
            temps: Temperatures::default(),
            targets: [0; MAX_HOTENDS],
            bed_target: 0,
            cycles: 0,
            pinda_compensation_min,
            status,
            store,
            busy,
            alert: MinTempAlert::default(),
            last_event: None,
            halted: None,
            warning_first: true,
            beeper: false,
        }
    }

    // ── Task loop ────────────────────────────────────────────────────────────

    /// Copy fresh cadence temperatures to the task side and publish targets.
    /// Returns false when no new samples were available.
    pub fn update_temperatures(&mut self) -> bool {
        if !self.cadence.take_ready() {
            return false;
        }
        let mut mgr = self.cadence.guard();
        self.temps = *mgr.temperatures();
        self.cycles = mgr.cycles();
        if !mgr.fault().active() {
            mgr.publish_targets(&self.targets[..self.hotend_count], self.bed_target);
        }
        true
    }

    /// One pass of the task-side heater management.
    pub fn manage_heater(&mut self) {
        if !self.update_temperatures() {
            return;
        }
        let (warning, fault) = {
            let mgr = self.cadence.guard();
            (mgr.warning(), mgr.fault().record())
        };
        if warning.latched {
            self.handle_warning();
        }
        if fault.is_some() {
            self.handle_fault();
        }
    }

    /// Keep the controller alive for one task iteration.
    pub fn idle(&mut self) {
        match &mut self.drive {
            Drive::Manual { pwm } => {
                self.cadence.tick();
                pwm.run_period();
            }
            Drive::Threaded { .. } => {
                self.clock.sleep(self.interval / 4);
            }
        }
        self.manage_heater();
    }

    /// Run task iterations until `n` more cadence cycles were observed or a
    /// fault latches. Returns false when interrupted by a fault.
    pub fn wait_cycles(&mut self, n: u64) -> bool {
        let end = self.cycles + n;
        while self.cycles < end {
            if self.fault().is_some() {
                return false;
            }
            self.idle();
        }
        self.fault().is_none()
    }

    // ── Targets and readings ─────────────────────────────────────────────────

    fn check_zone(&self, zone: ZoneId) -> Result<(), ThermalError> {
        match zone {
            ZoneId::Hotend(i) if i >= self.hotend_count => {
                tracing::error!(index = i, configured = self.hotend_count, "invalid hotend index");
                Err(ThermalError::InvalidZone {
                    index: i,
                    configured: self.hotend_count,
                })
            }
            _ => Ok(()),
        }
    }

    pub fn hotend_count(&self) -> usize {
        self.hotend_count
    }

    pub fn set_target(&mut self, zone: ZoneId, celsius: u16) -> Result<(), ThermalError> {
        self.check_zone(zone)?;
        match zone {
            ZoneId::Hotend(i) => self.targets[i] = celsius,
            ZoneId::Bed => self.bed_target = celsius,
        }
        tracing::debug!(?zone, celsius, "target set");
        Ok(())
    }

    pub(crate) fn set_hotend0_target(&mut self, celsius: u16) {
        self.targets[0] = celsius;
    }

    pub fn target(&self, zone: ZoneId) -> Result<u16, ThermalError> {
        self.check_zone(zone)?;
        Ok(match zone {
            ZoneId::Hotend(i) => self.targets[i],
            ZoneId::Bed => self.bed_target,
        })
    }

    pub fn temperature(&self, zone: ZoneId) -> Result<f32, ThermalError> {
        self.check_zone(zone)?;
        Ok(match zone {
            ZoneId::Hotend(i) => self.temps.hotends[i],
            ZoneId::Bed => self.temps.bed,
        })
    }

    pub fn temperatures(&self) -> &Temperatures {
        &self.temps
    }

    pub fn ambient_temperature(&self) -> Option<f32> {
        self.temps.ambient
    }

    pub fn pinda_temperature(&self) -> Option<f32> {
        self.temps.pinda
    }

    /// Probe temperature compensation is usable.
    pub fn has_temperature_compensation(&self) -> bool {
        match (self.temps.pinda, self.pinda_compensation_min) {
            (Some(t), Some(min)) => t >= min,
            _ => false,
        }
    }

    /// Current heater duty (0..=127).
    pub fn heater_power(&self, zone: ZoneId) -> Result<u8, ThermalError> {
        self.check_zone(zone)?;
        Ok(match zone {
            ZoneId::Hotend(i) => self.duties.heater(i),
            ZoneId::Bed => self.duties.bed(),
        })
    }

    pub fn any_hotend_heating(&self) -> bool {
        self.targets[..self.hotend_count].iter().any(|t| *t > 0)
    }

    pub fn set_fan_speed(&mut self, speed: u8) {
        self.duties.set_fan(speed);
    }

    pub fn fan_speed(&self) -> u8 {
        self.duties.fan()
    }

    /// Cadence cycles observed by the task side.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn frames_dropped(&self) -> u64 {
        self.cadence.frames_dropped()
    }

    pub fn fault(&self) -> Option<FaultRecord> {
        self.cadence.guard().fault().record()
    }

    pub fn fault_snapshot(&self) -> Option<RecoverySnapshot> {
        self.cadence.guard().fault().snapshot()
    }

    /// True while the thermal model's warning condition holds.
    pub fn model_warning(&self) -> bool {
        self.cadence.guard().warning().assert
    }

    // ── Regulation ───────────────────────────────────────────────────────────

    /// Replace a zone's PID gains. Returns false when the zone does not run PID.
    pub fn set_pid_gains(&mut self, zone: ZoneId, gains: PidGains) -> Result<bool, ThermalError> {
        self.check_zone(zone)?;
        if !(gains.kp >= 0.0 && gains.ki >= 0.0 && gains.kd >= 0.0) {
            return Err(ThermalError::InvalidParameter("PID gains must be >= 0"));
        }
        let mut mgr = self.cadence.guard();
        Ok(mgr
            .zone_mut(zone)
            .is_some_and(|z| z.regulator.set_gains(gains)))
    }

    pub fn pid_gains(&self, zone: ZoneId) -> Result<Option<PidGains>, ThermalError> {
        self.check_zone(zone)?;
        let mgr = self.cadence.guard();
        Ok(mgr.zone(zone).and_then(|z| z.regulator.gains()))
    }

    pub fn regulation_name(&self, zone: ZoneId) -> Result<&'static str, ThermalError> {
        self.check_zone(zone)?;
        let mgr = self.cadence.guard();
        Ok(mgr.zone(zone).map_or("none", |z| z.regulator.name()))
    }

    // ── Thermal model ────────────────────────────────────────────────────────

    pub fn model_settings(&self) -> ModelSettings {
        self.cadence.guard().model().settings().clone()
    }

    /// Log and return the current model settings.
    pub fn model_report(&self) -> ModelSettings {
        let s = self.model_settings();
        tracing::info!(
            enabled = s.enabled,
            warn_beep = s.warn_beep,
            p = s.params.p,
            c = s.params.c,
            ta_corr = s.params.ta_corr,
            warn = s.params.warn,
            err = s.params.err,
            r = ?s.params.r,
            "thermal model settings"
        );
        s
    }

    /// Enable or disable model checking. Enabling an uncalibrated model is
    /// refused and returns false.
    pub fn model_set_enabled(&mut self, enabled: bool) -> bool {
        let ok = self.cadence.guard().model_mut().set_enabled(enabled);
        if !ok {
            tracing::warn!("thermal model is not calibrated, cannot enable");
        }
        ok
    }

    pub fn model_set_warn_beep(&mut self, beep: bool) {
        self.cadence.guard().model_mut().set_warn_beep(beep);
    }

    pub fn model_set_params(&mut self, update: ModelParamUpdate) {
        self.cadence.guard().model_mut().set_params(
            update.c,
            update.p,
            update.ta_corr,
            update.warn,
            update.err,
        );
    }

    pub fn model_set_resistance(&mut self, index: usize, r: f32) -> Result<(), ThermalError> {
        self.cadence.guard().model_mut().set_resistance(index, r)
    }

    pub fn model_reset_settings(&mut self) {
        self.cadence.guard().model_mut().reset_settings();
        tracing::info!("thermal model settings reset to defaults");
    }

    /// Reload settings from the store. Unusable stored data reverts to defaults.
    pub fn model_load(&mut self) -> Result<()> {
        let Some(store) = self.store.as_mut() else {
            return Err(Report::new(ThermalError::InvalidParameter(
                "no settings store configured",
            )));
        };
        let loaded = store.load()?;
        let mut mgr = self.cadence.guard();
        match loaded {
            Some(settings) => mgr.model_mut().load(settings),
            None => mgr.model_mut().reset_settings(),
        }
        Ok(())
    }

    pub fn model_save(&mut self) -> Result<()> {
        let settings = self.model_settings();
        let Some(store) = self.store.as_mut() else {
            return Err(Report::new(ThermalError::InvalidParameter(
                "no settings store configured",
            )));
        };
        store.save(&settings)?;
        tracing::info!("thermal model settings saved");
        Ok(())
    }

    pub(crate) fn has_store(&self) -> bool {
        self.store.is_some()
    }

    pub(crate) fn busy(&self) -> bool {
        self.busy.busy()
    }

    // ── Status ───────────────────────────────────────────────────────────────

    /// Send a report unless it repeats the last event.
    pub(crate) fn notify(&mut self, report: StatusReport) {
        if self.last_event == Some(report.event) {
            return;
        }
        self.last_event = Some(report.event);
        self.status.report(&report);
    }

    pub(crate) fn set_beeper(&mut self, on: bool) {
        if self.beeper != on {
            self.beeper = on;
            self.status.set_beeper(on);
        }
    }

    fn halt_once(&mut self, record: FaultRecord, halt: Halt) {
        if self.halted != Some(record) {
            self.halted = Some(record);
            self.status.halt(halt);
        }
    }

    fn source_temperature(&self, source: FaultSource, index: u8) -> f32 {
        match source {
            FaultSource::Hotend => self
                .temps
                .hotends
                .get(usize::from(index))
                .copied()
                .unwrap_or(f32::NAN),
            FaultSource::Bed => self.temps.bed,
            FaultSource::Ambient => self.temps.ambient.unwrap_or(f32::NAN),
        }
    }

    fn handle_warning(&mut self) {
        let (warning, beep) = {
            let mut mgr = self.cadence.guard();
            let w = mgr.warning();
            if !w.assert {
                mgr.warning.latched = false;
            }
            (w, mgr.model().settings().warn_beep)
        };
        let interval_s = self.interval.as_secs_f32();
        if warning.assert {
            let k_per_s = warning.residual / interval_s;
            if self.warning_first {
                tracing::warn!(k_per_s, "thermal model anomaly");
                self.notify(StatusReport::new(StatusEvent::ThermalAnomaly));
                if beep {
                    self.set_beeper(true);
                }
                self.warning_first = false;
            } else if beep {
                let on = !self.beeper;
                self.set_beeper(on);
            }
        } else {
            self.set_beeper(false);
            self.warning_first = true;
            if self.last_event == Some(StatusEvent::ThermalAnomaly) {
                self.last_event = None;
            }
        }
    }

    fn handle_fault(&mut self) {
        // mirror the cadence, which has already dropped every target
        self.targets = [0; MAX_HOTENDS];
        self.bed_target = 0;

        let (record, asserting, mintemp) = {
            let mgr = self.cadence.guard();
            let Some(record) = mgr.fault().record() else {
                return;
            };
            (record, mgr.fault().asserting(), fault_mintemp(&mgr, record))
        };
        let current = self.source_temperature(record.source, record.index);
        let report = StatusReport::new(StatusEvent::for_fault(record.kind, record.source))
            .zone(record.index)
            .temperatures(current, 0);

        match record.kind {
            FaultKind::Min if asserting => {
                self.alert = MinTempAlert::default();
                self.notify(report);
                self.halt_once(record, Halt::ThermalStop);
            }
            FaultKind::Min => {
                if let Some(event) = self.alert.step(record.source, current, mintemp + MINTEMP_HYSTERESIS) {
                    self.notify(StatusReport::new(event).zone(record.index));
                }
            }
            FaultKind::Max | FaultKind::Preheat | FaultKind::Runaway => {
                self.notify(report);
                self.halt_once(record, Halt::Stop);
            }
            FaultKind::Model if asserting => {
                self.notify(report);
                self.halt_once(record, Halt::ThermalStop);
                self.set_beeper(true);
            }
            FaultKind::Model => {
                self.cadence.guard().fault.clear();
                self.set_beeper(false);
                self.halted = None;
                self.last_event = None;
                tracing::info!("thermal model fault cleared");
            }
        }
    }
}

fn fault_mintemp(mgr: &TempMgr, record: FaultRecord) -> f32 {
    match record.source {
        FaultSource::Hotend => mgr
            .zone(ZoneId::Hotend(usize::from(record.index)))
            .map_or(f32::NAN, |z| z.limits.mintemp),
        FaultSource::Bed => mgr.bed.limits.mintemp,
        FaultSource::Ambient => mgr.ambient.as_ref().map_or(f32::NAN, |a| a.limits.mintemp),
    }
}

impl Drop for ThermalSystem {
    fn drop(&mut self) {
        self.cadence.guard().disable_heaters();
        tracing::debug!("thermal system shut down, heaters disabled");
    }
}
