//! Cadence-side temperature manager.
//!
//! Runs once per sampling cycle with exclusive access to the regulation
//! state: linearizes the frame, evaluates the fault stack in severity order,
//! steps the thermal model and, unless a zone is under manual control,
//! computes the new heater duties.

use std::sync::Arc;

use crate::MAX_HOTENDS;
use crate::fault::{FaultKind, FaultRecord, FaultSource, FaultState, RecoverySnapshot};
use crate::frame::{Channel, RawFrame};
use crate::limits::{MinTempGate, RawLimits, RawThreshold};
use crate::model::{ModelInput, ThermalModel};
use crate::pid::RegulationStrategy;
use crate::runaway::RunawayTracker;
use crate::sensor::{Linearizer, Temperatures};
use crate::softpwm::Duties;

/// Ambient reading assumed by the model when no ambient sensor is fitted.
pub const FALLBACK_AMBIENT: f32 = 25.0;

/// Which heat zone an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZoneId {
    Hotend(usize),
    Bed,
}

impl ZoneId {
    pub fn source(self) -> FaultSource {
        match self {
            Self::Hotend(_) => FaultSource::Hotend,
            Self::Bed => FaultSource::Bed,
        }
    }
}

#[derive(Debug)]
pub(crate) struct HeatZone {
    pub(crate) raw: u16,
    pub(crate) temperature: f32,
    pub(crate) target: u16,
    /// Regulator output of the last cycle (0..=255).
    pub(crate) output: u8,
    /// Output forced by an autotune procedure instead of the regulator.
    pub(crate) manual: Option<u8>,
    pub(crate) regulator: Box<dyn RegulationStrategy>,
    pub(crate) limits: RawLimits,
    pub(crate) gate: MinTempGate,
    pub(crate) runaway: RunawayTracker,
}

impl HeatZone {
    pub(crate) fn new(
        regulator: Box<dyn RegulationStrategy>,
        limits: RawLimits,
        min_delay_ms: u64,
        runaway: RunawayTracker,
    ) -> Self {
        Self {
            raw: 0,
            temperature: 0.0,
            target: 0,
            output: 0,
            manual: None,
            regulator,
            limits,
            gate: MinTempGate::new(min_delay_ms),
            runaway,
        }
    }

    fn powered(&self) -> bool {
        self.temperature < self.limits.maxtemp && (self.target != 0 || self.manual.is_some())
    }
}

#[derive(Debug)]
pub(crate) struct AmbientChannel {
    pub(crate) limits: RawLimits,
    /// Below this reading the MINTEMP grace logic applies.
    pub(crate) low: RawThreshold,
}

/// Model warning as seen by the task side.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModelWarning {
    /// Warning condition held during the last cycle.
    pub assert: bool,
    /// Set by the cadence, cleared by the task once the condition is gone.
    pub latched: bool,
    /// Filtered residual at the last assertion (K per cycle).
    pub residual: f32,
}

#[derive(Debug)]
pub struct TempMgr {
    pub(crate) hotends: Vec<HeatZone>,
    pub(crate) bed: HeatZone,
    pub(crate) ambient: Option<AmbientChannel>,
    pub(crate) linearizer: Linearizer,
    pub(crate) temps: Temperatures,
    pub(crate) model: ThermalModel,
    pub(crate) warning: ModelWarning,
    pub(crate) fault: FaultState,
    pub(crate) duties: Arc<Duties>,
    interval_ms: u64,
    now_ms: u64,
    cycles: u64,
}

impl TempMgr {
    pub(crate) fn new(
        hotends: Vec<HeatZone>,
        bed: HeatZone,
        ambient: Option<AmbientChannel>,
        linearizer: Linearizer,
        model: ThermalModel,
        duties: Arc<Duties>,
        interval_ms: u64,
    ) -> Self {
        Self {
            hotends,
            bed,
            ambient,
            linearizer,
            temps: Temperatures::default(),
            model,
            warning: ModelWarning::default(),
            fault: FaultState::default(),
            duties,
            interval_ms,
            now_ms: 0,
            cycles: 0,
        }
    }

    pub fn temperatures(&self) -> &Temperatures {
        &self.temps
    }

    pub fn fault(&self) -> &FaultState {
        &self.fault
    }

    pub fn fault_record(&self) -> Option<FaultRecord> {
        self.fault.record()
    }

    pub fn model(&self) -> &ThermalModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut ThermalModel {
        &mut self.model
    }

    pub fn warning(&self) -> ModelWarning {
        self.warning
    }

    /// Logical time in ms, advanced by one interval per processed frame.
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Frames processed since startup.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn hotend_count(&self) -> usize {
        self.hotends.len()
    }

    pub(crate) fn zone(&self, id: ZoneId) -> Option<&HeatZone> {
        match id {
            ZoneId::Hotend(i) => self.hotends.get(i),
            ZoneId::Bed => Some(&self.bed),
        }
    }

    pub(crate) fn zone_mut(&mut self, id: ZoneId) -> Option<&mut HeatZone> {
        match id {
            ZoneId::Hotend(i) => self.hotends.get_mut(i),
            ZoneId::Bed => Some(&mut self.bed),
        }
    }

    /// Publish task-side targets to the cadence copies.
    pub(crate) fn publish_targets(&mut self, hotends: &[u16], bed: u16) {
        for (zone, t) in self.hotends.iter_mut().zip(hotends) {
            zone.target = *t;
        }
        self.bed.target = bed;
    }

    /// Put a zone under manual output (autotune) or hand it back to its
    /// regulator with `None`.
    pub(crate) fn set_manual(&mut self, id: ZoneId, output: Option<u8>) {
        if let Some(zone) = self.zone_mut(id) {
            zone.manual = output;
            if output.is_none() {
                zone.regulator.reset();
            }
        }
    }

    /// One cadence cycle.
    pub fn tick(&mut self, frame: &RawFrame) {
        self.now_ms += self.interval_ms;
        self.cycles += 1;

        self.temps = self.linearizer.convert(frame);
        for (i, zone) in self.hotends.iter_mut().enumerate() {
            zone.raw = frame.get(Channel::Hotend(i));
            zone.temperature = self.temps.hotends[i];
        }
        self.bed.raw = frame.get(Channel::Bed);
        self.bed.temperature = self.temps.bed;
        let ambient_raw = frame.get(Channel::Ambient);

        self.fault.begin_cycle();
        self.check_max(ambient_raw);
        self.check_min(ambient_raw);
        self.check_runaway();
        self.check_model();
        self.regulate();
    }

    fn check_max(&mut self, ambient_raw: u16) {
        for i in 0..self.hotends.len() {
            if self.hotends[i].limits.max.is_hotter(self.hotends[i].raw) {
                self.raise(FaultSource::Hotend, i, FaultKind::Max);
            }
        }
        if self.bed.limits.max.is_hotter(self.bed.raw) {
            self.raise(FaultSource::Bed, 0, FaultKind::Max);
        }
        if self
            .ambient
            .as_ref()
            .is_some_and(|a| a.limits.max.is_hotter(ambient_raw))
        {
            self.raise(FaultSource::Ambient, 0, FaultKind::Max);
        }
    }

    fn check_min(&mut self, ambient_raw: u16) {
        if self
            .ambient
            .as_ref()
            .is_some_and(|a| a.limits.min.is_colder(ambient_raw))
        {
            self.raise(FaultSource::Ambient, 0, FaultKind::Min);
        }
        // without an ambient sensor the room is assumed to be cold
        let gated = self
            .ambient
            .as_ref()
            .is_none_or(|a| a.low.is_colder(ambient_raw));
        let now = self.now_ms;
        // every zone's grace timer advances before any fault disables heaters
        let mut cold = [false; MAX_HOTENDS];
        for (flag, z) in cold.iter_mut().zip(self.hotends.iter_mut()) {
            *flag = min_violated(z, now, gated);
        }
        let bed_cold = min_violated(&mut self.bed, now, gated);
        for (i, _) in cold.iter().enumerate().filter(|(_, c)| **c) {
            self.raise(FaultSource::Hotend, i, FaultKind::Min);
        }
        if bed_cold {
            self.raise(FaultSource::Bed, 0, FaultKind::Min);
        }
    }

    fn check_runaway(&mut self) {
        let now = self.now_ms;
        // poll every tracker against live targets first; raising zeroes them
        let mut found: [Option<FaultKind>; MAX_HOTENDS] = [None; MAX_HOTENDS];
        for (i, (slot, z)) in found.iter_mut().zip(self.hotends.iter_mut()).enumerate() {
            let duty = self.duties.heater(i);
            *slot = z.runaway.poll(now, z.temperature, f32::from(z.target), duty);
        }
        let duty = self.duties.bed();
        let bed = &mut self.bed;
        let bed_kind = bed.runaway.poll(now, bed.temperature, f32::from(bed.target), duty);
        for (i, kind) in found.into_iter().enumerate() {
            if let Some(kind) = kind {
                self.raise(FaultSource::Hotend, i, kind);
            }
        }
        if let Some(kind) = bed_kind {
            self.raise(FaultSource::Bed, 0, kind);
        }
    }

    fn check_model(&mut self) {
        let Some(h0) = self.hotends.first() else {
            return;
        };
        let input = ModelInput {
            temperature: h0.temperature,
            ambient: self.temps.ambient.unwrap_or(FALLBACK_AMBIENT),
            duty: self.duties.heater(0),
            fan_speed: self.duties.fan(),
        };
        let check = self.model.check(input);
        if let Some(residual) = check.warning {
            self.warning.assert = true;
            self.warning.latched = true;
            self.warning.residual = residual;
        } else {
            self.warning.assert = false;
        }
        if check.fault {
            self.raise(FaultSource::Hotend, 0, FaultKind::Model);
        }
    }

    fn regulate(&mut self) {
        if self.fault.active() {
            self.duties.zero_heaters();
            return;
        }
        let now = self.now_ms;
        for (i, z) in self.hotends.iter_mut().enumerate() {
            z.output = match z.manual {
                Some(out) => out,
                None => z
                    .regulator
                    .output(z.temperature, f32::from(z.target), now),
            };
            let duty = if z.powered() { z.output >> 1 } else { 0 };
            self.duties.set_heater(i, duty);
        }
        let bed = &mut self.bed;
        bed.output = match bed.manual {
            Some(out) => out,
            None => bed
                .regulator
                .output(bed.temperature, f32::from(bed.target), now),
        };
        if bed.powered() {
            self.duties.set_bed(bed.output >> 1, bed.output);
        } else {
            self.duties.set_bed(0, 0);
        }
    }

    /// Disable every heater, then latch the fault.
    pub(crate) fn raise(&mut self, source: FaultSource, index: usize, kind: FaultKind) {
        let zone = if source == FaultSource::Hotend { index } else { 0 };
        let snapshot = RecoverySnapshot {
            hotend_target: self.hotends.get(zone).map_or(0, |z| z.target),
            bed_target: self.bed.target,
            fan_speed: self.duties.fan(),
        };
        self.disable_heaters();
        self.duties.set_fan(u8::MAX);
        let index = u8::try_from(index).unwrap_or(u8::MAX);
        if self.fault.raise(source, index, kind, snapshot) {
            tracing::error!(?kind, ?source, index, "thermal fault latched");
        }
    }

    pub(crate) fn disable_heaters(&mut self) {
        for z in self.hotends.iter_mut().chain(std::iter::once(&mut self.bed)) {
            z.target = 0;
            z.output = 0;
            z.manual = None;
            z.regulator.reset();
        }
        self.duties.zero_heaters();
    }
}

fn min_violated(zone: &mut HeatZone, now_ms: u64, gated: bool) -> bool {
    if !zone.limits.min.is_colder(zone.raw) {
        // keep the grace timer running
        if gated {
            zone.gate.should_check(
                now_ms,
                zone.temperature,
                f32::from(zone.target),
                zone.limits.mintemp,
            );
        }
        return false;
    }
    !gated
        || zone.gate.should_check(
            now_ms,
            zone.temperature,
            f32::from(zone.target),
            zone.limits.mintemp,
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RawFrame;
    use crate::limits::RawLimits;
    use crate::model::ModelSettings;
    use crate::pid::{Pid, PidGains};
    use crate::runaway::RunawayParams;
    use crate::sensor::Sensor;
    use crate::tables::EPCOS_100K;
    use std::borrow::Cow;

    fn ntc() -> Sensor {
        Sensor::Table(Cow::Borrowed(&EPCOS_100K))
    }

    fn zone(mintemp: f32, maxtemp: f32) -> HeatZone {
        HeatZone::new(
            Box::new(Pid::new(
                PidGains {
                    kp: 16.13,
                    ki: 1.1625,
                    kd: 56.23,
                },
                0.27,
                255,
            )),
            RawLimits::probe(&ntc(), mintemp, maxtemp).expect("probe"),
            15_000,
            RunawayTracker::new(RunawayParams {
                hysteresis: 15.0,
                timeout_ms: 45_000,
                poll_ms: 2_000,
                preheat_window: 8,
                preheat_violations: 5,
                is_bed: false,
            }),
        )
    }

    fn mgr() -> TempMgr {
        TempMgr::new(
            vec![zone(15.0, 305.0)],
            zone(10.0, 125.0),
            None,
            Linearizer::new(vec![ntc()], ntc()),
            ThermalModel::new(ModelSettings::default(), 0.27),
            Arc::new(Duties::default()),
            270,
        )
    }

    /// Raw reading that linearizes to roughly `c` on the stock thermistor.
    fn raw_for(c: f32) -> u16 {
        let s = ntc();
        (0..=crate::sensor::RAW_FULL_SCALE)
            .step_by(16)
            .find(|r| s.to_celsius(*r) <= c)
            .unwrap_or(crate::sensor::RAW_FULL_SCALE)
    }

    fn frame(hotend: f32, bed: f32) -> RawFrame {
        let mut f = RawFrame::default();
        f.set(Channel::Hotend(0), raw_for(hotend));
        f.set(Channel::Bed, raw_for(bed));
        f
    }

    #[test]
    fn maxtemp_disables_and_latches() {
        let mut m = mgr();
        m.publish_targets(&[200], 60);
        m.tick(&frame(25.0, 25.0));
        assert!(m.duties.heater(0) > 0);
        m.tick(&frame(310.0, 25.0));
        let rec = m.fault_record().expect("fault");
        assert_eq!((rec.kind, rec.source), (FaultKind::Max, FaultSource::Hotend));
        assert_eq!(m.duties.heater(0), 0);
        assert_eq!(m.duties.fan(), 255);
        assert_eq!(m.hotends[0].target, 0);
        assert_eq!(m.fault.snapshot().map(|s| s.hotend_target), Some(200));
    }

    #[test]
    fn mintemp_waits_for_grace_period() {
        let mut m = mgr();
        m.publish_targets(&[0], 0);
        m.tick(&frame(5.0, 25.0));
        assert!(m.fault_record().is_none());
        m.publish_targets(&[200], 0);
        // 15 s grace at 270 ms per cycle
        for _ in 0..55 {
            m.tick(&frame(5.0, 25.0));
        }
        assert!(m.fault_record().is_none());
        for _ in 0..2 {
            m.tick(&frame(5.0, 25.0));
        }
        let rec = m.fault_record().expect("mintemp");
        assert_eq!(rec.kind, FaultKind::Min);
    }

    #[test]
    fn mintemp_then_maxtemp_upgrades_kind_but_keeps_snapshot() {
        let mut m = mgr();
        m.publish_targets(&[200], 60);
        for _ in 0..60 {
            m.tick(&frame(5.0, 25.0));
        }
        let rec = m.fault_record().expect("mintemp");
        assert_eq!(rec.kind, FaultKind::Min);
        let first = m.fault.snapshot();
        assert_eq!(first.map(|s| (s.hotend_target, s.bed_target)), Some((200, 60)));

        m.tick(&frame(310.0, 25.0));
        let rec = m.fault_record().expect("maxtemp");
        assert_eq!((rec.kind, rec.source), (FaultKind::Max, FaultSource::Hotend));
        assert_eq!(m.fault.snapshot(), first);
    }

    #[test]
    fn snapshot_records_the_faulting_hotend_target() {
        let mut m = TempMgr::new(
            vec![zone(15.0, 305.0), zone(15.0, 305.0)],
            zone(10.0, 125.0),
            None,
            Linearizer::new(vec![ntc(), ntc()], ntc()),
            ThermalModel::new(ModelSettings::default(), 0.27),
            Arc::new(Duties::default()),
            270,
        );
        m.publish_targets(&[200, 180], 0);
        let mut f = frame(25.0, 25.0);
        f.set(Channel::Hotend(1), raw_for(25.0));
        m.tick(&f);
        assert!(m.fault_record().is_none());
        f.set(Channel::Hotend(1), raw_for(310.0));
        m.tick(&f);
        let rec = m.fault_record().expect("maxtemp");
        assert_eq!((rec.kind, rec.index), (FaultKind::Max, 1));
        assert_eq!(m.fault.snapshot().map(|s| s.hotend_target), Some(180));
    }

    #[test]
    fn steady_ticks_do_not_allocate() {
        // register the fault-path log callsites outside the counted window
        let mut warm = mgr();
        warm.tick(&frame(310.0, 25.0));

        let mut m = mgr();
        m.publish_targets(&[200], 60);
        m.tick(&frame(25.0, 25.0));
        let allocs = alloc_count::during(|| {
            for _ in 0..50 {
                m.tick(&frame(25.0, 25.0));
            }
            // fault path too
            m.tick(&frame(310.0, 25.0));
            m.tick(&frame(5.0, 5.0));
        });
        assert_eq!(allocs, 0);
        assert!(m.fault_record().is_some());
    }

    #[test]
    fn unpowered_zone_gets_no_duty() {
        let mut m = mgr();
        m.tick(&frame(25.0, 25.0));
        assert_eq!(m.duties.heater(0), 0);
        assert_eq!(m.duties.bed(), 0);
    }

    #[test]
    fn manual_output_bypasses_regulator() {
        let mut m = mgr();
        m.set_manual(ZoneId::Hotend(0), Some(128));
        m.tick(&frame(25.0, 25.0));
        assert_eq!(m.duties.heater(0), 64);
        m.set_manual(ZoneId::Hotend(0), None);
        m.tick(&frame(25.0, 25.0));
        assert_eq!(m.duties.heater(0), 0);
    }

    #[test]
    fn asserting_clears_each_cycle() {
        let mut m = mgr();
        m.tick(&frame(310.0, 25.0));
        assert!(m.fault.asserting());
        m.tick(&frame(200.0, 25.0));
        assert!(!m.fault.asserting());
        assert!(m.fault.active());
    }
}

/// Counts heap allocations made by the current thread.
#[cfg(test)]
mod alloc_count {
    use std::alloc::{GlobalAlloc, Layout, System};
    use std::cell::Cell;

    thread_local! {
        static COUNTING: Cell<bool> = const { Cell::new(false) };
        static COUNT: Cell<usize> = const { Cell::new(0) };
    }

    struct Counting;

    unsafe impl GlobalAlloc for Counting {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            if COUNTING.with(Cell::get) {
                COUNT.with(|c| c.set(c.get() + 1));
            }
            unsafe { System.alloc(layout) }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            unsafe { System.dealloc(ptr, layout) }
        }
    }

    #[global_allocator]
    static GLOBAL: Counting = Counting;

    pub fn during(f: impl FnOnce()) -> usize {
        COUNT.with(|c| c.set(0));
        COUNTING.with(|c| c.set(true));
        f();
        COUNTING.with(|c| c.set(false));
        COUNT.with(Cell::get)
    }
}
