//! Simulated heater plant.
//!
//! Each hotend is a heater block (capacity `C`, loss resistance `R` that
//! drops with fan speed) with a first-order lagging sensor. The bed is a
//! single node. `SimOutputs` counts PWM on-ticks; every `SimAdc::start_cycle`
//! advances the plant by one sampling interval using the on-fractions seen
//! since the previous cycle, then publishes the encoded sensor readings.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thermal_traits::{AnalogSampler, PowerOutputs, SampleSink, slots};

use crate::error::HwError;

type HwResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Physical constants of the simulated machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlantParams {
    pub ambient: f32,
    /// Hotend heater power (W).
    pub heater_power: f32,
    /// Hotend heat capacity (J/K).
    pub capacity: f32,
    /// Hotend loss resistance with the fan off (K/W).
    pub r_fan_off: f32,
    /// Hotend loss resistance with the fan at full speed (K/W).
    pub r_fan_full: f32,
    /// Hotend sensor time constant (s).
    pub sensor_tau_s: f32,
    pub bed_power: f32,
    pub bed_capacity: f32,
    pub bed_resistance: f32,
    /// Plant time advanced per sampling cycle.
    pub interval: Duration,
}

impl Default for PlantParams {
    fn default() -> Self {
        Self {
            ambient: 25.0,
            heater_power: 40.0,
            capacity: 12.0,
            r_fan_off: 20.0,
            r_fan_full: 12.0,
            sensor_tau_s: 3.0,
            bed_power: 250.0,
            bed_capacity: 500.0,
            bed_resistance: 0.6,
            interval: Duration::from_millis(270),
        }
    }
}

/// Channel being encoded for the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimChannel {
    Hotend(usize),
    Bed,
    Ambient,
    Pinda,
}

#[derive(Debug)]
struct Plant {
    params: PlantParams,
    ambient: f32,
    heater: [f32; slots::HOTENDS],
    sensor: [f32; slots::HOTENDS],
    bed: f32,
    heater_failed: [bool; slots::HOTENDS],
    heater_fail_at: [Option<u64>; slots::HOTENDS],
    forced: [Option<u16>; slots::COUNT],
    fail_cycles: u32,
    cycles: u64,
    // PWM accounting since the last cycle
    ticks: u32,
    heater_on: [u32; slots::HOTENDS],
    bed_on: u32,
    fan_on: u32,
    last_heater_fraction: [f32; slots::HOTENDS],
    bed_pwm: u8,
}

impl Plant {
    fn new(params: PlantParams) -> Self {
        Self {
            params,
            ambient: params.ambient,
            heater: [params.ambient; slots::HOTENDS],
            sensor: [params.ambient; slots::HOTENDS],
            bed: params.ambient,
            heater_failed: [false; slots::HOTENDS],
            heater_fail_at: [None; slots::HOTENDS],
            forced: [None; slots::COUNT],
            fail_cycles: 0,
            cycles: 0,
            ticks: 0,
            heater_on: [0; slots::HOTENDS],
            bed_on: 0,
            fan_on: 0,
            last_heater_fraction: [0.0; slots::HOTENDS],
            bed_pwm: 0,
        }
    }

    fn fraction(&self, on: u32) -> f32 {
        if self.ticks == 0 {
            0.0
        } else {
            on as f32 / self.ticks as f32
        }
    }

    fn step(&mut self) {
        let p = self.params;
        let dt = p.interval.as_secs_f32();
        let fan = self.fraction(self.fan_on);
        let r = p.r_fan_off + (p.r_fan_full - p.r_fan_off) * fan;
        let lag = (dt / p.sensor_tau_s.max(dt)).min(1.0);

        for i in 0..slots::HOTENDS {
            if self.heater_fail_at[i].is_some_and(|at| self.cycles >= at) {
                self.heater_failed[i] = true;
                self.heater_fail_at[i] = None;
            }
            let u = if self.heater_failed[i] {
                0.0
            } else {
                self.fraction(self.heater_on[i])
            };
            self.last_heater_fraction[i] = u;
            let t = self.heater[i];
            self.heater[i] = t + dt / p.capacity * (p.heater_power * u - (t - self.ambient) / r);
            self.sensor[i] += (self.heater[i] - self.sensor[i]) * lag;
        }
        let ub = self.fraction(self.bed_on);
        self.bed += dt / p.bed_capacity * (p.bed_power * ub - (self.bed - self.ambient) / p.bed_resistance);

        self.ticks = 0;
        self.heater_on = [0; slots::HOTENDS];
        self.bed_on = 0;
        self.fan_on = 0;
        self.cycles += 1;
        tracing::trace!(hotend = self.sensor[0], bed = self.bed, fan, "plant step");
    }

    fn pinda(&self) -> f32 {
        self.ambient + (self.bed - self.ambient) * 0.8
    }
}

/// Shared handle to the simulated plant. Clones refer to the same plant.
#[derive(Debug, Clone)]
pub struct SimHandle {
    plant: Arc<Mutex<Plant>>,
}

impl SimHandle {
    pub fn new(params: PlantParams) -> Self {
        Self {
            plant: Arc::new(Mutex::new(Plant::new(params))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Plant> {
        self.plant.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Output pins wired to this plant.
    pub fn outputs(&self) -> SimOutputs {
        SimOutputs {
            handle: self.clone(),
        }
    }

    /// Temperature reported by the hotend sensor.
    pub fn hotend(&self, zone: usize) -> f32 {
        self.lock().sensor.get(zone).copied().unwrap_or(f32::NAN)
    }

    /// Temperature of the heater block itself.
    pub fn heater_block(&self, zone: usize) -> f32 {
        self.lock().heater.get(zone).copied().unwrap_or(f32::NAN)
    }

    pub fn bed(&self) -> f32 {
        self.lock().bed
    }

    pub fn ambient(&self) -> f32 {
        self.lock().ambient
    }

    pub fn set_ambient(&self, celsius: f32) {
        self.lock().ambient = celsius;
    }

    /// Put a hotend (block and sensor) at `celsius`.
    pub fn set_hotend(&self, zone: usize, celsius: f32) {
        let mut p = self.lock();
        if zone < slots::HOTENDS {
            p.heater[zone] = celsius;
            p.sensor[zone] = celsius;
        }
    }

    pub fn set_bed(&self, celsius: f32) {
        self.lock().bed = celsius;
    }

    /// A failed heater draws no power regardless of its pin.
    pub fn fail_heater(&self, zone: usize, failed: bool) {
        if let Some(f) = self.lock().heater_failed.get_mut(zone) {
            *f = failed;
        }
    }

    /// Fail the heater once the plant has completed `cycle` cycles.
    pub fn fail_heater_at(&self, zone: usize, cycle: u64) {
        if let Some(at) = self.lock().heater_fail_at.get_mut(zone) {
            *at = Some(cycle);
        }
    }

    /// Override the raw reading of a frame slot (disconnected or shorted
    /// sensor); `None` restores the simulated value.
    pub fn force_raw(&self, slot: usize, raw: Option<u16>) {
        if let Some(f) = self.lock().forced.get_mut(slot) {
            *f = raw;
        }
    }

    /// Make the next `n` conversion requests fail.
    pub fn fail_cycles(&self, n: u32) {
        self.lock().fail_cycles = n;
    }

    /// Conversion cycles completed.
    pub fn cycles(&self) -> u64 {
        self.lock().cycles
    }

    /// Heater on-fraction applied during the last plant step.
    pub fn last_heater_fraction(&self, zone: usize) -> f32 {
        self.lock().last_heater_fraction.get(zone).copied().unwrap_or(0.0)
    }

    pub fn bed_pwm(&self) -> u8 {
        self.lock().bed_pwm
    }
}

/// Simulated heater, bed and fan pins.
#[derive(Debug, Clone)]
pub struct SimOutputs {
    handle: SimHandle,
}

impl PowerOutputs for SimOutputs {
    fn set_heater(&mut self, zone: usize, on: bool) -> HwResult {
        if on && let Some(n) = self.handle.lock().heater_on.get_mut(zone) {
            *n += 1;
        }
        Ok(())
    }

    fn set_bed(&mut self, on: bool) -> HwResult {
        let mut p = self.handle.lock();
        // one bed write per modulator tick
        p.ticks += 1;
        if on {
            p.bed_on += 1;
        }
        Ok(())
    }

    fn set_bed_pwm(&mut self, duty: u8) -> HwResult {
        self.handle.lock().bed_pwm = duty;
        Ok(())
    }

    fn set_fan(&mut self, on: bool) -> HwResult {
        if on {
            self.handle.lock().fan_on += 1;
        }
        Ok(())
    }
}

type Encoder = Box<dyn Fn(SimChannel, f32) -> u16 + Send>;

/// Simulated sampling peripheral. Every conversion request advances the
/// plant and delivers one encoded frame to the sink.
pub struct SimAdc {
    sink: Box<dyn SampleSink>,
    handle: SimHandle,
    encode: Encoder,
}

impl std::fmt::Debug for SimAdc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimAdc").field("handle", &self.handle).finish_non_exhaustive()
    }
}

impl SimAdc {
    /// `encode` turns a channel temperature into the raw reading the
    /// configured sensor would produce.
    pub fn new(
        sink: impl SampleSink + 'static,
        handle: SimHandle,
        encode: impl Fn(SimChannel, f32) -> u16 + Send + 'static,
    ) -> Self {
        Self {
            sink: Box::new(sink),
            handle,
            encode: Box::new(encode),
        }
    }

    /// All channels encoded like a MAX6675 (4 counts per °C).
    pub fn linear(sink: impl SampleSink + 'static, handle: SimHandle) -> Self {
        Self::new(sink, handle, |_, c| (c * 4.0).round().clamp(0.0, f32::from(u16::MAX)) as u16)
    }

    fn frame(&self, p: &Plant) -> [u16; slots::COUNT] {
        let mut raw = [0u16; slots::COUNT];
        for (i, slot) in raw.iter_mut().enumerate().take(slots::HOTENDS) {
            *slot = (self.encode)(SimChannel::Hotend(i), p.sensor[i]);
        }
        raw[slots::BED] = (self.encode)(SimChannel::Bed, p.bed);
        raw[slots::AMBIENT] = (self.encode)(SimChannel::Ambient, p.ambient);
        raw[slots::PINDA] = (self.encode)(SimChannel::Pinda, p.pinda());
        for (slot, forced) in raw.iter_mut().zip(p.forced) {
            if let Some(v) = forced {
                *slot = v;
            }
        }
        raw
    }
}

impl AnalogSampler for SimAdc {
    fn start_cycle(&mut self) -> HwResult {
        let raw = {
            let mut p = self.handle.lock();
            if p.fail_cycles > 0 {
                p.fail_cycles -= 1;
                return Err(Box::new(HwError::Timeout));
            }
            p.step();
            self.frame(&p)
        };
        self.sink.on_samples(&raw);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU16, Ordering};

    /// Keeps the hotend 0 slot of the last frame.
    #[derive(Default, Clone)]
    struct LastFrame(Arc<AtomicU16>);

    impl LastFrame {
        fn hotend0(&self) -> u16 {
            self.0.load(Ordering::Relaxed)
        }
    }

    impl SampleSink for LastFrame {
        fn on_samples(&self, raw: &[u16]) {
            self.0.store(raw[0], Ordering::Relaxed);
        }
    }

    fn run_ticks(out: &mut SimOutputs, on_ticks: u32, total: u32) {
        for t in 0..total {
            out.set_heater(0, t < on_ticks).expect("heater");
            out.set_bed(false).expect("bed");
            out.set_fan(false).expect("fan");
        }
    }

    #[test]
    fn full_power_heats_and_unpowered_cools() {
        let h = SimHandle::new(PlantParams::default());
        let sink = LastFrame::default();
        let mut adc = SimAdc::linear(sink.clone(), h.clone());
        let mut out = h.outputs();
        for _ in 0..100 {
            run_ticks(&mut out, 128, 128);
            adc.start_cycle().expect("cycle");
        }
        let hot = h.hotend(0);
        assert!(hot > 40.0, "hotend {hot}");
        assert!(h.heater_block(0) > hot, "sensor lags the block");
        assert_eq!(sink.hotend0(), (hot * 4.0).round() as u16);

        for _ in 0..100 {
            run_ticks(&mut out, 0, 128);
            adc.start_cycle().expect("cycle");
        }
        assert!(h.hotend(0) < hot);
    }

    #[test]
    fn duty_fraction_reaches_the_plant() {
        let h = SimHandle::new(PlantParams::default());
        let mut adc = SimAdc::linear(LastFrame::default(), h.clone());
        let mut out = h.outputs();
        run_ticks(&mut out, 32, 128);
        adc.start_cycle().expect("cycle");
        assert!((h.last_heater_fraction(0) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn failed_heater_stays_at_ambient() {
        let h = SimHandle::new(PlantParams::default());
        h.fail_heater(0, true);
        let mut adc = SimAdc::linear(LastFrame::default(), h.clone());
        let mut out = h.outputs();
        for _ in 0..50 {
            run_ticks(&mut out, 128, 128);
            adc.start_cycle().expect("cycle");
        }
        assert!((h.hotend(0) - 25.0).abs() < 1e-3);
    }

    #[test]
    fn injected_failures_and_forced_readings() {
        let h = SimHandle::new(PlantParams::default());
        let sink = LastFrame::default();
        let mut adc = SimAdc::linear(sink.clone(), h.clone());
        h.fail_cycles(1);
        let err = adc.start_cycle().expect_err("injected");
        assert!(err.to_string().contains("timeout"));
        h.force_raw(0, Some(7));
        adc.start_cycle().expect("cycle");
        assert_eq!(sink.hotend0(), 7);
        assert_eq!(h.cycles(), 1);
    }
}
