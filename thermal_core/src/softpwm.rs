//! Software PWM for heater and fan outputs.
//!
//! A 7-bit counter advances once per tick. At count zero each channel latches
//! its commanded duty and switches on when the duty is non-zero; it switches
//! off once the counter passes the latched duty. The fan runs a 4-bit
//! modulator from the low counter bits. The bed additionally gets its duty
//! on a separate hardware PWM path.

use std::sync::atomic::{AtomicU8, Ordering};

use thermal_traits::PowerOutputs;

use crate::MAX_HOTENDS;
use crate::hw_error::map_hw_error;

/// Counter wraps at this value; also the full-scale heater duty.
pub const PWM_STEPS: u8 = 128;
const FAN_BITS: u8 = 4;
const FAN_MASK: u8 = (1 << FAN_BITS) - 1;

/// Commanded duties shared between the cadence, the task side and the PWM
/// modulator. Heater and bed duties are 0..=127, fan speed is 0..=255.
#[derive(Debug, Default)]
pub struct Duties {
    heaters: [AtomicU8; MAX_HOTENDS],
    bed: AtomicU8,
    bed_pwm: AtomicU8,
    fan: AtomicU8,
}

impl Duties {
    pub fn heater(&self, zone: usize) -> u8 {
        self.heaters
            .get(zone)
            .map_or(0, |d| d.load(Ordering::Relaxed))
    }

    pub fn set_heater(&self, zone: usize, duty: u8) {
        if let Some(d) = self.heaters.get(zone) {
            d.store(duty.min(PWM_STEPS - 1), Ordering::Relaxed);
        }
    }

    pub fn bed(&self) -> u8 {
        self.bed.load(Ordering::Relaxed)
    }

    pub fn bed_pwm(&self) -> u8 {
        self.bed_pwm.load(Ordering::Relaxed)
    }

    pub fn set_bed(&self, duty: u8, pwm: u8) {
        self.bed.store(duty.min(PWM_STEPS - 1), Ordering::Relaxed);
        self.bed_pwm.store(pwm, Ordering::Relaxed);
    }

    pub fn fan(&self) -> u8 {
        self.fan.load(Ordering::Relaxed)
    }

    pub fn set_fan(&self, speed: u8) {
        self.fan.store(speed, Ordering::Relaxed);
    }

    pub fn zero_heaters(&self) {
        for d in &self.heaters {
            d.store(0, Ordering::Relaxed);
        }
        self.set_bed(0, 0);
    }
}

pub struct SoftPwm<O: PowerOutputs> {
    outputs: O,
    duties: std::sync::Arc<Duties>,
    hotends: usize,
    count: u8,
    latched: [u8; MAX_HOTENDS],
    latched_bed: u8,
    latched_fan: u8,
    errors: u64,
}

impl<O: PowerOutputs> SoftPwm<O> {
    pub fn new(outputs: O, duties: std::sync::Arc<Duties>, hotends: usize) -> Self {
        Self {
            outputs,
            duties,
            hotends: hotends.min(MAX_HOTENDS),
            count: 0,
            latched: [0; MAX_HOTENDS],
            latched_bed: 0,
            latched_fan: 0,
            errors: 0,
        }
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    /// Output writes that failed since construction.
    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn outputs(&self) -> &O {
        &self.outputs
    }

    /// Advance the modulator by one tick and drive every pin.
    pub fn tick(&mut self) {
        let fan_phase = self.count & FAN_MASK;
        if self.count == 0 {
            for (zone, slot) in self.latched.iter_mut().enumerate().take(self.hotends) {
                *slot = self.duties.heater(zone);
            }
            self.latched_bed = self.duties.bed();
            let pwm = self.duties.bed_pwm();
            let res = self.outputs.set_bed_pwm(pwm);
            self.check(res, "bed pwm");
        }
        if fan_phase == 0 {
            self.latched_fan = self.duties.fan() >> (8 - FAN_BITS);
        }

        for zone in 0..self.hotends {
            let duty = self.latched[zone];
            let res = self.outputs.set_heater(zone, duty > 0 && self.count <= duty);
            self.check(res, "heater");
        }
        let on = self.latched_bed > 0 && self.count <= self.latched_bed;
        let res = self.outputs.set_bed(on);
        self.check(res, "bed");
        let on = self.latched_fan > 0 && fan_phase <= self.latched_fan;
        let res = self.outputs.set_fan(on);
        self.check(res, "fan");

        self.count = (self.count + 1) % PWM_STEPS;
    }

    /// One full counter period.
    pub fn run_period(&mut self) {
        for _ in 0..PWM_STEPS {
            self.tick();
        }
    }

    /// Force every output off, used on shutdown.
    pub fn all_off(&mut self) {
        for zone in 0..self.hotends {
            let res = self.outputs.set_heater(zone, false);
            self.check(res, "heater");
        }
        let res = self.outputs.set_bed(false);
        self.check(res, "bed");
        let res = self.outputs.set_bed_pwm(0);
        self.check(res, "bed pwm");
    }

    fn check(&mut self, res: Result<(), Box<dyn std::error::Error + Send + Sync>>, pin: &'static str) {
        if let Err(e) = res {
            self.errors += 1;
            // rate-limit: first failure and every 1000th after that
            if self.errors % 1000 == 1 {
                let err = map_hw_error(e.as_ref());
                tracing::error!(pin, error = %err, count = self.errors, "power output write failed");
            }
        }
    }
}

impl<O: PowerOutputs> Drop for SoftPwm<O> {
    fn drop(&mut self) {
        self.all_off();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::RecordingOutputs;
    use std::sync::Arc;

    fn pwm(duty: u8, fan: u8) -> SoftPwm<RecordingOutputs> {
        let d = Arc::new(Duties::default());
        d.set_heater(0, duty);
        d.set_fan(fan);
        SoftPwm::new(RecordingOutputs::default(), d, 1)
    }

    #[test]
    fn heater_on_fraction_tracks_duty() {
        let mut p = pwm(63, 0);
        p.run_period();
        // on for counts 0..=63
        assert_eq!(p.outputs().heater_on_ticks(0), 64);
        assert_eq!(p.outputs().ticks(), 128);
    }

    #[test]
    fn zero_duty_never_switches_on() {
        let mut p = pwm(0, 0);
        p.run_period();
        assert_eq!(p.outputs().heater_on_ticks(0), 0);
    }

    #[test]
    fn duty_latched_at_period_start() {
        let d = Arc::new(Duties::default());
        d.set_heater(0, 127);
        let mut p = SoftPwm::new(RecordingOutputs::default(), Arc::clone(&d), 1);
        p.tick();
        d.set_heater(0, 0);
        for _ in 1..PWM_STEPS {
            p.tick();
        }
        assert_eq!(p.outputs().heater_on_ticks(0), 128);
    }

    #[test]
    fn fan_uses_four_bit_modulator() {
        let mut p = pwm(0, 128);
        p.run_period();
        // 128 >> 4 = 8: on for phases 0..=8 of each 16-tick window
        assert_eq!(p.outputs().fan_on_ticks(), 8 * 9);
    }

    #[test]
    fn duties_are_clamped_to_seven_bits() {
        let d = Duties::default();
        d.set_heater(0, 255);
        d.set_bed(200, 255);
        assert_eq!(d.heater(0), 127);
        assert_eq!(d.bed(), 127);
        assert_eq!(d.bed_pwm(), 255);
        assert_eq!(d.heater(MAX_HOTENDS), 0);
    }
}
