pub mod clock;

pub use clock::{Clock, MonotonicClock};

#[cfg(any(test, feature = "test-util"))]
pub use clock::manual::ManualClock;

/// Slot layout of one raw sample frame as delivered to a `SampleSink`.
pub mod slots {
    /// Hotend slots come first, one per possible hotend.
    pub const HOTENDS: usize = 4;
    pub const BED: usize = HOTENDS;
    pub const AMBIENT: usize = HOTENDS + 1;
    pub const PINDA: usize = HOTENDS + 2;
    pub const COUNT: usize = HOTENDS + 3;
}

/// Receives one completed conversion cycle from the sampling peripheral.
///
/// Called from the peripheral's completion context; implementations must not
/// block. `raw` holds one oversampled reading per configured channel.
pub trait SampleSink: Send + Sync {
    fn on_samples(&self, raw: &[u16]);
}

/// Multi-channel analog sampling peripheral.
pub trait AnalogSampler: Send {
    /// Request the next conversion cycle. Results are delivered to the
    /// `SampleSink` the peripheral was constructed with.
    fn start_cycle(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Switched heater and fan outputs driven by the software PWM modulator.
pub trait PowerOutputs: Send {
    fn set_heater(
        &mut self,
        zone: usize,
        on: bool,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    fn set_bed(&mut self, on: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    /// Separate hardware PWM path for the bed (0..=255).
    fn set_bed_pwm(&mut self, duty: u8) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    fn set_fan(&mut self, on: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

impl<T: PowerOutputs + ?Sized> PowerOutputs for Box<T> {
    fn set_heater(
        &mut self,
        zone: usize,
        on: bool,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).set_heater(zone, on)
    }

    fn set_bed(&mut self, on: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).set_bed(on)
    }

    fn set_bed_pwm(&mut self, duty: u8) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).set_bed_pwm(duty)
    }

    fn set_fan(&mut self, on: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).set_fan(on)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Pins {
        heaters: [bool; slots::HOTENDS],
        bed: bool,
        bed_pwm: u8,
        fan: bool,
    }

    impl PowerOutputs for Pins {
        fn set_heater(
            &mut self,
            zone: usize,
            on: bool,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.heaters[zone] = on;
            Ok(())
        }

        fn set_bed(&mut self, on: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.bed = on;
            Ok(())
        }

        fn set_bed_pwm(&mut self, duty: u8) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.bed_pwm = duty;
            Ok(())
        }

        fn set_fan(&mut self, on: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.fan = on;
            Ok(())
        }
    }

    fn drive<O: PowerOutputs>(out: &mut O) {
        out.set_heater(1, true).unwrap();
        out.set_bed(true).unwrap();
        out.set_bed_pwm(77).unwrap();
        out.set_fan(true).unwrap();
    }

    #[test]
    fn boxed_outputs_forward_to_the_backend() {
        let mut boxed: Box<Pins> = Box::default();
        drive(&mut boxed);
        assert!(boxed.heaters[1] && !boxed.heaters[0]);
        assert!(boxed.bed && boxed.fan);
        assert_eq!(boxed.bed_pwm, 77);

        let mut erased: Box<dyn PowerOutputs> = Box::new(Pins::default());
        drive(&mut erased);
    }
}
