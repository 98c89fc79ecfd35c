//! Heater, bed and fan switching on Raspberry Pi GPIO.

use rppal::gpio::{Gpio, OutputPin};
use thermal_traits::PowerOutputs;

use crate::error::{HwError, Result};

type HwResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Bed PWM carrier frequency on the dedicated PWM pin.
const BED_PWM_HZ: f64 = 1_000.0;

fn gpio_err(e: rppal::gpio::Error) -> HwError {
    HwError::Gpio(e.to_string())
}

/// BCM pin numbers of the switched outputs.
#[derive(Debug, Clone)]
pub struct PinMap {
    pub heaters: Vec<u8>,
    pub bed: u8,
    pub bed_pwm: Option<u8>,
    pub fan: u8,
}

pub struct GpioOutputs {
    heaters: Vec<OutputPin>,
    bed: OutputPin,
    bed_pwm: Option<OutputPin>,
    fan: OutputPin,
    last_bed_pwm: Option<u8>,
}

impl GpioOutputs {
    /// Claim every pin and drive it low.
    pub fn new(pins: &PinMap) -> Result<Self> {
        let gpio = Gpio::new().map_err(gpio_err)?;
        let out = |pin: u8| -> Result<OutputPin> { Ok(gpio.get(pin).map_err(gpio_err)?.into_output_low()) };
        let heaters = pins.heaters.iter().map(|p| out(*p)).collect::<Result<Vec<_>>>()?;
        let bed = out(pins.bed)?;
        let bed_pwm = pins.bed_pwm.map(out).transpose()?;
        let fan = out(pins.fan)?;
        tracing::info!(heaters = ?pins.heaters, bed = pins.bed, fan = pins.fan, "gpio outputs claimed");
        Ok(Self {
            heaters,
            bed,
            bed_pwm,
            fan,
            last_bed_pwm: None,
        })
    }
}

fn write(pin: &mut OutputPin, on: bool) {
    if on {
        pin.set_high();
    } else {
        pin.set_low();
    }
}

impl PowerOutputs for GpioOutputs {
    fn set_heater(&mut self, zone: usize, on: bool) -> HwResult {
        let pin = self
            .heaters
            .get_mut(zone)
            .ok_or_else(|| HwError::Gpio(format!("no heater pin for zone {zone}")))?;
        write(pin, on);
        Ok(())
    }

    fn set_bed(&mut self, on: bool) -> HwResult {
        write(&mut self.bed, on);
        Ok(())
    }

    fn set_bed_pwm(&mut self, duty: u8) -> HwResult {
        let Some(pin) = self.bed_pwm.as_mut() else {
            return Ok(());
        };
        if self.last_bed_pwm == Some(duty) {
            return Ok(());
        }
        pin.set_pwm_frequency(BED_PWM_HZ, f64::from(duty) / 255.0)
            .map_err(gpio_err)?;
        self.last_bed_pwm = Some(duty);
        Ok(())
    }

    fn set_fan(&mut self, on: bool) -> HwResult {
        write(&mut self.fan, on);
        Ok(())
    }
}

impl Drop for GpioOutputs {
    fn drop(&mut self) {
        for pin in &mut self.heaters {
            pin.set_low();
        }
        self.bed.set_low();
        if let Some(pin) = self.bed_pwm.as_mut() {
            let _ = pin.clear_pwm();
            pin.set_low();
        }
        tracing::debug!("gpio outputs released low");
    }
}
