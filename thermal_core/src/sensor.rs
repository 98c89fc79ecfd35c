//! Raw ADC reading to temperature conversion.
//!
//! Every channel is linearized either by a breakpoint table (thermistors) or
//! by a linear gain/offset (amplified thermocouples). Tables saturate to
//! their boundary entries; nothing extrapolates past the measured range.

use std::borrow::Cow;

use crate::error::ThermalError;
use crate::frame::{Channel, RawFrame};

/// Conversions summed per published reading.
pub const OVERSAMPLE: u16 = 16;

/// Upper bound of an oversampled 10-bit reading.
pub const RAW_FULL_SCALE: u16 = 1023 * OVERSAMPLE;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Breakpoint {
    pub raw: u16,
    pub celsius: f32,
}

/// Direction temperature moves as raw grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// Temperature rises with raw (thermocouple amplifiers, PTC).
    Rising,
    /// Temperature falls with raw (NTC thermistors).
    Falling,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sensor {
    Table(Cow<'static, [Breakpoint]>),
    /// `raw * (500/1024) / 16 * gain + offset`.
    Ad595 { gain: f32, offset: f32 },
    /// 0.25 °C per count.
    Max6675,
}

impl Sensor {
    pub fn to_celsius(&self, raw: u16) -> f32 {
        match self {
            Self::Table(points) => interpolate(points, raw),
            Self::Ad595 { gain, offset } => {
                f32::from(raw) * (500.0 / 1024.0) / f32::from(OVERSAMPLE) * gain + offset
            }
            Self::Max6675 => f32::from(raw) * 0.25,
        }
    }

    /// Raw reading that linearizes to `celsius`, saturating at the sensor
    /// range. Used to drive simulated peripherals.
    pub fn to_raw(&self, celsius: f32) -> u16 {
        let raw = match self {
            Self::Table(points) => return invert(points, celsius),
            Self::Ad595 { gain, offset } => {
                (celsius - offset) / gain * f32::from(OVERSAMPLE) * (1024.0 / 500.0)
            }
            Self::Max6675 => celsius * 4.0,
        };
        raw.round().clamp(0.0, f32::from(RAW_FULL_SCALE)) as u16
    }

    pub fn polarity(&self) -> Polarity {
        match self {
            Self::Table(points) => match (points.first(), points.last()) {
                (Some(a), Some(b)) if b.celsius < a.celsius => Polarity::Falling,
                _ => Polarity::Rising,
            },
            Self::Ad595 { gain, .. } if *gain < 0.0 => Polarity::Falling,
            _ => Polarity::Rising,
        }
    }
}

fn interpolate(points: &[Breakpoint], raw: u16) -> f32 {
    let Some(first) = points.first() else {
        return f32::NAN;
    };
    if raw <= first.raw {
        return first.celsius;
    }
    for w in points.windows(2) {
        let (lo, hi) = (w[0], w[1]);
        if hi.raw > raw {
            let span = f32::from(hi.raw - lo.raw);
            return lo.celsius + f32::from(raw - lo.raw) * (hi.celsius - lo.celsius) / span;
        }
    }
    points.last().map_or(f32::NAN, |p| p.celsius)
}

fn invert(points: &[Breakpoint], celsius: f32) -> u16 {
    for w in points.windows(2) {
        let (lo, hi) = (w[0], w[1]);
        let (cmin, cmax) = if lo.celsius <= hi.celsius {
            (lo.celsius, hi.celsius)
        } else {
            (hi.celsius, lo.celsius)
        };
        if (cmin..=cmax).contains(&celsius) && hi.celsius != lo.celsius {
            let f = (celsius - lo.celsius) / (hi.celsius - lo.celsius);
            return (f32::from(lo.raw) + f * f32::from(hi.raw - lo.raw)).round() as u16;
        }
    }
    // outside the table: nearest end
    points
        .iter()
        .min_by(|a, b| (a.celsius - celsius).abs().total_cmp(&(b.celsius - celsius).abs()))
        .map_or(0, |p| p.raw)
}

/// Piecewise correction the bed thermistor carries on some machines.
///
/// Kept formula-for-formula with deployed firmware, including the
/// `(100 - center)` term of the upper segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BedOffset {
    pub start: f32,
    pub center: f32,
    pub offset: f32,
}

impl BedOffset {
    pub fn apply(&self, c: f32) -> f32 {
        let first_koef = (self.offset / 2.0) / (self.center - self.start);
        let second_koef = (self.offset / 2.0) / (100.0 - self.center);
        if c >= self.start && c <= self.center {
            c + first_koef * (c - self.start)
        } else if c > self.center && c <= 100.0 {
            c + first_koef * (self.center - self.start) + second_koef * (c - (100.0 - self.center))
        } else if c > 100.0 {
            c + self.offset
        } else {
            c
        }
    }
}

/// Linearized temperatures for one sampling cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Temperatures {
    pub hotends: [f32; crate::MAX_HOTENDS],
    pub bed: f32,
    pub ambient: Option<f32>,
    pub pinda: Option<f32>,
}

/// Per-channel sensor set, sized once at startup.
#[derive(Debug, Clone)]
pub struct Linearizer {
    pub(crate) hotends: Vec<Sensor>,
    pub(crate) bed: Sensor,
    pub(crate) bed_offset: Option<BedOffset>,
    pub(crate) ambient: Option<Sensor>,
    pub(crate) pinda: Option<Sensor>,
}

impl Linearizer {
    pub fn new(hotends: Vec<Sensor>, bed: Sensor) -> Self {
        Self {
            hotends,
            bed,
            bed_offset: None,
            ambient: None,
            pinda: None,
        }
    }

    pub fn with_bed_offset(mut self, offset: BedOffset) -> Self {
        self.bed_offset = Some(offset);
        self
    }

    pub fn with_ambient(mut self, sensor: Sensor) -> Self {
        self.ambient = Some(sensor);
        self
    }

    pub fn with_pinda(mut self, sensor: Sensor) -> Self {
        self.pinda = Some(sensor);
        self
    }

    pub fn hotend_count(&self) -> usize {
        self.hotends.len()
    }

    pub fn hotend_sensor(&self, index: usize) -> Result<&Sensor, ThermalError> {
        self.hotends.get(index).ok_or(ThermalError::InvalidZone {
            index,
            configured: self.hotends.len(),
        })
    }

    /// Convert a hotend reading. An index outside the configured set is a
    /// configuration defect and is reported as fatal.
    pub fn hotend(&self, index: usize, raw: u16) -> Result<f32, ThermalError> {
        Ok(self.hotend_sensor(index)?.to_celsius(raw))
    }

    pub fn bed(&self, raw: u16) -> f32 {
        let c = self.bed.to_celsius(raw);
        self.bed_offset.map_or(c, |o| o.apply(c))
    }

    pub fn ambient(&self, raw: u16) -> Option<f32> {
        self.ambient.as_ref().map(|s| s.to_celsius(raw))
    }

    pub fn pinda(&self, raw: u16) -> Option<f32> {
        self.pinda.as_ref().map(|s| s.to_celsius(raw))
    }

    /// Linearize every configured channel of a frame.
    pub fn convert(&self, frame: &RawFrame) -> Temperatures {
        let mut out = Temperatures::default();
        for (i, sensor) in self.hotends.iter().enumerate() {
            out.hotends[i] = sensor.to_celsius(frame.get(Channel::Hotend(i)));
        }
        out.bed = self.bed(frame.get(Channel::Bed));
        out.ambient = self.ambient(frame.get(Channel::Ambient));
        out.pinda = self.pinda(frame.get(Channel::Pinda));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::EPCOS_100K;

    fn table() -> Sensor {
        Sensor::Table(Cow::Borrowed(&EPCOS_100K))
    }

    #[test]
    fn exact_breakpoints_map_to_their_temperature() {
        let s = table();
        assert_eq!(s.to_celsius(109 * 16), 200.0);
        assert_eq!(s.to_celsius(977 * 16), 25.0);
    }

    #[test]
    fn interpolates_between_breakpoints() {
        let s = table();
        // halfway between (591, 100) and (628, 95) in oversampled units
        let raw = (591 * 16 + 628 * 16) / 2;
        let c = s.to_celsius(raw);
        assert!((c - 97.5).abs() < 0.01, "{c}");
    }

    #[test]
    fn saturates_at_both_ends() {
        let s = table();
        assert_eq!(s.to_celsius(0), 300.0);
        assert_eq!(s.to_celsius(u16::MAX), -15.0);
    }

    #[test]
    fn ntc_tables_fall_with_raw() {
        assert_eq!(table().polarity(), Polarity::Falling);
        assert_eq!(Sensor::Max6675.polarity(), Polarity::Rising);
    }

    #[test]
    fn linear_sensors() {
        assert_eq!(Sensor::Max6675.to_celsius(800), 200.0);
        let ad = Sensor::Ad595 {
            gain: 1.0,
            offset: 0.0,
        };
        assert!((ad.to_celsius(1024 * 16) - 500.0).abs() < 1e-3);
    }

    #[test]
    fn to_raw_inverts_the_conversion() {
        let s = table();
        for c in [25.0_f32, 97.5, 200.0, 250.0] {
            let back = s.to_celsius(s.to_raw(c));
            assert!((back - c).abs() < 0.5, "{c} -> {back}");
        }
        // out of range saturates at the table ends
        assert_eq!(s.to_celsius(s.to_raw(400.0)), 300.0);
        assert_eq!(s.to_celsius(s.to_raw(-40.0)), -15.0);
        assert_eq!(Sensor::Max6675.to_raw(200.0), 800);
    }

    #[test]
    fn invalid_hotend_index_is_fatal() {
        let lin = Linearizer::new(vec![table()], table());
        assert_eq!(
            lin.hotend(3, 1000),
            Err(ThermalError::InvalidZone {
                index: 3,
                configured: 1
            })
        );
    }

    #[test]
    fn bed_offset_segments() {
        let o = BedOffset {
            start: 40.0,
            center: 60.0,
            offset: 4.0,
        };
        assert_eq!(o.apply(30.0), 30.0);
        // lower segment: 2/20 per degree above start
        assert!((o.apply(50.0) - 51.0).abs() < 1e-5);
        // upper segment keeps the (100 - center) term
        let expected = 80.0 + 0.1 * 20.0 + (2.0 / 40.0) * (80.0 - 40.0);
        assert!((o.apply(80.0) - expected).abs() < 1e-5);
        assert_eq!(o.apply(120.0), 124.0);
    }
}
