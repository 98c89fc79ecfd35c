//! Built-in thermistor tables.
//!
//! Raw values are oversampled sums (16 conversions of a 10-bit ADC), sorted
//! ascending. For NTC parts the temperature falls as raw rises.

use crate::sensor::Breakpoint;

const fn ov(raw: u16, celsius: f32) -> Breakpoint {
    Breakpoint {
        raw: raw * crate::sensor::OVERSAMPLE,
        celsius,
    }
}

/// EPCOS 100k (B57560G104F), 4.7k pull-up.
pub static EPCOS_100K: [Breakpoint; 64] = [
    ov(23, 300.0),
    ov(25, 295.0),
    ov(27, 290.0),
    ov(28, 285.0),
    ov(31, 280.0),
    ov(33, 275.0),
    ov(35, 270.0),
    ov(38, 265.0),
    ov(41, 260.0),
    ov(44, 255.0),
    ov(48, 250.0),
    ov(52, 245.0),
    ov(56, 240.0),
    ov(61, 235.0),
    ov(66, 230.0),
    ov(71, 225.0),
    ov(78, 220.0),
    ov(84, 215.0),
    ov(92, 210.0),
    ov(100, 205.0),
    ov(109, 200.0),
    ov(120, 195.0),
    ov(131, 190.0),
    ov(143, 185.0),
    ov(156, 180.0),
    ov(171, 175.0),
    ov(187, 170.0),
    ov(205, 165.0),
    ov(224, 160.0),
    ov(245, 155.0),
    ov(268, 150.0),
    ov(293, 145.0),
    ov(320, 140.0),
    ov(348, 135.0),
    ov(379, 130.0),
    ov(411, 125.0),
    ov(445, 120.0),
    ov(480, 115.0),
    ov(516, 110.0),
    ov(553, 105.0),
    ov(591, 100.0),
    ov(628, 95.0),
    ov(665, 90.0),
    ov(702, 85.0),
    ov(737, 80.0),
    ov(770, 75.0),
    ov(801, 70.0),
    ov(830, 65.0),
    ov(857, 60.0),
    ov(881, 55.0),
    ov(903, 50.0),
    ov(922, 45.0),
    ov(939, 40.0),
    ov(954, 35.0),
    ov(966, 30.0),
    ov(977, 25.0),
    ov(985, 20.0),
    ov(993, 15.0),
    ov(999, 10.0),
    ov(1004, 5.0),
    ov(1008, 0.0),
    ov(1012, -5.0),
    ov(1016, -10.0),
    ov(1020, -15.0),
];

/// Resolve a built-in table by its configuration name.
pub fn builtin(name: &str) -> Option<&'static [Breakpoint]> {
    match name {
        "epcos100k" | "1" => Some(&EPCOS_100K),
        _ => None,
    }
}
