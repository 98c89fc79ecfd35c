//! Heater hardware backends: a simulated two-node heater plant with its
//! sampling peripheral and outputs, and Raspberry Pi GPIO outputs behind the
//! `hardware` feature.

pub mod error;
pub mod sim;

#[cfg(all(feature = "hardware", target_os = "linux"))]
pub mod gpio;

pub use sim::{PlantParams, SimAdc, SimChannel, SimHandle, SimOutputs};
