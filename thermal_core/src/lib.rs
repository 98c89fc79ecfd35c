#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Heater thermal management (hardware-agnostic).
//!
//! All hardware access goes through `thermal_traits::AnalogSampler` and
//! `thermal_traits::PowerOutputs`.
//!
//! ## Architecture
//!
//! - **Cadence side** (`manager`): once per sampling cycle, linearize the
//!   frame, run the fault stack (MAXTEMP, MINTEMP, runaway/preheat, thermal
//!   model) and regulate every zone.
//! - **Task side** (`system`): owns targets, reacts to latched faults and
//!   warnings, talks to the operator interface and the settings store.
//! - **Hand-off** (`bridge`, `guard`): a capacity-one channel for raw frames
//!   and a guard that excludes the cadence while shared state is touched.
//! - **Outputs** (`softpwm`): 7-bit software PWM reading lock-free duties.
//! - **Calibration** (`calibration`, `pid_autotune`): model self-calibration
//!   and relay PID autotune, both run cooperatively from the task.

pub mod alert;
pub mod atomic;
pub mod bridge;
pub mod builder;
pub mod cadence;
pub mod calibration;
pub mod config;
pub mod conversions;
pub mod error;
pub mod fault;
pub mod frame;
pub mod guard;
pub mod hw_error;
pub mod limits;
pub mod manager;
pub mod mocks;
pub mod model;
pub mod persist;
pub mod pid;
pub mod pid_autotune;
pub mod ports;
pub mod runaway;
pub mod sensor;
pub mod softpwm;
pub mod status;
pub mod system;
pub mod tables;
pub mod util;

/// Upper bound on configured hotends; also the width of every per-hotend array.
pub const MAX_HOTENDS: usize = thermal_config::MAX_HOTENDS;

pub use builder::{Missing, Set, ThermalBuilder};
pub use config::ThermalConfig;
pub use error::{BuildError, CalibrationError, Report, Result, ThermalError};
pub use fault::{FaultKind, FaultRecord, FaultSource, RecoverySnapshot};
pub use manager::ZoneId;
pub use model::ModelSettings;
pub use pid::PidGains;
pub use ports::{BusySignal, LogStatus, SettingsStore, StatusSink};
pub use sensor::Temperatures;
pub use status::{Halt, StatusEvent, StatusReport};
pub use system::{ModelParamUpdate, ThermalSystem};
