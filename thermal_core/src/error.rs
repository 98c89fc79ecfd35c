use thiserror::Error;

use crate::fault::{FaultKind, FaultSource};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ThermalError {
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("hardware fault: {0}")]
    HardwareFault(String),
    #[error("timeout waiting for samples")]
    Timeout,
    /// A zone index outside the configured arena. Treated as fatal.
    #[error("invalid zone index {index} (configured: {configured})")]
    InvalidZone { index: usize, configured: usize },
    #[error("thermal fault: {kind:?} on {origin:?} {index}")]
    Fault {
        kind: FaultKind,
        origin: FaultSource,
        index: u8,
    },
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("io error: {0}")]
    Io(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("missing analog sampler")]
    MissingSampler,
    #[error("missing power outputs")]
    MissingOutputs,
    #[error("missing controller config")]
    MissingConfig,
    #[error("unknown sensor table: {0}")]
    UnknownSensorTable(String),
    #[error("sensor limit {0} is outside the sensor range")]
    LimitOutOfRange(&'static str),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

/// Reasons a calibration procedure stops without a result.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("printer is busy")]
    Busy,
    #[error("no such heat zone")]
    InvalidZone,
    #[error("calibration interrupted by a thermal fault")]
    Interrupted,
    #[error("estimation of {0} did not converge")]
    NotConverged(&'static str),
    #[error("temperature overshot the autotune target")]
    Overshoot,
    #[error("autotune timed out")]
    TimedOut,
    #[error("temperature did not rise while heating")]
    NoRise,
}

pub type Result<T, E = Report> = std::result::Result<T, E>;
pub use eyre::Report;
