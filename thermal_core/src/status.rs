//! Status codes reported to the operator interface.

use crate::fault::{FaultKind, FaultSource};

/// Categorical status code. Rendering to text is the UI's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusEvent {
    MaxTemp(FaultSource),
    MinTemp(FaultSource),
    PreheatError(FaultSource),
    ThermalRunaway(FaultSource),
    /// Model residual above the error threshold.
    ModelFault,
    /// Model residual above the warning threshold.
    ThermalAnomaly,
    MinTempFixed(FaultSource),
    PleaseRestart,
    AutotuneStarted,
    AutotuneFinished,
    AutotuneFailed,
}

impl StatusEvent {
    /// Event announcing a freshly latched fault.
    pub fn for_fault(kind: FaultKind, source: FaultSource) -> Self {
        match kind {
            FaultKind::Max => Self::MaxTemp(source),
            FaultKind::Min => Self::MinTemp(source),
            FaultKind::Preheat => Self::PreheatError(source),
            FaultKind::Runaway => Self::ThermalRunaway(source),
            FaultKind::Model => Self::ModelFault,
        }
    }

    /// Faults that need a power cycle before printing can continue.
    pub fn is_serious(self) -> bool {
        matches!(
            self,
            Self::MaxTemp(_) | Self::MinTemp(_) | Self::PreheatError(_) | Self::ThermalRunaway(_)
        )
    }
}

/// One report to the operator interface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusReport {
    pub event: StatusEvent,
    pub zone: Option<u8>,
    pub current: Option<f32>,
    pub target: Option<u16>,
    pub serious: bool,
}

impl StatusReport {
    pub fn new(event: StatusEvent) -> Self {
        Self {
            event,
            zone: None,
            current: None,
            target: None,
            serious: event.is_serious(),
        }
    }

    pub fn zone(mut self, zone: u8) -> Self {
        self.zone = Some(zone);
        self
    }

    pub fn temperatures(mut self, current: f32, target: u16) -> Self {
        self.current = Some(current);
        self.target = Some(target);
        self
    }
}

/// How a fault stops the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// Abort the job; recovery needs a restart.
    Stop,
    /// Pause the job with the thermal-stop reason.
    ThermalStop,
}
