//! Narrow interfaces to collaborators outside the thermal core.

use crate::error::Result;
use crate::model::ModelSettings;
use crate::status::{Halt, StatusReport};

/// Operator interface: display, beeper and job control.
pub trait StatusSink: Send {
    fn report(&mut self, report: &StatusReport);
    fn set_beeper(&mut self, on: bool);
    fn halt(&mut self, halt: Halt);
}

/// Persistent storage for thermal-model settings.
pub trait SettingsStore: Send {
    /// `Ok(None)` when nothing was stored yet.
    fn load(&mut self) -> Result<Option<ModelSettings>>;
    fn save(&mut self, settings: &ModelSettings) -> Result<()>;
}

/// Motion/job state. Calibration refuses to run while busy.
pub trait BusySignal: Send {
    fn busy(&self) -> bool;
}

impl<F> BusySignal for F
where
    F: Fn() -> bool + Send,
{
    fn busy(&self) -> bool {
        self()
    }
}

/// Status sink used when none is supplied: reports go to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatus;

impl StatusSink for LogStatus {
    fn report(&mut self, report: &StatusReport) {
        if report.serious {
            tracing::error!(event = ?report.event, zone = ?report.zone, current = ?report.current, "thermal status");
        } else {
            tracing::info!(event = ?report.event, zone = ?report.zone, "thermal status");
        }
    }

    fn set_beeper(&mut self, on: bool) {
        tracing::debug!(on, "beeper");
    }

    fn halt(&mut self, halt: Halt) {
        tracing::warn!(?halt, "halt requested");
    }
}
