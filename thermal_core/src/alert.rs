//! Operator prompt after a MINTEMP fault has cleared physically.
//!
//! The controller never resumes on its own. Once the zone is warm again the
//! display alternates between "MINTEMP fixed" and "Please restart", each
//! held for a few task iterations.

use crate::fault::FaultSource;
use crate::status::StatusEvent;

/// Task iterations each message is held for.
pub const SPEED_DIV: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MinTempAlertState {
    #[default]
    Init,
    TempAboveMintemp,
    ShowPleaseRestart,
    ShowMintemp,
}

#[derive(Debug, Clone)]
pub struct MinTempAlert {
    state: MinTempAlertState,
    repeat: u8,
}

impl Default for MinTempAlert {
    fn default() -> Self {
        Self {
            state: MinTempAlertState::Init,
            repeat: SPEED_DIV,
        }
    }
}

impl MinTempAlert {
    pub fn state(&self) -> MinTempAlertState {
        self.state
    }

    fn substep(&mut self, next: MinTempAlertState) {
        if self.repeat == 0 {
            self.state = next;
            self.repeat = SPEED_DIV;
        } else {
            self.repeat -= 1;
        }
    }

    /// Advance one task iteration. `threshold` is MINTEMP plus hysteresis.
    ///
    /// While still cold the MINTEMP message stays on the display, so `Init`
    /// reports nothing.
    pub fn step(&mut self, source: FaultSource, current: f32, threshold: f32) -> Option<StatusEvent> {
        match self.state {
            MinTempAlertState::Init => {
                if current > threshold {
                    self.state = MinTempAlertState::TempAboveMintemp;
                }
                None
            }
            MinTempAlertState::TempAboveMintemp => {
                self.substep(MinTempAlertState::ShowMintemp);
                Some(StatusEvent::MinTempFixed(source))
            }
            MinTempAlertState::ShowPleaseRestart => {
                self.substep(MinTempAlertState::ShowMintemp);
                Some(StatusEvent::PleaseRestart)
            }
            MinTempAlertState::ShowMintemp => {
                self.substep(MinTempAlertState::ShowPleaseRestart);
                Some(StatusEvent::MinTempFixed(source))
            }
        }
    }
}
