//! Latched thermal fault record.
//!
//! At most one fault is live. A later detection replaces the recorded
//! kind/source only when it outranks the current one; `asserting` tracks
//! whether any check still fails this cycle.

/// Fault kinds in priority order: the first variant outranks the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FaultKind {
    Max,
    Min,
    Preheat,
    Runaway,
    Model,
}

impl FaultKind {
    pub fn outranks(self, other: Self) -> bool {
        self < other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultSource {
    Hotend,
    Bed,
    Ambient,
}

/// State saved when the first fault of a session latches.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RecoverySnapshot {
    pub hotend_target: u16,
    pub bed_target: u16,
    pub fan_speed: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    pub kind: FaultKind,
    pub source: FaultSource,
    pub index: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaultState {
    record: Option<FaultRecord>,
    asserting: bool,
    snapshot: Option<RecoverySnapshot>,
}

impl FaultState {
    pub fn active(&self) -> bool {
        self.record.is_some()
    }

    pub fn asserting(&self) -> bool {
        self.asserting
    }

    pub fn record(&self) -> Option<FaultRecord> {
        self.record
    }

    pub fn snapshot(&self) -> Option<RecoverySnapshot> {
        self.snapshot
    }

    /// Start of a cadence cycle: checks re-assert what still fails.
    pub fn begin_cycle(&mut self) {
        self.asserting = false;
    }

    /// Latch a detection. `snapshot` is only kept for the first fault.
    /// Returns true when the recorded fault changed.
    pub fn raise(
        &mut self,
        source: FaultSource,
        index: u8,
        kind: FaultKind,
        snapshot: RecoverySnapshot,
    ) -> bool {
        self.asserting = true;
        match self.record {
            None => {
                self.snapshot = Some(snapshot);
                self.record = Some(FaultRecord {
                    kind,
                    source,
                    index,
                });
                true
            }
            Some(cur) if kind.outranks(cur.kind) => {
                self.record = Some(FaultRecord {
                    kind,
                    source,
                    index,
                });
                true
            }
            Some(_) => false,
        }
    }

    /// Drop the record entirely. Only the model fault is cleared this way.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
