//! Test and helper mocks for thermal_core

use std::error::Error;
use std::sync::{Arc, Mutex, PoisonError};

use thermal_traits::{AnalogSampler, PowerOutputs, SampleSink};

use crate::MAX_HOTENDS;
use crate::bridge::SamplePublisher;
use crate::error::Result;
use crate::frame::RawFrame;
use crate::model::ModelSettings;
use crate::ports::{SettingsStore, StatusSink};
use crate::status::{Halt, StatusReport};

type HwResult = std::result::Result<(), Box<dyn Error + Send + Sync>>;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct OutputLog {
    heater_on: [u64; MAX_HOTENDS],
    bed_writes: u64,
    bed_on: u64,
    bed_pwm: u8,
    fan_on: u64,
}

/// Power outputs that count how often each pin was driven high.
/// Clones share the same counters.
#[derive(Debug, Default, Clone)]
pub struct RecordingOutputs {
    log: Arc<Mutex<OutputLog>>,
}

impl RecordingOutputs {
    pub fn heater_on_ticks(&self, zone: usize) -> u64 {
        lock(&self.log).heater_on.get(zone).copied().unwrap_or(0)
    }

    /// PWM ticks seen (one bed write per tick).
    pub fn ticks(&self) -> u64 {
        lock(&self.log).bed_writes
    }

    pub fn bed_on_ticks(&self) -> u64 {
        lock(&self.log).bed_on
    }

    pub fn bed_pwm_last(&self) -> u8 {
        lock(&self.log).bed_pwm
    }

    pub fn fan_on_ticks(&self) -> u64 {
        lock(&self.log).fan_on
    }
}

impl PowerOutputs for RecordingOutputs {
    fn set_heater(&mut self, zone: usize, on: bool) -> HwResult {
        if on && let Some(n) = lock(&self.log).heater_on.get_mut(zone) {
            *n += 1;
        }
        Ok(())
    }

    fn set_bed(&mut self, on: bool) -> HwResult {
        let mut log = lock(&self.log);
        log.bed_writes += 1;
        if on {
            log.bed_on += 1;
        }
        Ok(())
    }

    fn set_bed_pwm(&mut self, duty: u8) -> HwResult {
        lock(&self.log).bed_pwm = duty;
        Ok(())
    }

    fn set_fan(&mut self, on: bool) -> HwResult {
        if on {
            lock(&self.log).fan_on += 1;
        }
        Ok(())
    }
}

/// Publishes a fixed frame on every `start_cycle`. The frame can be swapped
/// through a shared handle to script temperature changes.
#[derive(Debug, Clone)]
pub struct ScriptedSampler {
    publisher: SamplePublisher,
    frame: Arc<Mutex<RawFrame>>,
}

impl ScriptedSampler {
    pub fn new(publisher: SamplePublisher, frame: RawFrame) -> Self {
        Self {
            publisher,
            frame: Arc::new(Mutex::new(frame)),
        }
    }

    /// Replace the frame published from the next cycle on.
    pub fn set_frame(&self, frame: RawFrame) {
        *lock(&self.frame) = frame;
    }

    pub fn frame(&self) -> RawFrame {
        *lock(&self.frame)
    }
}

impl AnalogSampler for ScriptedSampler {
    fn start_cycle(&mut self) -> HwResult {
        let frame = *lock(&self.frame);
        self.publisher.on_samples(frame.as_slice());
        Ok(())
    }
}

/// A sampler whose peripheral always fails to start.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingSampler;

impl AnalogSampler for FailingSampler {
    fn start_cycle(&mut self) -> HwResult {
        Err(Box::new(std::io::Error::other("adc offline")))
    }
}

/// In-memory settings store. Clones share the stored value.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    slot: Arc<Mutex<Option<ModelSettings>>>,
    saves: Arc<Mutex<u32>>,
}

impl MemoryStore {
    pub fn with(settings: ModelSettings) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(settings))),
            saves: Arc::default(),
        }
    }

    pub fn stored(&self) -> Option<ModelSettings> {
        lock(&self.slot).clone()
    }

    pub fn saves(&self) -> u32 {
        *lock(&self.saves)
    }
}

impl SettingsStore for MemoryStore {
    fn load(&mut self) -> Result<Option<ModelSettings>> {
        Ok(lock(&self.slot).clone())
    }

    fn save(&mut self, settings: &ModelSettings) -> Result<()> {
        *lock(&self.slot) = Some(settings.clone());
        *lock(&self.saves) += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StatusLog {
    reports: Vec<StatusReport>,
    beeper: bool,
    beeper_changes: u32,
    halts: Vec<Halt>,
}

/// Status sink that records everything it is told. Clones share the log.
#[derive(Debug, Default, Clone)]
pub struct RecordingStatus {
    log: Arc<Mutex<StatusLog>>,
}

impl RecordingStatus {
    pub fn reports(&self) -> Vec<StatusReport> {
        lock(&self.log).reports.clone()
    }

    pub fn beeper(&self) -> bool {
        lock(&self.log).beeper
    }

    pub fn beeper_changes(&self) -> u32 {
        lock(&self.log).beeper_changes
    }

    pub fn halts(&self) -> Vec<Halt> {
        lock(&self.log).halts.clone()
    }
}

impl StatusSink for RecordingStatus {
    fn report(&mut self, report: &StatusReport) {
        lock(&self.log).reports.push(*report);
    }

    fn set_beeper(&mut self, on: bool) {
        let mut log = lock(&self.log);
        log.beeper = on;
        log.beeper_changes += 1;
    }

    fn halt(&mut self, halt: Halt) {
        lock(&self.log).halts.push(halt);
    }
}
