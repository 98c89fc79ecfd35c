//! Shared rig: a thermal system wired to the simulated plant.
#![allow(dead_code)]

use thermal_core::bridge;
use thermal_core::mocks::{MemoryStore, RecordingStatus};
use thermal_core::{ThermalConfig, ThermalSystem};
use thermal_hardware::{PlantParams, SimAdc, SimChannel, SimHandle};

pub struct Rig {
    pub sys: ThermalSystem,
    pub plant: SimHandle,
    pub status: RecordingStatus,
    pub store: MemoryStore,
}

/// Encoder producing the raw counts each configured sensor would report.
fn encoder(cfg: &ThermalConfig) -> impl Fn(SimChannel, f32) -> u16 + Send + 'static {
    let hotends: Vec<_> = cfg.hotends.iter().map(|z| z.sensor.clone()).collect();
    let bed = cfg.bed.sensor.clone();
    let ambient = cfg.ambient.as_ref().map(|a| a.sensor.clone());
    move |ch, celsius| match ch {
        SimChannel::Hotend(i) => hotends.get(i).unwrap_or(&bed).to_raw(celsius),
        SimChannel::Ambient => ambient.as_ref().unwrap_or(&bed).to_raw(celsius),
        SimChannel::Bed | SimChannel::Pinda => bed.to_raw(celsius),
    }
}

pub fn rig_with(cfg: ThermalConfig, busy: bool) -> Rig {
    let plant = SimHandle::new(PlantParams {
        interval: cfg.cadence.interval(),
        ..PlantParams::default()
    });
    let status = RecordingStatus::default();
    let store = MemoryStore::default();
    let (publisher, bridge) = bridge::channel();
    let adc = SimAdc::new(publisher, plant.clone(), encoder(&cfg));
    let sys = ThermalSystem::builder()
        .with_sampler(adc, bridge)
        .with_outputs(plant.outputs())
        .with_config(cfg)
        .with_status(status.clone())
        .with_settings_store(store.clone())
        .with_busy_signal(move || busy)
        .manual_drive()
        .build()
        .expect("build thermal system");
    Rig {
        sys,
        plant,
        status,
        store,
    }
}

pub fn rig() -> Rig {
    rig_with(ThermalConfig::default(), false)
}

impl Rig {
    /// Idle until a fault latches or `max_cycles` iterations pass.
    pub fn run_until_fault(&mut self, max_cycles: u64) -> bool {
        for _ in 0..max_cycles {
            self.sys.idle();
            if self.sys.fault().is_some() {
                return true;
            }
        }
        false
    }

    pub fn idle(&mut self, n: usize) {
        for _ in 0..n {
            self.sys.idle();
        }
    }
}
