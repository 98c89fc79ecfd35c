use std::borrow::Cow;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use thermal_core::bridge;
use thermal_core::frame::{Channel, RawFrame};
use thermal_core::mocks::{RecordingOutputs, ScriptedSampler};
use thermal_core::model::{ModelInput, ModelParams, ModelSettings, R_SIZE, ThermalModel};
use thermal_core::pid::{Pid, PidGains, RegulationStrategy};
use thermal_core::sensor::{Linearizer, Sensor};
use thermal_core::tables::EPCOS_100K;
use thermal_core::{ThermalConfig, ThermalSystem, ZoneId};

fn ntc() -> Sensor {
    Sensor::Table(Cow::Borrowed(&EPCOS_100K))
}

fn frame(hotend: f32) -> RawFrame {
    let s = ntc();
    let mut f = RawFrame::default();
    f.set(Channel::Hotend(0), s.to_raw(hotend));
    f.set(Channel::Bed, s.to_raw(60.0));
    f
}

fn sample_size(g: &mut criterion::BenchmarkGroup<'_, criterion::measurement::WallTime>) {
    // BENCH_SAMPLE_SIZE=10 cargo bench -p thermal_core --bench cycle
    let n = std::env::var("BENCH_SAMPLE_SIZE")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(50);
    g.sample_size(n.max(10));
}

pub fn bench_control_path(c: &mut Criterion) {
    let mut g = c.benchmark_group("control_path");
    sample_size(&mut g);

    let lin = Linearizer::new(vec![ntc()], ntc());
    let f = frame(215.0);
    g.bench_function("linearize", |b| b.iter(|| black_box(lin.convert(black_box(&f)))));

    let mut pid = Pid::new(
        PidGains {
            kp: 16.13,
            ki: 1.1625,
            kd: 56.23,
        },
        0.27,
        255,
    );
    let mut t = 0u64;
    g.bench_function("pid", |b| {
        b.iter(|| {
            t += 270;
            black_box(pid.output(black_box(212.5), 215.0, t))
        })
    });

    let mut model = ThermalModel::new(
        ModelSettings {
            params: ModelParams {
                c: 12.1,
                r: [20.5; R_SIZE],
                ..ModelParams::default()
            },
            enabled: true,
            ..ModelSettings::default()
        },
        0.27,
    );
    let input = ModelInput {
        temperature: 215.0,
        ambient: 25.0,
        duty: 40,
        fan_speed: 128,
    };
    g.bench_function("model_check", |b| b.iter(|| black_box(model.check(black_box(input)))));
    g.finish();
}

pub fn bench_full_cycle(c: &mut Criterion) {
    let mut g = c.benchmark_group("full_cycle");
    sample_size(&mut g);

    let (publisher, bridge) = bridge::channel();
    let mut sys = ThermalSystem::builder()
        .with_sampler(ScriptedSampler::new(publisher, frame(214.0)), bridge)
        .with_outputs(RecordingOutputs::default())
        .with_config(ThermalConfig::default())
        .manual_drive()
        .build()
        .expect("build");
    sys.set_target(ZoneId::Hotend(0), 215).expect("target");
    // one cadence tick, one PWM period and the task-side pass
    g.bench_function("idle", |b| b.iter(|| sys.idle()));
    g.finish();
}

criterion_group!(benches, bench_control_path, bench_full_cycle);
criterion_main!(benches);
