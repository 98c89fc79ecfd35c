mod common;

use common::{rig, rig_with};
use thermal_core::model::R_SIZE;
use thermal_core::sensor::RAW_FULL_SCALE;
use thermal_core::{
    CalibrationError, FaultKind, FaultSource, Halt, ModelParamUpdate, PidGains, StatusEvent,
    ThermalConfig, ThermalError, ZoneId,
};

const HOTEND: ZoneId = ZoneId::Hotend(0);

fn events(status: &thermal_core::mocks::RecordingStatus) -> Vec<StatusEvent> {
    status.reports().iter().map(|r| r.event).collect()
}

#[test]
fn heats_to_target_and_holds() {
    let mut r = rig();
    r.sys.set_target(HOTEND, 200).expect("target");
    assert!(r.sys.wait_cycles(1_500), "fault while heating: {:?}", r.sys.fault());

    let t = r.sys.temperature(HOTEND).expect("temperature");
    assert!((t - 200.0).abs() < 5.0, "hotend at {t}");
    assert!(r.sys.heater_power(HOTEND).expect("power") > 0);
    assert!(r.plant.last_heater_fraction(0) > 0.0);
    assert!(r.status.halts().is_empty());
    assert!(r.status.reports().iter().all(|rep| !rep.serious));
}

#[test]
fn maxtemp_latches_and_stops() {
    let mut cfg = ThermalConfig::default();
    cfg.hotends[0].maxtemp = 275.0;
    let mut r = rig_with(cfg, false);
    r.sys.set_target(HOTEND, 200).expect("target");
    assert!(r.sys.wait_cycles(10));

    r.plant.set_hotend(0, 290.0);
    assert!(r.run_until_fault(5));

    let fault = r.sys.fault().expect("fault latched");
    assert_eq!(fault.kind, FaultKind::Max);
    assert_eq!(fault.source, FaultSource::Hotend);
    assert_eq!(r.status.halts(), vec![Halt::Stop]);
    assert!(events(&r.status).contains(&StatusEvent::MaxTemp(FaultSource::Hotend)));
    assert_eq!(r.sys.fan_speed(), u8::MAX);
    assert_eq!(r.sys.target(HOTEND).expect("target"), 0);
    assert_eq!(r.sys.fault_snapshot().map(|s| s.hotend_target), Some(200));

    // heater stays off and the halt is not repeated
    r.idle(5);
    assert_eq!(r.sys.heater_power(HOTEND).expect("power"), 0);
    assert_eq!(r.plant.last_heater_fraction(0), 0.0);
    assert_eq!(r.status.halts().len(), 1);
}

#[test]
fn disconnected_sensor_trips_mintemp_after_grace_then_prompts_restart() {
    let mut r = rig();
    r.idle(5);
    r.plant.force_raw(0, Some(RAW_FULL_SCALE));
    r.sys.set_target(HOTEND, 200).expect("target");

    // 15 s grace without an ambient sensor
    assert!(r.sys.wait_cycles(38), "tripped early: {:?}", r.sys.fault());
    assert!(r.run_until_fault(40));
    let fault = r.sys.fault().expect("fault latched");
    assert_eq!(fault.kind, FaultKind::Min);
    assert_eq!(fault.source, FaultSource::Hotend);
    assert!(events(&r.status).contains(&StatusEvent::MinTemp(FaultSource::Hotend)));
    assert_eq!(r.status.halts(), vec![Halt::ThermalStop]);
    assert_eq!(r.sys.heater_power(HOTEND).expect("power"), 0);

    // still cold: no prompt yet
    r.idle(5);
    assert!(!events(&r.status).contains(&StatusEvent::MinTempFixed(FaultSource::Hotend)));

    r.plant.force_raw(0, None);
    r.idle(30);
    let seen = events(&r.status);
    assert!(seen.contains(&StatusEvent::MinTempFixed(FaultSource::Hotend)));
    assert!(seen.contains(&StatusEvent::PleaseRestart));
    // never resumes on its own and the halt is not repeated
    assert!(r.sys.fault().is_some());
    assert_eq!(r.status.halts(), vec![Halt::ThermalStop]);
}

#[test]
fn heater_failure_at_temperature_is_runaway() {
    let mut r = rig();
    r.sys.set_target(HOTEND, 200).expect("target");
    assert!(r.sys.wait_cycles(1_500));

    r.plant.fail_heater(0, true);
    assert!(r.run_until_fault(1_000), "no fault at {}", r.plant.hotend(0));
    let fault = r.sys.fault().expect("fault latched");
    assert_eq!(fault.kind, FaultKind::Runaway);
    assert_eq!(r.status.halts(), vec![Halt::Stop]);
    assert!(events(&r.status).contains(&StatusEvent::ThermalRunaway(FaultSource::Hotend)));
}

#[test]
fn heater_that_never_warms_is_preheat_error() {
    let mut r = rig();
    r.plant.fail_heater(0, true);
    r.sys.set_target(HOTEND, 200).expect("target");
    assert!(r.run_until_fault(1_000));
    let fault = r.sys.fault().expect("fault latched");
    assert_eq!(fault.kind, FaultKind::Preheat);
    assert!(events(&r.status).contains(&StatusEvent::PreheatError(FaultSource::Hotend)));
}

#[test]
fn pid_autotune_returns_gains_without_applying_them() {
    let mut r = rig();
    let before = r.sys.pid_gains(HOTEND).expect("zone");
    let gains = r
        .sys
        .pid_autotune(HOTEND, 200.0, Some(5))
        .expect("autotune converges on the plant");
    assert!(gains.kp > 0.0 && gains.ki > 0.0 && gains.kd > 0.0, "{gains:?}");
    assert_eq!(r.sys.pid_gains(HOTEND).expect("zone"), before);
    assert_eq!(r.sys.target(HOTEND).expect("target"), 0);
    assert!(r.sys.fault().is_none());

    let seen = events(&r.status);
    assert!(seen.contains(&StatusEvent::AutotuneStarted));
    assert!(seen.contains(&StatusEvent::AutotuneFinished));
}

#[test]
fn pid_autotune_with_dead_heater_raises_preheat() {
    let mut r = rig();
    r.plant.fail_heater(0, true);
    let err = r.sys.pid_autotune(HOTEND, 200.0, Some(5)).expect_err("no rise");
    assert!(matches!(err, CalibrationError::NoRise | CalibrationError::Interrupted), "{err:?}");
    assert_eq!(r.sys.fault().map(|f| f.kind), Some(FaultKind::Preheat));
    assert!(events(&r.status).contains(&StatusEvent::AutotuneFailed));
}

#[test]
fn model_autotune_calibrates_and_persists() {
    let mut r = rig();
    let settings = r.sys.model_autotune(None).expect("model autotune");
    assert!(settings.params.calibrated(), "{settings:?}");
    assert!((5.0..20.0).contains(&settings.params.c), "c = {}", settings.params.c);
    assert!(settings.params.r.iter().all(|v| (5.0..45.0).contains(v)), "{:?}", settings.params.r);
    assert_eq!(r.store.saves(), 1);
    assert_eq!(r.store.stored(), Some(settings));
    assert_eq!(r.sys.target(HOTEND).expect("target"), 0);
    assert_eq!(r.sys.fan_speed(), 0);

    // a calibrated model can now be enabled
    assert!(r.sys.model_set_enabled(true));
}

#[test]
fn failed_model_autotune_leaves_model_untouched() {
    let mut r = rig();
    let before = r.sys.model_settings();
    r.plant.fail_heater(0, true);

    assert!(r.sys.model_autotune(None).is_err());
    let after = r.sys.model_settings();
    assert!(after.params.c.is_nan());
    assert!(after.params.r.iter().all(|v| v.is_nan()), "{:?}", after.params.r);
    assert_eq!(after.params.p, before.params.p);
    assert!(!after.params.calibrated());
    assert_eq!(r.store.saves(), 0);
    assert!(events(&r.status).contains(&StatusEvent::AutotuneFailed));
}

#[test]
fn model_autotune_failing_after_capacity_keeps_it_unsaved() {
    let mut r = rig();
    // the capacity recording needs 256 cycles, the heater dies right after
    r.plant.fail_heater_at(0, 300);

    assert!(r.sys.model_autotune(None).is_err());
    let c = r.sys.model_settings().params.c;
    assert!((5.0..20.0).contains(&c), "c = {c}");
    assert!(!r.sys.model_settings().params.calibrated());
    assert_eq!(r.store.saves(), 0);
    assert_eq!(r.store.stored(), None);
    assert!(!r.sys.model_set_enabled(true));
}

#[test]
fn calibration_is_refused_while_busy() {
    let mut r = rig_with(ThermalConfig::default(), true);
    assert_eq!(r.sys.pid_autotune(HOTEND, 200.0, None), Err(CalibrationError::Busy));
    assert_eq!(r.sys.model_autotune(None), Err(CalibrationError::Busy));
    assert_eq!(r.status.reports().len(), 0);
}

#[test]
fn invalid_zone_is_a_typed_error() {
    let mut r = rig();
    assert_eq!(
        r.sys.set_target(ZoneId::Hotend(2), 200),
        Err(ThermalError::InvalidZone {
            index: 2,
            configured: 1
        })
    );
    assert!(r.sys.temperature(ZoneId::Hotend(3)).is_err());
    assert_eq!(
        r.sys.pid_autotune(ZoneId::Hotend(1), 200.0, None),
        Err(CalibrationError::InvalidZone)
    );
    assert!(!events(&r.status).contains(&StatusEvent::AutotuneStarted));
    assert_eq!(r.sys.target(HOTEND), Ok(0));
}

#[test]
fn pid_gains_are_validated() {
    let mut r = rig();
    let bad = PidGains {
        kp: -1.0,
        ki: 0.5,
        kd: 10.0,
    };
    assert!(matches!(
        r.sys.set_pid_gains(HOTEND, bad),
        Err(ThermalError::InvalidParameter(_))
    ));
    let good = PidGains {
        kp: 20.0,
        ki: 1.5,
        kd: 60.0,
    };
    assert_eq!(r.sys.set_pid_gains(HOTEND, good), Ok(true));
    assert_eq!(r.sys.pid_gains(HOTEND), Ok(Some(good)));
}

#[test]
fn bed_heats_with_its_own_regulator() {
    let mut r = rig();
    r.sys.set_target(ZoneId::Bed, 60).expect("target");
    assert!(r.sys.wait_cycles(300));
    assert!(r.plant.bed() > 30.0, "bed at {}", r.plant.bed());
    assert!(r.sys.heater_power(ZoneId::Bed).expect("power") > 0);
    assert_eq!(r.sys.regulation_name(ZoneId::Bed), Ok("pid"));
}

/// Hold 200 °C, then switch on a model that matches the simulated plant.
fn holding_with_model(warn: f32, err: f32) -> common::Rig {
    let mut r = rig();
    r.sys.set_target(HOTEND, 200).expect("target");
    assert!(r.sys.wait_cycles(1_500), "fault while heating: {:?}", r.sys.fault());
    r.sys.model_set_params(ModelParamUpdate {
        p: Some(40.0),
        c: Some(12.0),
        ta_corr: Some(0.0),
        warn: Some(warn),
        err: Some(err),
    });
    for i in 0..R_SIZE {
        r.sys.model_set_resistance(i, 20.0).expect("resistance");
    }
    assert!(r.sys.model_set_enabled(true));
    assert!(r.sys.wait_cycles(200));
    assert!(!r.sys.model_warning());
    assert!(!r.status.beeper());
    r
}

#[test]
fn model_warning_beeps_and_clears_when_the_plant_recovers() {
    let mut r = holding_with_model(0.2, 5.0);

    r.plant.fail_heater(0, true);
    let mut n = 0;
    while !events(&r.status).contains(&StatusEvent::ThermalAnomaly) && n < 150 {
        r.sys.idle();
        n += 1;
    }
    assert!(r.sys.model_warning(), "no warning after {n} cycles");
    // first report turns the beeper on, later cycles toggle it
    assert!(r.status.beeper());
    assert!(r.sys.fault().is_none());

    r.plant.fail_heater(0, false);
    assert!(r.sys.wait_cycles(800), "fault during recovery: {:?}", r.sys.fault());
    assert!(!r.sys.model_warning());
    assert!(!r.status.beeper());
    assert!(r.status.halts().is_empty());
}

#[test]
fn model_fault_stops_then_clears_itself() {
    let mut r = holding_with_model(0.2, 0.5);

    r.plant.fail_heater(0, true);
    assert!(r.run_until_fault(150), "no model fault at {}", r.plant.hotend(0));
    assert_eq!(r.sys.fault().map(|f| f.kind), Some(FaultKind::Model));
    r.idle(1);
    assert_eq!(r.status.halts(), vec![Halt::ThermalStop]);
    assert!(events(&r.status).contains(&StatusEvent::ModelFault));
    assert!(r.status.beeper());

    // heaters are off, so the plant cools the way the model predicts
    let mut n = 0;
    while r.sys.fault().is_some() && n < 800 {
        r.sys.idle();
        n += 1;
    }
    assert!(r.sys.fault().is_none(), "model fault still latched");
    r.idle(200);
    assert!(!r.status.beeper());
    assert_eq!(r.sys.target(HOTEND).expect("target"), 0);
    assert_eq!(r.sys.heater_power(HOTEND).expect("power"), 0);
    assert_eq!(r.status.halts(), vec![Halt::ThermalStop]);
}
