use rstest::rstest;
use thermal_config::{Config, Regulation, SensorSpec, load_toml};

const BASE: &str = r#"
[cadence]
interval_ms = 270

[[hotend]]
mintemp = 15
maxtemp = 305
pid = { kp = 16.13, ki = 1.1625, kd = 56.23 }

[bed]
maxtemp = 125
regulation = "bang_bang"
hysteresis = 2.0
"#;

#[test]
fn empty_document_uses_defaults() {
    let cfg = load_toml("").expect("parse TOML");
    cfg.validate().expect("defaults must validate");
    assert_eq!(cfg.hotend.len(), 1);
    assert_eq!(cfg.cadence.interval_ms, 270);
    assert_eq!(cfg.runaway.hotend.preheat_window, 8);
    assert_eq!(cfg.runaway.bed.preheat_window, 16);
    assert!(!cfg.model.defaults.enabled);
}

#[test]
fn parses_sections_and_enums() {
    let cfg = load_toml(BASE).expect("parse TOML");
    cfg.validate().expect("valid config should pass");
    assert_eq!(cfg.bed.regulation, Regulation::BangBang);
    assert_eq!(cfg.hotend[0].sensor, SensorSpec::default());
}

#[test]
fn parses_tagged_sensor_specs() {
    let toml = r#"
[[hotend]]
sensor = { kind = "ad595", gain = 1.02 }

[[hotend]]
sensor = { kind = "max6675" }

[ambient]
enabled = true
sensor = { kind = "csv", path = "tables/ambient.csv" }
"#;
    let cfg = load_toml(toml).expect("parse TOML");
    cfg.validate().expect("valid config should pass");
    assert!(matches!(
        cfg.hotend[0].sensor,
        SensorSpec::Ad595 { gain, offset } if (gain - 1.02).abs() < 1e-6 && offset == 0.0
    ));
    assert_eq!(cfg.hotend[1].sensor, SensorSpec::Max6675);
    assert!(matches!(cfg.ambient.sensor, SensorSpec::Csv { .. }));
}

#[rstest]
#[case("[cadence]\ninterval_ms = 10", "cadence.interval_ms must be in [50, 2000]")]
#[case("[[hotend]]\nmintemp = 400", "hotend[0].mintemp must be < hotend[0].maxtemp")]
#[case("[[hotend]]\nmax_output = 0", "hotend[0].max_output must be > 0")]
#[case("[[hotend]]\npid = { kp = -1.0 }", "hotend[0].pid.kp must be a finite value >= 0")]
#[case("[bed]\nhysteresis = -1.0", "bed.hysteresis must be >= 0")]
#[case(
    "[bed]\noffset = { start = 50, center = 40, offset = 2 }",
    "bed.offset must satisfy start < center < 100"
)]
#[case(
    "[runaway.hotend]\nhysteresis = 15\ntimeout_s = 0\npreheat_window = 8\npreheat_violations = 5",
    "runaway.hotend.timeout_s must be >= 1"
)]
#[case("[logging]\nrotation = \"weekly\"", "logging.rotation must be one of never|daily|hourly")]
fn rejects_invalid_values(#[case] toml: &str, #[case] expected: &str) {
    let cfg = load_toml(toml).expect("parse TOML");
    let err = cfg.validate().expect_err("should reject");
    assert!(
        format!("{err}").contains(expected),
        "unexpected error: {err}"
    );
}

#[test]
fn rejects_too_many_hotends() {
    let toml = "[[hotend]]\n[[hotend]]\n[[hotend]]\n[[hotend]]\n[[hotend]]\n";
    let cfg = load_toml(toml).expect("parse TOML");
    let err = cfg.validate().expect_err("five hotends");
    assert!(format!("{err}").contains("at most 4 hotends"));
}

#[test]
fn rejects_unknown_regulation() {
    let err = load_toml("[bed]\nregulation = \"fuzzy\"").expect_err("unknown variant");
    assert!(err.to_string().contains("fuzzy"));
}

#[test]
fn default_config_matches_default_document() {
    let parsed = load_toml("").expect("parse TOML");
    let built = Config::default();
    assert_eq!(parsed.hotend.len(), built.hotend.len());
    assert_eq!(parsed.bed.maxtemp, built.bed.maxtemp);
}

#[rstest]
#[case("[pins]\nheaters = [17]\nbed = 27\nfan = 22\n", None)]
#[case("[pins]\nheaters = [17, 18]\nbed = 27\nfan = 22\n", Some("one pin per hotend"))]
#[case("[pins]\nheaters = [17]\nbed = 17\nfan = 22\n", Some("distinct"))]
#[case("[pins]\nheaters = [17]\nbed = 27\nbed_pwm = 40\nfan = 22\n", Some("BCM range"))]
fn validates_output_pins(#[case] toml: &str, #[case] expected: Option<&str>) {
    let cfg = load_toml(toml).expect("parse TOML");
    match (cfg.validate(), expected) {
        (Ok(()), None) => assert_eq!(cfg.pins.map(|p| p.heaters), Some(vec![17])),
        (Err(e), Some(needle)) => assert!(format!("{e}").contains(needle), "unexpected error: {e}"),
        (res, _) => panic!("unexpected outcome: {res:?}"),
    }
}

#[test]
fn shipped_sample_config_validates() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../etc/thermal.toml");
    let text = std::fs::read_to_string(path).expect("read etc/thermal.toml");
    let cfg = load_toml(&text).expect("parse TOML");
    cfg.validate().expect("sample config must validate");
    assert_eq!(cfg.hotend.len(), 1);
    assert_eq!(cfg.bed.maxtemp, 125.0);
    assert_eq!(cfg.model.settings_path.as_deref(), Some(std::path::Path::new("var/thermal_model.toml")));
}

#[test]
fn model_warn_above_err_is_clamped() {
    let cfg = load_toml("[model.defaults]\nwarn = 3.0\nerr = 1.0").expect("parse TOML");
    cfg.validate().expect("clamped thresholds validate");
    assert_eq!(cfg.model.defaults.warn, 1.0);
    assert_eq!(cfg.model.defaults.err, 1.0);
}
