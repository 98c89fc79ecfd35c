#![no_main]
use libfuzzer_sys::fuzz_target;

// Arbitrary TOML must either parse and validate or be rejected; never panic.
fuzz_target!(|data: &str| {
    if let Ok(cfg) = toml::from_str::<thermal_config::Config>(data) {
        let _ = cfg.validate();
    }
});
