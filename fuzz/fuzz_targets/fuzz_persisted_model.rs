#![no_main]
use libfuzzer_sys::fuzz_target;
use thermal_config::PersistedModel;

// A settings file that loads must also serialize again.
fuzz_target!(|data: &str| {
    if let Ok(model) = PersistedModel::from_toml_str(data) {
        let _ = model.to_toml_string();
    }
});
