//! Human-readable error descriptions and structured JSON error formatting.

use thermal_core::{BuildError, CalibrationError, FaultKind, FaultSource, ThermalError};

fn source_name(source: FaultSource) -> &'static str {
    match source {
        FaultSource::Hotend => "hotend",
        FaultSource::Bed => "bed",
        FaultSource::Ambient => "ambient",
    }
}

/// Stable reason name for a latched fault.
pub fn fault_reason_name(kind: FaultKind) -> &'static str {
    match kind {
        FaultKind::Max => "MaxTemp",
        FaultKind::Min => "MinTemp",
        FaultKind::Preheat => "PreheatError",
        FaultKind::Runaway => "ThermalRunaway",
        FaultKind::Model => "ModelFault",
    }
}

fn calibration_reason_name(err: &CalibrationError) -> &'static str {
    match err {
        CalibrationError::Busy => "Busy",
        CalibrationError::InvalidZone => "InvalidZone",
        CalibrationError::Interrupted => "Interrupted",
        CalibrationError::NotConverged(_) => "NotConverged",
        CalibrationError::Overshoot => "Overshoot",
        CalibrationError::TimedOut => "TimedOut",
        CalibrationError::NoRise => "NoRise",
    }
}

fn humanize_fault(kind: FaultKind, source: FaultSource, index: u8) -> String {
    let zone = match source {
        FaultSource::Hotend => format!("hotend {index}"),
        other => source_name(other).to_string(),
    };
    match kind {
        FaultKind::Max => format!(
            "What happened: MAXTEMP on {zone}; all heaters were switched off.\nLikely causes: Shorted thermistor, heater stuck on, or maxtemp set too low.\nHow to fix: Check the thermistor wiring and the heater MOSFET; review maxtemp in the config. Power cycle before printing again."
        ),
        FaultKind::Min => format!(
            "What happened: MINTEMP on {zone}; all heaters were switched off.\nLikely causes: Disconnected or broken thermistor, or a very cold room.\nHow to fix: Check the thermistor connector and cable; the controller asks for a restart once the reading is back in range."
        ),
        FaultKind::Preheat => format!(
            "What happened: {zone} is not heating (preheat error).\nLikely causes: Heater cartridge disconnected, blown fuse, or thermistor out of the heater block.\nHow to fix: Check heater wiring and that the thermistor sits in the block. Power cycle before printing again."
        ),
        FaultKind::Runaway => format!(
            "What happened: Thermal runaway on {zone}: temperature fell away from the target while heating.\nLikely causes: Heater or thermistor came loose, or a strong draft cooled the zone.\nHow to fix: Inspect the heater and thermistor mounting; check runaway.* settings. Power cycle before printing again."
        ),
        FaultKind::Model => "What happened: The thermal model detected a heating error.\nLikely causes: Heater power or cooling no longer matches the calibrated model.\nHow to fix: Check the heater and fan, then re-run `autotune model`; or disable the model with `model disable`.".to_string(),
    }
}

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    // Typed matches first
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingSampler | BuildError::MissingOutputs | BuildError::MissingConfig => format!(
                "What happened: The thermal system could not be assembled ({be}).\nLikely causes: A backend failed to initialize.\nHow to fix: Re-run with --log-level=debug for details."
            ),
            BuildError::UnknownSensorTable(name) => format!(
                "What happened: Unknown sensor table '{name}'.\nLikely causes: Typo in a sensor name.\nHow to fix: Use a built-in table (e.g. epcos100k) or kind = \"csv\" with a raw,celsius file."
            ),
            BuildError::LimitOutOfRange(which) => format!(
                "What happened: The {which} limit lies outside what the sensor can read.\nLikely causes: Limit set beyond the sensor table range.\nHow to fix: Move {which} inside the table range or use a table that covers it."
            ),
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun."
            ),
        };
    }

    if let Some(te) = err.downcast_ref::<ThermalError>() {
        return match te {
            ThermalError::Fault {
                kind,
                origin,
                index,
            } => humanize_fault(*kind, *origin, *index),
            ThermalError::InvalidZone { index, configured } => format!(
                "What happened: Hotend {index} does not exist ({configured} configured).\nLikely causes: Wrong --index.\nHow to fix: Use an index below {configured}."
            ),
            ThermalError::InvalidParameter(msg) if msg.contains("settings store") => {
                "What happened: No settings file to save the thermal model to.\nLikely causes: Neither --settings nor model.settings_path is set.\nHow to fix: Pass --settings FILE or set [model] settings_path in the config.".to_string()
            }
            other => format!(
                "What happened: {other}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    if let Some(ce) = err.downcast_ref::<CalibrationError>() {
        return match ce {
            CalibrationError::Busy => "What happened: Calibration refused: the printer is busy.\nLikely causes: A job or motion is in progress.\nHow to fix: Wait for the job to finish, then retry.".to_string(),
            CalibrationError::NoRise => "What happened: Autotune aborted: the temperature did not rise while heating.\nLikely causes: Heater disconnected or thermistor out of the block.\nHow to fix: Check the heater and thermistor, then retry.".to_string(),
            CalibrationError::Interrupted => "What happened: Calibration was interrupted by a thermal fault.\nLikely causes: See the fault reported just before.\nHow to fix: Fix the fault, power cycle, then retry.".to_string(),
            other => format!(
                "What happened: Calibration failed ({other}).\nLikely causes: Unstable airflow or a target too close to ambient.\nHow to fix: Close enclosures, pick a higher target temperature, and retry."
            ),
        };
    }

    // String-based heuristics over the whole context chain
    let chain = err
        .chain()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ");
    let lower = chain.to_ascii_lowercase();

    if lower.contains("sensor table csv must have headers") {
        return "Invalid headers in sensor table CSV. Expected 'raw,celsius'.".to_string();
    }

    if lower.contains("read config") {
        return format!(
            "What happened: The config file could not be read.\nLikely causes: Wrong --config path or missing permissions.\nHow to fix: Point --config at a readable TOML file. Detail: {chain}"
        );
    }

    if lower.contains("parse config") || lower.contains("invalid configuration") {
        let detail = err.root_cause().to_string();
        return format!(
            "What happened: Configuration is invalid ({detail}).\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the config file and try again."
        );
    }

    if lower.contains("gpio") || lower.contains("claim output pins") {
        return "What happened: Failed to initialize output pins.\nLikely causes: Incorrect pin numbers or insufficient GPIO permissions.\nHow to fix: Fix the [pins] values in the config; ensure the process may access GPIO.".to_string();
    }

    // Generic fallback
    format!(
        "Something went wrong.\nHow to fix: Re-run with --log-level=debug for details. Original: {chain}"
    )
}

/// Stable exit codes: one per fault kind, one for failed calibration, 1 otherwise.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    if let Some(ThermalError::Fault { kind, .. }) = err.downcast_ref::<ThermalError>() {
        return match kind {
            FaultKind::Max => 3,
            FaultKind::Min => 4,
            FaultKind::Preheat => 5,
            FaultKind::Runaway => 6,
            FaultKind::Model => 7,
        };
    }
    if err.downcast_ref::<CalibrationError>().is_some() {
        return 8;
    }
    1
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;

    if let Some(ThermalError::Fault {
        kind,
        origin,
        index,
    }) = err.downcast_ref::<ThermalError>()
    {
        return json!({
            "reason": fault_reason_name(*kind),
            "details": { "source": source_name(*origin), "index": index },
            "message": humanize(err),
        })
        .to_string();
    }

    if let Some(ce) = err.downcast_ref::<CalibrationError>() {
        return json!({
            "reason": "CalibrationFailed",
            "details": { "cause": calibration_reason_name(ce) },
            "message": humanize(err),
        })
        .to_string();
    }

    // Generic error JSON
    json!({ "reason": "Error", "message": humanize(err) }).to_string()
}
