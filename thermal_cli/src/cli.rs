//! Command-line surface of the `thermal` binary.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::OnceLock;
use thermal_ui::MessageStyle;

/// Set once from `--json`; the error path in `main` reads it.
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "thermal", version, about = "Heater thermal controller")]
pub struct Cli {
    /// Machine config (TOML)
    #[arg(long, value_name = "FILE", default_value = "etc/thermal.toml")]
    pub config: PathBuf,

    /// Thermal-model settings file (overrides model.settings_path)
    #[arg(long, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Print reports and logs as JSON lines instead of text
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// stderr log filter, e.g. `debug` or `thermal_core=trace`
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Wording of operator status messages
    #[arg(long, value_enum, value_name = "STYLE", default_value_t = MessageStyle::Lcd)]
    pub messages: MessageStyle,

    #[command(subcommand)]
    pub cmd: Commands,
}

/// How much of the address space `--rt` pins with mlockall.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum RtLock {
    None,
    /// MCL_CURRENT
    Current,
    /// MCL_CURRENT | MCL_FUTURE
    All,
}

impl RtLock {
    #[inline]
    pub fn os_default() -> Self {
        if cfg!(target_os = "linux") {
            Self::Current
        } else {
            Self::None
        }
    }
}

/// Heat zone selector for zone-specific commands.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ZoneArg {
    Hotend,
    Bed,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Hold heater targets on the simulated plant and report temperatures
    Run {
        /// Hotend target in °C (applies to every configured hotend)
        #[arg(long, value_name = "CELSIUS")]
        hotend: Option<u16>,
        /// Bed target in °C
        #[arg(long, value_name = "CELSIUS")]
        bed: Option<u16>,
        /// Part-cooling fan speed (0..=255)
        #[arg(long, value_name = "SPEED")]
        fan: Option<u8>,
        /// Plant time to run, in seconds
        #[arg(long, value_name = "SECS", default_value_t = 60)]
        seconds: u64,
        /// Print a temperature line every SECS of plant time (0 disables)
        #[arg(long, value_name = "SECS", default_value_t = 10)]
        report_every: u64,
        /// Pace the cadence with the wall clock on background threads
        #[arg(long, action = ArgAction::SetTrue)]
        realtime: bool,
        /// Raise scheduling priority for the cadence threads
        #[arg(
            long,
            action = ArgAction::SetTrue,
            requires = "realtime",
            long_help = "Raise scheduling priority for the cadence threads (requires --realtime).\n\nLinux: SCHED_FIFO, pinning to one CPU and mlockall. Needs CAP_SYS_NICE or a matching rtprio/memlock ulimit; failures are logged and the run continues.\n\nOther unix: mlockall only."
        )]
        rt: bool,
        /// SCHED_FIFO priority (Linux, clamped to the allowed range)
        #[arg(long, value_name = "PRIO")]
        rt_prio: Option<i32>,
        /// mlockall mode for --rt
        #[arg(long, value_enum, value_name = "MODE")]
        rt_lock: Option<RtLock>,
        /// CPU to pin to under --rt (Linux, default 0)
        #[arg(long, value_name = "CPU")]
        rt_cpu: Option<usize>,
    },
    /// Calibrate a regulator or the thermal model
    Autotune {
        #[command(subcommand)]
        what: AutotuneCmd,
    },
    /// Inspect or edit the stored thermal-model settings
    Model {
        #[command(subcommand)]
        action: ModelCmd,
    },
    /// Quick health check (outputs claimable, sensors readable)
    SelfCheck,
}

#[derive(Subcommand, Debug)]
pub enum AutotuneCmd {
    /// Relay PID autotune; prints gains without applying them
    Pid {
        #[arg(long, value_enum, default_value_t = ZoneArg::Hotend)]
        zone: ZoneArg,
        /// Hotend index when --zone hotend
        #[arg(long, default_value_t = 0)]
        index: usize,
        /// Oscillation temperature in °C
        #[arg(long, value_name = "CELSIUS")]
        temp: f32,
        /// Number of oscillations (config default when omitted)
        #[arg(long, value_name = "N")]
        cycles: Option<u8>,
    },
    /// Thermal-model self-calibration; saves the result to the settings file
    Model {
        /// Calibration temperature in °C (config default when omitted)
        #[arg(long, value_name = "CELSIUS")]
        temp: Option<f32>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ModelCmd {
    /// Print the active model settings
    Show,
    /// Restore default settings and save them
    Reset,
    /// Enable model checking (needs a calibrated model)
    Enable,
    /// Disable model checking
    Disable,
    /// Change scalar model parameters
    Set {
        /// Heater power (W)
        #[arg(long)]
        p: Option<f32>,
        /// Heat capacity (J/K)
        #[arg(long)]
        c: Option<f32>,
        /// Ambient correction (K)
        #[arg(long)]
        ta_corr: Option<f32>,
        /// Warning threshold (K/s)
        #[arg(long)]
        warn: Option<f32>,
        /// Error threshold (K/s)
        #[arg(long)]
        err: Option<f32>,
        /// Beep on model warnings
        #[arg(long)]
        beep: Option<bool>,
    },
    /// Set one thermal resistance of the per-fan-speed table
    SetR {
        /// Fan bucket index
        #[arg(long)]
        index: usize,
        /// Resistance (K/W)
        #[arg(long)]
        value: f32,
    },
}
