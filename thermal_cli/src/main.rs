mod cli;
mod error_fmt;
mod rt;
mod session;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use eyre::{Result, WrapErr};
use serde_json::json;
use thermal_core::{ModelParamUpdate, ModelSettings, PidGains, Report, ZoneId};
use tracing_appender::non_blocking::WorkerGuard;

use cli::{AutotuneCmd, Cli, Commands, JSON_MODE, ModelCmd, RtLock, ZoneArg};
use error_fmt::{exit_code_for_error, format_error_json, humanize};
use session::{RunOpts, Session, SessionOpts};

fn main() {
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);
    if let Err(e) = color_eyre::install() {
        eprintln!("warning: error report hooks not installed: {e}");
    }

    if let Err(err) = real_main(cli) {
        if JSON_MODE.get().copied().unwrap_or(false) {
            println!("{}", format_error_json(&err));
        } else {
            eprintln!("{}", humanize(&err));
        }
        std::process::exit(exit_code_for_error(&err));
    }
}

fn load_config(path: &Path) -> Result<thermal_config::Config> {
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("read config {}", path.display()))?;
    let cfg = thermal_config::load_toml(&text)
        .wrap_err_with(|| format!("parse config {}", path.display()))?;
    cfg.validate().wrap_err("invalid configuration")?;
    Ok(cfg)
}

/// Console logs go to stderr so stdout stays clean for reports; the optional
/// `[logging] file` gets JSON lines through a non-blocking appender.
fn init_tracing(
    level: &str,
    json: bool,
    logging: &thermal_config::Logging,
) -> Result<Option<WorkerGuard>> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let console_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .wrap_err_with(|| format!("invalid --log-level {level:?}"))?;
    let console = if json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(console_filter)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(console_filter)
            .boxed()
    };

    let mut guard = None;
    let file = match logging.file.as_deref() {
        Some(file) => {
            let path = Path::new(file);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| eyre::eyre!("logging.file must name a file: {file}"))?;
            let rotation = match logging.rotation.as_deref() {
                Some("daily") => Rotation::DAILY,
                Some("hourly") => Rotation::HOURLY,
                _ => Rotation::NEVER,
            };
            let (writer, g) = tracing_appender::non_blocking(RollingFileAppender::new(rotation, dir, name));
            guard = Some(g);
            let filter = EnvFilter::try_new(logging.level.as_deref().unwrap_or("info"))
                .wrap_err("invalid logging.level")?;
            Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_filter(filter)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .wrap_err("init logging")?;
    Ok(guard)
}

fn real_main(cli: Cli) -> Result<()> {
    let cfg = load_config(&cli.config)?;
    let _log_guard = init_tracing(&cli.log_level, cli.json, &cfg.logging)?;
    let json = cli.json;
    let base = SessionOpts {
        settings: cli.settings.clone().or_else(|| cfg.model.settings_path.clone()),
        style: cli.messages,
        json,
        realtime: false,
    };

    match cli.cmd {
        Commands::Run {
            hotend,
            bed,
            fan,
            seconds,
            report_every,
            realtime,
            rt,
            rt_prio,
            rt_lock,
            rt_cpu,
        } => {
            if rt {
                rt::setup_rt_once(rt::RtOpts {
                    prio: rt_prio,
                    lock: rt_lock.unwrap_or_else(RtLock::os_default),
                    cpu: rt_cpu,
                });
            }
            let stop = Arc::new(AtomicBool::new(false));
            {
                let stop = Arc::clone(&stop);
                ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))
                    .wrap_err("install Ctrl-C handler")?;
            }
            let mut session = Session::open(&cfg, &SessionOpts { realtime, ..base })?;
            let opts = RunOpts {
                hotend,
                bed,
                fan,
                seconds,
                report_every,
            };
            let summary = session.run(&opts, &stop)?;
            if json {
                println!(
                    "{}",
                    json!({
                        "event": "complete",
                        "cycles": summary.cycles,
                        "hotends": summary.hotends,
                        "bed": summary.bed,
                        "interrupted": summary.interrupted,
                    })
                );
            } else {
                let hotends = summary
                    .hotends
                    .iter()
                    .enumerate()
                    .map(|(i, t)| format!("T{i} {t:.1} °C"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let how = if summary.interrupted { "interrupted" } else { "complete" };
                println!(
                    "run {how}: {} cycles, {hotends}, bed {:.1} °C",
                    summary.cycles, summary.bed
                );
            }
            Ok(())
        }
        Commands::Autotune { what } => {
            let mut session = Session::open(&cfg, &base)?;
            match what {
                AutotuneCmd::Pid {
                    zone,
                    index,
                    temp,
                    cycles,
                } => {
                    let zone = match zone {
                        ZoneArg::Hotend => ZoneId::Hotend(index),
                        ZoneArg::Bed => ZoneId::Bed,
                    };
                    let gains = session
                        .sys
                        .pid_autotune(zone, temp, cycles)
                        .map_err(Report::new)?;
                    print_gains(zone, gains, json)
                }
                AutotuneCmd::Model { temp } => {
                    let settings = session.sys.model_autotune(temp).map_err(Report::new)?;
                    if base.settings.is_none() {
                        tracing::warn!("no settings file configured; calibration result not saved");
                    }
                    print_model(&settings, json);
                    Ok(())
                }
            }
        }
        Commands::Model { action } => {
            let mut session = Session::open(&cfg, &base)?;
            let sys = &mut session.sys;
            match action {
                ModelCmd::Show => {
                    print_model(&sys.model_report(), json);
                    return Ok(());
                }
                ModelCmd::Reset => sys.model_reset_settings(),
                ModelCmd::Enable => {
                    if !sys.model_set_enabled(true) {
                        eyre::bail!("thermal model is not calibrated; run `autotune model` first");
                    }
                }
                ModelCmd::Disable => {
                    sys.model_set_enabled(false);
                }
                ModelCmd::Set {
                    p,
                    c,
                    ta_corr,
                    warn,
                    err,
                    beep,
                } => {
                    sys.model_set_params(ModelParamUpdate {
                        p,
                        c,
                        ta_corr,
                        warn,
                        err,
                    });
                    if let Some(beep) = beep {
                        sys.model_set_warn_beep(beep);
                    }
                }
                ModelCmd::SetR { index, value } => sys.model_set_resistance(index, value)?,
            }
            sys.model_save()?;
            print_model(&sys.model_settings(), json);
            Ok(())
        }
        Commands::SelfCheck => self_check(&cfg, &base),
    }
}

#[cfg(all(feature = "hardware", target_os = "linux"))]
fn check_outputs(cfg: &thermal_config::Config) -> Result<()> {
    use thermal_hardware::gpio::{GpioOutputs, PinMap};
    let Some(pins) = &cfg.pins else {
        println!("outputs: no [pins] configured");
        return Ok(());
    };
    let map = PinMap {
        heaters: pins.heaters.clone(),
        bed: pins.bed,
        bed_pwm: pins.bed_pwm,
        fan: pins.fan,
    };
    // dropping the outputs drives every pin low again
    drop(GpioOutputs::new(&map).wrap_err("claim output pins")?);
    println!("outputs: ok");
    Ok(())
}

#[cfg(not(all(feature = "hardware", target_os = "linux")))]
fn check_outputs(cfg: &thermal_config::Config) -> Result<()> {
    if cfg.pins.is_some() {
        tracing::debug!("built without the hardware feature; [pins] not checked");
    }
    Ok(())
}

fn self_check(cfg: &thermal_config::Config, opts: &SessionOpts) -> Result<()> {
    check_outputs(cfg)?;
    let mut session = Session::open(cfg, opts)?;
    if !session.sys.wait_cycles(4)
        && let Some(fault) = session.sys.fault()
    {
        return Err(session::fault_error(fault));
    }
    session.print_temps()?;
    tracing::debug!(ambient = session.plant.ambient(), "plant ambient");
    println!("self-check ok");
    Ok(())
}

fn print_gains(zone: ZoneId, gains: PidGains, json: bool) -> Result<()> {
    let table = match zone {
        ZoneId::Hotend(_) => "hotend.pid",
        ZoneId::Bed => "bed.pid",
    };
    if json {
        println!(
            "{}",
            json!({ "event": "pid_gains", "zone": table, "kp": gains.kp, "ki": gains.ki, "kd": gains.kd })
        );
        return Ok(());
    }
    let mut snippet = toml::Table::new();
    snippet.insert("kp".into(), toml::Value::Float(f64::from(gains.kp)));
    snippet.insert("ki".into(), toml::Value::Float(f64::from(gains.ki)));
    snippet.insert("kd".into(), toml::Value::Float(f64::from(gains.kd)));
    println!("Kp {:.2}  Ki {:.2}  Kd {:.2}", gains.kp, gains.ki, gains.kd);
    println!("# not applied; paste into the config:");
    println!("[{table}]");
    print!("{}", toml::to_string(&snippet).wrap_err("format gains")?);
    Ok(())
}

fn print_model(s: &ModelSettings, json: bool) {
    let p = &s.params;
    if json {
        println!(
            "{}",
            json!({
                "event": "model",
                "enabled": s.enabled,
                "calibrated": p.calibrated(),
                "warn_beep": s.warn_beep,
                "p": p.p,
                "c": p.c,
                "ta_corr": p.ta_corr,
                "warn": p.warn,
                "err": p.err,
                "r": p.r.to_vec(),
            })
        );
        return;
    }
    println!(
        "thermal model: {} ({})",
        if s.enabled { "enabled" } else { "disabled" },
        if p.calibrated() { "calibrated" } else { "uncalibrated" }
    );
    println!("  P {:.1} W  C {:.2} J/K  Ta corr {:.1} K", p.p, p.c, p.ta_corr);
    println!(
        "  warn {:.2} K/s  err {:.2} K/s  beep {}",
        p.warn,
        p.err,
        if s.warn_beep { "on" } else { "off" }
    );
    let r = p.r.iter().map(|r| format!("{r:.2}")).collect::<Vec<_>>().join(" ");
    println!("  R {r}");
}
