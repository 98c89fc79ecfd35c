#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Operator-facing rendering of thermal status events.
//!
//! The core reports categorical codes; this crate turns them into display
//! text and drives a console "status line" with a beeper indicator.

use std::io::Write;

use clap::ValueEnum;
use thermal_core::{FaultSource, Halt, StatusEvent, StatusReport, StatusSink};

/// How status messages are worded.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum MessageStyle {
    /// Short display strings as shown on a 20-column status line.
    #[default]
    Lcd,
    /// Full sentences including zone and temperatures.
    Verbose,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Severity {
    Info,
    Alert,
    Critical,
}

pub fn severity(event: StatusEvent) -> Severity {
    match event {
        StatusEvent::AutotuneStarted
        | StatusEvent::AutotuneFinished
        | StatusEvent::MinTempFixed(_)
        | StatusEvent::PleaseRestart => Severity::Info,
        StatusEvent::ThermalAnomaly | StatusEvent::AutotuneFailed => Severity::Alert,
        StatusEvent::MaxTemp(_)
        | StatusEvent::MinTemp(_)
        | StatusEvent::PreheatError(_)
        | StatusEvent::ThermalRunaway(_)
        | StatusEvent::ModelFault => Severity::Critical,
    }
}

fn source_suffix(source: FaultSource) -> &'static str {
    match source {
        FaultSource::Hotend => "",
        FaultSource::Bed => " BED",
        FaultSource::Ambient => " AMB",
    }
}

fn source_prefix(source: FaultSource) -> &'static str {
    match source {
        FaultSource::Bed => "BED ",
        FaultSource::Hotend | FaultSource::Ambient => "",
    }
}

fn lcd(event: StatusEvent) -> String {
    match event {
        StatusEvent::MaxTemp(s) => format!("Err: MAXTEMP{}", source_suffix(s)),
        StatusEvent::MinTemp(s) => format!("Err: MINTEMP{}", source_suffix(s)),
        StatusEvent::PreheatError(s) => format!("{}PREHEAT ERROR", source_prefix(s)),
        StatusEvent::ThermalRunaway(s) => format!("{}THERMAL RUNAWAY", source_prefix(s)),
        StatusEvent::ModelFault => "THERMAL ERROR".to_string(),
        StatusEvent::ThermalAnomaly => "THERMAL ANOMALY".to_string(),
        StatusEvent::MinTempFixed(_) => "MINTEMP fixed".to_string(),
        StatusEvent::PleaseRestart => "Please restart".to_string(),
        StatusEvent::AutotuneStarted => "Autotune start".to_string(),
        StatusEvent::AutotuneFinished => "Autotune finished".to_string(),
        StatusEvent::AutotuneFailed => "Autotune failed".to_string(),
    }
}

fn zone_name(source: FaultSource, zone: Option<u8>) -> String {
    match (source, zone) {
        (FaultSource::Hotend, Some(i)) => format!("hotend {i}"),
        (FaultSource::Hotend, None) => "hotend".to_string(),
        (FaultSource::Bed, _) => "bed".to_string(),
        (FaultSource::Ambient, _) => "ambient sensor".to_string(),
    }
}

fn verbose(report: &StatusReport) -> String {
    let at = report
        .current
        .filter(|c| c.is_finite())
        .map(|c| format!(" at {c:.1}C"))
        .unwrap_or_default();
    match report.event {
        StatusEvent::MaxTemp(s) => format!(
            "{} above its maximum temperature{at}; heaters switched off",
            zone_name(s, report.zone)
        ),
        StatusEvent::MinTemp(s) => format!(
            "{} below its minimum temperature{at}; check the thermistor wiring",
            zone_name(s, report.zone)
        ),
        StatusEvent::PreheatError(s) => {
            format!("{} is not heating up{at}; heaters switched off", zone_name(s, report.zone))
        }
        StatusEvent::ThermalRunaway(s) => format!(
            "{} left its regulation band{at}; heaters switched off",
            zone_name(s, report.zone)
        ),
        StatusEvent::ModelFault => format!("thermal model error on hotend{at}; print paused"),
        StatusEvent::ThermalAnomaly => "thermal model anomaly detected".to_string(),
        StatusEvent::MinTempFixed(s) => format!("{} is warm again", zone_name(s, report.zone)),
        StatusEvent::PleaseRestart => "please restart the printer".to_string(),
        StatusEvent::AutotuneStarted => "autotune started".to_string(),
        StatusEvent::AutotuneFinished => "autotune finished".to_string(),
        StatusEvent::AutotuneFailed => "autotune failed".to_string(),
    }
}

/// Render a report in the requested style.
pub fn render(report: &StatusReport, style: MessageStyle) -> String {
    match style {
        MessageStyle::Lcd => lcd(report.event),
        MessageStyle::Verbose => verbose(report),
    }
}

/// Status sink that prints one line per report to `out`.
pub struct ConsoleStatus<W: Write + Send> {
    out: W,
    style: MessageStyle,
    beeper: bool,
}

impl<W: Write + Send> ConsoleStatus<W> {
    pub fn new(out: W, style: MessageStyle) -> Self {
        Self {
            out,
            style,
            beeper: false,
        }
    }

    pub fn beeper(&self) -> bool {
        self.beeper
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, text: &str) {
        if let Err(e) = writeln!(self.out, "{text}") {
            tracing::debug!(error = %e, "status line not written");
        }
    }
}

impl<W: Write + Send> StatusSink for ConsoleStatus<W> {
    fn report(&mut self, report: &StatusReport) {
        let text = render(report, self.style);
        match severity(report.event) {
            Severity::Critical => tracing::error!(event = ?report.event, "{text}"),
            Severity::Alert => tracing::warn!(event = ?report.event, "{text}"),
            Severity::Info => tracing::info!(event = ?report.event, "{text}"),
        }
        let mark = if report.serious { "!! " } else { "" };
        self.line(&format!("{mark}{text}"));
    }

    fn set_beeper(&mut self, on: bool) {
        self.beeper = on;
        if on {
            self.line("(beep)");
        }
    }

    fn halt(&mut self, halt: Halt) {
        let text = match halt {
            Halt::Stop => "print stopped",
            Halt::ThermalStop => "print paused: thermal stop",
        };
        tracing::warn!(?halt, "{text}");
        self.line(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(StatusEvent::MaxTemp(FaultSource::Hotend), "Err: MAXTEMP")]
    #[case(StatusEvent::MaxTemp(FaultSource::Bed), "Err: MAXTEMP BED")]
    #[case(StatusEvent::MinTemp(FaultSource::Ambient), "Err: MINTEMP AMB")]
    #[case(StatusEvent::PreheatError(FaultSource::Bed), "BED PREHEAT ERROR")]
    #[case(StatusEvent::ThermalRunaway(FaultSource::Hotend), "THERMAL RUNAWAY")]
    #[case(StatusEvent::ThermalAnomaly, "THERMAL ANOMALY")]
    #[case(StatusEvent::MinTempFixed(FaultSource::Bed), "MINTEMP fixed")]
    #[case(StatusEvent::PleaseRestart, "Please restart")]
    fn lcd_messages(#[case] event: StatusEvent, #[case] expected: &str) {
        let text = render(&StatusReport::new(event), MessageStyle::Lcd);
        assert_eq!(text, expected);
        assert!(text.len() <= 20);
    }

    #[test]
    fn verbose_names_zone_and_temperature() {
        let report = StatusReport::new(StatusEvent::MaxTemp(FaultSource::Hotend))
            .zone(1)
            .temperatures(312.4, 0);
        let text = render(&report, MessageStyle::Verbose);
        assert!(text.starts_with("hotend 1 above"), "{text}");
        assert!(text.contains("312.4C"), "{text}");
    }

    #[test]
    fn serious_reports_are_marked_and_halts_printed() {
        let mut sink = ConsoleStatus::new(Vec::new(), MessageStyle::Lcd);
        sink.report(&StatusReport::new(StatusEvent::MinTemp(FaultSource::Bed)));
        sink.report(&StatusReport::new(StatusEvent::AutotuneStarted));
        sink.halt(Halt::Stop);
        sink.set_beeper(true);
        assert!(sink.beeper());
        let out = String::from_utf8(sink.into_inner()).expect("utf8");
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(
            lines,
            ["!! Err: MINTEMP BED", "Autotune start", "print stopped", "(beep)"]
        );
    }

    #[test]
    fn faults_are_critical() {
        assert_eq!(severity(StatusEvent::ModelFault), Severity::Critical);
        assert_eq!(severity(StatusEvent::ThermalAnomaly), Severity::Alert);
        assert_eq!(severity(StatusEvent::PleaseRestart), Severity::Info);
    }
}
