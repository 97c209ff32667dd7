use std::io::IsTerminal;

use anstyle::{AnsiColor, Effects, Style};
use anyhow::{Context, Result};
use convex_ops_installer::{ErrorKind, LifecycleError};
use serde::Serialize;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

/// How results reach the operator: human lines (plain or rich) or one JSON
/// document on stdout.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct OutputMode {
    pub(crate) style: OutputStyle,
    pub(crate) json: bool,
    pub(crate) quiet: bool,
}

impl OutputMode {
    pub(crate) fn from_flags(json: bool, quiet: bool) -> Self {
        Self {
            style: current_output_style(),
            json,
            quiet,
        }
    }

    /// Progress and success lines; dropped under `--quiet` and `--json`.
    pub(crate) fn print_status(self, status: &str, message: &str) {
        if self.json || self.quiet {
            return;
        }
        println!("{}", paint_status_line(self.style, status, message));
    }

    pub(crate) fn print_section(self, title: &str) {
        if self.json {
            return;
        }
        println!();
        match self.style {
            OutputStyle::Plain => println!("{title}:"),
            OutputStyle::Rich => {
                println!("{}", colorize(section_style(), &format!("== {title} ==")))
            }
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        if self.json {
            return;
        }
        for line in lines {
            println!("{line}");
        }
    }

    pub(crate) fn print_json<T: Serialize>(self, payload: &T) -> Result<()> {
        let rendered = render_success_json(payload)?;
        println!("{rendered}");
        Ok(())
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    if std::env::var_os("NO_COLOR").is_some() || !std::io::stdout().is_terminal() {
        OutputStyle::Plain
    } else {
        OutputStyle::Rich
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn paint_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => render_status_line(style, status, message),
        OutputStyle::Rich => format!(
            "{} {message}",
            colorize(badge_style(status), status_badge(status))
        ),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        "step" => "[..]",
        _ => "[INFO]",
    }
}

fn badge_style(status: &str) -> Style {
    let color = match status {
        "ok" => AnsiColor::BrightGreen,
        "warn" => AnsiColor::BrightYellow,
        "err" => AnsiColor::BrightRed,
        _ => AnsiColor::BrightCyan,
    };
    Style::new().fg_color(Some(color.into())).effects(Effects::BOLD)
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

#[derive(Serialize)]
struct SuccessEnvelope<'a, T: Serialize> {
    ok: bool,
    #[serde(flatten)]
    payload: &'a T,
}

pub(crate) fn render_success_json<T: Serialize>(payload: &T) -> Result<String> {
    serde_json::to_string_pretty(&SuccessEnvelope { ok: true, payload })
        .context("failed to render JSON output")
}

/// Errors from outside the lifecycle, like an unreadable settings file, count
/// as resource failures.
pub(crate) fn error_kind(err: &anyhow::Error) -> ErrorKind {
    err.downcast_ref::<LifecycleError>()
        .map(LifecycleError::kind)
        .unwrap_or(ErrorKind::Resource)
}

pub(crate) fn render_error_json(err: &anyhow::Error) -> serde_json::Value {
    serde_json::json!({
        "ok": false,
        "error": {
            "kind": error_kind(err).as_str(),
            "message": format!("{err:#}"),
        }
    })
}

pub(crate) fn print_error(output: OutputMode, err: &anyhow::Error) {
    if output.json {
        println!("{}", render_error_json(err));
        return;
    }
    let label = match output.style {
        OutputStyle::Plain => "Error:".to_string(),
        OutputStyle::Rich => colorize(badge_style("err"), "Error:"),
    };
    eprintln!("{label} {err:#}");
}
