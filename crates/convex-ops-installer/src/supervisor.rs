use std::path::PathBuf;
use std::process::Command;

use anyhow::{anyhow, Context, Result};

use crate::layout::SERVICE_NAME;

/// The init system's view of the backend unit.
pub trait ServiceSupervisor {
    fn is_present(&self) -> bool;
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn enable(&self) -> Result<()>;
    fn disable(&self) -> Result<()>;
    /// Supervisor's word for the unit state, e.g. `active` or `inactive`.
    fn active_state(&self) -> String;
    fn is_enabled(&self) -> bool;
    fn reload_definitions(&self) -> Result<()>;
    fn recent_logs(&self, lines: usize) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Systemd {
    unit: String,
}

impl Systemd {
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into() }
    }

    fn systemctl(&self, verb: &str) -> Result<()> {
        run_command(
            Command::new("systemctl").arg(verb).arg(&self.unit),
            &format!("systemctl {verb} {}", self.unit),
        )
    }

    fn systemctl_stdout(&self, verb: &str) -> Option<String> {
        let output = Command::new("systemctl")
            .arg(verb)
            .arg(&self.unit)
            .output()
            .ok()?;
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for Systemd {
    fn default() -> Self {
        Self::new(SERVICE_NAME)
    }
}

impl ServiceSupervisor for Systemd {
    fn is_present(&self) -> bool {
        find_on_path("systemctl").is_some()
    }

    fn start(&self) -> Result<()> {
        self.systemctl("start")
    }

    fn stop(&self) -> Result<()> {
        self.systemctl("stop")
    }

    fn enable(&self) -> Result<()> {
        self.systemctl("enable")
    }

    fn disable(&self) -> Result<()> {
        self.systemctl("disable")
    }

    fn active_state(&self) -> String {
        match self.systemctl_stdout("is-active") {
            Some(state) if !state.is_empty() => state,
            _ => "unknown".to_string(),
        }
    }

    fn is_enabled(&self) -> bool {
        self.systemctl_stdout("is-enabled").as_deref() == Some("enabled")
    }

    fn reload_definitions(&self) -> Result<()> {
        run_command(
            Command::new("systemctl").arg("daemon-reload"),
            "systemctl daemon-reload",
        )
    }

    fn recent_logs(&self, lines: usize) -> Result<String> {
        let output = Command::new("journalctl")
            .arg("-u")
            .arg(&self.unit)
            .arg("-n")
            .arg(lines.to_string())
            .arg("--no-pager")
            .output()
            .context("journalctl failed to start")?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(anyhow!(
        "{context_message}: status={} stderr='{}'",
        output.status,
        stderr.trim()
    ))
}

fn find_on_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
