use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

pub const DEFAULT_HEALTH_URL: &str = "http://localhost:3210";
pub const DEFAULT_BACKUP_RETENTION: usize = 3;
pub const RETENTION_ENV: &str = "CONVEX_BACKUP_RETENTION";

const DEFAULT_HEALTH_BUDGET: Duration = Duration::from_secs(30);
const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(750);
const DEFAULT_DIAGNOSTIC_LOG_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpsSettings {
    pub health_url: String,
    pub health_budget: Duration,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    pub backup_retention: usize,
    pub diagnostic_log_lines: usize,
    pub require_root: bool,
}

impl Default for OpsSettings {
    fn default() -> Self {
        Self {
            health_url: DEFAULT_HEALTH_URL.to_string(),
            health_budget: DEFAULT_HEALTH_BUDGET,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            backup_retention: DEFAULT_BACKUP_RETENTION,
            diagnostic_log_lines: DEFAULT_DIAGNOSTIC_LOG_LINES,
            require_root: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    health_url: Option<String>,
    health_timeout_secs: Option<u64>,
    health_interval_ms: Option<u64>,
    probe_timeout_ms: Option<u64>,
    backup_retention: Option<i64>,
    diagnostic_log_lines: Option<usize>,
}

impl OpsSettings {
    /// Defaults, then the optional settings file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read settings: {}", path.display()))?;
                Self::from_toml_str(&raw)
                    .with_context(|| format!("failed to load settings: {}", path.display()))?
            }
            None => Self::default(),
        };
        settings.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: SettingsFile = toml::from_str(raw).context("failed to parse settings")?;
        let mut settings = Self::default();

        if let Some(url) = file.health_url {
            let url = url.trim().trim_end_matches('/').to_string();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(anyhow!("health_url must use http or https: {url}"));
            }
            settings.health_url = url;
        }
        if let Some(secs) = file.health_timeout_secs.filter(|secs| *secs > 0) {
            settings.health_budget = Duration::from_secs(secs);
        }
        if let Some(millis) = file.health_interval_ms.filter(|millis| *millis > 0) {
            settings.health_interval = Duration::from_millis(millis);
        }
        if let Some(millis) = file.probe_timeout_ms.filter(|millis| *millis > 0) {
            settings.probe_timeout = Duration::from_millis(millis);
        }
        if let Some(retention) = file.backup_retention.filter(|value| *value > 0) {
            settings.backup_retention = retention as usize;
        }
        if let Some(lines) = file.diagnostic_log_lines {
            settings.diagnostic_log_lines = lines;
        }
        Ok(settings)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(retention) = lookup(RETENTION_ENV).as_deref().and_then(parse_retention) {
            self.backup_retention = retention;
        }
    }
}

/// Non-positive or unparsable values are ignored.
pub fn parse_retention(raw: &str) -> Option<usize> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|value| *value > 0)
        .map(|value| value as usize)
}
