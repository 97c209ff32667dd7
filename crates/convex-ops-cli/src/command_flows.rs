use std::io::{BufRead, Write};
use std::path::Path;

use anyhow::{Context, Result};
use convex_ops_core::InstallationManifest;
use convex_ops_installer::{
    format_timestamp, Backup, InstallLayout, InstallReport, InstallationState, ResetReport,
    RollbackReport, StatusReport, UninstallReport, UpgradeReport, SERVICE_NAME,
};
use indicatif::HumanBytes;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InstallView<'a> {
    pub(crate) name: &'a str,
    pub(crate) version: &'a str,
    pub(crate) apps: &'a [String],
    pub(crate) backend_url: &'a str,
    pub(crate) admin_key: &'a str,
}

impl<'a> InstallView<'a> {
    pub(crate) fn new(report: &'a InstallReport) -> Self {
        Self {
            name: &report.manifest.name,
            version: &report.manifest.version,
            apps: &report.manifest.apps,
            backend_url: &report.backend_url,
            admin_key: &report.credentials.admin_key,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StatusView<'a> {
    pub(crate) installed: bool,
    pub(crate) state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) manifest: Option<&'a InstallationManifest>,
    pub(crate) service_status: &'a str,
    pub(crate) service_enabled: bool,
    pub(crate) health: &'static str,
    pub(crate) backend_url: &'a str,
}

impl<'a> StatusView<'a> {
    pub(crate) fn new(report: &'a StatusReport) -> Self {
        Self {
            installed: report.state.is_installed(),
            state: report.state.as_str(),
            manifest: report.state.manifest(),
            service_status: &report.service_state,
            service_enabled: report.service_enabled,
            health: health_label(report.healthy),
            backend_url: &report.backend_url,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UpgradeView<'a> {
    pub(crate) from_version: &'a str,
    pub(crate) to_version: &'a str,
    pub(crate) change: &'static str,
    pub(crate) backup_path: String,
    pub(crate) pruned: Vec<&'a str>,
}

impl<'a> UpgradeView<'a> {
    pub(crate) fn new(report: &'a UpgradeReport) -> Self {
        Self {
            from_version: &report.from_version,
            to_version: &report.to_version,
            change: report.change.as_str(),
            backup_path: report.backup.path.display().to_string(),
            pruned: report.pruned.iter().map(Backup::version).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RollbackView<'a> {
    pub(crate) version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) previous_version: Option<&'a str>,
    pub(crate) backup_path: String,
}

impl<'a> RollbackView<'a> {
    pub(crate) fn new(report: &'a RollbackReport) -> Self {
        Self {
            version: report.backup.version(),
            previous_version: report.previous_version.as_deref(),
            backup_path: report.backup.path.display().to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BackupView {
    pub(crate) version: String,
    pub(crate) created: String,
    pub(crate) size: u64,
    pub(crate) size_human: String,
    pub(crate) reason: String,
    pub(crate) path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BackupListView {
    pub(crate) backups: Vec<BackupView>,
    pub(crate) total_count: usize,
    pub(crate) total_size: u64,
}

impl BackupListView {
    pub(crate) fn new(backups: &[Backup]) -> Self {
        let backups: Vec<BackupView> = backups
            .iter()
            .map(|backup| {
                let size = backup.size_on_disk();
                BackupView {
                    version: backup.version().to_string(),
                    created: format_timestamp(backup.created_at),
                    size,
                    size_human: HumanBytes(size).to_string(),
                    reason: backup.metadata.reason.clone(),
                    path: backup.path.display().to_string(),
                }
            })
            .collect();
        let total_size = backups.iter().map(|backup| backup.size).sum();
        Self {
            total_count: backups.len(),
            total_size,
            backups,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ResetView<'a> {
    pub(crate) data_dir: String,
    pub(crate) warnings: &'a [String],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UninstallView<'a> {
    pub(crate) removed: Vec<String>,
    pub(crate) warnings: &'a [String],
}

impl<'a> UninstallView<'a> {
    pub(crate) fn new(report: &'a UninstallReport) -> Self {
        Self {
            removed: report
                .removed
                .iter()
                .map(|path| path.display().to_string())
                .collect(),
            warnings: &report.warnings,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VersionView<'a> {
    pub(crate) version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) installed: Option<&'a InstallationManifest>,
}

fn health_label(healthy: bool) -> &'static str {
    if healthy {
        "healthy"
    } else {
        "unhealthy"
    }
}

fn app_lines(apps: &[String], indent: &str) -> Vec<String> {
    apps.iter().map(|app| format!("{indent}- {app}")).collect()
}

pub(crate) fn format_install_lines(report: &InstallReport) -> Vec<String> {
    let mut lines = vec![
        format!("Backend URL:  {}", report.backend_url),
        format!("Admin Key:    {}", report.credentials.admin_key),
    ];
    if !report.manifest.apps.is_empty() {
        lines.push(String::new());
        lines.push("Bundled Apps:".to_string());
        lines.extend(app_lines(&report.manifest.apps, "  "));
    }
    lines.push(String::new());
    lines.push("Service commands:".to_string());
    lines.push(format!("  systemctl status {SERVICE_NAME}"));
    lines.push(format!("  journalctl -u {SERVICE_NAME} -f"));
    lines
}

pub(crate) fn format_status_lines(report: &StatusReport, layout: &InstallLayout) -> Vec<String> {
    let manifest = match &report.state {
        InstallationState::Installed(manifest) => manifest,
        InstallationState::NotInstalled => {
            return vec![
                "Status: Not installed".to_string(),
                String::new(),
                "Run 'convex-backend-ops install --bundle <path>' to install.".to_string(),
            ];
        }
        InstallationState::Corrupt { reason } => {
            return vec![
                "Status: Corrupt installation".to_string(),
                format!("Reason: {reason}"),
                format!("Manifest: {}", layout.manifest_path().display()),
            ];
        }
    };

    let enabled = if report.service_enabled {
        " (enabled)"
    } else {
        ""
    };
    let mut lines = vec![
        format!("Name:           {}", manifest.name),
        format!("Version:        {}", manifest.version),
        format!("Service Status: {}{enabled}", report.service_state),
        format!("Health:         {}", health_label(report.healthy)),
        format!("Backend URL:    {}", report.backend_url),
    ];
    if !manifest.apps.is_empty() {
        lines.push(String::new());
        lines.push("Bundled Apps:".to_string());
        lines.extend(app_lines(&manifest.apps, "  "));
    }
    lines.push(String::new());
    lines.push("Paths:".to_string());
    lines.push(format!("  Binary: {}", layout.binary_path().display()));
    lines.push(format!("  Data:   {}", layout.data_dir().display()));
    lines.push(format!("  Config: {}", layout.config_dir().display()));
    lines
}

pub(crate) fn format_upgrade_lines(report: &UpgradeReport) -> Vec<String> {
    let mut lines = vec![format!("Backup created: {}", report.backup.path.display())];
    for pruned in &report.pruned {
        lines.push(format!("Pruned backup:  {}", pruned.path.display()));
    }
    lines
}

pub(crate) fn format_backup_table(view: &BackupListView) -> Vec<String> {
    if view.backups.is_empty() {
        return vec!["No backups found.".to_string()];
    }

    let mut lines = vec![format!(
        "{:<12} {:<26} {:<10} {}",
        "VERSION", "CREATED", "SIZE", "REASON"
    )];
    for backup in &view.backups {
        lines.push(format!(
            "{:<12} {:<26} {:<10} {}",
            format!("v{}", backup.version),
            backup.created,
            backup.size_human,
            backup.reason
        ));
    }
    lines.push(String::new());
    lines.push(format!(
        "Total: {} backups ({})",
        view.total_count,
        HumanBytes(view.total_size)
    ));
    lines
}

pub(crate) fn format_reset_lines(report: &ResetReport, layout: &InstallLayout) -> Vec<String> {
    vec![
        "Deleted:".to_string(),
        format!("  - Database: {}", report.data_dir.display()),
        String::new(),
        "Preserved:".to_string(),
        format!("  - Config:  {}", layout.config_dir().display()),
        format!("  - Backups: {}", layout.backups_dir().display()),
    ]
}

pub(crate) fn format_uninstall_lines(report: &UninstallReport) -> Vec<String> {
    if report.removed.is_empty() {
        return vec!["Nothing to remove.".to_string()];
    }
    let mut lines = vec!["Removed:".to_string()];
    lines.extend(
        report
            .removed
            .iter()
            .map(|path| format!("  - {}", path.display())),
    );
    lines
}

pub(crate) fn format_version_lines(installed: Option<&InstallationManifest>) -> Vec<String> {
    let mut lines = vec![format!("convex-backend-ops {}", env!("CARGO_PKG_VERSION"))];
    lines.push(String::new());
    match installed {
        Some(manifest) => {
            lines.push("Installed:".to_string());
            lines.push(format!("  Name:    {}", manifest.name));
            lines.push(format!("  Version: {}", manifest.version));
            if !manifest.apps.is_empty() {
                lines.push("  Apps:".to_string());
                lines.extend(app_lines(&manifest.apps, "    "));
            }
        }
        None => lines.push("Installed: (not installed)".to_string()),
    }
    lines
}

pub(crate) fn reset_warning_lines(layout: &InstallLayout) -> Vec<String> {
    vec![
        "This will delete all database data but keep configuration.".to_string(),
        String::new(),
        "Will delete:".to_string(),
        format!("  - Database: {}", layout.data_dir().display()),
        String::new(),
        "Will preserve:".to_string(),
        format!("  - Config:  {}", layout.config_dir().display()),
        format!("  - Backups: {}", layout.backups_dir().display()),
    ]
}

pub(crate) fn uninstall_warning_lines(layout: &InstallLayout) -> Vec<String> {
    vec![
        "This will delete all Convex backend data, including:".to_string(),
        format!("  - Binary:  {}", layout.binary_path().display()),
        format!(
            "  - Data:    {} (including all backups)",
            layout.data_root().display()
        ),
        format!("  - Config:  {}", layout.config_dir().display()),
        format!("  - Service: {}", display_file_name(&layout.unit_path())),
    ]
}

fn display_file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Shows the warning and reads one line; only a literal `yes` confirms.
pub(crate) fn confirm_destructive<R: BufRead, W: Write>(
    warning: &[String],
    input: &mut R,
    prompt: &mut W,
) -> Result<bool> {
    for line in warning {
        writeln!(prompt, "{line}").context("failed to write confirmation prompt")?;
    }
    write!(prompt, "\nType 'yes' to confirm: ").context("failed to write confirmation prompt")?;
    prompt
        .flush()
        .context("failed to flush confirmation prompt")?;

    let mut answer = String::new();
    input
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    Ok(answer.trim() == "yes")
}
