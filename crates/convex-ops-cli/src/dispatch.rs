use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::Shell;
use convex_ops_installer::{
    default_layout_root, list_backups, HttpProbe, InstallLayout, InstallationState, Lifecycle,
    LifecycleError, OpsSettings, Systemd,
};
use tracing::debug;

use crate::command_flows::{
    confirm_destructive, format_backup_table, format_install_lines, format_reset_lines,
    format_status_lines, format_uninstall_lines, format_upgrade_lines, format_version_lines,
    reset_warning_lines, uninstall_warning_lines, BackupListView, InstallView, ResetView,
    RollbackView, StatusView, UninstallView, UpgradeView, VersionView,
};
use crate::render::OutputMode;
use crate::{Cli, Commands};

pub(crate) fn run_cli(cli: Cli, output: OutputMode) -> Result<()> {
    if let Commands::Completions { shell } = cli.command {
        return write_completions(shell, &mut io::stdout());
    }

    let settings = OpsSettings::load(cli.config.as_deref())?;
    let layout = InstallLayout::new(default_layout_root());
    debug!(
        root = %layout.root().display(),
        health_url = %settings.health_url,
        retention = settings.backup_retention,
        "resolved settings"
    );
    let supervisor = Systemd::default();
    let probe = HttpProbe::new(settings.probe_timeout)?;
    let lifecycle = Lifecycle::new(&layout, &supervisor, &probe, &settings);

    match cli.command {
        Commands::Install { bundle } => {
            output.print_status(
                "step",
                &format!("Installing Convex backend from bundle: {}", bundle.display()),
            );
            let report = lifecycle.install(&bundle)?;
            if output.json {
                return output.print_json(&InstallView::new(&report));
            }
            output.print_status("ok", "Convex backend installed successfully");
            output.print_lines(&format_install_lines(&report));
        }
        Commands::Status => {
            let report = lifecycle.status();
            if output.json {
                return output.print_json(&StatusView::new(&report));
            }
            output.print_section("Convex Backend Status");
            output.print_lines(&format_status_lines(&report, &layout));
        }
        Commands::Upgrade { bundle, force } => {
            let report = lifecycle.upgrade(&bundle, force)?;
            if output.json {
                return output.print_json(&UpgradeView::new(&report));
            }
            output.print_status(
                "ok",
                &format!(
                    "Upgraded from v{} to v{}",
                    report.from_version, report.to_version
                ),
            );
            output.print_lines(&format_upgrade_lines(&report));
        }
        Commands::Rollback { version } => {
            let report = lifecycle.rollback(version.as_deref())?;
            if output.json {
                return output.print_json(&RollbackView::new(&report));
            }
            output.print_status(
                "ok",
                &format!("Rolled back to v{}", report.backup.version()),
            );
            output.print_lines(&["Service restarted successfully.".to_string()]);
        }
        Commands::ListBackups => {
            let backups = list_backups(&layout.backups_dir())?;
            let view = BackupListView::new(&backups);
            if output.json {
                return output.print_json(&view);
            }
            if !view.backups.is_empty() {
                output.print_section("Available Backups");
            }
            output.print_lines(&format_backup_table(&view));
        }
        Commands::Reset => {
            confirm_or_cancel(cli.yes, "reset", &reset_warning_lines(&layout))?;
            let report = lifecycle.reset()?;
            if output.json {
                return output.print_json(&ResetView {
                    data_dir: report.data_dir.display().to_string(),
                    warnings: &report.warnings,
                });
            }
            for warning in &report.warnings {
                output.print_status("warn", warning);
            }
            output.print_status("ok", "Factory reset complete");
            output.print_lines(&format_reset_lines(&report, &layout));
        }
        Commands::Uninstall => {
            confirm_or_cancel(cli.yes, "uninstall", &uninstall_warning_lines(&layout))?;
            let report = lifecycle.uninstall()?;
            if output.json {
                return output.print_json(&UninstallView::new(&report));
            }
            for warning in &report.warnings {
                output.print_status("warn", warning);
            }
            output.print_status("ok", "Convex backend uninstalled");
            output.print_lines(&format_uninstall_lines(&report));
        }
        Commands::Version => {
            let state = InstallationState::derive(&layout);
            if output.json {
                return output.print_json(&VersionView {
                    version: env!("CARGO_PKG_VERSION"),
                    installed: state.manifest(),
                });
            }
            output.print_lines(&format_version_lines(state.manifest()));
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn confirm_or_cancel(assume_yes: bool, operation: &str, warning: &[String]) -> Result<()> {
    if assume_yes {
        return Ok(());
    }
    let stdin = io::stdin();
    let confirmed = confirm_destructive(warning, &mut stdin.lock(), &mut io::stderr())?;
    if !confirmed {
        return Err(LifecycleError::Cancelled(operation.to_string()).into());
    }
    Ok(())
}

pub(crate) fn write_completions<W: Write>(shell: Shell, writer: &mut W) -> Result<()> {
    let mut command = Cli::command();
    let mut generated = Vec::new();
    clap_complete::generate(shell, &mut command, "convex-backend-ops", &mut generated);
    writer
        .write_all(&generated)
        .context("failed writing generated completion script")
}
