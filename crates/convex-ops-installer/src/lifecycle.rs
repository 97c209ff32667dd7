use std::cell::{Cell, OnceCell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use chrono::Utc;
use convex_ops_core::{
    compare_versions, Bundle, Credentials, InstallationManifest, VersionChange, UPGRADE_REASON,
};
use tracing::{debug, info, warn};

use crate::backups::{
    create_backup, find_backup_by_version, most_recent_backup, prune_backups, restore_backup,
    Backup, BackupRequest, BackupSource,
};
use crate::config::OpsSettings;
use crate::error::{LifecycleError, LifecycleResult, StepContext};
use crate::fs_utils::{
    clear_dir_entries, copy_file, copy_tree, remove_dir_if_exists, remove_file_if_exists,
    set_mode, write_file_with_mode,
};
use crate::health::{HealthGate, HealthProbe};
use crate::lock::with_operation_lock;
use crate::manifest_store::install_manifest_file;
use crate::state::InstallationState;
use crate::steps::{run_steps, Step, StepFailure};
use crate::supervisor::ServiceSupervisor;
use crate::InstallLayout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub manifest: InstallationManifest,
    pub credentials: Credentials,
    pub backend_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeReport {
    pub from_version: String,
    pub to_version: String,
    pub change: VersionChange,
    pub backup: Backup,
    pub pruned: Vec<Backup>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub backup: Backup,
    pub previous_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetReport {
    pub data_dir: PathBuf,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UninstallReport {
    pub removed: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub state: InstallationState,
    pub service_state: String,
    pub service_enabled: bool,
    pub healthy: bool,
    pub backend_url: String,
}

/// Drives install, upgrade, rollback, reset and uninstall against one host
/// layout. Holds no state of its own between calls.
pub struct Lifecycle<'a> {
    layout: &'a InstallLayout,
    supervisor: &'a dyn ServiceSupervisor,
    probe: &'a dyn HealthProbe,
    settings: &'a OpsSettings,
}

impl<'a> Lifecycle<'a> {
    pub fn new(
        layout: &'a InstallLayout,
        supervisor: &'a dyn ServiceSupervisor,
        probe: &'a dyn HealthProbe,
        settings: &'a OpsSettings,
    ) -> Self {
        Self {
            layout,
            supervisor,
            probe,
            settings,
        }
    }

    pub fn state(&self) -> InstallationState {
        InstallationState::derive(self.layout)
    }

    pub fn install(&self, bundle_dir: &Path) -> LifecycleResult<InstallReport> {
        self.ensure_privileged()?;
        self.ensure_supervisor()?;
        with_operation_lock(self.layout, "install", || self.install_locked(bundle_dir))
    }

    pub fn upgrade(&self, bundle_dir: &Path, force: bool) -> LifecycleResult<UpgradeReport> {
        self.ensure_privileged()?;
        self.ensure_supervisor()?;
        with_operation_lock(self.layout, "upgrade", || {
            self.upgrade_locked(bundle_dir, force)
        })
    }

    /// Restores the backup taken from `version`, or the newest backup.
    pub fn rollback(&self, version: Option<&str>) -> LifecycleResult<RollbackReport> {
        self.ensure_privileged()?;
        self.ensure_supervisor()?;
        with_operation_lock(self.layout, "rollback", || self.rollback_locked(version))
    }

    pub fn reset(&self) -> LifecycleResult<ResetReport> {
        self.ensure_privileged()?;
        self.ensure_supervisor()?;
        with_operation_lock(self.layout, "reset", || self.reset_locked())
    }

    pub fn uninstall(&self) -> LifecycleResult<UninstallReport> {
        self.ensure_privileged()?;
        with_operation_lock(self.layout, "uninstall", || Ok(self.uninstall_locked()))
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            state: self.state(),
            service_state: self.supervisor.active_state(),
            service_enabled: self.supervisor.is_enabled(),
            healthy: self.probe.probe(&self.settings.health_url),
            backend_url: self.settings.health_url.clone(),
        }
    }

    fn install_locked(&self, bundle_dir: &Path) -> LifecycleResult<InstallReport> {
        match self.state() {
            InstallationState::NotInstalled => {}
            InstallationState::Installed(manifest) => {
                return Err(LifecycleError::AlreadyInstalled {
                    name: manifest.name,
                    version: manifest.version,
                });
            }
            InstallationState::Corrupt { .. } => {
                return Err(LifecycleError::AlreadyInstalled {
                    name: "backend".to_string(),
                    version: "unknown".to_string(),
                });
            }
        }

        let bundle = open_bundle(bundle_dir)?;
        let manifest = bundle.read_manifest().map_err(invalid_bundle)?;
        let credentials = bundle.read_credentials().map_err(invalid_bundle)?;
        info!(
            bundle = %bundle.root().display(),
            "installing {} v{}", manifest.name, manifest.version
        );

        let layout = self.layout;
        let supervisor = self.supervisor;
        run_steps(vec![
            Step::wrapped("create directories", || layout.ensure_install_dirs()),
            Step::wrapped("copy backend binary", || {
                copy_file(&bundle.binary_path(), &layout.binary_path())?;
                set_mode(&layout.binary_path(), 0o755)
            }),
            Step::wrapped("copy data store", || {
                copy_file(&bundle.data_store_path(), &layout.data_store_path())?;
                if bundle.has_storage() {
                    copy_tree(&bundle.storage_dir(), &layout.storage_dir())?;
                }
                Ok(())
            }),
            Step::wrapped("write credentials", || {
                write_file_with_mode(
                    &layout.admin_key_path(),
                    credentials.admin_key.as_bytes(),
                    0o600,
                )?;
                write_file_with_mode(
                    &layout.instance_secret_path(),
                    credentials.instance_secret.as_bytes(),
                    0o600,
                )
            }),
            Step::wrapped("write environment config", || {
                write_file_with_mode(
                    &layout.env_file_path(),
                    render_env_file(layout, self.settings).as_bytes(),
                    0o644,
                )
            }),
            Step::wrapped("install service unit", || {
                write_file_with_mode(
                    &layout.unit_path(),
                    render_unit_file(layout).as_bytes(),
                    0o644,
                )?;
                supervisor.reload_definitions()?;
                supervisor.enable()
            }),
            Step::wrapped("install manifest", || {
                install_manifest_file(&bundle.manifest_path(), &layout.manifest_path())
                    .map(|_| ())
            }),
            Step::wrapped("start service", || supervisor.start()),
            Step::new("wait for health", || self.gate_health()),
        ])
        .map_err(StepFailure::into_cause)?;

        Ok(InstallReport {
            manifest,
            credentials,
            backend_url: self.settings.health_url.clone(),
        })
    }

    fn upgrade_locked(&self, bundle_dir: &Path, force: bool) -> LifecycleResult<UpgradeReport> {
        let current = match self.state() {
            InstallationState::Installed(manifest) => manifest,
            InstallationState::NotInstalled => return Err(LifecycleError::NotInstalled),
            InstallationState::Corrupt { reason } => {
                return Err(LifecycleError::resource(
                    "read installed manifest",
                    anyhow!(reason),
                ));
            }
        };

        let bundle = open_bundle(bundle_dir)?;
        let next = bundle.read_manifest().map_err(invalid_bundle)?;

        let change = compare_versions(&current.version, &next.version);
        match change {
            VersionChange::Same if !force => {
                return Err(LifecycleError::SameVersion(current.version));
            }
            VersionChange::Downgrade => warn!(
                from = %current.version,
                to = %next.version,
                "bundle version is older than the installed version"
            ),
            _ => {}
        }
        info!("upgrading from v{} to v{}", current.version, next.version);

        let layout = self.layout;
        let supervisor = self.supervisor;
        let backup_dir = layout.backup_dir(&current.version);
        let binary = layout.binary_path();
        let data_dir = layout.data_dir();
        let manifest_path = layout.manifest_path();
        let request = BackupRequest {
            from_version: &current.version,
            to_version: &next.version,
            reason: UPGRADE_REASON,
            created_at: Utc::now(),
        };
        let created: OnceCell<Backup> = OnceCell::new();

        let outcome = run_steps(vec![
            Step::wrapped("create backup", || {
                let source = BackupSource {
                    binary: &binary,
                    data_dir: &data_dir,
                    manifest: &manifest_path,
                };
                let backup = create_backup(&backup_dir, source, &request)?;
                let _ = created.set(backup);
                Ok(())
            }),
            Step::wrapped("stop service", || supervisor.stop())
                .compensate("restart service", || supervisor.start().step("restart service")),
            Step::wrapped("install new version", || {
                copy_file(&bundle.binary_path(), &binary)?;
                set_mode(&binary, 0o755)?;
                install_manifest_file(&bundle.manifest_path(), &manifest_path).map(|_| ())
            })
            .compensate("restore from backup", || {
                let backup = created
                    .get()
                    .ok_or_else(|| anyhow!("backup was not recorded"))
                    .step("restore from backup")?;
                restore_backup(backup, &binary, &data_dir, &manifest_path)
                    .step("restore from backup")
            }),
            Step::wrapped("start service", || supervisor.start())
                .compensate_best_effort("stop service", || supervisor.stop().step("stop service")),
            Step::new("wait for health", || self.gate_health()),
        ]);

        match outcome {
            Ok(()) => {}
            // Nothing but the backup attempt ran; the installation is untouched.
            Err(StepFailure::Compensated {
                cause,
                compensations_run: 0,
                ..
            }) => return Err(cause),
            Err(StepFailure::Compensated { step, cause, .. }) => {
                warn!(step, "upgrade rolled back to v{}", current.version);
                return Err(LifecycleError::RolledBack {
                    step: step.to_string(),
                    restored_version: current.version,
                    cause: Box::new(cause),
                });
            }
            Err(failure) => return Err(failure.into_cause()),
        }

        let backup = created
            .into_inner()
            .ok_or_else(|| anyhow!("backup was not recorded"))
            .step("create backup")?;

        let pruned = match prune_backups(&layout.backups_dir(), self.settings.backup_retention) {
            Ok(pruned) => pruned,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to prune backups");
                Vec::new()
            }
        };

        Ok(UpgradeReport {
            from_version: current.version,
            to_version: next.version,
            change,
            backup,
            pruned,
        })
    }

    fn rollback_locked(&self, version: Option<&str>) -> LifecycleResult<RollbackReport> {
        let backups_dir = self.layout.backups_dir();
        let backup = match version {
            Some(version) => find_backup_by_version(&backups_dir, version)
                .step("read backups")?
                .ok_or_else(|| LifecycleError::BackupNotFound(version.to_string()))?,
            None => most_recent_backup(&backups_dir)
                .step("read backups")?
                .ok_or(LifecycleError::NoBackupsFound)?,
        };

        let previous_version = self.state().manifest().map(|manifest| manifest.version.clone());
        info!(
            backup = %backup.path.display(),
            "rolling back to v{}", backup.version()
        );

        let layout = self.layout;
        let supervisor = self.supervisor;
        run_steps(vec![
            Step::new("stop service", || {
                if let Err(err) = supervisor.stop() {
                    warn!(error = %format!("{err:#}"), "failed to stop service before rollback");
                }
                Ok(())
            }),
            Step::wrapped("restore from backup", || {
                restore_backup(
                    &backup,
                    &layout.binary_path(),
                    &layout.data_dir(),
                    &layout.manifest_path(),
                )
            }),
            Step::wrapped("start service", || supervisor.start()),
            Step::new("wait for health", || self.gate_health()),
        ])
        .map_err(StepFailure::into_cause)?;

        Ok(RollbackReport {
            backup,
            previous_version,
        })
    }

    fn reset_locked(&self) -> LifecycleResult<ResetReport> {
        if !self.state().is_installed() {
            return Err(LifecycleError::NotInstalled);
        }

        let layout = self.layout;
        let supervisor = self.supervisor;
        let warnings = RefCell::new(Vec::new());
        // Once the forward start has run, the service is up again.
        let restarted = Cell::new(false);
        let restart = || {
            if restarted.get() {
                return Ok(());
            }
            supervisor.start().step("restart service")
        };
        run_steps(vec![
            Step::wrapped("stop service", || supervisor.stop())
                .compensate("restart service", restart),
            Step::wrapped("delete data", || {
                for (path, err) in clear_dir_entries(&layout.data_dir())? {
                    warn!(path = %path.display(), error = %err, "failed to remove data entry");
                    warnings
                        .borrow_mut()
                        .push(format!("failed to remove {}: {err}", path.display()));
                }
                fs::create_dir_all(layout.storage_dir()).map_err(|err| {
                    anyhow!(
                        "failed to recreate {}: {err}",
                        layout.storage_dir().display()
                    )
                })
            }),
            Step::wrapped("start service", || {
                supervisor.start()?;
                restarted.set(true);
                Ok(())
            }),
            Step::new("wait for health", || self.gate_health()),
        ])
        .map_err(StepFailure::into_cause)?;

        Ok(ResetReport {
            data_dir: layout.data_dir(),
            warnings: warnings.into_inner(),
        })
    }

    // Teardown keeps going past individual failures; each becomes a warning.
    fn uninstall_locked(&self) -> UninstallReport {
        let mut report = UninstallReport::default();

        info!("step: stop and disable service");
        if let Err(err) = self.supervisor.stop() {
            debug!(error = %format!("{err:#}"), "stop during uninstall failed");
        }
        if let Err(err) = self.supervisor.disable() {
            debug!(error = %format!("{err:#}"), "disable during uninstall failed");
        }

        info!("step: remove files");
        for path in [self.layout.binary_path(), self.layout.unit_path()] {
            let existed = path.exists();
            match remove_file_if_exists(&path) {
                Ok(()) if existed => report.removed.push(path),
                Ok(()) => {}
                Err(err) => record_removal_failure(&mut report, &path, &err),
            }
        }
        for path in [self.layout.data_root(), self.layout.config_dir()] {
            let existed = path.exists();
            match remove_dir_if_exists(&path) {
                Ok(()) if existed => report.removed.push(path),
                Ok(()) => {}
                Err(err) => record_removal_failure(&mut report, &path, &err),
            }
        }

        if let Err(err) = self.supervisor.reload_definitions() {
            debug!(error = %format!("{err:#}"), "reload during uninstall failed");
        }
        report
    }

    fn ensure_privileged(&self) -> LifecycleResult<()> {
        if self.settings.require_root && !nix::unistd::geteuid().is_root() {
            return Err(LifecycleError::NotRoot);
        }
        Ok(())
    }

    fn ensure_supervisor(&self) -> LifecycleResult<()> {
        if !self.supervisor.is_present() {
            return Err(LifecycleError::SupervisorMissing);
        }
        Ok(())
    }

    fn gate_health(&self) -> LifecycleResult<()> {
        let gate = HealthGate {
            budget: self.settings.health_budget,
            interval: self.settings.health_interval,
        };
        match gate.wait_healthy(self.probe, &self.settings.health_url) {
            Ok(_) => Ok(()),
            Err(err) => {
                self.dump_diagnostics();
                Err(err)
            }
        }
    }

    fn dump_diagnostics(&self) {
        match self.supervisor.recent_logs(self.settings.diagnostic_log_lines) {
            Ok(logs) => {
                warn!("recent service logs:");
                for line in logs.lines() {
                    warn!("  {line}");
                }
            }
            Err(err) => warn!(error = %format!("{err:#}"), "failed to collect service logs"),
        }
    }
}

fn open_bundle(bundle_dir: &Path) -> LifecycleResult<Bundle> {
    Bundle::open(bundle_dir).map_err(invalid_bundle)
}

fn invalid_bundle(err: anyhow::Error) -> LifecycleError {
    LifecycleError::InvalidBundle(format!("{err:#}"))
}

fn record_removal_failure(report: &mut UninstallReport, path: &Path, err: &std::io::Error) {
    warn!(path = %path.display(), error = %err, "failed to remove");
    report
        .warnings
        .push(format!("failed to remove {}: {err}", path.display()));
}

pub fn render_env_file(layout: &InstallLayout, settings: &OpsSettings) -> String {
    format!(
        "CONVEX_SITE_URL={}\nCONVEX_LOCAL_STORAGE={}\nCONVEX_ADMIN_KEY_FILE={}\nCONVEX_INSTANCE_SECRET_FILE={}\n",
        settings.health_url,
        layout.data_dir().display(),
        layout.admin_key_path().display(),
        layout.instance_secret_path().display(),
    )
}

pub fn render_unit_file(layout: &InstallLayout) -> String {
    format!(
        "[Unit]\nDescription=Convex Backend\nAfter=network.target\n\n[Service]\nType=simple\nEnvironmentFile={}\nExecStart={}\nRestart=always\nRestartSec=5\n\n[Install]\nWantedBy=multi-user.target\n",
        layout.env_file_path().display(),
        layout.binary_path().display(),
    )
}
