mod backups;
mod config;
mod error;
mod fs_utils;
mod health;
mod layout;
mod lifecycle;
mod lock;
mod manifest_store;
mod state;
mod steps;
mod supervisor;

pub use backups::{
    create_backup, find_backup_by_version, format_timestamp, list_backups, most_recent_backup,
    parse_timestamp, prune_backups, restore_backup, Backup, BackupRequest, BackupSource,
};
pub use config::{
    parse_retention, OpsSettings, DEFAULT_BACKUP_RETENTION, DEFAULT_HEALTH_URL, RETENTION_ENV,
};
pub use error::{ErrorKind, LifecycleError, LifecycleResult};
pub use health::{HealthGate, HealthProbe, HttpProbe};
pub use layout::{default_layout_root, InstallLayout, SERVICE_NAME};
pub use lifecycle::{
    render_env_file, render_unit_file, InstallReport, Lifecycle, ResetReport, RollbackReport,
    StatusReport, UninstallReport, UpgradeReport,
};
pub use lock::with_operation_lock;
pub use manifest_store::{install_manifest_file, read_manifest};
pub use state::InstallationState;
pub use steps::{run_steps, Step, StepFailure};
pub use supervisor::{ServiceSupervisor, Systemd};

#[cfg(test)]
mod tests;
