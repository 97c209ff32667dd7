use std::time::Duration;

use thiserror::Error;

/// Failure classification surfaced to operators and in `--json` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Precondition,
    Resource,
    BackupNotFound,
    HealthTimeout,
    DoubleFailure,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Precondition => "precondition",
            Self::Resource => "resource",
            Self::BackupNotFound => "backup_not_found",
            Self::HealthTimeout => "health_timeout",
            Self::DoubleFailure => "double_failure",
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("this command must be run as root (use sudo)")]
    NotRoot,

    #[error("service supervisor is required but was not found")]
    SupervisorMissing,

    #[error("{name} is already installed (version {version}); use 'upgrade' to update")]
    AlreadyInstalled { name: String, version: String },

    #[error("backend is not installed; use 'install' first")]
    NotInstalled,

    #[error("already at version {0}; use --force to upgrade anyway")]
    SameVersion(String),

    #[error("invalid bundle: {0}")]
    InvalidBundle(String),

    #[error("another lifecycle operation is in progress ({holder})")]
    Locked { holder: String },

    #[error("{0} cancelled")]
    Cancelled(String),

    #[error("backup for version {0} not found")]
    BackupNotFound(String),

    #[error("no backups found")]
    NoBackupsFound,

    #[error("failed to {step}: {cause:#}")]
    Resource { step: String, cause: anyhow::Error },

    #[error("health check failed: backend at {url} did not become healthy within {timeout:?}")]
    HealthTimeout { url: String, timeout: Duration },

    #[error("upgrade failed at step '{step}', rolled back to v{restored_version}: {cause}")]
    RolledBack {
        step: String,
        restored_version: String,
        cause: Box<LifecycleError>,
    },

    #[error(
        "upgrade failed at step '{step}': {cause}; rollback also failed at step '{rollback_step}': {rollback_cause} (manual intervention required)"
    )]
    DoubleFailure {
        step: String,
        cause: Box<LifecycleError>,
        rollback_step: String,
        rollback_cause: Box<LifecycleError>,
    },
}

impl LifecycleError {
    pub fn resource(step: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::Resource {
            step: step.into(),
            cause,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotRoot
            | Self::SupervisorMissing
            | Self::AlreadyInstalled { .. }
            | Self::NotInstalled
            | Self::SameVersion(_)
            | Self::InvalidBundle(_)
            | Self::Locked { .. }
            | Self::Cancelled(_) => ErrorKind::Precondition,
            Self::BackupNotFound(_) | Self::NoBackupsFound => ErrorKind::BackupNotFound,
            Self::Resource { .. } => ErrorKind::Resource,
            Self::HealthTimeout { .. } => ErrorKind::HealthTimeout,
            Self::RolledBack { cause, .. } => cause.kind(),
            Self::DoubleFailure { .. } => ErrorKind::DoubleFailure,
        }
    }
}

pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;

/// Wraps plumbing errors with the lifecycle step that produced them.
pub(crate) trait StepContext<T> {
    fn step(self, step: &str) -> LifecycleResult<T>;
}

impl<T> StepContext<T> for anyhow::Result<T> {
    fn step(self, step: &str) -> LifecycleResult<T> {
        self.map_err(|cause| LifecycleError::resource(step, cause))
    }
}
