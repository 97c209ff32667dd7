use convex_ops_core::InstallationManifest;

use crate::manifest_store::read_manifest;
use crate::InstallLayout;

/// What is on disk right now. Derived at the start of every operation and
/// never carried between operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallationState {
    NotInstalled,
    Installed(InstallationManifest),
    /// A manifest file exists but cannot be read or parsed.
    Corrupt { reason: String },
}

impl InstallationState {
    pub fn derive(layout: &InstallLayout) -> Self {
        match read_manifest(&layout.manifest_path()) {
            Ok(None) => Self::NotInstalled,
            Ok(Some(manifest)) => Self::Installed(manifest),
            Err(err) => Self::Corrupt {
                reason: format!("{err:#}"),
            },
        }
    }

    pub fn is_installed(&self) -> bool {
        !matches!(self, Self::NotInstalled)
    }

    pub fn manifest(&self) -> Option<&InstallationManifest> {
        match self {
            Self::Installed(manifest) => Some(manifest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotInstalled => "not_installed",
            Self::Installed(_) => "installed",
            Self::Corrupt { .. } => "corrupt",
        }
    }
}
