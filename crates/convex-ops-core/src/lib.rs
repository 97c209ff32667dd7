mod backup;
mod bundle;
mod manifest;
mod version;

pub use backup::{BackupMetadata, UPGRADE_REASON};
pub use bundle::{Bundle, Credentials};
pub use manifest::InstallationManifest;
pub use version::{compare_versions, validate_version_token, VersionChange};
