use std::cmp::Ordering;

use anyhow::{anyhow, Result};
use semver::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionChange {
    Same,
    Upgrade,
    Downgrade,
    /// At least one side is not semver and the strings differ.
    Unordered,
}

impl VersionChange {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Same => "same",
            Self::Upgrade => "upgrade",
            Self::Downgrade => "downgrade",
            Self::Unordered => "unordered",
        }
    }
}

pub fn compare_versions(current: &str, candidate: &str) -> VersionChange {
    match (parse_loose(current), parse_loose(candidate)) {
        (Some(current), Some(candidate)) => match candidate.cmp(&current) {
            Ordering::Equal => VersionChange::Same,
            Ordering::Greater => VersionChange::Upgrade,
            Ordering::Less => VersionChange::Downgrade,
        },
        _ if current.trim() == candidate.trim() => VersionChange::Same,
        _ => VersionChange::Unordered,
    }
}

// Backups are stored under `v<version>`, so a version must be a single path
// component.
pub fn validate_version_token(version: &str) -> Result<()> {
    let trimmed = version.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("version must not be empty"));
    }
    if trimmed == "." || trimmed == ".." {
        return Err(anyhow!("version must not be a relative path token: {version}"));
    }
    if trimmed
        .chars()
        .any(|ch| ch == '/' || ch == '\\' || ch.is_control())
    {
        return Err(anyhow!("version contains invalid character(s): {version}"));
    }
    Ok(())
}

fn parse_loose(value: &str) -> Option<Version> {
    let trimmed = value.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(trimmed).ok()
}
