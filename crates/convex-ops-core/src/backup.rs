use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const UPGRADE_REASON: &str = "upgrade";

/// Contents of a backup's `meta.json`. Written last, so its presence marks the
/// snapshot as complete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub version: String,
    pub timestamp: String,
    pub reason: String,
    pub from_version: String,
    pub to_version: String,
}

impl BackupMetadata {
    pub fn from_json_str(input: &str) -> Result<Self> {
        serde_json::from_str(input).context("failed to parse backup metadata")
    }

    pub fn to_json_string(&self) -> Result<String> {
        let mut payload =
            serde_json::to_string_pretty(self).context("failed to serialize backup metadata")?;
        payload.push('\n');
        Ok(payload)
    }
}
