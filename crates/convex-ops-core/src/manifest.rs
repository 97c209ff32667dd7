use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::version::validate_version_token;

/// Identity of the backend build currently placed on the host.
///
/// Field names follow the bundler's `manifest.json` (camelCase) so the file can
/// be copied out of a bundle byte-for-byte and still parse here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallationManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub apps: Vec<String>,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub created_at: String,
}

impl InstallationManifest {
    pub fn from_json_str(input: &str) -> Result<Self> {
        let manifest: Self =
            serde_json::from_str(input).context("failed to parse installation manifest")?;
        validate_version_token(&manifest.version).with_context(|| {
            format!("manifest '{}' declares an unusable version", manifest.name)
        })?;
        Ok(manifest)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest: {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("failed to load manifest: {}", path.display()))
    }

    pub fn to_json_string(&self) -> Result<String> {
        let mut payload =
            serde_json::to_string_pretty(self).context("failed to serialize manifest")?;
        payload.push('\n');
        Ok(payload)
    }
}
