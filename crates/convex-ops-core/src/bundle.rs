use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::manifest::InstallationManifest;

const BINARY_FILE: &str = "backend";
const DATA_STORE_FILE: &str = "convex.db";
const STORAGE_DIR: &str = "storage";
const MANIFEST_FILE: &str = "manifest.json";
const CREDENTIALS_FILE: &str = "credentials.json";

const REQUIRED_MEMBERS: [&str; 4] = [BINARY_FILE, DATA_STORE_FILE, MANIFEST_FILE, CREDENTIALS_FILE];

/// A bundle directory produced by the bundler. Treated as read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    root: PathBuf,
}

impl Bundle {
    /// Opens a bundle after checking that every required member is present.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let bundle = Self { root: root.into() };
        bundle.validate()?;
        Ok(bundle)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn binary_path(&self) -> PathBuf {
        self.root.join(BINARY_FILE)
    }

    pub fn data_store_path(&self) -> PathBuf {
        self.root.join(DATA_STORE_FILE)
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.root.join(STORAGE_DIR)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.root.join(CREDENTIALS_FILE)
    }

    pub fn has_storage(&self) -> bool {
        self.storage_dir().is_dir()
    }

    pub fn missing_members(&self) -> Vec<&'static str> {
        REQUIRED_MEMBERS
            .into_iter()
            .filter(|member| !self.root.join(member).exists())
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(anyhow!(
                "bundle directory not found: {}",
                self.root.display()
            ));
        }
        if let Some(missing) = self.missing_members().first() {
            return Err(anyhow!("missing required file: {missing}"));
        }
        Ok(())
    }

    pub fn read_manifest(&self) -> Result<InstallationManifest> {
        InstallationManifest::from_path(&self.manifest_path())
    }

    pub fn read_credentials(&self) -> Result<Credentials> {
        let path = self.credentials_path();
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read credentials: {}", path.display()))?;
        Credentials::from_json_str(&raw)
            .with_context(|| format!("failed to load credentials: {}", path.display()))
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub admin_key: String,
    pub instance_secret: String,
}

impl Credentials {
    pub fn from_json_str(input: &str) -> Result<Self> {
        let credentials: Self =
            serde_json::from_str(input).context("failed to parse credentials")?;
        if credentials.admin_key.trim().is_empty() {
            return Err(anyhow!("credentials adminKey must not be empty"));
        }
        if credentials.instance_secret.trim().is_empty() {
            return Err(anyhow!("credentials instanceSecret must not be empty"));
        }
        Ok(credentials)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("admin_key", &"<redacted>")
            .field("instance_secret", &"<redacted>")
            .finish()
    }
}
