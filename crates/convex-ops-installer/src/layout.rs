use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const SERVICE_NAME: &str = "convex-backend";
const ROOT_ENV: &str = "CONVEX_OPS_ROOT";

/// Fixed on-host paths, resolved under a root that is `/` in production.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    root: PathBuf,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn binary_path(&self) -> PathBuf {
        self.root.join("usr/local/bin").join(SERVICE_NAME)
    }

    pub fn data_root(&self) -> PathBuf {
        self.root.join("var/lib/convex")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_root().join("data")
    }

    pub fn data_store_path(&self) -> PathBuf {
        self.data_dir().join("convex.db")
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.data_dir().join("storage")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.data_root().join("manifest.json")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_root().join("backups")
    }

    pub fn backup_dir(&self, from_version: &str) -> PathBuf {
        self.backups_dir().join(format!("v{from_version}"))
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("etc/convex")
    }

    pub fn env_file_path(&self) -> PathBuf {
        self.config_dir().join("convex.env")
    }

    pub fn admin_key_path(&self) -> PathBuf {
        self.config_dir().join("admin.key")
    }

    pub fn instance_secret_path(&self) -> PathBuf {
        self.config_dir().join("instance.secret")
    }

    pub fn unit_path(&self) -> PathBuf {
        self.root
            .join("etc/systemd/system")
            .join(format!("{SERVICE_NAME}.service"))
    }

    // Outside the data root: uninstall deletes that tree while holding the lock.
    pub fn lock_path(&self) -> PathBuf {
        self.root.join("run/lock/convex-backend-ops.lock")
    }

    pub fn ensure_install_dirs(&self) -> Result<()> {
        for dir in [
            self.data_root(),
            self.data_dir(),
            self.storage_dir(),
            self.backups_dir(),
            self.config_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

impl Default for InstallLayout {
    fn default() -> Self {
        Self::new("/")
    }
}

pub fn default_layout_root() -> PathBuf {
    match std::env::var(ROOT_ENV) {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => PathBuf::from("/"),
    }
}
