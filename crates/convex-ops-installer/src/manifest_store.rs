use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use convex_ops_core::InstallationManifest;

use crate::fs_utils::copy_file;

pub fn read_manifest(path: &Path) -> Result<Option<InstallationManifest>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read manifest: {}", path.display()));
        }
    };

    let manifest = InstallationManifest::from_json_str(&raw)
        .with_context(|| format!("failed to parse manifest: {}", path.display()))?;
    Ok(Some(manifest))
}

/// Places a manifest file as-is after checking that it parses.
pub fn install_manifest_file(src: &Path, dst: &Path) -> Result<InstallationManifest> {
    let manifest = InstallationManifest::from_path(src)?;
    copy_file(src, dst)?;
    Ok(manifest)
}
