use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use convex_ops_core::{validate_version_token, BackupMetadata};
use tracing::{debug, warn};

use crate::fs_utils::{copy_file, copy_tree, dir_size, remove_dir_if_exists, replace_tree, set_mode};

const BACKUP_BINARY: &str = "convex-backend";
const BACKUP_DATA_DIR: &str = "data";
const BACKUP_MANIFEST: &str = "manifest.json";
const BACKUP_METADATA: &str = "meta.json";

/// A complete snapshot under the backups root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    pub path: PathBuf,
    pub metadata: BackupMetadata,
    pub created_at: DateTime<Utc>,
}

impl Backup {
    pub fn version(&self) -> &str {
        &self.metadata.version
    }

    pub fn binary_path(&self) -> PathBuf {
        self.path.join(BACKUP_BINARY)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.path.join(BACKUP_DATA_DIR)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(BACKUP_MANIFEST)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.path.join(BACKUP_METADATA)
    }

    pub fn size_on_disk(&self) -> u64 {
        dir_size(&self.path)
    }
}

/// The live installation a backup is taken from.
#[derive(Debug, Clone, Copy)]
pub struct BackupSource<'a> {
    pub binary: &'a Path,
    pub data_dir: &'a Path,
    pub manifest: &'a Path,
}

#[derive(Debug, Clone)]
pub struct BackupRequest<'a> {
    pub from_version: &'a str,
    pub to_version: &'a str,
    pub reason: &'a str,
    pub created_at: DateTime<Utc>,
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|value| value.with_timezone(&Utc))
}

/// Writes binary, data, and manifest, then metadata, into a staging directory
/// next to `backup_dir`, and only then swaps it into place. A failed attempt
/// removes the staging directory and leaves any earlier backup at `backup_dir`
/// untouched.
pub fn create_backup(
    backup_dir: &Path,
    source: BackupSource<'_>,
    request: &BackupRequest<'_>,
) -> Result<Backup> {
    validate_version_token(request.from_version)?;
    let staging = sibling_path(backup_dir, "staging")?;
    remove_dir_if_exists(&staging)
        .with_context(|| format!("failed to clear stale staging: {}", staging.display()))?;

    let staged = write_backup_members(&staging, source, request)
        .and_then(|metadata| swap_into_place(&staging, backup_dir).map(|()| metadata));
    let metadata = match staged {
        Ok(metadata) => metadata,
        Err(err) => {
            discard_dir(&staging, "failed to remove partial backup");
            return Err(err);
        }
    };

    Ok(Backup {
        path: backup_dir.to_path_buf(),
        metadata,
        created_at: request.created_at,
    })
}

fn write_backup_members(
    staging: &Path,
    source: BackupSource<'_>,
    request: &BackupRequest<'_>,
) -> Result<BackupMetadata> {
    fs::create_dir_all(staging)
        .with_context(|| format!("failed to create backup directory: {}", staging.display()))?;

    copy_file(source.binary, &staging.join(BACKUP_BINARY)).context("failed to back up binary")?;

    let data_dst = staging.join(BACKUP_DATA_DIR);
    if source.data_dir.exists() {
        copy_tree(source.data_dir, &data_dst).context("failed to back up data")?;
    } else {
        fs::create_dir_all(&data_dst)
            .with_context(|| format!("failed to create directory: {}", data_dst.display()))?;
    }

    copy_file(source.manifest, &staging.join(BACKUP_MANIFEST))
        .context("failed to back up manifest")?;

    let metadata = BackupMetadata {
        version: request.from_version.to_string(),
        timestamp: format_timestamp(request.created_at),
        reason: request.reason.to_string(),
        from_version: request.from_version.to_string(),
        to_version: request.to_version.to_string(),
    };
    let metadata_path = staging.join(BACKUP_METADATA);
    fs::write(&metadata_path, metadata.to_json_string()?)
        .with_context(|| format!("failed to write {}", metadata_path.display()))?;
    Ok(metadata)
}

// The previous backup is moved aside, not deleted, until the new one is in place.
fn swap_into_place(staging: &Path, backup_dir: &Path) -> Result<()> {
    let retired = sibling_path(backup_dir, "retired")?;
    remove_dir_if_exists(&retired)
        .with_context(|| format!("failed to clear {}", retired.display()))?;

    let had_previous = backup_dir.exists();
    if had_previous {
        fs::rename(backup_dir, &retired).with_context(|| {
            format!("failed to move aside previous backup: {}", backup_dir.display())
        })?;
    }

    if let Err(err) = fs::rename(staging, backup_dir) {
        if had_previous {
            if let Err(restore_err) = fs::rename(&retired, backup_dir) {
                warn!(
                    path = %backup_dir.display(),
                    error = %restore_err,
                    "failed to put previous backup back"
                );
            }
        }
        return Err(err)
            .with_context(|| format!("failed to place backup: {}", backup_dir.display()));
    }

    if had_previous {
        discard_dir(&retired, "failed to remove replaced backup");
    }
    Ok(())
}

/// `.staging-v1.0.0` style names; `list_backups` skips dot directories.
fn sibling_path(backup_dir: &Path, label: &str) -> Result<PathBuf> {
    let name = backup_dir
        .file_name()
        .ok_or_else(|| anyhow!("backup path has no final component: {}", backup_dir.display()))?;
    Ok(backup_dir.with_file_name(format!(".{label}-{}", name.to_string_lossy())))
}

fn discard_dir(path: &Path, message: &str) {
    if let Err(err) = remove_dir_if_exists(path) {
        warn!(path = %path.display(), error = %err, "{message}");
    }
}

/// Valid backups, newest first. Directories with missing or unreadable members
/// are not backups and are skipped.
pub fn list_backups(backups_root: &Path) -> Result<Vec<Backup>> {
    let entries = match fs::read_dir(backups_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to read backups directory: {}", backups_root.display())
            });
        }
    };

    let mut backups = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| {
            format!("failed to iterate backups directory: {}", backups_root.display())
        })?;
        if !entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false) {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if let Some(backup) = read_backup(&entry.path()) {
            backups.push(backup);
        }
    }

    backups.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.path.cmp(&b.path))
    });
    Ok(backups)
}

pub fn most_recent_backup(backups_root: &Path) -> Result<Option<Backup>> {
    Ok(list_backups(backups_root)?.into_iter().next())
}

/// Backups are addressed by the version they were taken from.
pub fn find_backup_by_version(backups_root: &Path, version: &str) -> Result<Option<Backup>> {
    let mut candidates = vec![version.trim()];
    if let Some(stripped) = version.trim().strip_prefix('v') {
        candidates.push(stripped);
    }

    for candidate in candidates {
        if validate_version_token(candidate).is_err() {
            continue;
        }
        if let Some(backup) = read_backup(&backups_root.join(format!("v{candidate}"))) {
            return Ok(Some(backup));
        }
    }
    Ok(None)
}

/// Keeps the newest `retention` backups and deletes the rest.
pub fn prune_backups(backups_root: &Path, retention: usize) -> Result<Vec<Backup>> {
    let mut removed = Vec::new();
    for backup in list_backups(backups_root)?.into_iter().skip(retention) {
        match fs::remove_dir_all(&backup.path) {
            Ok(()) => {
                debug!(path = %backup.path.display(), "pruned backup");
                removed.push(backup);
            }
            Err(err) => warn!(
                path = %backup.path.display(),
                error = %err,
                "failed to prune backup"
            ),
        }
    }
    Ok(removed)
}

pub fn restore_backup(
    backup: &Backup,
    binary: &Path,
    data_dir: &Path,
    manifest: &Path,
) -> Result<()> {
    copy_file(&backup.binary_path(), binary).context("failed to restore binary")?;
    set_mode(binary, 0o755)?;
    replace_tree(&backup.data_dir(), data_dir).context("failed to restore data")?;
    copy_file(&backup.manifest_path(), manifest).context("failed to restore manifest")?;
    Ok(())
}

fn read_backup(path: &Path) -> Option<Backup> {
    let raw = fs::read_to_string(path.join(BACKUP_METADATA)).ok()?;
    let metadata = BackupMetadata::from_json_str(&raw).ok()?;
    let created_at = parse_timestamp(&metadata.timestamp)?;

    let complete = path.join(BACKUP_BINARY).is_file()
        && path.join(BACKUP_DATA_DIR).is_dir()
        && path.join(BACKUP_MANIFEST).is_file();
    if !complete {
        debug!(path = %path.display(), "skipping incomplete backup");
        return None;
    }

    Some(Backup {
        path: path.to_path_buf(),
        metadata,
        created_at,
    })
}
