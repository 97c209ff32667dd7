use std::fs;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::Context;
use fd_lock::RwLock;
use tracing::debug;

use crate::error::{LifecycleError, LifecycleResult, StepContext};
use crate::InstallLayout;

/// Runs `run` while holding the host-wide advisory lock. The lock is released
/// when this returns, whatever `run` returned.
pub fn with_operation_lock<T>(
    layout: &InstallLayout,
    operation: &str,
    run: impl FnOnce() -> LifecycleResult<T>,
) -> LifecycleResult<T> {
    let path = layout.lock_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))
            .step("prepare operation lock")?;
    }

    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))
        .step("open operation lock")?;

    let mut lock = RwLock::new(file);
    let mut guard = match lock.try_write() {
        Ok(guard) => guard,
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            return Err(LifecycleError::Locked {
                holder: read_lock_holder(&path),
            });
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to lock {}", path.display()))
                .step("acquire operation lock");
        }
    };

    let holder = format!("pid={} operation={operation}\n", std::process::id());
    record_holder(&mut guard, &holder)
        .with_context(|| format!("failed to record lock holder: {}", path.display()))
        .step("acquire operation lock")?;
    debug!(operation, path = %path.display(), "acquired operation lock");

    let result = run();
    drop(guard);
    result
}

fn record_holder(file: &mut fs::File, holder: &str) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(holder.as_bytes())?;
    file.flush()
}

fn read_lock_holder(path: &Path) -> String {
    fs::read_to_string(path)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .unwrap_or_else(|| "holder unknown".to_string())
}
