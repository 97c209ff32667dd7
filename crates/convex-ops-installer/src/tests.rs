use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use convex_ops_core::{BackupMetadata, InstallationManifest, VersionChange, UPGRADE_REASON};
use tempfile::TempDir;

use super::*;

#[derive(Default)]
struct FakeSupervisor {
    absent: bool,
    fail_all: Cell<bool>,
    start_results: RefCell<VecDeque<bool>>,
    calls: RefCell<Vec<&'static str>>,
}

impl FakeSupervisor {
    fn record(&self, verb: &'static str) -> Result<()> {
        self.calls.borrow_mut().push(verb);
        if self.fail_all.get() {
            return Err(anyhow!("{verb} failed"));
        }
        Ok(())
    }

    fn calls_since(&self, mark: usize) -> Vec<&'static str> {
        self.calls.borrow()[mark..].to_vec()
    }

    fn mark(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl ServiceSupervisor for FakeSupervisor {
    fn is_present(&self) -> bool {
        !self.absent
    }

    fn start(&self) -> Result<()> {
        self.record("start")?;
        match self.start_results.borrow_mut().pop_front() {
            Some(false) => Err(anyhow!("unit failed to start")),
            _ => Ok(()),
        }
    }

    fn stop(&self) -> Result<()> {
        self.record("stop")
    }

    fn enable(&self) -> Result<()> {
        self.record("enable")
    }

    fn disable(&self) -> Result<()> {
        self.record("disable")
    }

    fn active_state(&self) -> String {
        "active".to_string()
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn reload_definitions(&self) -> Result<()> {
        self.record("reload")
    }

    fn recent_logs(&self, lines: usize) -> Result<String> {
        self.calls.borrow_mut().push("logs");
        Ok(format!("last {lines} lines\nbackend exited"))
    }
}

#[derive(Default)]
struct FakeProbe {
    probes: Cell<u32>,
    healthy_from: Cell<Option<u32>>,
}

impl FakeProbe {
    fn healthy() -> Self {
        let probe = Self::default();
        probe.healthy_from.set(Some(1));
        probe
    }
}

impl HealthProbe for FakeProbe {
    fn probe(&self, _url: &str) -> bool {
        let attempt = self.probes.get() + 1;
        self.probes.set(attempt);
        self.healthy_from
            .get()
            .is_some_and(|healthy_from| attempt >= healthy_from)
    }
}

struct Harness {
    temp: TempDir,
    layout: InstallLayout,
    supervisor: FakeSupervisor,
    probe: FakeProbe,
    settings: OpsSettings,
}

impl Harness {
    fn new() -> Self {
        let temp = tempfile::tempdir().expect("must create temp dir");
        let layout = InstallLayout::new(temp.path().join("host"));
        Self {
            temp,
            layout,
            supervisor: FakeSupervisor::default(),
            probe: FakeProbe::healthy(),
            settings: test_settings(),
        }
    }

    fn lifecycle(&self) -> Lifecycle<'_> {
        Lifecycle::new(&self.layout, &self.supervisor, &self.probe, &self.settings)
    }

    fn bundle(&self, version: &str) -> PathBuf {
        let dir = self.temp.path().join("bundles").join(version);
        write_bundle(&dir, version);
        dir
    }

    fn install(&self, version: &str) -> InstallReport {
        self.lifecycle()
            .install(&self.bundle(version))
            .expect("must install")
    }

    fn set_unhealthy(&self) {
        self.probe.healthy_from.set(None);
    }

    fn installed_version(&self) -> Option<String> {
        self.lifecycle()
            .state()
            .manifest()
            .map(|manifest| manifest.version.clone())
    }
}

fn test_settings() -> OpsSettings {
    OpsSettings {
        health_budget: Duration::from_millis(40),
        health_interval: Duration::from_millis(5),
        probe_timeout: Duration::from_millis(5),
        require_root: false,
        ..OpsSettings::default()
    }
}

fn write_bundle(dir: &Path, version: &str) {
    fs::create_dir_all(dir.join("storage")).expect("must create bundle dir");
    fs::write(dir.join("backend"), format!("backend-{version}")).expect("must write binary");
    fs::write(dir.join("convex.db"), format!("db-{version}")).expect("must write data store");
    fs::write(dir.join("storage/blob.bin"), format!("blob-{version}"))
        .expect("must write storage blob");
    fs::write(
        dir.join("manifest.json"),
        format!(
            r#"{{"name":"acme-backend","version":"{version}","apps":["dashboard"],"platform":"x86_64-unknown-linux-gnu","createdAt":"2026-01-12T08:30:00Z"}}"#
        ),
    )
    .expect("must write manifest");
    fs::write(
        dir.join("credentials.json"),
        format!(r#"{{"adminKey":"admin-{version}","instanceSecret":"secret-{version}"}}"#),
    )
    .expect("must write credentials");
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_else(|err| panic!("must read {}: {err}", path.display()))
}

fn timestamp(raw: &str) -> chrono::DateTime<chrono::Utc> {
    parse_timestamp(raw).expect("must parse timestamp")
}

fn seed_backup(layout: &InstallLayout, from_version: &str, created_at: &str) -> Backup {
    let binary = layout.binary_path();
    let data_dir = layout.data_dir();
    let manifest = layout.manifest_path();
    create_backup(
        &layout.backup_dir(from_version),
        BackupSource {
            binary: &binary,
            data_dir: &data_dir,
            manifest: &manifest,
        },
        &BackupRequest {
            from_version,
            to_version: "next",
            reason: UPGRADE_REASON,
            created_at: timestamp(created_at),
        },
    )
    .expect("must create backup")
}

#[test]
fn install_places_artifacts_and_records_manifest() {
    let harness = Harness::new();
    let report = harness.install("1.0.0");
    let layout = &harness.layout;

    assert_eq!(report.manifest.version, "1.0.0");
    assert_eq!(report.manifest.apps, vec!["dashboard"]);
    assert_eq!(report.credentials.admin_key, "admin-1.0.0");
    assert_eq!(harness.installed_version().as_deref(), Some("1.0.0"));

    assert_eq!(read(&layout.binary_path()), "backend-1.0.0");
    assert_eq!(read(&layout.data_store_path()), "db-1.0.0");
    assert_eq!(read(&layout.storage_dir().join("blob.bin")), "blob-1.0.0");
    assert_eq!(read(&layout.admin_key_path()), "admin-1.0.0");
    assert_eq!(read(&layout.instance_secret_path()), "secret-1.0.0");
    assert!(layout.backups_dir().is_dir());

    let env = read(&layout.env_file_path());
    assert!(env.contains(&format!(
        "CONVEX_ADMIN_KEY_FILE={}",
        layout.admin_key_path().display()
    )));
    assert!(env.contains(&format!("CONVEX_LOCAL_STORAGE={}", layout.data_dir().display())));
    let unit = read(&layout.unit_path());
    assert!(unit.contains(&format!("ExecStart={}", layout.binary_path().display())));
    assert!(unit.contains("Restart=always"));

    assert_eq!(
        harness.supervisor.calls_since(0),
        vec!["reload", "enable", "start"]
    );
}

#[cfg(unix)]
#[test]
fn install_restricts_credential_permissions() {
    use std::os::unix::fs::PermissionsExt;

    let harness = Harness::new();
    harness.install("1.0.0");

    let mode = |path: PathBuf| {
        fs::metadata(path)
            .expect("must stat")
            .permissions()
            .mode()
            & 0o777
    };
    assert_eq!(mode(harness.layout.admin_key_path()), 0o600);
    assert_eq!(mode(harness.layout.instance_secret_path()), 0o600);
    assert_eq!(mode(harness.layout.binary_path()), 0o755);
}

#[test]
fn install_refuses_existing_installation() {
    let harness = Harness::new();
    harness.install("1.0.0");

    let err = harness
        .lifecycle()
        .install(&harness.bundle("1.2.0"))
        .expect_err("second install must fail");
    assert!(
        matches!(err, LifecycleError::AlreadyInstalled { ref version, .. } if version == "1.0.0"),
        "unexpected error: {err}"
    );
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert_eq!(read(&harness.layout.binary_path()), "backend-1.0.0");
}

#[test]
fn install_treats_corrupt_manifest_as_installed() {
    let harness = Harness::new();
    harness
        .layout
        .ensure_install_dirs()
        .expect("must create dirs");
    fs::write(harness.layout.manifest_path(), "not json").expect("must write manifest");

    assert_eq!(harness.lifecycle().state().as_str(), "corrupt");
    let err = harness
        .lifecycle()
        .install(&harness.bundle("1.0.0"))
        .expect_err("corrupt install must be refused");
    assert!(matches!(err, LifecycleError::AlreadyInstalled { .. }));
    assert!(!harness.layout.binary_path().exists());
}

#[test]
fn install_requires_service_supervisor() {
    let mut harness = Harness::new();
    harness.supervisor.absent = true;

    let err = harness
        .lifecycle()
        .install(&harness.bundle("1.0.0"))
        .expect_err("install without supervisor must fail");
    assert!(matches!(err, LifecycleError::SupervisorMissing));
    assert!(!harness.layout.root().exists());
}

#[test]
fn install_rejects_incomplete_bundle_before_mutation() {
    let harness = Harness::new();
    let bundle = harness.bundle("1.0.0");
    fs::remove_file(bundle.join("credentials.json")).expect("must remove credentials");

    let err = harness
        .lifecycle()
        .install(&bundle)
        .expect_err("incomplete bundle must fail");
    assert!(
        matches!(err, LifecycleError::InvalidBundle(ref message) if message.contains("credentials.json")),
        "unexpected error: {err}"
    );
    assert!(!harness.layout.binary_path().exists());
    assert!(harness.supervisor.calls_since(0).is_empty());
}

#[test]
fn install_health_timeout_dumps_logs_and_leaves_service_started() {
    let harness = Harness::new();
    harness.set_unhealthy();

    let err = harness
        .lifecycle()
        .install(&harness.bundle("1.0.0"))
        .expect_err("unhealthy install must fail");
    assert_eq!(err.kind(), ErrorKind::HealthTimeout);
    assert_eq!(
        harness.supervisor.calls_since(0),
        vec!["reload", "enable", "start", "logs"]
    );
    assert_eq!(harness.installed_version().as_deref(), Some("1.0.0"));
    assert!(harness.probe.probes.get() > 1);
}

#[test]
fn upgrade_same_version_is_rejected_without_side_effects() {
    let harness = Harness::new();
    harness.install("1.0.0");
    let mark = harness.supervisor.mark();
    let bundle = harness.bundle("1.0.0");

    for _ in 0..2 {
        let err = harness
            .lifecycle()
            .upgrade(&bundle, false)
            .expect_err("same-version upgrade must fail");
        assert!(matches!(err, LifecycleError::SameVersion(ref version) if version == "1.0.0"));
    }

    assert!(harness.supervisor.calls_since(mark).is_empty());
    assert!(list_backups(&harness.layout.backups_dir())
        .expect("must list backups")
        .is_empty());
}

#[test]
fn upgrade_same_version_with_force_reinstalls() {
    let harness = Harness::new();
    harness.install("1.0.0");

    let report = harness
        .lifecycle()
        .upgrade(&harness.bundle("1.0.0"), true)
        .expect("forced upgrade must succeed");
    assert_eq!(report.change, VersionChange::Same);
    assert_eq!(report.backup.version(), "1.0.0");
}

#[test]
fn upgrade_requires_installation() {
    let harness = Harness::new();
    let err = harness
        .lifecycle()
        .upgrade(&harness.bundle("1.2.0"), false)
        .expect_err("upgrade without install must fail");
    assert!(matches!(err, LifecycleError::NotInstalled));
}

#[test]
fn upgrade_backs_up_and_swaps_binary_while_keeping_data() {
    let harness = Harness::new();
    harness.install("1.0.0");
    let mark = harness.supervisor.mark();

    let report = harness
        .lifecycle()
        .upgrade(&harness.bundle("1.2.0"), false)
        .expect("upgrade must succeed");

    assert_eq!(report.from_version, "1.0.0");
    assert_eq!(report.to_version, "1.2.0");
    assert_eq!(report.change, VersionChange::Upgrade);
    assert!(report.pruned.is_empty());
    assert_eq!(harness.installed_version().as_deref(), Some("1.2.0"));
    assert_eq!(read(&harness.layout.binary_path()), "backend-1.2.0");
    assert_eq!(read(&harness.layout.data_store_path()), "db-1.0.0");
    assert_eq!(harness.supervisor.calls_since(mark), vec!["stop", "start"]);

    let backups = list_backups(&harness.layout.backups_dir()).expect("must list backups");
    assert_eq!(backups.len(), 1);
    let backup = &backups[0];
    assert_eq!(backup.path, harness.layout.backup_dir("1.0.0"));
    assert_eq!(backup.metadata.from_version, "1.0.0");
    assert_eq!(backup.metadata.to_version, "1.2.0");
    assert_eq!(backup.metadata.reason, "upgrade");
    assert_eq!(read(&backup.binary_path()), "backend-1.0.0");
    assert_eq!(read(&backup.data_dir().join("convex.db")), "db-1.0.0");
}

#[test]
fn upgrade_allows_downgrade() {
    let harness = Harness::new();
    harness.install("1.2.0");

    let report = harness
        .lifecycle()
        .upgrade(&harness.bundle("1.0.0"), false)
        .expect("downgrade must be allowed");
    assert_eq!(report.change, VersionChange::Downgrade);
    assert_eq!(harness.installed_version().as_deref(), Some("1.0.0"));
}

#[test]
fn upgrade_health_failure_restores_previous_version() {
    let harness = Harness::new();
    harness.install("1.0.0");
    seed_backup(&harness.layout, "0.1.0", "2025-01-01T00:00:00Z");
    seed_backup(&harness.layout, "0.2.0", "2025-01-02T00:00:00Z");
    seed_backup(&harness.layout, "0.3.0", "2025-01-03T00:00:00Z");
    fs::write(harness.layout.data_dir().join("extra.log"), "written by 1.0.0")
        .expect("must write data");
    harness.set_unhealthy();
    let mark = harness.supervisor.mark();

    let err = harness
        .lifecycle()
        .upgrade(&harness.bundle("1.2.0"), false)
        .expect_err("unhealthy upgrade must fail");

    match &err {
        LifecycleError::RolledBack {
            step,
            restored_version,
            ..
        } => {
            assert_eq!(step, "wait for health");
            assert_eq!(restored_version, "1.0.0");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), ErrorKind::HealthTimeout);

    assert_eq!(harness.installed_version().as_deref(), Some("1.0.0"));
    assert_eq!(read(&harness.layout.binary_path()), "backend-1.0.0");
    assert_eq!(read(&harness.layout.data_store_path()), "db-1.0.0");
    assert_eq!(
        read(&harness.layout.data_dir().join("extra.log")),
        "written by 1.0.0"
    );
    assert_eq!(
        harness.supervisor.calls_since(mark),
        vec!["stop", "start", "logs", "stop", "start"]
    );
    // No pruning after a failed upgrade.
    assert_eq!(
        list_backups(&harness.layout.backups_dir())
            .expect("must list backups")
            .len(),
        4
    );
}

#[test]
fn upgrade_reports_double_failure_when_restart_fails() {
    let harness = Harness::new();
    harness.install("1.0.0");
    harness.set_unhealthy();
    harness
        .supervisor
        .start_results
        .borrow_mut()
        .extend([true, false]);

    let err = harness
        .lifecycle()
        .upgrade(&harness.bundle("1.2.0"), false)
        .expect_err("upgrade must fail");
    match &err {
        LifecycleError::DoubleFailure {
            step,
            rollback_step,
            ..
        } => {
            assert_eq!(step, "wait for health");
            assert_eq!(rollback_step, "restart service");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), ErrorKind::DoubleFailure);
    assert!(err.to_string().contains("manual intervention required"));
}

#[test]
fn upgrade_backup_failure_leaves_installation_untouched() {
    let harness = Harness::new();
    harness.install("1.0.0");
    fs::remove_file(harness.layout.binary_path()).expect("must remove binary");
    let mark = harness.supervisor.mark();

    let err = harness
        .lifecycle()
        .upgrade(&harness.bundle("1.2.0"), false)
        .expect_err("upgrade must fail");
    assert!(
        matches!(err, LifecycleError::Resource { ref step, .. } if step == "create backup"),
        "unexpected error: {err}"
    );
    assert!(!harness.layout.backup_dir("1.0.0").exists());
    assert!(harness.supervisor.calls_since(mark).is_empty());
    assert_eq!(harness.installed_version().as_deref(), Some("1.0.0"));
}

#[test]
fn upgrade_prunes_beyond_retention_after_success() {
    let harness = Harness::new();
    harness.install("1.0.0");
    seed_backup(&harness.layout, "0.1.0", "2025-01-01T00:00:00Z");
    seed_backup(&harness.layout, "0.2.0", "2025-01-02T00:00:00Z");
    seed_backup(&harness.layout, "0.3.0", "2025-01-03T00:00:00Z");

    let report = harness
        .lifecycle()
        .upgrade(&harness.bundle("1.2.0"), false)
        .expect("upgrade must succeed");

    let pruned: Vec<&str> = report.pruned.iter().map(Backup::version).collect();
    assert_eq!(pruned, vec!["0.1.0"]);
    let kept: Vec<String> = list_backups(&harness.layout.backups_dir())
        .expect("must list backups")
        .iter()
        .map(|backup| backup.version().to_string())
        .collect();
    assert_eq!(kept, vec!["1.0.0", "0.3.0", "0.2.0"]);
}

#[test]
fn rollback_without_backups_fails_before_mutation() {
    let harness = Harness::new();
    harness.install("1.0.0");
    let mark = harness.supervisor.mark();

    let err = harness
        .lifecycle()
        .rollback(None)
        .expect_err("rollback must fail");
    assert!(matches!(err, LifecycleError::NoBackupsFound));
    assert_eq!(err.kind(), ErrorKind::BackupNotFound);

    let err = harness
        .lifecycle()
        .rollback(Some("9.9.9"))
        .expect_err("rollback must fail");
    assert_eq!(err.to_string(), "backup for version 9.9.9 not found");

    assert!(harness.supervisor.calls_since(mark).is_empty());
    assert_eq!(read(&harness.layout.binary_path()), "backend-1.0.0");
}

#[test]
fn install_upgrade_rollback_returns_to_first_version() {
    let harness = Harness::new();
    harness.install("1.0.0");
    harness
        .lifecycle()
        .upgrade(&harness.bundle("1.2.0"), false)
        .expect("upgrade must succeed");
    let written_after_upgrade = harness.layout.data_dir().join("after-upgrade.db");
    fs::write(&written_after_upgrade, "new rows").expect("must write data file");

    let err = harness
        .lifecycle()
        .upgrade(&harness.bundle("1.2.0"), false)
        .expect_err("same-version upgrade must fail");
    assert!(matches!(err, LifecycleError::SameVersion(ref version) if version == "1.2.0"));
    assert_eq!(err.kind(), ErrorKind::Precondition);
    let mark = harness.supervisor.mark();

    let report = harness.lifecycle().rollback(None).expect("rollback must succeed");

    assert_eq!(report.backup.version(), "1.0.0");
    assert_eq!(report.previous_version.as_deref(), Some("1.2.0"));
    assert_eq!(harness.installed_version().as_deref(), Some("1.0.0"));
    assert_eq!(read(&harness.layout.binary_path()), "backend-1.0.0");
    assert_eq!(read(&harness.layout.data_store_path()), "db-1.0.0");
    assert!(!written_after_upgrade.exists());
    assert_eq!(harness.supervisor.calls_since(mark), vec!["stop", "start"]);
}

#[test]
fn upgrade_failure_keeps_existing_rollback_point() {
    let harness = Harness::new();
    harness.install("1.0.0");
    harness
        .lifecycle()
        .upgrade(&harness.bundle("1.2.0"), false)
        .expect("upgrade must succeed");
    harness.lifecycle().rollback(None).expect("rollback must succeed");
    let backups_dir = harness.layout.backups_dir();
    assert_eq!(list_backups(&backups_dir).expect("must list backups").len(), 1);

    fs::remove_file(harness.layout.binary_path()).expect("must remove live binary");
    let err = harness
        .lifecycle()
        .upgrade(&harness.bundle("1.2.0"), false)
        .expect_err("upgrade without a live binary must fail");
    assert!(
        matches!(err, LifecycleError::Resource { ref step, .. } if step == "create backup"),
        "unexpected error: {err}"
    );

    let backups = list_backups(&backups_dir).expect("must list backups");
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].version(), "1.0.0");
    assert_eq!(read(&backups[0].binary_path()), "backend-1.0.0");
    let leftovers: Vec<_> = fs::read_dir(&backups_dir)
        .expect("must read backups dir")
        .map(|entry| entry.expect("must read entry").file_name())
        .collect();
    assert_eq!(leftovers, vec![std::ffi::OsString::from("v1.0.0")]);

    let report = harness
        .lifecycle()
        .rollback(Some("1.0.0"))
        .expect("existing backup must still restore");
    assert_eq!(report.backup.version(), "1.0.0");
    assert_eq!(read(&harness.layout.binary_path()), "backend-1.0.0");
}

#[test]
fn rollback_accepts_prefixed_version() {
    let harness = Harness::new();
    harness.install("1.0.0");
    harness
        .lifecycle()
        .upgrade(&harness.bundle("1.2.0"), false)
        .expect("upgrade must succeed");

    let report = harness
        .lifecycle()
        .rollback(Some("v1.0.0"))
        .expect("rollback must succeed");
    assert_eq!(report.backup.version(), "1.0.0");
}

#[test]
fn rollback_ignores_stop_failure() {
    let harness = Harness::new();
    harness.install("1.0.0");
    harness
        .lifecycle()
        .upgrade(&harness.bundle("1.2.0"), false)
        .expect("upgrade must succeed");
    harness.supervisor.fail_all.set(true);

    let err = harness
        .lifecycle()
        .rollback(None)
        .expect_err("start failure must surface");
    assert!(
        matches!(err, LifecycleError::Resource { ref step, .. } if step == "start service"),
        "unexpected error: {err}"
    );
    // The restore ran even though stop failed.
    assert_eq!(harness.installed_version().as_deref(), Some("1.0.0"));
}

#[test]
fn reset_clears_data_and_keeps_config_and_backups() {
    let harness = Harness::new();
    harness.install("1.0.0");
    harness
        .lifecycle()
        .upgrade(&harness.bundle("1.2.0"), false)
        .expect("upgrade must succeed");
    fs::create_dir_all(harness.layout.data_dir().join("modules/nested"))
        .expect("must create nested dir");
    let env_before = read(&harness.layout.env_file_path());
    let key_before = read(&harness.layout.admin_key_path());
    let meta_path = harness.layout.backup_dir("1.0.0").join("meta.json");
    let meta_before = read(&meta_path);
    let mark = harness.supervisor.mark();

    let report = harness.lifecycle().reset().expect("reset must succeed");

    assert!(report.warnings.is_empty());
    let mut remaining: Vec<String> = fs::read_dir(harness.layout.data_dir())
        .expect("must read data dir")
        .map(|entry| {
            entry
                .expect("must read entry")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    remaining.sort();
    assert_eq!(remaining, vec!["storage"]);
    assert_eq!(
        fs::read_dir(harness.layout.storage_dir())
            .expect("must read storage dir")
            .count(),
        0
    );
    assert_eq!(read(&harness.layout.env_file_path()), env_before);
    assert_eq!(read(&harness.layout.admin_key_path()), key_before);
    assert_eq!(read(&meta_path), meta_before);
    assert_eq!(harness.installed_version().as_deref(), Some("1.2.0"));
    assert_eq!(harness.supervisor.calls_since(mark), vec!["stop", "start"]);
}

#[test]
fn reset_health_failure_does_not_start_service_twice() {
    let harness = Harness::new();
    harness.install("1.0.0");
    harness.set_unhealthy();
    // A second start would fail.
    harness
        .supervisor
        .start_results
        .borrow_mut()
        .extend([true, false]);
    let mark = harness.supervisor.mark();

    let err = harness.lifecycle().reset().expect_err("unhealthy reset must fail");

    assert!(
        matches!(err, LifecycleError::HealthTimeout { .. }),
        "unexpected error: {err}"
    );
    assert_eq!(
        harness.supervisor.calls_since(mark),
        vec!["stop", "start", "logs"]
    );
}

#[test]
fn reset_requires_installation() {
    let harness = Harness::new();
    let err = harness.lifecycle().reset().expect_err("reset must fail");
    assert!(matches!(err, LifecycleError::NotInstalled));
}

#[test]
fn uninstall_removes_everything_and_ignores_supervisor_failures() {
    let harness = Harness::new();
    harness.install("1.0.0");
    harness.supervisor.fail_all.set(true);
    let mark = harness.supervisor.mark();

    let report = harness.lifecycle().uninstall().expect("uninstall must succeed");

    assert!(report.warnings.is_empty());
    assert_eq!(report.removed.len(), 4);
    assert!(!harness.layout.binary_path().exists());
    assert!(!harness.layout.unit_path().exists());
    assert!(!harness.layout.data_root().exists());
    assert!(!harness.layout.config_dir().exists());
    assert_eq!(
        harness.supervisor.calls_since(mark),
        vec!["stop", "disable", "reload"]
    );
    assert_eq!(harness.lifecycle().state(), InstallationState::NotInstalled);
}

#[test]
fn uninstall_on_clean_host_removes_nothing() {
    let harness = Harness::new();
    let report = harness.lifecycle().uninstall().expect("uninstall must succeed");
    assert!(report.removed.is_empty());
    assert!(report.warnings.is_empty());
}

#[test]
fn operation_lock_rejects_concurrent_operation() {
    let harness = Harness::new();
    let bundle = harness.bundle("1.0.0");

    with_operation_lock(&harness.layout, "upgrade", || {
        let err = harness
            .lifecycle()
            .install(&bundle)
            .expect_err("install must be refused while locked");
        assert!(
            matches!(err, LifecycleError::Locked { ref holder } if holder.contains("operation=upgrade")),
            "unexpected error: {err}"
        );
        assert_eq!(err.kind(), ErrorKind::Precondition);
        Ok(())
    })
    .expect("locked closure must run");

    assert!(!harness.layout.binary_path().exists());
    harness.install("1.0.0");
}

#[test]
fn operation_lock_is_released_on_error() {
    let harness = Harness::new();
    let err = with_operation_lock(&harness.layout, "reset", || -> LifecycleResult<()> {
        Err(LifecycleError::NotInstalled)
    })
    .expect_err("closure error must propagate");
    assert!(matches!(err, LifecycleError::NotInstalled));

    with_operation_lock(&harness.layout, "reset", || Ok(())).expect("lock must be free again");
}

#[test]
fn list_backups_skips_torn_backups() {
    let harness = Harness::new();
    harness.install("1.0.0");
    seed_backup(&harness.layout, "0.9.0", "2025-03-01T00:00:00Z");

    let no_meta = harness.layout.backup_dir("0.8.0");
    fs::create_dir_all(no_meta.join("data")).expect("must create torn backup");
    fs::write(no_meta.join("convex-backend"), "partial").expect("must write binary");

    let bad_meta = harness.layout.backup_dir("0.7.0");
    fs::create_dir_all(&bad_meta).expect("must create torn backup");
    fs::write(bad_meta.join("meta.json"), "{").expect("must write metadata");

    let missing_binary = seed_backup(&harness.layout, "0.6.0", "2025-02-01T00:00:00Z");
    fs::remove_file(missing_binary.binary_path()).expect("must remove binary");

    let versions: Vec<String> = list_backups(&harness.layout.backups_dir())
        .expect("must list backups")
        .iter()
        .map(|backup| backup.version().to_string())
        .collect();
    assert_eq!(versions, vec!["0.9.0"]);
}

#[test]
fn failed_backup_leaves_no_directory() {
    let harness = Harness::new();
    let backup_dir = harness.layout.backup_dir("1.0.0");
    let missing = harness.temp.path().join("missing");

    let err = create_backup(
        &backup_dir,
        BackupSource {
            binary: &missing.join("binary"),
            data_dir: &missing.join("data"),
            manifest: &missing.join("manifest.json"),
        },
        &BackupRequest {
            from_version: "1.0.0",
            to_version: "1.2.0",
            reason: UPGRADE_REASON,
            created_at: timestamp("2026-01-01T00:00:00Z"),
        },
    )
    .expect_err("backup of missing files must fail");
    assert!(format!("{err:#}").contains("failed to back up binary"));
    assert!(!backup_dir.exists());
    assert!(!backup_dir.with_file_name(".staging-v1.0.0").exists());
}

#[test]
fn backup_for_same_version_replaces_previous_snapshot() {
    let harness = Harness::new();
    harness.install("1.0.0");
    seed_backup(&harness.layout, "1.0.0", "2026-01-01T00:00:00Z");
    fs::write(harness.layout.data_store_path(), "db-later").expect("must update data store");

    let backup = seed_backup(&harness.layout, "1.0.0", "2026-02-01T00:00:00Z");

    assert_eq!(backup.path, harness.layout.backup_dir("1.0.0"));
    assert_eq!(read(&backup.data_dir().join("convex.db")), "db-later");
    let backups = list_backups(&harness.layout.backups_dir()).expect("must list backups");
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].metadata.timestamp, "2026-02-01T00:00:00.000Z");
    let names: Vec<_> = fs::read_dir(harness.layout.backups_dir())
        .expect("must read backups dir")
        .map(|entry| entry.expect("must read entry").file_name())
        .collect();
    assert_eq!(names, vec![std::ffi::OsString::from("v1.0.0")]);
}

#[test]
fn restore_reproduces_backed_up_tree() {
    let harness = Harness::new();
    harness.install("1.0.0");
    let layout = &harness.layout;
    fs::create_dir_all(layout.storage_dir().join("a/b")).expect("must create nested dir");
    fs::write(layout.storage_dir().join("a/b/file.bin"), [0_u8, 1, 2, 255])
        .expect("must write nested file");

    let backup = seed_backup(layout, "1.0.0", "2026-01-01T00:00:00Z");
    let manifest_before = fs::read(layout.manifest_path()).expect("must read manifest");

    fs::write(layout.binary_path(), "tampered").expect("must overwrite binary");
    fs::remove_dir_all(layout.storage_dir().join("a")).expect("must remove nested dir");
    fs::write(layout.data_dir().join("stray.tmp"), "stray").expect("must write stray file");
    fs::write(layout.manifest_path(), "{}").expect("must overwrite manifest");

    restore_backup(
        &backup,
        &layout.binary_path(),
        &layout.data_dir(),
        &layout.manifest_path(),
    )
    .expect("must restore");

    assert_eq!(read(&layout.binary_path()), "backend-1.0.0");
    assert_eq!(
        fs::read(layout.storage_dir().join("a/b/file.bin")).expect("must read nested file"),
        vec![0_u8, 1, 2, 255]
    );
    assert!(!layout.data_dir().join("stray.tmp").exists());
    assert_eq!(
        fs::read(layout.manifest_path()).expect("must read manifest"),
        manifest_before
    );
}

#[test]
fn backup_metadata_is_written_with_millisecond_timestamp() {
    let harness = Harness::new();
    harness.install("1.0.0");
    let backup = seed_backup(&harness.layout, "1.0.0", "2026-02-03T04:05:06.789Z");

    let raw = read(&backup.metadata_path());
    let metadata = BackupMetadata::from_json_str(&raw).expect("must parse metadata");
    assert_eq!(metadata.timestamp, "2026-02-03T04:05:06.789Z");
    assert_eq!(metadata.version, "1.0.0");
    assert!(raw.contains("\"fromVersion\""));
    assert!(backup.size_on_disk() > 0);
}

#[test]
fn find_backup_by_version_rejects_path_like_input() {
    let harness = Harness::new();
    harness.install("1.0.0");
    seed_backup(&harness.layout, "1.0.0", "2026-01-01T00:00:00Z");

    let backups_dir = harness.layout.backups_dir();
    assert!(find_backup_by_version(&backups_dir, "1.0.0")
        .expect("must search")
        .is_some());
    assert!(find_backup_by_version(&backups_dir, "../v1.0.0")
        .expect("must search")
        .is_none());
}

#[test]
fn list_backups_breaks_timestamp_ties_by_path() {
    let harness = Harness::new();
    harness.install("1.0.0");
    seed_backup(&harness.layout, "0.2.0", "2026-01-01T00:00:00Z");
    seed_backup(&harness.layout, "0.1.0", "2026-01-01T00:00:00Z");

    let newest = most_recent_backup(&harness.layout.backups_dir())
        .expect("must list backups")
        .expect("must have a backup");
    assert_eq!(newest.version(), "0.1.0");
}

#[test]
fn step_runner_compensates_in_reverse_order() {
    let log = RefCell::new(Vec::new());

    let failure = run_steps(vec![
        Step::new("one", || {
            log.borrow_mut().push("one");
            Ok(())
        })
        .compensate("undo one", || {
            log.borrow_mut().push("undo one");
            Ok(())
        }),
        Step::new("two", || {
            log.borrow_mut().push("two");
            Ok(())
        })
        .compensate_best_effort("undo two", || {
            log.borrow_mut().push("undo two");
            Err(LifecycleError::NoBackupsFound)
        }),
        Step::new("three", || {
            log.borrow_mut().push("three");
            Err(LifecycleError::NotInstalled)
        })
        .compensate("undo three", || {
            log.borrow_mut().push("undo three");
            Ok(())
        }),
        Step::new("four", || {
            log.borrow_mut().push("four");
            Ok(())
        }),
    ])
    .expect_err("third step must fail");

    match failure {
        StepFailure::Compensated {
            step,
            cause,
            compensations_run,
        } => {
            assert_eq!(step, "three");
            assert!(matches!(cause, LifecycleError::NotInstalled));
            assert_eq!(compensations_run, 3);
        }
        other => panic!("unexpected failure: {other:?}"),
    }
    assert_eq!(
        log.into_inner(),
        vec!["one", "two", "three", "undo three", "undo two", "undo one"]
    );
}

#[test]
fn step_runner_stops_compensating_on_required_failure() {
    let log = RefCell::new(Vec::new());

    let failure = run_steps(vec![
        Step::new("one", || Ok(())).compensate("undo one", || {
            log.borrow_mut().push("undo one");
            Ok(())
        }),
        Step::new("two", || Ok(())).compensate("undo two", || {
            log.borrow_mut().push("undo two");
            Err(LifecycleError::resource("undo two", anyhow!("disk full")))
        }),
        Step::new("three", || Err(LifecycleError::NotInstalled)),
    ])
    .expect_err("third step must fail");

    let err = failure.into_cause();
    match &err {
        LifecycleError::DoubleFailure {
            step,
            rollback_step,
            ..
        } => {
            assert_eq!(step, "three");
            assert_eq!(rollback_step, "undo two");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(log.into_inner(), vec!["undo two"]);
}

#[test]
fn wrapped_step_names_the_failed_step() {
    let failure = run_steps(vec![Step::wrapped("copy backend binary", || {
        Err(anyhow!("no space left on device"))
    })])
    .expect_err("step must fail");

    let err = failure.into_cause();
    assert_eq!(
        err.to_string(),
        "failed to copy backend binary: no space left on device"
    );
    assert_eq!(err.kind(), ErrorKind::Resource);
}

#[test]
fn health_gate_polls_until_healthy() {
    let probe = FakeProbe::default();
    probe.healthy_from.set(Some(3));
    let gate = HealthGate {
        budget: Duration::from_secs(5),
        interval: Duration::from_millis(1),
    };

    let attempts = gate
        .wait_healthy(&probe, DEFAULT_HEALTH_URL)
        .expect("must become healthy");
    assert_eq!(attempts, 3);
}

#[test]
fn health_gate_times_out() {
    let probe = FakeProbe::default();
    let gate = HealthGate {
        budget: Duration::from_millis(20),
        interval: Duration::from_millis(5),
    };

    let err = gate
        .wait_healthy(&probe, DEFAULT_HEALTH_URL)
        .expect_err("must time out");
    assert!(
        matches!(err, LifecycleError::HealthTimeout { ref url, .. } if url == DEFAULT_HEALTH_URL)
    );
    assert!(probe.probes.get() >= 2);
}

#[test]
fn http_probe_accepts_only_ok_status() {
    use reqwest::StatusCode;

    assert!(health::is_healthy_status(StatusCode::OK));
    assert!(!health::is_healthy_status(StatusCode::NO_CONTENT));
    assert!(!health::is_healthy_status(StatusCode::ACCEPTED));
    assert!(!health::is_healthy_status(StatusCode::SERVICE_UNAVAILABLE));
}

#[test]
fn status_reports_state_and_probe() {
    let harness = Harness::new();
    let status = harness.lifecycle().status();
    assert_eq!(status.state, InstallationState::NotInstalled);
    assert!(status.healthy);

    harness.install("1.0.0");
    harness.set_unhealthy();
    let status = harness.lifecycle().status();
    assert_eq!(status.state.as_str(), "installed");
    assert_eq!(status.service_state, "active");
    assert!(!status.healthy);
    assert_eq!(status.backend_url, DEFAULT_HEALTH_URL);
}

#[test]
fn layout_paths_resolve_under_root() {
    let layout = InstallLayout::new("/srv/host");
    assert_eq!(
        layout.binary_path(),
        PathBuf::from("/srv/host/usr/local/bin/convex-backend")
    );
    assert_eq!(
        layout.manifest_path(),
        PathBuf::from("/srv/host/var/lib/convex/manifest.json")
    );
    assert_eq!(
        layout.backup_dir("1.0.0"),
        PathBuf::from("/srv/host/var/lib/convex/backups/v1.0.0")
    );
    assert_eq!(
        layout.unit_path(),
        PathBuf::from("/srv/host/etc/systemd/system/convex-backend.service")
    );
    assert!(!layout.lock_path().starts_with(layout.data_root()));
}

#[test]
fn settings_parse_toml_overrides() {
    let settings = OpsSettings::from_toml_str(
        "health_url = \"http://127.0.0.1:4000/\"\nhealth_timeout_secs = 60\nbackup_retention = 5\n",
    )
    .expect("must parse settings");
    assert_eq!(settings.health_url, "http://127.0.0.1:4000");
    assert_eq!(settings.health_budget, Duration::from_secs(60));
    assert_eq!(settings.backup_retention, 5);
    assert_eq!(settings.health_interval, Duration::from_secs(1));
    assert!(settings.require_root);
}

#[test]
fn settings_reject_unknown_keys_and_bad_urls() {
    assert!(OpsSettings::from_toml_str("retention = 2\n").is_err());
    assert!(OpsSettings::from_toml_str("health_url = \"localhost:3210\"\n").is_err());
}

#[test]
fn retention_env_override_ignores_non_positive_values() {
    let mut settings = OpsSettings::default();
    settings.apply_env_overrides(|key| (key == RETENTION_ENV).then(|| "0".to_string()));
    assert_eq!(settings.backup_retention, DEFAULT_BACKUP_RETENTION);

    settings.apply_env_overrides(|key| (key == RETENTION_ENV).then(|| "7".to_string()));
    assert_eq!(settings.backup_retention, 7);

    assert_eq!(parse_retention("-1"), None);
    assert_eq!(parse_retention("abc"), None);
    assert_eq!(parse_retention(" 2 "), Some(2));
}

#[test]
fn rolled_back_error_takes_kind_of_cause() {
    let err = LifecycleError::RolledBack {
        step: "start service".to_string(),
        restored_version: "1.0.0".to_string(),
        cause: Box::new(LifecycleError::resource(
            "start service",
            anyhow!("unit failed to start"),
        )),
    };
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert_eq!(
        err.to_string(),
        "upgrade failed at step 'start service', rolled back to v1.0.0: failed to start service: unit failed to start"
    );
}

#[test]
fn manifest_store_reads_installed_manifest() {
    let harness = Harness::new();
    let path = harness.layout.manifest_path();
    assert!(read_manifest(&path).expect("must read").is_none());

    let manifest = InstallationManifest {
        name: "acme-backend".to_string(),
        version: "1.0.0".to_string(),
        apps: Vec::new(),
        platform: String::new(),
        created_at: String::new(),
    };
    let source = harness.temp.path().join("manifest.json");
    fs::write(&source, manifest.to_json_string().expect("must serialize"))
        .expect("must write manifest source");
    let installed = install_manifest_file(&source, &path).expect("must install manifest");
    assert_eq!(installed, manifest);

    assert_eq!(read_manifest(&path).expect("must read"), Some(manifest.clone()));
    assert_eq!(
        InstallationState::derive(&harness.layout),
        InstallationState::Installed(manifest)
    );
}
