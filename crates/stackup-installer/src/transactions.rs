use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use stackup_core::{unix_now, validate_identifier, write_json_atomic, UpgradeError};
use tracing::{debug, info, warn};

use crate::fs_utils::{remove_dir_all_if_exists, remove_file_if_exists, replace_file_from, sha256_file};
use crate::lock::process_alive;
use crate::{ServiceAction, ServiceManager, ServiceSnapshot, StateLayout};

const TRANSACTION_FORMAT_VERSION: u32 = 1;

static TXID_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOpKind {
    Create,
    Modify,
    Delete,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Applying,
    Committed,
    RollingBack,
    RolledBack,
    PartiallyRolledBack,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applying => "applying",
            Self::Committed => "committed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::PartiallyRolledBack => "partially_rolled_back",
        }
    }

    fn is_open(self) -> bool {
        matches!(self, Self::Applying | Self::RollingBack)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalOp {
    File {
        kind: FileOpKind,
        path: PathBuf,
        /// Pre-image copy; `None` when the path did not exist beforehand.
        backup: Option<PathBuf>,
        sha256: Option<String>,
    },
    Service {
        action: ServiceAction,
        service: String,
        prior: ServiceSnapshot,
    },
    Hook {
        name: String,
        index: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub recorded_at_unix: u64,
    #[serde(flatten)]
    pub op: JournalOp,
}

/// Persisted form of one transaction. Rewritten atomically on every append;
/// on commit it moves into the backup directory as `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub version: u32,
    pub txid: String,
    pub component: String,
    #[serde(default)]
    pub run_id: Option<String>,
    pub status: TransactionStatus,
    pub owner_pid: u32,
    pub started_at_unix: u64,
    #[serde(default)]
    pub finished_at_unix: Option<u64>,
    #[serde(default)]
    pub from_version: Option<String>,
    #[serde(default)]
    pub to_version: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub entries: Vec<JournalEntry>,
}

#[derive(Debug, Clone)]
pub struct RollbackContext {
    pub txid: String,
    pub component: String,
    pub reason: String,
}

/// Custom reversal step registered by the caller. Runs during rollback in
/// reverse registration order, interleaved with the journal by position.
pub trait RollbackHook: Send {
    fn name(&self) -> &str;

    fn run(&self, context: &RollbackContext) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub txid: String,
    pub component: String,
    pub reason: String,
    pub reverted: usize,
    pub failures: Vec<String>,
}

impl RollbackReport {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TransactionManager {
    layout: StateLayout,
    retention: Duration,
}

impl TransactionManager {
    pub fn new(layout: StateLayout, retention: Duration) -> Self {
        Self { layout, retention }
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn begin(&self, component: &str, run_id: Option<&str>) -> Result<Transaction<'_>> {
        validate_identifier("component name", component)?;
        let started_at_unix = unix_now();
        let txid = format!(
            "tx-{started_at_unix}-{}-{}",
            std::process::id(),
            TXID_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let record = TransactionRecord {
            version: TRANSACTION_FORMAT_VERSION,
            txid,
            component: component.to_string(),
            run_id: run_id.map(str::to_string),
            status: TransactionStatus::Applying,
            owner_pid: std::process::id(),
            started_at_unix,
            finished_at_unix: None,
            from_version: None,
            to_version: None,
            reason: None,
            entries: Vec::new(),
        };
        let transaction = Transaction {
            manager: self,
            record,
            hooks: Vec::new(),
        };
        transaction.persist()?;
        debug!(component, txid = %transaction.record.txid, "transaction started");
        Ok(transaction)
    }

    pub fn read_record(&self, txid: &str) -> Result<Option<TransactionRecord>> {
        read_record_file(&self.layout.transaction_path(txid))
    }

    /// Transactions left `applying` or `rolling_back` by a dead process, or
    /// abandoned by this one. Callers hold the orchestrator lock, so no open
    /// transaction can belong to a live peer.
    pub fn interrupted(&self) -> Result<Vec<TransactionRecord>> {
        let mut interrupted = Vec::new();
        for path in json_files(&self.layout.transactions_dir())? {
            let Some(record) = read_record_file(&path)? else {
                continue;
            };
            let abandoned =
                record.owner_pid == std::process::id() || !process_alive(record.owner_pid);
            if record.status.is_open() && abandoned {
                interrupted.push(record);
            }
        }
        interrupted.sort_by_key(|record| record.started_at_unix);
        Ok(interrupted)
    }

    /// Rolls back every interrupted transaction from its persisted journal.
    /// `rehydrate` supplies hooks for a record; journal hooks are matched by
    /// name, and any it cannot supply are reported as partial rollbacks.
    pub fn recover_interrupted<F>(
        &self,
        services: &dyn ServiceManager,
        rehydrate: F,
    ) -> Result<Vec<RollbackReport>>
    where
        F: Fn(&TransactionRecord) -> Vec<Box<dyn RollbackHook>>,
    {
        let mut reports = Vec::new();
        for record in self.interrupted()? {
            warn!(
                txid = %record.txid,
                component = %record.component,
                status = record.status.as_str(),
                "recovering interrupted transaction"
            );
            let hooks = rehydrate(&record);
            let transaction = Transaction {
                manager: self,
                record,
                hooks,
            };
            reports.push(transaction.rollback("recovering interrupted transaction", services));
        }
        Ok(reports)
    }

    pub fn committed_manifest(&self, component: &str, txid: &str) -> Result<Option<TransactionRecord>> {
        validate_identifier("component name", component)?;
        validate_identifier("transaction id", txid)?;
        read_record_file(&self.layout.backup_manifest_path(component, txid))
    }

    /// Reverts a committed transaction from its retained manifest, restoring
    /// pre-images and prior service state exactly as a live rollback would.
    pub fn revert_committed(
        &self,
        component: &str,
        txid: &str,
        reason: &str,
        services: &dyn ServiceManager,
        hooks: Vec<Box<dyn RollbackHook>>,
    ) -> Result<RollbackReport> {
        let mut record = self.committed_manifest(component, txid)?.ok_or_else(|| {
            anyhow!("no retained backup manifest for {component} transaction {txid}")
        })?;
        if record.status != TransactionStatus::Committed {
            return Err(UpgradeError::StateIntegrity(format!(
                "manifest for {txid} has status {}, expected committed",
                record.status.as_str()
            ))
            .into());
        }
        record.status = TransactionStatus::RollingBack;
        let manifest_path = self.layout.backup_manifest_path(component, txid);
        write_json_atomic(&manifest_path, &record)?;

        let context = RollbackContext {
            txid: record.txid.clone(),
            component: record.component.clone(),
            reason: reason.to_string(),
        };
        let (reverted, failures) = replay_reverse(&record.entries, &hooks, &context, services);
        record.status = if failures.is_empty() {
            TransactionStatus::RolledBack
        } else {
            TransactionStatus::PartiallyRolledBack
        };
        record.reason = Some(reason.to_string());
        record.finished_at_unix = Some(unix_now());
        write_json_atomic(&manifest_path, &record)?;
        Ok(RollbackReport {
            txid: record.txid,
            component: record.component,
            reason: reason.to_string(),
            reverted,
            failures,
        })
    }

    /// Deletes committed backups and finished transaction records older than
    /// the retention window. Returns how many were removed.
    pub fn prune_expired(&self, now_unix: u64) -> Result<usize> {
        let horizon = now_unix.saturating_sub(self.retention.as_secs());
        let mut removed = 0;

        let backups_dir = self.layout.backups_dir();
        for component_dir in subdirectories(&backups_dir)? {
            for tx_dir in subdirectories(&component_dir)? {
                let manifest = read_record_file(&tx_dir.join("manifest.json"))?;
                let finished = manifest
                    .as_ref()
                    .and_then(|record| record.finished_at_unix)
                    .unwrap_or(0);
                let expired = match &manifest {
                    Some(record) => !record.status.is_open() && finished < horizon,
                    None => modified_unix(&tx_dir).is_some_and(|at| at < horizon),
                };
                if expired {
                    remove_dir_all_if_exists(&tx_dir)
                        .with_context(|| format!("failed to prune {}", tx_dir.display()))?;
                    removed += 1;
                }
            }
        }

        for path in json_files(&self.layout.transactions_dir())? {
            let Some(record) = read_record_file(&path)? else {
                continue;
            };
            if !record.status.is_open()
                && record.finished_at_unix.is_some_and(|finished| finished < horizon)
            {
                remove_file_if_exists(&path)
                    .with_context(|| format!("failed to prune {}", path.display()))?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, retention_days = self.retention.as_secs() / 86_400, "pruned expired backups");
        }
        Ok(removed)
    }
}

/// One component upgrade's reversible log. Dropping it without `commit` or
/// `rollback` leaves it `applying` on disk for crash recovery.
pub struct Transaction<'a> {
    manager: &'a TransactionManager,
    record: TransactionRecord,
    hooks: Vec<Box<dyn RollbackHook>>,
}

impl<'a> Transaction<'a> {
    pub fn txid(&self) -> &str {
        &self.record.txid
    }

    pub fn component(&self) -> &str {
        &self.record.component
    }

    pub fn record(&self) -> &TransactionRecord {
        &self.record
    }

    pub fn set_versions(&mut self, from: Option<&str>, to: &str) -> Result<()> {
        self.record.from_version = from.map(str::to_string);
        self.record.to_version = Some(to.to_string());
        self.persist()
    }

    /// Must be called before the file is touched. Existing files are copied
    /// to the backup directory with their digest first.
    pub fn record_file_op(&mut self, kind: FileOpKind, path: &Path) -> Result<()> {
        if !path.is_absolute() {
            return Err(UpgradeError::validation(
                "managed path",
                format!("'{}' must be absolute", path.display()),
            )
            .into());
        }
        let seq = self.next_seq();
        let (backup, sha256) = match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_file() => {
                let backup_dir = self
                    .manager
                    .layout
                    .transaction_backup_dir(&self.record.component, &self.record.txid);
                fs::create_dir_all(&backup_dir)
                    .with_context(|| format!("failed to create {}", backup_dir.display()))?;
                let file_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "file".to_string());
                let backup = backup_dir.join(format!("{seq:04}-{file_name}"));
                fs::copy(path, &backup).with_context(|| {
                    format!("failed to back up {} to {}", path.display(), backup.display())
                })?;
                let digest = sha256_file(&backup)?;
                (Some(backup), Some(digest))
            }
            Ok(_) => {
                return Err(anyhow!(
                    "{} is not a regular file; only regular files can be tracked",
                    path.display()
                ));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if kind != FileOpKind::Create {
                    debug!(path = %path.display(), kind = ?kind, "tracked path does not exist yet");
                }
                (None, None)
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to inspect {}", path.display()));
            }
        };
        self.append(JournalOp::File {
            kind,
            path: path.to_path_buf(),
            backup,
            sha256,
        })
    }

    /// Must be called before the service is touched; captures its current
    /// running and enabled state.
    pub fn record_service_op(
        &mut self,
        action: ServiceAction,
        service: &str,
        services: &dyn ServiceManager,
    ) -> Result<()> {
        validate_identifier("service", service)?;
        let prior = services
            .status(service)
            .with_context(|| format!("failed to capture state of service {service}"))?;
        self.append(JournalOp::Service {
            action,
            service: service.to_string(),
            prior,
        })
    }

    pub fn register_rollback_hook(&mut self, hook: Box<dyn RollbackHook>) -> Result<()> {
        let name = hook.name().to_string();
        let index = self.hooks.len();
        self.hooks.push(hook);
        self.append(JournalOp::Hook { name, index })
    }

    /// Discards the live log and keeps the backups plus a manifest for the
    /// retention window.
    pub fn commit(mut self) -> Result<()> {
        self.record.status = TransactionStatus::Committed;
        self.record.finished_at_unix = Some(unix_now());
        let manifest = self
            .manager
            .layout
            .backup_manifest_path(&self.record.component, &self.record.txid);
        write_json_atomic(&manifest, &self.record)
            .with_context(|| format!("failed to write backup manifest: {}", manifest.display()))?;
        let path = self.manager.layout.transaction_path(&self.record.txid);
        remove_file_if_exists(&path)
            .with_context(|| format!("failed to discard transaction log: {}", path.display()))?;
        info!(
            component = %self.record.component,
            txid = %self.record.txid,
            entries = self.record.entries.len(),
            "transaction committed"
        );
        Ok(())
    }

    /// Replays the log in strict reverse order. Individual failures are
    /// collected into the report and never stop the remaining reversal.
    pub fn rollback(mut self, reason: &str, services: &dyn ServiceManager) -> RollbackReport {
        self.record.status = TransactionStatus::RollingBack;
        self.record.reason = Some(reason.to_string());
        let mut failures = Vec::new();
        if let Err(err) = self.persist() {
            failures.push(format!("failed to mark rolling_back: {err:#}"));
        }

        let context = RollbackContext {
            txid: self.record.txid.clone(),
            component: self.record.component.clone(),
            reason: reason.to_string(),
        };
        let (reverted, replay_failures) =
            replay_reverse(&self.record.entries, &self.hooks, &context, services);
        failures.extend(replay_failures);

        self.record.status = if failures.is_empty() {
            TransactionStatus::RolledBack
        } else {
            TransactionStatus::PartiallyRolledBack
        };
        self.record.finished_at_unix = Some(unix_now());
        if let Err(err) = self.persist() {
            failures.push(format!("failed to record rollback outcome: {err:#}"));
        }
        if failures.is_empty() {
            let backup_dir = self
                .manager
                .layout
                .transaction_backup_dir(&self.record.component, &self.record.txid);
            if let Err(err) = remove_dir_all_if_exists(&backup_dir) {
                warn!(path = %backup_dir.display(), error = %err, "failed to remove rolled back backups");
            }
            info!(
                component = %self.record.component,
                txid = %self.record.txid,
                reverted,
                reason,
                "transaction rolled back"
            );
        } else {
            warn!(
                component = %self.record.component,
                txid = %self.record.txid,
                failures = failures.len(),
                reason,
                "partial rollback"
            );
        }

        RollbackReport {
            txid: self.record.txid.clone(),
            component: self.record.component.clone(),
            reason: reason.to_string(),
            reverted,
            failures,
        }
    }

    fn next_seq(&self) -> u64 {
        self.record
            .entries
            .last()
            .map(|entry| entry.seq + 1)
            .unwrap_or(1)
    }

    fn append(&mut self, op: JournalOp) -> Result<()> {
        let entry = JournalEntry {
            seq: self.next_seq(),
            recorded_at_unix: unix_now(),
            op,
        };
        self.record.entries.push(entry);
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let path = self.manager.layout.transaction_path(&self.record.txid);
        write_json_atomic(&path, &self.record)
            .with_context(|| format!("failed to write transaction log: {}", path.display()))
    }
}

fn replay_reverse(
    entries: &[JournalEntry],
    hooks: &[Box<dyn RollbackHook>],
    context: &RollbackContext,
    services: &dyn ServiceManager,
) -> (usize, Vec<String>) {
    let mut reverted = 0;
    let mut failures = Vec::new();
    let mut ordered: Vec<&JournalEntry> = entries.iter().collect();
    ordered.sort_by(|left, right| right.seq.cmp(&left.seq));

    for entry in ordered {
        let result = match &entry.op {
            JournalOp::File {
                path,
                backup,
                sha256,
                ..
            } => revert_file(path, backup.as_deref(), sha256.as_deref()),
            JournalOp::Service { service, prior, .. } => services
                .restore(service, *prior)
                .with_context(|| format!("failed to restore service {service}")),
            JournalOp::Hook { name, index } => match find_hook(hooks, name, *index) {
                Some(hook) => hook
                    .run(context)
                    .with_context(|| format!("rollback hook '{name}' failed")),
                None => Err(anyhow!(
                    "rollback hook '{name}' is not available in this process"
                )),
            },
        };
        match result {
            Ok(()) => reverted += 1,
            Err(err) => {
                warn!(seq = entry.seq, txid = %context.txid, error = %format!("{err:#}"), "rollback step failed");
                failures.push(format!("step {}: {err:#}", entry.seq));
            }
        }
    }
    (reverted, failures)
}

/// Live transactions hold hooks by registration index; rehydrated ones are
/// matched by name.
fn find_hook<'h>(
    hooks: &'h [Box<dyn RollbackHook>],
    name: &str,
    index: usize,
) -> Option<&'h dyn RollbackHook> {
    hooks
        .get(index)
        .filter(|hook| hook.name() == name)
        .or_else(|| hooks.iter().find(|hook| hook.name() == name))
        .map(|hook| hook.as_ref())
}

fn revert_file(path: &Path, backup: Option<&Path>, sha256: Option<&str>) -> Result<()> {
    match backup {
        Some(backup) => {
            if let Some(expected) = sha256 {
                let actual = sha256_file(backup)?;
                if actual != expected {
                    return Err(anyhow!(
                        "backup {} failed integrity check (expected {expected}, found {actual})",
                        backup.display()
                    ));
                }
            }
            replace_file_from(backup, path)
        }
        None => remove_file_if_exists(path)
            .with_context(|| format!("failed to remove created file {}", path.display())),
    }
}

fn read_record_file(path: &Path) -> Result<Option<TransactionRecord>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let record = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing transaction record: {}", path.display()))?;
    Ok(Some(record))
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", dir.display())),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", dir.display()))?
            .path();
        let visible = path
            .file_name()
            .is_some_and(|name| !name.to_string_lossy().starts_with('.'));
        if visible && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", dir.display())),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        if entry.file_type().is_ok_and(|kind| kind.is_dir()) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn modified_unix(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).and_then(|meta| meta.modified()).ok()?;
    modified
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|elapsed| elapsed.as_secs())
}
