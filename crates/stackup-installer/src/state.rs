use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stackup_core::{unix_now, validate_identifier, write_json_atomic, RunMode, UpgradeError};
use tracing::{debug, info};

use crate::{LockManager, StateLayout};

const STATE_LOCK: &str = "state";
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Idle | Completed | Failed | RolledBack, InProgress)
                | (InProgress, Completed | Failed | RolledBack)
                | (Completed | Failed, RolledBack)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl ComponentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// `in_progress -> pending` resets an interrupted component for resume;
    /// `failed -> pending` allows a resumed run to re-attempt it.
    pub fn can_transition_to(self, next: ComponentStatus) -> bool {
        use ComponentStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress | Skipped)
                | (InProgress, Completed | Failed | Skipped | Pending)
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub status: ComponentStatus,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Transaction id whose retained backups can undo this upgrade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reverted: bool,
    #[serde(default)]
    pub updated_at: u64,
}

/// What a run was asked to upgrade. Persisted so a resumed run covers the
/// same components as the one that was interrupted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunScope {
    #[default]
    All,
    Phase(String),
    Component { name: String, force: bool },
}

impl fmt::Display for RunScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Phase(name) => write!(f, "phase {name}"),
            Self::Component { name, force: false } => write!(f, "component {name}"),
            Self::Component { name, force: true } => write!(f, "component {name} (force)"),
        }
    }
}

/// Fields to merge into a component record alongside a status change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentUpdate {
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub phase: Option<String>,
    pub backup_ref: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub mode: RunMode,
    pub started_at: u64,
    #[serde(default)]
    pub finished_at: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentRecord>,
}

/// The persisted state document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub run_id: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub mode: Option<RunMode>,
    #[serde(default)]
    pub scope: RunScope,
    #[serde(default)]
    pub started_at: Option<u64>,
    #[serde(default)]
    pub finished_at: Option<u64>,
    #[serde(default)]
    pub current_phase: Option<String>,
    #[serde(default)]
    pub current_component: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentRecord>,
    #[serde(default)]
    pub history: Vec<RunSummary>,
    #[serde(default)]
    pub updated_at: u64,
}

impl StateDocument {
    pub fn current_run(&self) -> Option<RunSummary> {
        let run_id = self.run_id.clone()?;
        Some(RunSummary {
            run_id,
            status: self.status,
            mode: self.mode.unwrap_or_default(),
            started_at: self.started_at.unwrap_or_default(),
            finished_at: self.finished_at,
            error: self.error.clone(),
            components: self.components.clone(),
        })
    }

    pub fn component(&self, name: &str) -> Option<&ComponentRecord> {
        self.components.get(name)
    }

    pub fn component_status(&self, name: &str) -> ComponentStatus {
        self.component(name)
            .map(|record| record.status)
            .unwrap_or_default()
    }

    /// Completed components of the current run, most recent first.
    pub fn completed_newest_first(&self) -> Vec<(&str, &ComponentRecord)> {
        let mut completed: Vec<_> = self
            .components
            .iter()
            .filter(|(_, record)| record.status == ComponentStatus::Completed && !record.reverted)
            .map(|(name, record)| (name.as_str(), record))
            .collect();
        completed.sort_by(|left, right| right.1.completed_seq.cmp(&left.1.completed_seq));
        completed
    }
}

/// Single source of truth for upgrade progress.
///
/// Every mutation takes the `state` lock, re-reads the document, checks it
/// against the revision this store last saw, validates the transition and
/// replaces the file atomically.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    locks: LockManager,
    history_limit: usize,
    observed_revision: Mutex<Option<u64>>,
}

impl StateStore {
    pub fn new(layout: &StateLayout, locks: LockManager) -> Self {
        Self {
            path: layout.state_path(),
            locks,
            history_limit: DEFAULT_HISTORY_LIMIT,
            observed_revision: Mutex::new(None),
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Reads the document without taking the lock; a missing file is an idle
    /// store.
    pub fn load(&self) -> Result<StateDocument> {
        let document = self.read()?;
        *self.observed_revision.lock() = Some(document.revision);
        Ok(document)
    }

    pub fn begin_run(&self, mode: RunMode, scope: RunScope) -> Result<String> {
        self.mutate(|document, now| {
            transition_run(document, RunStatus::InProgress)?;
            if let Some(previous) = document.current_run() {
                document.history.push(previous);
            }
            let run_id = format!("run-{now}-{}", document.revision + 1);
            document.run_id = Some(run_id.clone());
            document.mode = Some(mode);
            info!(run_id = %run_id, mode = mode.as_str(), scope = %scope, "run started");
            document.scope = scope;
            document.started_at = Some(now);
            document.finished_at = None;
            document.current_phase = None;
            document.current_component = None;
            document.error = None;
            document.components.clear();
            Ok(run_id)
        })
    }

    pub fn set_phase(&self, phase: Option<&str>) -> Result<()> {
        if let Some(phase) = phase {
            validate_identifier("phase name", phase)?;
        }
        self.mutate(|document, _| {
            require_in_progress(document, "set phase")?;
            document.current_phase = phase.map(str::to_string);
            Ok(())
        })
    }

    pub fn set_component_status(
        &self,
        component: &str,
        status: ComponentStatus,
        update: ComponentUpdate,
    ) -> Result<()> {
        validate_identifier("component name", component)?;
        self.mutate(|document, now| {
            require_in_progress(document, "update component")?;
            let next_seq = document
                .components
                .values()
                .filter_map(|record| record.completed_seq)
                .max()
                .unwrap_or(0)
                + 1;
            let record = document.components.entry(component.to_string()).or_default();
            if record.status != status && !record.status.can_transition_to(status) {
                return Err(UpgradeError::StateIntegrity(format!(
                    "component '{component}' cannot move from {} to {}",
                    record.status.as_str(),
                    status.as_str()
                ))
                .into());
            }
            record.status = status;
            if let Some(from) = update.from_version {
                record.from_version = Some(from);
            }
            if let Some(to) = update.to_version {
                record.to_version = Some(to);
            }
            if let Some(phase) = update.phase {
                record.phase = Some(phase);
            }
            if let Some(backup_ref) = update.backup_ref {
                record.backup_ref = Some(backup_ref);
            }
            record.error = update.error;
            match status {
                ComponentStatus::Completed => record.completed_seq = Some(next_seq),
                ComponentStatus::Pending | ComponentStatus::InProgress => {
                    record.completed_seq = None
                }
                _ => {}
            }
            record.updated_at = now;
            document.current_component = match status {
                ComponentStatus::InProgress => Some(component.to_string()),
                _ if document.current_component.as_deref() == Some(component) => None,
                _ => document.current_component.take(),
            };
            debug!(component, status = status.as_str(), "component status updated");
            Ok(())
        })
    }

    pub fn mark_reverted(&self, component: &str) -> Result<()> {
        validate_identifier("component name", component)?;
        self.mutate(|document, now| {
            let record = document.components.get_mut(component).ok_or_else(|| {
                UpgradeError::StateIntegrity(format!("component '{component}' is not part of the run"))
            })?;
            record.reverted = true;
            record.updated_at = now;
            Ok(())
        })
    }

    /// Durable progress marker; returns the new revision.
    pub fn checkpoint(&self) -> Result<u64> {
        self.mutate(|document, _| {
            require_in_progress(document, "checkpoint")?;
            Ok(document.revision + 1)
        })
    }

    pub fn complete_run(&self) -> Result<()> {
        self.finish_run(RunStatus::Completed, None)
    }

    pub fn fail_run(&self, error: &str) -> Result<()> {
        self.finish_run(RunStatus::Failed, Some(error))
    }

    pub fn rollback_run(&self, reason: &str) -> Result<()> {
        self.finish_run(RunStatus::RolledBack, Some(reason))
    }

    pub fn load_last_run(&self) -> Result<Option<RunSummary>> {
        Ok(self.load()?.current_run())
    }

    /// Finished runs, oldest first, excluding the current one.
    pub fn history(&self) -> Result<Vec<RunSummary>> {
        Ok(self.load()?.history)
    }

    fn finish_run(&self, status: RunStatus, error: Option<&str>) -> Result<()> {
        self.mutate(|document, now| {
            transition_run(document, status)?;
            document.finished_at = Some(now);
            document.current_component = None;
            if error.is_some() {
                document.error = error.map(str::to_string);
            }
            info!(
                run_id = document.run_id.as_deref().unwrap_or_default(),
                status = status.as_str(),
                "run finished"
            );
            Ok(())
        })
    }

    fn mutate<T>(&self, apply: impl FnOnce(&mut StateDocument, u64) -> Result<T>) -> Result<T> {
        let _guard = self.locks.acquire(STATE_LOCK)?;
        let mut document = self.read()?;

        let mut observed = self.observed_revision.lock();
        if let Some(expected) = *observed {
            if document.revision != expected {
                return Err(UpgradeError::StateIntegrity(format!(
                    "state document changed underneath this process (revision {} on disk, {} expected)",
                    document.revision, expected
                ))
                .into());
            }
        }

        let now = unix_now();
        let value = apply(&mut document, now)?;
        document.revision += 1;
        document.updated_at = now;
        if document.history.len() > self.history_limit {
            let excess = document.history.len() - self.history_limit;
            document.history.drain(..excess);
        }
        write_json_atomic(&self.path, &document)
            .with_context(|| format!("failed to write state document: {}", self.path.display()))?;
        *observed = Some(document.revision);
        Ok(value)
    }

    fn read(&self) -> Result<StateDocument> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(StateDocument::default());
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read state document: {}", self.path.display())
                });
            }
        };
        serde_json::from_str(&raw).map_err(|err| {
            UpgradeError::StateIntegrity(format!(
                "state document {} is corrupt: {err}",
                self.path.display()
            ))
            .into()
        })
    }
}

fn transition_run(document: &mut StateDocument, next: RunStatus) -> Result<()> {
    if !document.status.can_transition_to(next) {
        return Err(UpgradeError::StateIntegrity(format!(
            "run cannot move from {} to {}",
            document.status.as_str(),
            next.as_str()
        ))
        .into());
    }
    document.status = next;
    Ok(())
}

fn require_in_progress(document: &StateDocument, action: &str) -> Result<()> {
    if document.status != RunStatus::InProgress {
        return Err(UpgradeError::StateIntegrity(format!(
            "cannot {action} while run is {}",
            document.status.as_str()
        ))
        .into());
    }
    Ok(())
}
