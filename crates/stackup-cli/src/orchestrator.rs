use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use semver::Version;
use stackup_core::{
    unix_now, validate_identifier, ComponentConfig, ConfigBundle, ExitCode, FailurePolicy,
    PhaseConfig, RunMode, Settings, UpgradeError,
};
use stackup_installer::{
    ComponentInstaller, ComponentStatus, ComponentUpdate, FileOpKind, HealthStatus, LockManager,
    RollbackContext, RollbackHook, RunScope, RunStatus, ServiceAction, ServiceManager,
    StateDocument, StateLayout, StateStore, Transaction, TransactionManager, TransactionRecord,
};
use stackup_resolver::{ResolutionOrigin, VersionResolver};
use stackup_retry::{classify_io_error, AttemptError, ErrorClass, Resilience, RetryPolicy};
use tracing::{debug, info, warn};

pub(crate) const ORCHESTRATOR_LOCK: &str = "orchestrator";
const REINSTALL_HOOK: &str = "reinstall-previous";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunRequest {
    pub(crate) selection: RunScope,
    pub(crate) mode: RunMode,
    /// Only continue an interrupted run, with the scope it was started with;
    /// `selection` is ignored.
    pub(crate) resume_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Dry run: an upgrade would be applied.
    Planned {
        from: Option<String>,
        to: String,
        origin: ResolutionOrigin,
    },
    /// Dry run: installed version already matches.
    Satisfied { version: String },
    Skipped { version: String },
    /// Resumed run: the component already reached a terminal status.
    Settled { status: ComponentStatus },
    Upgraded {
        from: Option<String>,
        to: String,
        txid: String,
    },
    Failed { error: String, partial_rollback: bool },
    NotReached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ComponentReport {
    pub(crate) phase: String,
    pub(crate) component: String,
    pub(crate) outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunReport {
    pub(crate) run_id: Option<String>,
    pub(crate) mode: RunMode,
    pub(crate) resumed: bool,
    pub(crate) aborted: bool,
    pub(crate) components: Vec<ComponentReport>,
}

impl RunReport {
    fn new(run_id: Option<String>, mode: RunMode, resumed: bool) -> Self {
        Self {
            run_id,
            mode,
            resumed,
            aborted: false,
            components: Vec::new(),
        }
    }

    pub(crate) fn failed(&self) -> usize {
        self.components
            .iter()
            .filter(|report| matches!(report.outcome, Outcome::Failed { .. }))
            .count()
    }

    pub(crate) fn changed(&self) -> usize {
        self.components
            .iter()
            .filter(|report| {
                matches!(
                    report.outcome,
                    Outcome::Upgraded { .. } | Outcome::Planned { .. }
                )
            })
            .count()
    }

    /// Any failure is 1; a run that changed nothing is the no-op signal 2.
    pub(crate) fn exit_code(&self) -> ExitCode {
        if self.failed() > 0 || self.aborted {
            ExitCode::Failure
        } else if self.changed() == 0 {
            ExitCode::NoOp
        } else {
            ExitCode::Success
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunRollback {
    pub(crate) run_id: Option<String>,
    pub(crate) reverted: Vec<String>,
    pub(crate) failures: Vec<String>,
}

impl RunRollback {
    pub(crate) fn exit_code(&self) -> ExitCode {
        if !self.failures.is_empty() {
            ExitCode::Failure
        } else if self.run_id.is_none() {
            ExitCode::NoOp
        } else {
            ExitCode::Success
        }
    }
}

/// Progress callbacks; every method defaults to doing nothing.
pub(crate) trait RunObserver {
    fn planned(&mut self, _total: usize) {}

    fn phase_started(&mut self, _phase: &PhaseConfig) {}

    fn component_finished(&mut self, _report: &ComponentReport) {}
}

pub(crate) struct SilentObserver;

impl RunObserver for SilentObserver {}

/// Retry budgets for one run, scaled by mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Budgets {
    pub(crate) service: RetryPolicy,
    pub(crate) install: RetryPolicy,
    pub(crate) health: RetryPolicy,
}

impl Budgets {
    pub(crate) fn for_mode(mode: RunMode, settings: &Settings) -> Self {
        let scale = |value: u32| match mode {
            RunMode::Safe => value.saturating_mul(2),
            RunMode::Fast => (value / 2).max(1),
            RunMode::Standard | RunMode::DryRun => value,
        };
        let health_deadline = Duration::from_secs(settings.health_check_deadline_secs);
        let health_deadline = match mode {
            RunMode::Safe => health_deadline.saturating_mul(2),
            RunMode::Fast => health_deadline / 2,
            RunMode::Standard | RunMode::DryRun => health_deadline,
        };
        let attempt_timeout = Duration::from_secs(settings.attempt_timeout_secs);

        let service = RetryPolicy::default()
            .with_max_attempts(scale(settings.retry_max_attempts))
            .with_initial_delay(Duration::from_millis(settings.retry_initial_delay_millis))
            .with_max_delay(Duration::from_millis(settings.retry_max_delay_millis))
            .with_attempt_timeout(attempt_timeout);
        let health = RetryPolicy::fixed(
            scale(settings.health_check_attempts),
            Duration::from_millis(settings.health_check_interval_millis),
        )
        .with_attempt_timeout(attempt_timeout)
        .with_deadline(health_deadline);

        Self {
            install: service.clone(),
            service,
            health,
        }
    }
}

pub(crate) struct Collaborators {
    pub(crate) resolver: VersionResolver,
    pub(crate) installer: Arc<dyn ComponentInstaller>,
    pub(crate) services: Arc<dyn ServiceManager>,
    pub(crate) resilience: Arc<Resilience>,
}

struct PlannedComponent<'a> {
    phase: &'a PhaseConfig,
    name: &'a str,
    config: &'a ComponentConfig,
    force: bool,
}

enum Applied {
    Committed { txid: String },
    RolledBack { error: String, partial: bool },
    Interrupted,
}

/// Drives phases and components through resolve, install and verify,
/// with every mutation wrapped in a transaction and recorded in the
/// state store.
pub(crate) struct Orchestrator {
    layout: StateLayout,
    config: ConfigBundle,
    resolver: VersionResolver,
    installer: Arc<dyn ComponentInstaller>,
    services: Arc<dyn ServiceManager>,
    resilience: Arc<Resilience>,
    locks: LockManager,
    store: StateStore,
    transactions: TransactionManager,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub(crate) fn new(
        layout: StateLayout,
        config: ConfigBundle,
        collaborators: Collaborators,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let settings = &config.settings;
        let locks = LockManager::new(layout.locks_dir(), settings.lock_wait(), settings.lock_poll());
        let store = StateStore::new(&layout, locks.clone()).with_history_limit(settings.history_limit);
        let transactions = TransactionManager::new(layout.clone(), settings.backup_retention());
        Self {
            layout,
            config,
            resolver: collaborators.resolver,
            installer: collaborators.installer,
            services: collaborators.services,
            resilience: collaborators.resilience,
            locks,
            store,
            transactions,
            cancel,
        }
    }

    pub(crate) fn store(&self) -> &StateStore {
        &self.store
    }

    pub(crate) fn run(&self, request: &RunRequest, observer: &mut dyn RunObserver) -> Result<RunReport> {
        if request.mode.is_dry_run() {
            let plan = self.plan(&request.selection)?;
            observer.planned(plan.len());
            return self.dry_run(&plan, observer);
        }
        if !request.resume_only {
            // Reject unknown names before waiting on the lock.
            self.plan(&request.selection)?;
        }

        self.layout.ensure_base_dirs()?;
        let _lock = self.locks.acquire(ORCHESTRATOR_LOCK)?;

        let document = self.store.load()?;
        let resuming = document.status == RunStatus::InProgress;
        if request.resume_only && !resuming {
            info!("no interrupted run to resume");
            return Ok(RunReport::new(None, request.mode, false));
        }

        let (run_id, mode, plan) = if resuming {
            let run_id = document.run_id.clone().ok_or_else(|| {
                UpgradeError::StateIntegrity("in_progress run has no run id".to_string())
            })?;
            let scope = resumed_scope(&run_id, &document, request)?;
            let plan = self.plan(scope)?;
            let mode = document.mode.unwrap_or(request.mode);
            if mode != request.mode {
                info!(recorded = mode.as_str(), requested = request.mode.as_str(), "resuming with the run's recorded mode");
            }
            warn!(run_id = %run_id, scope = %scope, "resuming interrupted run");
            self.recover(&document)?;
            (run_id, mode, plan)
        } else {
            let plan = self.plan(&request.selection)?;
            self.prune_backups();
            let run_id = self
                .store
                .begin_run(request.mode, request.selection.clone())?;
            (run_id, request.mode, plan)
        };
        observer.planned(plan.len());

        let budgets = Budgets::for_mode(mode, &self.config.settings);
        let mut report = RunReport::new(Some(run_id.clone()), mode, resuming);
        if let Err(err) = self.execute_plan(&run_id, &plan, mode, &budgets, &mut report, observer) {
            if is_interrupted(&err) {
                warn!(run_id = %run_id, "run interrupted; state left resumable");
            } else if let Err(fail_err) = self.store.fail_run(&format!("{err:#}")) {
                warn!(error = %format!("{fail_err:#}"), "failed to record run failure");
            }
            return Err(err);
        }

        let failed = report.failed();
        if failed > 0 {
            let message = if report.aborted {
                format!("run aborted after {failed} component failure(s)")
            } else {
                format!("{failed} component(s) failed")
            };
            self.store.fail_run(&message)?;
            return Ok(report);
        }

        let document = self.store.load()?;
        let unsettled: Vec<&str> = plan
            .iter()
            .map(|planned| planned.name)
            .filter(|name| !document.component_status(name).is_terminal())
            .collect();
        if !unsettled.is_empty() {
            let message = format!("component(s) never settled: {}", unsettled.join(", "));
            self.store.fail_run(&message)?;
            return Err(UpgradeError::StateIntegrity(message).into());
        }
        self.store.complete_run()?;
        Ok(report)
    }

    /// Reverts every completed component of the current run, newest first,
    /// from retained backups.
    pub(crate) fn rollback_run(&self, reason: &str) -> Result<RunRollback> {
        self.layout.ensure_base_dirs()?;
        let _lock = self.locks.acquire(ORCHESTRATOR_LOCK)?;
        let mut document = self.store.load()?;
        let nothing = RunRollback {
            run_id: None,
            reverted: Vec::new(),
            failures: Vec::new(),
        };
        let Some(run_id) = document.run_id.clone() else {
            return Ok(nothing);
        };
        match document.status {
            RunStatus::Idle | RunStatus::RolledBack => return Ok(nothing),
            RunStatus::InProgress => {
                self.recover(&document)?;
                document = self.store.load()?;
            }
            RunStatus::Completed | RunStatus::Failed => {}
        }

        let mut reverted = Vec::new();
        let mut failures = Vec::new();
        for (name, record) in document.completed_newest_first() {
            let Some(txid) = record.backup_ref.as_deref() else {
                failures.push(format!("{name}: no backup reference recorded"));
                continue;
            };
            let hooks = vec![self.reinstall_hook(name, record.from_version.as_deref())];
            match self
                .transactions
                .revert_committed(name, txid, reason, self.services.as_ref(), hooks)
            {
                Ok(report) if !report.is_partial() => {
                    self.store.mark_reverted(name)?;
                    info!(component = name, txid, "component reverted");
                    reverted.push(name.to_string());
                }
                Ok(report) => failures.extend(
                    report
                        .failures
                        .iter()
                        .map(|failure| format!("{name}: {failure}")),
                ),
                Err(err) => failures.push(format!("{name}: {err:#}")),
            }
        }

        if failures.is_empty() {
            self.store.rollback_run(reason)?;
        } else {
            self.store.rollback_run(&format!(
                "{reason} (incomplete: {} step(s) failed)",
                failures.len()
            ))?;
        }
        Ok(RunRollback {
            run_id: Some(run_id),
            reverted,
            failures,
        })
    }

    fn plan(&self, selection: &RunScope) -> Result<Vec<PlannedComponent<'_>>> {
        let versions = &self.config.versions;
        let phases = &self.config.phases;

        let mut plan = Vec::new();
        match selection {
            RunScope::All => {
                for phase in &phases.phases {
                    for name in &phase.components {
                        plan.push(self.planned(phase, name, false)?);
                    }
                }
            }
            RunScope::Phase(wanted) => {
                let phase = phases.phase(wanted).ok_or_else(|| {
                    UpgradeError::validation("phase", format!("unknown phase '{wanted}'"))
                })?;
                for name in &phase.components {
                    plan.push(self.planned(phase, name, false)?);
                }
            }
            RunScope::Component { name, force } => {
                validate_identifier("component", name)?;
                let (name, _) = versions.components.get_key_value(name.as_str()).ok_or_else(|| {
                    UpgradeError::validation(
                        "component",
                        format!("'{name}' has no entry in the versions document"),
                    )
                })?;
                let phase = phases.phase_of(name).ok_or_else(|| {
                    UpgradeError::validation(
                        "component",
                        format!("'{name}' is not assigned to any phase"),
                    )
                })?;
                plan.push(self.planned(phase, name, *force)?);
            }
        }
        Ok(plan)
    }

    fn planned<'a>(
        &'a self,
        phase: &'a PhaseConfig,
        name: &'a str,
        force: bool,
    ) -> Result<PlannedComponent<'a>> {
        let config = self.config.versions.component(name).ok_or_else(|| {
            UpgradeError::validation(
                "component",
                format!("'{name}' has no entry in the versions document"),
            )
        })?;
        Ok(PlannedComponent {
            phase,
            name,
            config,
            force,
        })
    }

    fn dry_run(
        &self,
        plan: &[PlannedComponent<'_>],
        observer: &mut dyn RunObserver,
    ) -> Result<RunReport> {
        let mut report = RunReport::new(None, RunMode::DryRun, false);
        let mut current_phase = None;
        for planned in plan {
            if current_phase != Some(planned.phase.name.as_str()) {
                observer.phase_started(planned.phase);
                current_phase = Some(planned.phase.name.as_str());
            }
            let resolution = self.resolver.resolve(planned.name, planned.config)?;
            let outcome = match self.installer.installed_version(planned.name) {
                Ok(installed) if installed.as_ref() == Some(&resolution.version) && !planned.force => {
                    Outcome::Satisfied {
                        version: resolution.version.to_string(),
                    }
                }
                Ok(installed) => Outcome::Planned {
                    from: installed.map(|version| version.to_string()),
                    to: resolution.version.to_string(),
                    origin: resolution.origin,
                },
                Err(err) => Outcome::Failed {
                    error: format!("cannot query installed version: {err:#}"),
                    partial_rollback: false,
                },
            };
            let entry = ComponentReport {
                phase: planned.phase.name.clone(),
                component: planned.name.to_string(),
                outcome,
            };
            observer.component_finished(&entry);
            report.components.push(entry);
        }
        Ok(report)
    }

    /// Rolls back transactions orphaned by a dead run and resets the
    /// component that was mid-upgrade so it is attempted again.
    fn recover(&self, document: &StateDocument) -> Result<()> {
        let reports = self
            .transactions
            .recover_interrupted(self.services.as_ref(), |record| self.rehydrate_hooks(record))?;
        for report in &reports {
            if report.is_partial() {
                warn!(
                    component = %report.component,
                    txid = %report.txid,
                    failures = ?report.failures,
                    "interrupted transaction only partially rolled back"
                );
            } else {
                info!(component = %report.component, txid = %report.txid, "interrupted transaction rolled back");
            }
        }
        for (name, record) in &document.components {
            if record.status == ComponentStatus::InProgress {
                self.store
                    .set_component_status(name, ComponentStatus::Pending, ComponentUpdate::default())?;
            }
        }
        Ok(())
    }

    fn prune_backups(&self) {
        match self.transactions.prune_expired(unix_now()) {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "pruned expired backups"),
            Err(err) => warn!(error = %format!("{err:#}"), "failed to prune expired backups"),
        }
    }

    fn execute_plan(
        &self,
        run_id: &str,
        plan: &[PlannedComponent<'_>],
        mode: RunMode,
        budgets: &Budgets,
        report: &mut RunReport,
        observer: &mut dyn RunObserver,
    ) -> Result<()> {
        let mut current_phase: Option<&str> = None;
        for (index, planned) in plan.iter().enumerate() {
            if current_phase != Some(planned.phase.name.as_str()) {
                self.store.set_phase(Some(planned.phase.name.as_str()))?;
                info!(phase = %planned.phase.name, risk = planned.phase.risk.as_str(), "entering phase");
                observer.phase_started(planned.phase);
                current_phase = Some(planned.phase.name.as_str());
            }
            self.ensure_not_cancelled()?;

            let outcome = self.process_component(run_id, planned, budgets)?;
            let failed = matches!(outcome, Outcome::Failed { .. });
            let entry = ComponentReport {
                phase: planned.phase.name.clone(),
                component: planned.name.to_string(),
                outcome,
            };
            observer.component_finished(&entry);
            report.components.push(entry);

            if failed && aborts_run(mode, planned.phase) {
                warn!(
                    component = planned.name,
                    phase = %planned.phase.name,
                    mode = mode.as_str(),
                    "component failure aborts the run"
                );
                report.aborted = true;
                for rest in &plan[index + 1..] {
                    report.components.push(ComponentReport {
                        phase: rest.phase.name.clone(),
                        component: rest.name.to_string(),
                        outcome: Outcome::NotReached,
                    });
                }
                break;
            }
        }
        Ok(())
    }

    fn process_component(
        &self,
        run_id: &str,
        planned: &PlannedComponent<'_>,
        budgets: &Budgets,
    ) -> Result<Outcome> {
        let name = planned.name;
        let existing = self.store.load()?.component(name).cloned();
        match existing.as_ref().map(|record| record.status) {
            Some(status @ (ComponentStatus::Completed | ComponentStatus::Skipped)) => {
                debug!(component = name, status = status.as_str(), "already settled in this run");
                return Ok(Outcome::Settled { status });
            }
            Some(ComponentStatus::Failed | ComponentStatus::InProgress) => {
                self.store
                    .set_component_status(name, ComponentStatus::Pending, ComponentUpdate::default())?;
            }
            Some(ComponentStatus::Pending) | None => {}
        }

        let resolution = self.resolver.resolve(name, planned.config)?;
        let target = resolution.version;
        let target_text = target.to_string();
        if resolution.origin == ResolutionOrigin::Fallback {
            warn!(component = name, version = %target_text, "using fallback version");
        }
        let phase = Some(planned.phase.name.clone());

        let installed = match self.installer.installed_version(name) {
            Ok(installed) => installed,
            Err(err) => {
                let error = format!("cannot query installed version: {err:#}");
                self.store.set_component_status(
                    name,
                    ComponentStatus::InProgress,
                    ComponentUpdate {
                        to_version: Some(target_text.clone()),
                        phase: phase.clone(),
                        ..ComponentUpdate::default()
                    },
                )?;
                self.store.set_component_status(
                    name,
                    ComponentStatus::Failed,
                    ComponentUpdate {
                        error: Some(error.clone()),
                        ..ComponentUpdate::default()
                    },
                )?;
                return Ok(Outcome::Failed {
                    error,
                    partial_rollback: false,
                });
            }
        };

        if installed.as_ref() == Some(&target) && !planned.force {
            info!(component = name, version = %target_text, "already at target version");
            self.store.set_component_status(
                name,
                ComponentStatus::Skipped,
                ComponentUpdate {
                    from_version: Some(target_text.clone()),
                    to_version: Some(target_text.clone()),
                    phase,
                    ..ComponentUpdate::default()
                },
            )?;
            return Ok(Outcome::Skipped {
                version: target_text,
            });
        }

        let observed = installed.map(|version| version.to_string());
        let recorded = existing.and_then(|record| record.from_version);
        if let (Some(recorded), Some(observed)) = (&recorded, &observed) {
            if recorded != observed {
                warn!(component = name, recorded = %recorded, observed = %observed, "installed version differs from the recorded starting version");
            }
        }
        let from = recorded.or(observed);

        self.store.set_component_status(
            name,
            ComponentStatus::InProgress,
            ComponentUpdate {
                from_version: from.clone(),
                to_version: Some(target_text.clone()),
                phase,
                ..ComponentUpdate::default()
            },
        )?;
        info!(component = name, from = from.as_deref().unwrap_or("none"), to = %target_text, origin = %resolution.origin, "upgrading component");

        match self.apply_upgrade(run_id, planned, from.as_deref(), &target, budgets)? {
            Applied::Committed { txid } => {
                self.store.set_component_status(
                    name,
                    ComponentStatus::Completed,
                    ComponentUpdate {
                        backup_ref: Some(txid.clone()),
                        ..ComponentUpdate::default()
                    },
                )?;
                Ok(Outcome::Upgraded {
                    from,
                    to: target_text,
                    txid,
                })
            }
            Applied::RolledBack { error, partial } => {
                self.store.set_component_status(
                    name,
                    ComponentStatus::Failed,
                    ComponentUpdate {
                        error: Some(error.clone()),
                        ..ComponentUpdate::default()
                    },
                )?;
                Ok(Outcome::Failed {
                    error,
                    partial_rollback: partial,
                })
            }
            Applied::Interrupted => {
                self.store
                    .set_component_status(name, ComponentStatus::Pending, ComponentUpdate::default())?;
                Err(UpgradeError::Interrupted.into())
            }
        }
    }

    fn apply_upgrade(
        &self,
        run_id: &str,
        planned: &PlannedComponent<'_>,
        from: Option<&str>,
        target: &Version,
        budgets: &Budgets,
    ) -> Result<Applied> {
        let mut tx = self.transactions.begin(planned.name, Some(run_id))?;
        let txid = tx.txid().to_string();

        let step_result = (|| -> Result<()> {
            tx.set_versions(from, &target.to_string())?;
            self.run_steps(&mut tx, planned, from, target, budgets)
        })();

        match step_result {
            Ok(()) => {
                tx.commit()?;
                Ok(Applied::Committed { txid })
            }
            Err(err) => {
                let interrupted = is_interrupted(&err) || self.cancelled();
                let reason = if interrupted {
                    "run interrupted".to_string()
                } else {
                    UpgradeError::Operational {
                        component: planned.name.to_string(),
                        message: format!("{err:#}"),
                    }
                    .to_string()
                };
                warn!(component = planned.name, txid = %txid, reason = %reason, "rolling back component");
                let report = tx.rollback(&reason, self.services.as_ref());
                if interrupted {
                    Ok(Applied::Interrupted)
                } else {
                    Ok(Applied::RolledBack {
                        error: reason,
                        partial: report.is_partial(),
                    })
                }
            }
        }
    }

    /// Journal order matters for reversal: the service stop is undone last,
    /// after files are restored and the previous version reinstalled.
    fn run_steps(
        &self,
        tx: &mut Transaction<'_>,
        planned: &PlannedComponent<'_>,
        from: Option<&str>,
        target: &Version,
        budgets: &Budgets,
    ) -> Result<()> {
        let name = planned.name;
        let service = planned.config.service.as_deref();

        if let Some(service) = service {
            tx.record_service_op(ServiceAction::Stop, service, self.services.as_ref())?;
            self.retried(&format!("service:{service}"), &budgets.service, |timeout| {
                self.services.apply(service, ServiceAction::Stop, timeout)
            })
            .with_context(|| format!("failed to stop service {service}"))?;
            self.ensure_not_cancelled()?;
        }

        tx.register_rollback_hook(self.reinstall_hook(name, from))?;
        for path in &planned.config.managed_paths {
            tx.record_file_op(FileOpKind::Replace, path)?;
        }
        self.retried(&format!("install:{name}"), &budgets.install, |timeout| {
            self.installer.install(name, target, timeout)
        })
        .with_context(|| format!("failed to install {name} {target}"))?;
        self.ensure_not_cancelled()?;

        if let Some(service) = service {
            tx.record_service_op(ServiceAction::Start, service, self.services.as_ref())?;
            self.retried(&format!("service:{service}"), &budgets.service, |timeout| {
                self.services.apply(service, ServiceAction::Start, timeout)
            })
            .with_context(|| format!("failed to start service {service}"))?;
            self.ensure_not_cancelled()?;
        }

        self.retried(&format!("health:{name}"), &budgets.health, |timeout| {
            match self.bounded_health_check(name, timeout)? {
                HealthStatus::Healthy => Ok(()),
                HealthStatus::Unhealthy(detail) => Err(anyhow!("{name} is unhealthy: {detail}")),
            }
        })
        .with_context(|| format!("health check for {name} failed"))?;
        Ok(())
    }

    /// Each attempt gets the policy's attempt timeout.
    fn retried<T>(
        &self,
        resource: &str,
        policy: &RetryPolicy,
        mut operation: impl FnMut(Option<Duration>) -> Result<T>,
    ) -> Result<T> {
        self.resilience
            .execute(resource, policy, |attempt| {
                if self.cancelled() {
                    return Err(AttemptError::permanent(anyhow!("cancelled")));
                }
                debug!(resource, attempt = attempt.number, "attempting");
                operation(attempt.timeout).map_err(classify_failure)
            })
            .map_err(anyhow::Error::new)
    }

    /// Runs the check on a helper thread so a check that ignores its timeout
    /// still cannot hold the run past it. A late answer is discarded.
    fn bounded_health_check(&self, name: &str, timeout: Option<Duration>) -> Result<HealthStatus> {
        let Some(timeout) = timeout else {
            return self.installer.health_check(name, None);
        };
        let (sender, receiver) = mpsc::channel();
        let installer = Arc::clone(&self.installer);
        let component = name.to_string();
        thread::Builder::new()
            .name(format!("health-{name}"))
            .spawn(move || {
                // The receiver is gone once the check has been abandoned.
                let _ = sender.send(installer.health_check(&component, Some(timeout)));
            })
            .context("failed to spawn health check thread")?;
        match receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(UpgradeError::Transient(format!(
                "health check for {name} gave no answer within {}ms",
                timeout.as_millis()
            ))
            .into()),
            Err(RecvTimeoutError::Disconnected) => {
                Err(anyhow!("health check for {name} ended without a result"))
            }
        }
    }

    fn reinstall_hook(&self, component: &str, from: Option<&str>) -> Box<dyn RollbackHook> {
        Box::new(ReinstallPrevious {
            installer: Arc::clone(&self.installer),
            component: component.to_string(),
            version: from.and_then(|version| Version::parse(version).ok()),
        })
    }

    fn rehydrate_hooks(&self, record: &TransactionRecord) -> Vec<Box<dyn RollbackHook>> {
        vec![self.reinstall_hook(&record.component, record.from_version.as_deref())]
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if self.cancelled() {
            return Err(UpgradeError::Interrupted.into());
        }
        Ok(())
    }
}

/// Safe mode aborts on any failure; otherwise the phase decides.
pub(crate) fn aborts_run(mode: RunMode, phase: &PhaseConfig) -> bool {
    mode.failures_are_fatal() || phase.on_failure == FailurePolicy::Abort
}

/// An in-progress run keeps the scope it started with. `--resume` adopts it;
/// any other selection must match it exactly.
fn resumed_scope<'d>(
    run_id: &str,
    document: &'d StateDocument,
    request: &RunRequest,
) -> Result<&'d RunScope> {
    if request.resume_only || request.selection == document.scope {
        return Ok(&document.scope);
    }
    Err(UpgradeError::validation(
        "selection",
        format!(
            "run {run_id} is still in progress for {}; continue it with --resume or undo it with --rollback",
            document.scope
        ),
    )
    .into())
}

/// Validation, state-integrity and cancellation fail the same way on every
/// attempt, io errors carry their own class, and anything else may clear up
/// on a later attempt.
pub(crate) fn classify_failure(err: anyhow::Error) -> AttemptError {
    let class = err
        .chain()
        .find_map(|cause| {
            if let Some(upgrade) = cause.downcast_ref::<UpgradeError>() {
                return Some(match upgrade {
                    UpgradeError::Validation { .. }
                    | UpgradeError::StateIntegrity(_)
                    | UpgradeError::Interrupted => ErrorClass::Permanent,
                    UpgradeError::LockBusy { .. }
                    | UpgradeError::Operational { .. }
                    | UpgradeError::Transient(_) => ErrorClass::Transient,
                });
            }
            cause.downcast_ref::<io::Error>().map(classify_io_error)
        })
        .unwrap_or(ErrorClass::Transient);
    AttemptError::classified(class, err)
}

pub(crate) fn is_interrupted(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<UpgradeError>(),
            Some(UpgradeError::Interrupted)
        )
    })
}

/// Puts the previously installed version back when restored files alone
/// did not.
struct ReinstallPrevious {
    installer: Arc<dyn ComponentInstaller>,
    component: String,
    version: Option<Version>,
}

impl RollbackHook for ReinstallPrevious {
    fn name(&self) -> &str {
        REINSTALL_HOOK
    }

    fn run(&self, context: &RollbackContext) -> Result<()> {
        let Some(version) = &self.version else {
            debug!(component = %self.component, "no previous version to reinstall");
            return Ok(());
        };
        if self.installer.installed_version(&self.component)?.as_ref() == Some(version) {
            return Ok(());
        }
        info!(
            component = %self.component,
            version = %version,
            reason = %context.reason,
            "reinstalling previous version"
        );
        self.installer.install(&self.component, version, None)
    }
}
