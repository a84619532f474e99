use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use parking_lot::Mutex;
use semver::Version;
use stackup_core::{
    exit_code_for, ConfigBundle, ExitCode, PhasesDocument, RunMode, Settings, UpgradeError,
    VersionsDocument,
};
use stackup_installer::{
    ComponentInstaller, ComponentStatus, ComponentUpdate, FileOpKind, HealthStatus, LockManager,
    RunScope, RunStatus, ServiceAction, ServiceManager, ServiceSnapshot, StateDocument,
    StateLayout, StateStore, TransactionManager,
};
use stackup_resolver::{
    Release, ReleaseSource, ResolutionOrigin, SourceLocation, StrategyRegistry, VersionCache,
    VersionResolver,
};
use stackup_retry::{AttemptError, BreakerConfig, ErrorClass, Resilience, RetryPolicy};
use tempfile::TempDir;

use crate::command_flows::{format_run_summary, format_status_lines};
use crate::dispatch::{Cli, ModeArg};
use crate::orchestrator::{
    classify_failure, is_interrupted, Budgets, Collaborators, Orchestrator, Outcome, RunReport,
    RunRequest, SilentObserver, ORCHESTRATOR_LOCK,
};
use crate::render::OutputStyle;

#[derive(Debug, Clone, Copy)]
enum InstallFailure {
    /// Refuses the request outright, before touching anything.
    Rejected,
    /// Writes the new version, then fails.
    Broken,
}

/// Keeps each component's installed version in `<bin_dir>/<component>`,
/// which is also the component's managed path.
struct FakeInstaller {
    bin_dir: PathBuf,
    unhealthy: Mutex<BTreeSet<String>>,
    failing_installs: Mutex<BTreeMap<String, InstallFailure>>,
    slow_health: Mutex<BTreeMap<String, Duration>>,
    installs: Mutex<Vec<String>>,
    health_checks: Mutex<BTreeMap<String, u32>>,
    cancel_on_install: Mutex<Option<(String, Arc<AtomicBool>)>>,
}

impl FakeInstaller {
    fn new(bin_dir: PathBuf) -> Self {
        Self {
            bin_dir,
            unhealthy: Mutex::new(BTreeSet::new()),
            failing_installs: Mutex::new(BTreeMap::new()),
            slow_health: Mutex::new(BTreeMap::new()),
            installs: Mutex::new(Vec::new()),
            health_checks: Mutex::new(BTreeMap::new()),
            cancel_on_install: Mutex::new(None),
        }
    }

    fn mark_unhealthy(&self, component: &str) {
        self.unhealthy.lock().insert(component.to_string());
    }

    fn fail_installs(&self, component: &str, failure: InstallFailure) {
        self.failing_installs
            .lock()
            .insert(component.to_string(), failure);
    }

    /// Health checks for `component` ignore their timeout and take `delay`.
    fn hang_health_checks(&self, component: &str, delay: Duration) {
        self.slow_health.lock().insert(component.to_string(), delay);
    }

    /// Raises `flag` once, right after `component` is installed.
    fn cancel_after_installing(&self, component: &str, flag: Arc<AtomicBool>) {
        *self.cancel_on_install.lock() = Some((component.to_string(), flag));
    }

    fn installs(&self) -> Vec<String> {
        self.installs.lock().clone()
    }

    fn install_calls(&self, component: &str) -> usize {
        self.installs
            .lock()
            .iter()
            .filter(|entry| entry.split(' ').next() == Some(component))
            .count()
    }

    fn health_checks(&self, component: &str) -> u32 {
        self.health_checks
            .lock()
            .get(component)
            .copied()
            .unwrap_or_default()
    }
}

impl ComponentInstaller for FakeInstaller {
    fn installed_version(&self, component: &str) -> Result<Option<Version>> {
        let path = self.bin_dir.join(component);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(Version::parse(raw.trim()).with_context(|| {
                format!("bad version in {}", path.display())
            })?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn install(&self, component: &str, version: &Version, _timeout: Option<Duration>) -> Result<()> {
        self.installs.lock().push(format!("{component} {version}"));
        let failure = self.failing_installs.lock().get(component).copied();
        if let Some(InstallFailure::Rejected) = failure {
            return Err(UpgradeError::validation(
                "version",
                format!("installer refuses {component} {version}"),
            )
            .into());
        }
        fs::write(self.bin_dir.join(component), version.to_string())?;
        if let Some(InstallFailure::Broken) = failure {
            return Err(anyhow!("post-install step for {component} failed"));
        }
        let mut trigger = self.cancel_on_install.lock();
        if trigger.as_ref().is_some_and(|(name, _)| name == component) {
            if let Some((_, flag)) = trigger.take() {
                flag.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn health_check(&self, component: &str, _timeout: Option<Duration>) -> Result<HealthStatus> {
        *self
            .health_checks
            .lock()
            .entry(component.to_string())
            .or_default() += 1;
        let delay = self.slow_health.lock().get(component).copied();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        if self.unhealthy.lock().contains(component) {
            return Ok(HealthStatus::Unhealthy("port refused connection".to_string()));
        }
        Ok(HealthStatus::Healthy)
    }
}

#[derive(Default)]
struct FakeServices {
    states: Mutex<BTreeMap<String, ServiceSnapshot>>,
    refused_starts: Mutex<BTreeMap<String, u32>>,
}

impl FakeServices {
    /// The next `times` start requests for `service` fail.
    fn refuse_starts(&self, service: &str, times: u32) {
        self.refused_starts.lock().insert(service.to_string(), times);
    }

    fn running(&self, service: &str) -> bool {
        self.states
            .lock()
            .get(service)
            .is_some_and(|state| state.running)
    }
}

impl ServiceManager for FakeServices {
    fn status(&self, service: &str) -> Result<ServiceSnapshot> {
        Ok(self.states.lock().get(service).copied().unwrap_or_default())
    }

    fn apply(&self, service: &str, action: ServiceAction, _timeout: Option<Duration>) -> Result<()> {
        if action == ServiceAction::Start {
            if let Some(remaining) = self.refused_starts.lock().get_mut(service) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(anyhow!("unit {service} failed to start"));
                }
            }
        }
        let mut states = self.states.lock();
        let state = states.entry(service.to_string()).or_default();
        match action {
            ServiceAction::Start | ServiceAction::Restart => state.running = true,
            ServiceAction::Stop => state.running = false,
            ServiceAction::Enable => state.enabled = true,
            ServiceAction::Disable => state.enabled = false,
        }
        Ok(())
    }
}

struct OfflineSource;

impl ReleaseSource for OfflineSource {
    fn list_releases(
        &self,
        _location: &SourceLocation,
        _timeout: Option<Duration>,
    ) -> Result<Vec<Release>, AttemptError> {
        Err(AttemptError::permanent(anyhow!("upstream unreachable")))
    }
}

const INITIAL_VERSIONS: [(&str, &str); 4] = [
    ("agent_a", "2.0.5"),
    ("agent_b", "1.4.0"),
    ("central_db", "3.0.0"),
    ("metrics_store", "5.0.0"),
];

struct Fixture {
    _dir: TempDir,
    layout: StateLayout,
    bin_dir: PathBuf,
    installer: Arc<FakeInstaller>,
    services: Arc<FakeServices>,
    cancel: Arc<AtomicBool>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("must create temp dir");
        let layout = StateLayout::new(dir.path().join("root"));
        let bin_dir = dir.path().join("bin");
        fs::create_dir_all(&bin_dir).expect("must create bin dir");

        let services = Arc::new(FakeServices::default());
        for (component, version) in INITIAL_VERSIONS {
            fs::write(bin_dir.join(component), version).expect("must seed version");
            services
                .apply(component, ServiceAction::Start, None)
                .expect("must start service");
        }

        Self {
            installer: Arc::new(FakeInstaller::new(bin_dir.clone())),
            _dir: dir,
            layout,
            bin_dir,
            services,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    fn managed(&self, component: &str) -> String {
        format!("\"{}\"", self.bin_dir.join(component).display())
    }

    fn config(&self, settings: Settings) -> ConfigBundle {
        let versions = format!(
            r#"
[resolver]
cache_ttl_secs = 60

[components.agent_a]
strategy = "pinned"
version = "2.1.0"
service = "agent_a"
managed_paths = [{agent_a}]

[components.agent_b]
strategy = "pinned"
version = "1.5.0"
service = "agent_b"
managed_paths = [{agent_b}]

[components.central_db]
strategy = "pinned"
version = "3.1.0"
service = "central_db"
managed_paths = [{central_db}]

[components.metrics_store]
strategy = "latest"
source = "github:acme/metrics-store"
fallback = "5.1.0"
service = "metrics_store"
managed_paths = [{metrics_store}]
"#,
            agent_a = self.managed("agent_a"),
            agent_b = self.managed("agent_b"),
            central_db = self.managed("central_db"),
            metrics_store = self.managed("metrics_store"),
        );
        let phases = r#"
[[phases]]
name = "agents"
risk = "low"
on_failure = "continue"
components = ["agent_a", "agent_b"]

[[phases]]
name = "central"
risk = "high"
on_failure = "abort"
components = ["central_db", "metrics_store"]
"#;
        ConfigBundle::new(
            VersionsDocument::from_toml_str(&versions).expect("must parse versions"),
            PhasesDocument::from_toml_str(phases).expect("must parse phases"),
            settings,
        )
        .expect("must cross-validate")
    }

    fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(quick_settings())
    }

    fn orchestrator_with(&self, settings: Settings) -> Orchestrator {
        let config = self.config(settings);
        let resilience = Arc::new(Resilience::new(BreakerConfig {
            threshold: 100,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(1),
        }));
        let resolver = VersionResolver::new(
            StrategyRegistry::with_builtins(),
            Box::new(OfflineSource),
            VersionCache::in_memory(Duration::from_secs(60)),
            Arc::clone(&resilience),
            RetryPolicy::no_retry(),
        );
        let installer: Arc<dyn ComponentInstaller> = self.installer.clone();
        let services: Arc<dyn ServiceManager> = self.services.clone();
        Orchestrator::new(
            self.layout.clone(),
            config,
            Collaborators {
                resolver,
                installer,
                services,
                resilience,
            },
            Arc::clone(&self.cancel),
        )
    }

    fn version(&self, component: &str) -> String {
        fs::read_to_string(self.bin_dir.join(component)).expect("must read version")
    }

    fn state(&self) -> StateDocument {
        self.store().load().expect("must load state")
    }

    fn store(&self) -> StateStore {
        StateStore::new(&self.layout, lock_manager(&self.layout))
    }
}

fn quick_settings() -> Settings {
    Settings {
        lock_wait_secs: 1,
        lock_poll_millis: 5,
        retry_initial_delay_millis: 0,
        retry_max_delay_millis: 0,
        health_check_interval_millis: 0,
        ..Settings::default()
    }
}

fn lock_manager(layout: &StateLayout) -> LockManager {
    LockManager::new(
        layout.locks_dir(),
        Duration::from_secs(1),
        Duration::from_millis(5),
    )
}

fn request(selection: RunScope, mode: RunMode) -> RunRequest {
    RunRequest {
        selection,
        mode,
        resume_only: false,
    }
}

fn run_all(orchestrator: &Orchestrator, mode: RunMode) -> Result<RunReport> {
    orchestrator.run(&request(RunScope::All, mode), &mut SilentObserver)
}

fn outcome<'r>(report: &'r RunReport, component: &str) -> &'r Outcome {
    &report
        .components
        .iter()
        .find(|entry| entry.component == component)
        .expect("component must be reported")
        .outcome
}

fn status_of(document: &StateDocument, component: &str) -> ComponentStatus {
    document
        .component(component)
        .map(|record| record.status)
        .expect("component must be recorded")
}

#[test]
fn full_run_upgrades_every_phase_in_order() {
    let fixture = Fixture::new();
    let report = run_all(&fixture.orchestrator(), RunMode::Standard).expect("run must succeed");

    assert_eq!(report.exit_code(), ExitCode::Success);
    assert_eq!(
        fixture.installer.installs(),
        vec![
            "agent_a 2.1.0",
            "agent_b 1.5.0",
            "central_db 3.1.0",
            "metrics_store 5.1.0"
        ]
    );
    assert_eq!(fixture.version("agent_a"), "2.1.0");
    assert!(fixture.services.running("agent_a"));

    let state = fixture.state();
    assert_eq!(state.status, RunStatus::Completed);
    let record = state.component("agent_a").expect("agent_a recorded");
    assert_eq!(record.status, ComponentStatus::Completed);
    assert_eq!(record.from_version.as_deref(), Some("2.0.5"));
    assert_eq!(record.to_version.as_deref(), Some("2.1.0"));
    assert_eq!(record.phase.as_deref(), Some("agents"));
    assert!(record.backup_ref.is_some());
}

#[test]
fn second_run_skips_everything_and_reports_no_op() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();
    run_all(&orchestrator, RunMode::Standard).expect("first run must succeed");

    let report = run_all(&orchestrator, RunMode::Standard).expect("second run must succeed");
    assert_eq!(report.exit_code(), ExitCode::NoOp);
    assert!(report
        .components
        .iter()
        .all(|entry| matches!(entry.outcome, Outcome::Skipped { .. })));
    assert_eq!(fixture.installer.installs().len(), 4);
    assert_eq!(fixture.state().history.len(), 1);
}

#[test]
fn failed_health_check_rolls_back_and_phase_continues() {
    let fixture = Fixture::new();
    fixture.installer.mark_unhealthy("agent_a");

    let report = run_all(&fixture.orchestrator(), RunMode::Standard).expect("run must finish");

    assert!(matches!(
        outcome(&report, "agent_a"),
        Outcome::Failed {
            partial_rollback: false,
            ..
        }
    ));
    assert_eq!(fixture.installer.health_checks("agent_a"), 3);
    assert_eq!(fixture.version("agent_a"), "2.0.5");
    assert!(fixture.services.running("agent_a"));
    assert!(matches!(outcome(&report, "agent_b"), Outcome::Upgraded { .. }));
    assert_eq!(report.exit_code(), ExitCode::Failure);

    let state = fixture.state();
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(status_of(&state, "agent_a"), ComponentStatus::Failed);
    assert!(state
        .component("agent_a")
        .and_then(|record| record.error.as_deref())
        .is_some_and(|error| error.contains("health check")));
}

#[test]
fn safe_mode_aborts_on_first_failure_with_doubled_budget() {
    let fixture = Fixture::new();
    fixture.installer.mark_unhealthy("agent_a");

    let report = run_all(&fixture.orchestrator(), RunMode::Safe).expect("run must finish");

    assert!(report.aborted);
    assert_eq!(fixture.installer.health_checks("agent_a"), 6);
    assert_eq!(outcome(&report, "agent_b"), &Outcome::NotReached);
    assert_eq!(outcome(&report, "metrics_store"), &Outcome::NotReached);
    assert_eq!(fixture.version("agent_b"), "1.4.0");
    assert_eq!(report.exit_code(), ExitCode::Failure);
}

#[test]
fn abort_policy_phase_stops_remaining_components() {
    let fixture = Fixture::new();
    fixture.installer.mark_unhealthy("central_db");

    let report = run_all(&fixture.orchestrator(), RunMode::Fast).expect("run must finish");

    assert!(matches!(outcome(&report, "agent_b"), Outcome::Upgraded { .. }));
    assert!(matches!(outcome(&report, "central_db"), Outcome::Failed { .. }));
    assert_eq!(outcome(&report, "metrics_store"), &Outcome::NotReached);
    assert_eq!(fixture.installer.health_checks("central_db"), 1);
    assert_eq!(fixture.version("central_db"), "3.0.0");
    assert_eq!(fixture.state().status, RunStatus::Failed);
}

#[test]
fn single_component_is_skipped_unless_forced() {
    let fixture = Fixture::new();
    fs::write(fixture.bin_dir.join("agent_a"), "2.1.0").expect("must seed");
    let orchestrator = fixture.orchestrator();
    let component = |force| RunScope::Component {
        name: "agent_a".to_string(),
        force,
    };

    let report = orchestrator
        .run(&request(component(false), RunMode::Standard), &mut SilentObserver)
        .expect("run must succeed");
    assert_eq!(report.components.len(), 1);
    assert!(matches!(outcome(&report, "agent_a"), Outcome::Skipped { .. }));
    assert_eq!(report.exit_code(), ExitCode::NoOp);

    let report = orchestrator
        .run(&request(component(true), RunMode::Standard), &mut SilentObserver)
        .expect("forced run must succeed");
    assert!(matches!(outcome(&report, "agent_a"), Outcome::Upgraded { .. }));
    assert_eq!(fixture.installer.installs(), vec!["agent_a 2.1.0"]);
}

#[test]
fn phase_selection_touches_only_that_phase() {
    let fixture = Fixture::new();
    let report = fixture
        .orchestrator()
        .run(
            &request(RunScope::Phase("central".to_string()), RunMode::Standard),
            &mut SilentObserver,
        )
        .expect("run must succeed");

    let names: Vec<_> = report
        .components
        .iter()
        .map(|entry| entry.component.as_str())
        .collect();
    assert_eq!(names, vec!["central_db", "metrics_store"]);
    assert_eq!(fixture.version("agent_a"), "2.0.5");
}

#[test]
fn unknown_selection_is_a_validation_error() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();

    let err = orchestrator
        .run(
            &request(RunScope::Phase("edge".to_string()), RunMode::Standard),
            &mut SilentObserver,
        )
        .expect_err("unknown phase must fail");
    assert_eq!(exit_code_for(&err), ExitCode::Validation);

    let err = orchestrator
        .run(
            &request(
                RunScope::Component {
                    name: "ghost".to_string(),
                    force: false,
                },
                RunMode::Standard,
            ),
            &mut SilentObserver,
        )
        .expect_err("unknown component must fail");
    assert_eq!(exit_code_for(&err), ExitCode::Validation);
    assert!(!fixture.layout.state_path().exists());
}

#[test]
fn dry_run_plans_without_state_or_installs() {
    let fixture = Fixture::new();
    let report = run_all(&fixture.orchestrator(), RunMode::DryRun).expect("dry run must succeed");

    assert_eq!(
        outcome(&report, "agent_a"),
        &Outcome::Planned {
            from: Some("2.0.5".to_string()),
            to: "2.1.0".to_string(),
            origin: ResolutionOrigin::Resolved,
        }
    );
    assert!(matches!(
        outcome(&report, "metrics_store"),
        Outcome::Planned {
            origin: ResolutionOrigin::Fallback,
            ..
        }
    ));
    assert!(fixture.installer.installs().is_empty());
    assert!(!fixture.layout.state_path().exists());
    assert_eq!(report.exit_code(), ExitCode::Success);
}

#[test]
fn held_orchestrator_lock_reports_lock_busy() {
    let fixture = Fixture::new();
    fixture.layout.ensure_base_dirs().expect("must create dirs");
    let _held = lock_manager(&fixture.layout)
        .acquire(ORCHESTRATOR_LOCK)
        .expect("must take lock");

    let orchestrator = fixture.orchestrator_with(Settings {
        lock_wait_secs: 0,
        ..quick_settings()
    });
    let err = run_all(&orchestrator, RunMode::Standard).expect_err("run must not start");
    assert_eq!(exit_code_for(&err), ExitCode::LockBusy);
    assert!(fixture.installer.installs().is_empty());
}

#[test]
fn cancellation_leaves_run_resumable_and_resume_finishes_it() {
    let fixture = Fixture::new();
    fixture
        .installer
        .cancel_after_installing("agent_b", Arc::clone(&fixture.cancel));

    let err = run_all(&fixture.orchestrator(), RunMode::Standard)
        .expect_err("cancelled run must stop");
    assert!(is_interrupted(&err));
    assert_eq!(exit_code_for(&err), ExitCode::Failure);

    let state = fixture.state();
    assert_eq!(state.status, RunStatus::InProgress);
    assert_eq!(status_of(&state, "agent_a"), ComponentStatus::Completed);
    assert_eq!(status_of(&state, "agent_b"), ComponentStatus::Pending);
    assert_eq!(fixture.version("agent_b"), "1.4.0");
    assert!(fixture.services.running("agent_b"));

    fixture.cancel.store(false, Ordering::SeqCst);
    let resume = RunRequest {
        selection: RunScope::All,
        mode: RunMode::Standard,
        resume_only: true,
    };
    let report = fixture
        .orchestrator()
        .run(&resume, &mut SilentObserver)
        .expect("resume must succeed");

    assert!(report.resumed);
    assert_eq!(
        outcome(&report, "agent_a"),
        &Outcome::Settled {
            status: ComponentStatus::Completed
        }
    );
    assert!(matches!(outcome(&report, "agent_b"), Outcome::Upgraded { .. }));
    let agent_a_installs = fixture
        .installer
        .installs()
        .iter()
        .filter(|entry| entry.starts_with("agent_a"))
        .count();
    assert_eq!(agent_a_installs, 1);
    assert_eq!(fixture.state().status, RunStatus::Completed);
}

#[test]
fn resume_recovers_transaction_left_by_a_crashed_process() {
    let fixture = Fixture::new();
    fixture.layout.ensure_base_dirs().expect("must create dirs");
    fs::write(fixture.bin_dir.join("agent_a"), "2.1.0").expect("agent_a already upgraded");

    let store = fixture.store();
    store
        .begin_run(RunMode::Fast, RunScope::All)
        .expect("must begin run");
    let started = |from: &str, to: &str| ComponentUpdate {
        from_version: Some(from.to_string()),
        to_version: Some(to.to_string()),
        phase: Some("agents".to_string()),
        ..ComponentUpdate::default()
    };
    store
        .set_component_status("agent_a", ComponentStatus::InProgress, started("2.0.5", "2.1.0"))
        .expect("must record");
    store
        .set_component_status(
            "agent_a",
            ComponentStatus::Completed,
            ComponentUpdate {
                backup_ref: Some("tx-earlier".to_string()),
                ..ComponentUpdate::default()
            },
        )
        .expect("must record");
    store
        .set_component_status("agent_b", ComponentStatus::InProgress, started("1.4.0", "1.5.0"))
        .expect("must record");

    let transactions = TransactionManager::new(fixture.layout.clone(), Duration::from_secs(3600));
    {
        let mut tx = transactions
            .begin("agent_b", Some("run-crashed"))
            .expect("must begin tx");
        tx.record_service_op(ServiceAction::Stop, "agent_b", fixture.services.as_ref())
            .expect("must record stop");
        fixture
            .services
            .apply("agent_b", ServiceAction::Stop, None)
            .expect("must stop");
        tx.record_file_op(FileOpKind::Replace, &fixture.bin_dir.join("agent_b"))
            .expect("must record file");
        fs::write(fixture.bin_dir.join("agent_b"), "9.9.9").expect("half-applied install");
    }

    let resume = RunRequest {
        selection: RunScope::All,
        mode: RunMode::Standard,
        resume_only: true,
    };
    let report = fixture
        .orchestrator()
        .run(&resume, &mut SilentObserver)
        .expect("resume must succeed");

    assert_eq!(report.mode, RunMode::Fast);
    assert!(matches!(outcome(&report, "agent_a"), Outcome::Settled { .. }));
    assert!(!fixture
        .installer
        .installs()
        .iter()
        .any(|entry| entry.starts_with("agent_a")));
    assert!(fixture.services.running("agent_b"));
    assert_eq!(fixture.version("agent_b"), "1.5.0");

    let state = fixture.state();
    let record = state.component("agent_b").expect("agent_b recorded");
    assert_eq!(record.status, ComponentStatus::Completed);
    assert_eq!(record.from_version.as_deref(), Some("1.4.0"));
    assert_eq!(state.status, RunStatus::Completed);
    assert!(transactions.interrupted().expect("must scan").is_empty());
}

#[test]
fn resume_without_interrupted_run_is_a_no_op() {
    let fixture = Fixture::new();
    let resume = RunRequest {
        selection: RunScope::All,
        mode: RunMode::Standard,
        resume_only: true,
    };
    let report = fixture
        .orchestrator()
        .run(&resume, &mut SilentObserver)
        .expect("resume must succeed");

    assert!(report.run_id.is_none());
    assert_eq!(report.exit_code(), ExitCode::NoOp);
    assert!(fixture.installer.installs().is_empty());
}

#[test]
fn rollback_reverts_completed_components_newest_first() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();
    run_all(&orchestrator, RunMode::Standard).expect("run must succeed");

    let rollback = orchestrator
        .rollback_run("operator request")
        .expect("rollback must succeed");
    assert_eq!(
        rollback.reverted,
        vec!["metrics_store", "central_db", "agent_b", "agent_a"]
    );
    assert!(rollback.failures.is_empty());
    assert_eq!(rollback.exit_code(), ExitCode::Success);
    for (component, version) in INITIAL_VERSIONS {
        assert_eq!(fixture.version(component), version);
        assert!(fixture.services.running(component));
    }

    let state = fixture.state();
    assert_eq!(state.status, RunStatus::RolledBack);
    assert!(state.components.values().all(|record| record.reverted));

    let again = orchestrator
        .rollback_run("operator request")
        .expect("second rollback must succeed");
    assert_eq!(again.exit_code(), ExitCode::NoOp);
}

#[test]
fn budgets_scale_with_mode() {
    let settings = Settings::default();
    let standard = Budgets::for_mode(RunMode::Standard, &settings);
    let safe = Budgets::for_mode(RunMode::Safe, &settings);
    let fast = Budgets::for_mode(RunMode::Fast, &settings);

    assert_eq!(standard.health.max_attempts, 3);
    assert_eq!(safe.health.max_attempts, 6);
    assert_eq!(fast.health.max_attempts, 1);
    assert_eq!(safe.service.max_attempts, 6);
    assert_eq!(fast.install.max_attempts, 1);
    assert_eq!(safe.health.deadline, Some(Duration::from_secs(240)));
    assert_eq!(fast.health.deadline, Some(Duration::from_secs(60)));
}

#[test]
fn actions_are_mutually_exclusive_and_required() {
    let err = Cli::try_parse_from(["stackup", "--all", "--status"]).expect_err("conflict");
    assert_eq!(err.kind(), ErrorKind::ArgumentConflict);

    let err = Cli::try_parse_from(["stackup"]).expect_err("an action is required");
    assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);

    let err = Cli::try_parse_from(["stackup", "--all", "--force"]).expect_err("force needs component");
    assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);

    let err = Cli::try_parse_from(["stackup", "--all", "--mode", "turbo"]).expect_err("bad mode");
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
}

#[test]
fn parsed_flags_map_to_run_request() {
    let cli = Cli::try_parse_from(["stackup", "--component", "agent_a", "--force", "--mode", "fast"])
        .expect("must parse");
    assert_eq!(cli.mode, ModeArg::Fast);
    assert_eq!(cli.run_mode(), RunMode::Fast);
    assert_eq!(
        cli.selection(),
        RunScope::Component {
            name: "agent_a".to_string(),
            force: true
        }
    );

    let cli = Cli::try_parse_from(["stackup", "--phase", "agents", "--dry-run"]).expect("must parse");
    assert_eq!(cli.run_mode(), RunMode::DryRun);
    assert_eq!(cli.selection(), RunScope::Phase("agents".to_string()));

    let cli = Cli::try_parse_from(["stackup", "--status", "--json"]).expect("must parse");
    assert!(cli.action.status && cli.json);
}

#[test]
fn status_lines_point_at_resume_for_interrupted_runs() {
    let fixture = Fixture::new();
    fixture.layout.ensure_base_dirs().expect("must create dirs");
    let store = fixture.store();
    store
        .begin_run(RunMode::Standard, RunScope::All)
        .expect("must begin");
    store
        .set_component_status(
            "agent_a",
            ComponentStatus::InProgress,
            ComponentUpdate {
                from_version: Some("2.0.5".to_string()),
                to_version: Some("2.1.0".to_string()),
                ..ComponentUpdate::default()
            },
        )
        .expect("must record");

    let lines = format_status_lines(OutputStyle::Plain, &fixture.state(), None);
    assert!(lines[0].ends_with("in_progress (mode standard)"));
    assert_eq!(lines[1], "scope: all");
    assert!(lines.contains(&"  agent_a: in_progress 2.0.5 -> 2.1.0".to_string()));
    assert!(lines
        .iter()
        .any(|line| line.contains("resume with --resume")));

    let empty = format_status_lines(OutputStyle::Plain, &StateDocument::default(), None);
    assert_eq!(empty, vec!["No runs recorded".to_string()]);
}

#[test]
fn run_summary_flags_aborted_runs() {
    let fixture = Fixture::new();
    fixture.installer.mark_unhealthy("agent_a");
    let report = run_all(&fixture.orchestrator(), RunMode::Safe).expect("run must finish");

    let (status, message) = format_run_summary(&report);
    assert_eq!(status, "fail");
    assert!(message.ends_with("0 upgraded, 0 skipped, 1 failed (aborted)"));
}


fn resume_request() -> RunRequest {
    RunRequest {
        selection: RunScope::All,
        mode: RunMode::Standard,
        resume_only: true,
    }
}

#[test]
fn narrower_selection_cannot_take_over_an_interrupted_run() {
    let fixture = Fixture::new();
    fixture
        .installer
        .cancel_after_installing("agent_b", Arc::clone(&fixture.cancel));
    run_all(&fixture.orchestrator(), RunMode::Standard).expect_err("cancelled run must stop");
    fixture.cancel.store(false, Ordering::SeqCst);

    let central_db = RunScope::Component {
        name: "central_db".to_string(),
        force: false,
    };
    let err = fixture
        .orchestrator()
        .run(&request(central_db.clone(), RunMode::Standard), &mut SilentObserver)
        .expect_err("conflicting selection must be refused");
    assert_eq!(exit_code_for(&err), ExitCode::Validation);
    assert!(format!("{err:#}").contains("--resume"));

    let state = fixture.state();
    assert_eq!(state.status, RunStatus::InProgress);
    assert_eq!(state.scope, RunScope::All);
    assert_eq!(status_of(&state, "agent_b"), ComponentStatus::Pending);
    assert_eq!(fixture.version("central_db"), "3.0.0");

    // `--resume` ignores the requested selection and finishes the whole run.
    let report = fixture
        .orchestrator()
        .run(
            &RunRequest {
                selection: central_db,
                ..resume_request()
            },
            &mut SilentObserver,
        )
        .expect("resume must succeed");
    assert_eq!(report.components.len(), 4);
    assert!(matches!(outcome(&report, "agent_b"), Outcome::Upgraded { .. }));
    assert!(matches!(outcome(&report, "metrics_store"), Outcome::Upgraded { .. }));
    let state = fixture.state();
    assert_eq!(state.status, RunStatus::Completed);
    assert!(state
        .components
        .values()
        .all(|record| record.status == ComponentStatus::Completed));
}

#[test]
fn resume_keeps_the_phase_the_run_started_with() {
    let fixture = Fixture::new();
    fixture
        .installer
        .cancel_after_installing("agent_a", Arc::clone(&fixture.cancel));
    fixture
        .orchestrator()
        .run(
            &request(RunScope::Phase("agents".to_string()), RunMode::Standard),
            &mut SilentObserver,
        )
        .expect_err("cancelled run must stop");
    fixture.cancel.store(false, Ordering::SeqCst);

    let report = fixture
        .orchestrator()
        .run(&resume_request(), &mut SilentObserver)
        .expect("resume must succeed");

    let names: Vec<_> = report
        .components
        .iter()
        .map(|entry| entry.component.as_str())
        .collect();
    assert_eq!(names, vec!["agent_a", "agent_b"]);
    assert_eq!(fixture.version("agent_a"), "2.1.0");
    assert_eq!(fixture.version("central_db"), "3.0.0");
    assert_eq!(fixture.installer.install_calls("central_db"), 0);
    let state = fixture.state();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.scope, RunScope::Phase("agents".to_string()));
}

#[test]
fn resume_keeps_force_for_a_single_component_run() {
    let fixture = Fixture::new();
    fs::write(fixture.bin_dir.join("agent_a"), "2.1.0").expect("must seed");
    fixture
        .installer
        .cancel_after_installing("agent_a", Arc::clone(&fixture.cancel));
    let forced = RunScope::Component {
        name: "agent_a".to_string(),
        force: true,
    };
    fixture
        .orchestrator()
        .run(&request(forced, RunMode::Standard), &mut SilentObserver)
        .expect_err("cancelled run must stop");
    fixture.cancel.store(false, Ordering::SeqCst);

    let report = fixture
        .orchestrator()
        .run(&resume_request(), &mut SilentObserver)
        .expect("resume must succeed");

    assert_eq!(report.components.len(), 1);
    assert!(matches!(outcome(&report, "agent_a"), Outcome::Upgraded { .. }));
    assert_eq!(fixture.installer.install_calls("agent_a"), 2);
    assert_eq!(fixture.installer.install_calls("agent_b"), 0);
}

#[test]
fn rejected_install_fails_without_retries() {
    let fixture = Fixture::new();
    fixture
        .installer
        .fail_installs("agent_a", InstallFailure::Rejected);

    let report = run_all(&fixture.orchestrator(), RunMode::Standard).expect("run must finish");

    assert_eq!(fixture.installer.install_calls("agent_a"), 1);
    assert!(matches!(outcome(&report, "agent_a"), Outcome::Failed { .. }));
    assert_eq!(fixture.version("agent_a"), "2.0.5");
    assert!(fixture.services.running("agent_a"));
    assert!(matches!(outcome(&report, "agent_b"), Outcome::Upgraded { .. }));
    let state = fixture.state();
    assert!(state
        .component("agent_a")
        .and_then(|record| record.error.as_deref())
        .is_some_and(|error| error.starts_with("component 'agent_a' failed")));
}

#[test]
fn failures_are_classified_before_retrying() {
    let validation = anyhow::Error::from(UpgradeError::validation("version", "not semver"))
        .context("failed to install agent_a");
    assert_eq!(classify_failure(validation).class(), ErrorClass::Permanent);

    let integrity = anyhow::Error::from(UpgradeError::StateIntegrity("revision".to_string()));
    assert_eq!(classify_failure(integrity).class(), ErrorClass::Permanent);

    let missing = anyhow::Error::from(io::Error::new(io::ErrorKind::NotFound, "no script"))
        .context("failed to run installer");
    assert_eq!(classify_failure(missing).class(), ErrorClass::Permanent);

    let timed_out = anyhow::Error::from(io::Error::new(io::ErrorKind::TimedOut, "slow"));
    assert_eq!(classify_failure(timed_out).class(), ErrorClass::Transient);

    let no_answer = anyhow::Error::from(UpgradeError::Transient("no answer".to_string()));
    assert_eq!(classify_failure(no_answer).class(), ErrorClass::Transient);

    let exit_status = anyhow!("install exited with status 1");
    assert_eq!(classify_failure(exit_status).class(), ErrorClass::Transient);
}

#[test]
fn broken_install_is_retried_then_rolled_back() {
    let fixture = Fixture::new();
    fixture
        .installer
        .fail_installs("agent_a", InstallFailure::Broken);

    let report = run_all(&fixture.orchestrator(), RunMode::Standard).expect("run must finish");

    assert_eq!(fixture.installer.install_calls("agent_a"), 3);
    assert!(matches!(
        outcome(&report, "agent_a"),
        Outcome::Failed {
            partial_rollback: false,
            ..
        }
    ));
    assert_eq!(fixture.version("agent_a"), "2.0.5");
    assert!(fixture.services.running("agent_a"));
    assert_eq!(fixture.installer.health_checks("agent_a"), 0);
    assert_eq!(status_of(&fixture.state(), "agent_a"), ComponentStatus::Failed);
}

#[test]
fn failed_service_start_rolls_back_install() {
    let fixture = Fixture::new();
    fixture.services.refuse_starts("agent_a", 3);

    let report = run_all(&fixture.orchestrator(), RunMode::Standard).expect("run must finish");

    assert!(matches!(
        outcome(&report, "agent_a"),
        Outcome::Failed {
            partial_rollback: false,
            ..
        }
    ));
    assert_eq!(fixture.version("agent_a"), "2.0.5");
    assert!(fixture.services.running("agent_a"));
    assert_eq!(fixture.installer.health_checks("agent_a"), 0);
    let state = fixture.state();
    assert_eq!(status_of(&state, "agent_a"), ComponentStatus::Failed);
    assert!(state
        .component("agent_a")
        .and_then(|record| record.error.as_deref())
        .is_some_and(|error| error.contains("failed to start service agent_a")));
}

#[test]
fn hung_health_check_is_cut_off_at_the_attempt_timeout() {
    let fixture = Fixture::new();
    fixture
        .installer
        .hang_health_checks("agent_a", Duration::from_secs(3));
    let orchestrator = fixture.orchestrator_with(Settings {
        attempt_timeout_secs: 1,
        health_check_deadline_secs: 1,
        ..quick_settings()
    });
    let agent_a = RunScope::Component {
        name: "agent_a".to_string(),
        force: false,
    };

    let started = Instant::now();
    let report = orchestrator
        .run(&request(agent_a, RunMode::Standard), &mut SilentObserver)
        .expect("run must finish");

    assert!(started.elapsed() < Duration::from_millis(2500));
    assert!(matches!(outcome(&report, "agent_a"), Outcome::Failed { .. }));
    assert_eq!(fixture.version("agent_a"), "2.0.5");
    assert!(fixture.services.running("agent_a"));
    assert_eq!(fixture.state().status, RunStatus::Failed);
}
