use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, ValueEnum};
use stackup_core::{ConfigBundle, ConfigPaths, ExitCode, RunMode, Settings};
use stackup_installer::{default_state_root, RunScope, ScriptInstaller, StateLayout, SystemdServices};
use stackup_resolver::{StrategyRegistry, UpstreamSources, VersionCache, VersionResolver};
use stackup_retry::{BreakerConfig, Resilience, RetryPolicy};
use tracing::warn;

use crate::command_flows::{run_resume_command, run_rollback_command, run_status_command, run_upgrade_command};
use crate::logging::LogFormat;
use crate::orchestrator::{Collaborators, Orchestrator, RunRequest};
use crate::render::TerminalRenderer;

#[derive(Parser, Debug)]
#[command(name = "stackup")]
#[command(
    about = "Host-local upgrade orchestrator for agents and the central metrics stack",
    long_about = None,
    version
)]
pub(crate) struct Cli {
    /// State root (default: /var/lib/stackup as root, otherwise ~/.stackup)
    #[arg(long, env = "STACKUP_ROOT", global = true)]
    pub(crate) root: Option<PathBuf>,

    /// Versions document (default: <root>/config/versions.toml)
    #[arg(long, value_name = "PATH")]
    pub(crate) versions: Option<PathBuf>,

    /// Phases document (default: <root>/config/phases.toml)
    #[arg(long, value_name = "PATH")]
    pub(crate) phases: Option<PathBuf>,

    /// Settings document (default: <root>/config/settings.toml, optional)
    #[arg(long, value_name = "PATH")]
    pub(crate) settings: Option<PathBuf>,

    /// Directory of per-component installer scripts (default: <root>/installers)
    #[arg(long, value_name = "DIR")]
    pub(crate) scripts_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ModeArg::Standard)]
    pub(crate) mode: ModeArg,

    /// Resolve and compare versions without changing anything
    #[arg(long)]
    pub(crate) dry_run: bool,

    /// Re-apply even when the installed version already matches
    #[arg(long, requires = "component")]
    pub(crate) force: bool,

    /// Print the raw state document (with --status)
    #[arg(long, requires = "status")]
    pub(crate) json: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub(crate) log_format: LogFormat,

    #[command(flatten)]
    pub(crate) action: ActionArgs,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub(crate) struct ActionArgs {
    /// Show the current run, per-component status and recent history
    #[arg(long)]
    pub(crate) status: bool,

    /// Upgrade every component, phase by phase
    #[arg(long)]
    pub(crate) all: bool,

    /// Upgrade only the components of one phase
    #[arg(long, value_name = "NAME")]
    pub(crate) phase: Option<String>,

    /// Upgrade a single component
    #[arg(long, value_name = "NAME")]
    pub(crate) component: Option<String>,

    /// Revert every component completed by the current run
    #[arg(long)]
    pub(crate) rollback: bool,

    /// Continue an interrupted run
    #[arg(long)]
    pub(crate) resume: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum ModeArg {
    Safe,
    Standard,
    Fast,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Safe => RunMode::Safe,
            ModeArg::Standard => RunMode::Standard,
            ModeArg::Fast => RunMode::Fast,
        }
    }
}

impl Cli {
    pub(crate) fn run_mode(&self) -> RunMode {
        if self.dry_run {
            RunMode::DryRun
        } else {
            self.mode.into()
        }
    }

    pub(crate) fn selection(&self) -> RunScope {
        if let Some(phase) = &self.action.phase {
            return RunScope::Phase(phase.clone());
        }
        if let Some(component) = &self.action.component {
            return RunScope::Component {
                name: component.clone(),
                force: self.force,
            };
        }
        RunScope::All
    }

    fn config_paths(&self, layout: &StateLayout) -> ConfigPaths {
        let defaults = ConfigPaths::under(&layout.config_dir());
        ConfigPaths {
            versions: self.versions.clone().unwrap_or(defaults.versions),
            phases: self.phases.clone().unwrap_or(defaults.phases),
            settings: self.settings.clone().or(defaults.settings),
        }
    }
}

pub(crate) fn run_cli(cli: Cli) -> Result<ExitCode> {
    let root = match cli.root.clone() {
        Some(root) => root,
        None => default_state_root()?,
    };
    let layout = StateLayout::new(root);
    let renderer = TerminalRenderer::current();

    if cli.action.status {
        return run_status_command(&layout, cli.json, renderer);
    }

    let config = ConfigBundle::load(&cli.config_paths(&layout))?;
    let scripts_dir = cli
        .scripts_dir
        .clone()
        .unwrap_or_else(|| layout.root().join("installers"));
    let collaborators = default_collaborators(&layout, &config, scripts_dir)?;
    let cancel = install_cancel_handler()?;
    let orchestrator = Orchestrator::new(layout, config, collaborators, cancel);

    if cli.action.rollback {
        return run_rollback_command(&orchestrator, renderer);
    }

    let request = RunRequest {
        selection: cli.selection(),
        mode: cli.run_mode(),
        resume_only: cli.action.resume,
    };
    if request.resume_only {
        return run_resume_command(&orchestrator, &request, renderer);
    }
    run_upgrade_command(&orchestrator, &request, renderer)
}

fn default_collaborators(
    layout: &StateLayout,
    config: &ConfigBundle,
    scripts_dir: PathBuf,
) -> Result<Collaborators> {
    let settings = &config.settings;
    let resilience = Arc::new(Resilience::new(breaker_config(settings)));
    let cache = VersionCache::load(
        &layout.version_cache_path(),
        Duration::from_secs(config.versions.resolver.cache_ttl_secs),
    );
    let resolver = VersionResolver::new(
        StrategyRegistry::with_builtins(),
        Box::new(UpstreamSources::new()?),
        cache,
        Arc::clone(&resilience),
        resolver_policy(settings),
    );
    Ok(Collaborators {
        resolver,
        installer: Arc::new(ScriptInstaller::new(scripts_dir)),
        services: Arc::new(SystemdServices::default()),
        resilience,
    })
}

pub(crate) fn breaker_config(settings: &Settings) -> BreakerConfig {
    BreakerConfig {
        threshold: settings.breaker_threshold,
        window: Duration::from_secs(settings.breaker_window_secs),
        cooldown: Duration::from_secs(settings.breaker_cooldown_secs),
    }
}

pub(crate) fn resolver_policy(settings: &Settings) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(settings.retry_max_attempts)
        .with_initial_delay(Duration::from_millis(settings.retry_initial_delay_millis))
        .with_max_delay(Duration::from_millis(settings.retry_max_delay_millis))
        .with_attempt_timeout(Duration::from_secs(settings.attempt_timeout_secs))
}

/// SIGINT/SIGTERM only raise a flag; the orchestrator stops between steps,
/// rolls back the component in flight and leaves the run resumable.
fn install_cancel_handler() -> Result<Arc<AtomicBool>> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || {
        if !flag.swap(true, Ordering::SeqCst) {
            warn!("interrupt received; stopping after the current step");
        }
    })
    .context("failed to install signal handler")?;
    Ok(cancel)
}
