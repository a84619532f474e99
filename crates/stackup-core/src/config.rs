use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{parse_strict_version, parse_version_range, validate_identifier, UpgradeError};

pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub strategy: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub range: Option<String>,
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub managed_paths: Vec<PathBuf>,
}

impl ComponentConfig {
    /// Argument handed to the resolution strategy; also part of the cache key.
    pub fn strategy_argument(&self) -> Option<&str> {
        match self.strategy.as_str() {
            "pinned" => self.version.as_deref(),
            "range" => self.range.as_deref(),
            _ => self.range.as_deref().or(self.version.as_deref()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverSection {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for ResolverSection {
    fn default() -> Self {
        Self {
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionsDocument {
    #[serde(default)]
    pub resolver: ResolverSection,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentConfig>,
}

impl VersionsDocument {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let document: Self = parse_toml("versions", input)?;
        document.validate()?;
        Ok(document)
    }

    pub fn component(&self, name: &str) -> Option<&ComponentConfig> {
        self.components.get(name)
    }

    fn validate(&self) -> Result<()> {
        for (name, component) in &self.components {
            validate_identifier("component name", name)?;
            validate_identifier(&format!("components.{name}.strategy"), &component.strategy)?;
            if let Some(service) = &component.service {
                validate_identifier(&format!("components.{name}.service"), service)?;
            }

            match component.strategy.as_str() {
                "pinned" => {
                    let version = component.version.as_deref().ok_or_else(|| {
                        UpgradeError::validation(
                            format!("components.{name}.version"),
                            "pinned strategy requires a version",
                        )
                    })?;
                    parse_strict_version(&format!("components.{name}.version"), version)?;
                }
                "range" => {
                    let range = component.range.as_deref().ok_or_else(|| {
                        UpgradeError::validation(
                            format!("components.{name}.range"),
                            "range strategy requires a range",
                        )
                    })?;
                    parse_version_range(&format!("components.{name}.range"), range)?;
                }
                _ => {}
            }

            if component.strategy != "pinned" && component.fallback.is_none() {
                return Err(UpgradeError::validation(
                    format!("components.{name}.fallback"),
                    format!("strategy '{}' requires a fallback version", component.strategy),
                )
                .into());
            }
            if let Some(fallback) = &component.fallback {
                parse_strict_version(&format!("components.{name}.fallback"), fallback)?;
            }

            for path in &component.managed_paths {
                if !path.is_absolute() {
                    return Err(UpgradeError::validation(
                        format!("components.{name}.managed_paths"),
                        format!("'{}' must be an absolute path", path.display()),
                    )
                    .into());
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Continue,
    Abort,
}

impl FailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Abort => "abort",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    #[serde(default)]
    pub risk: RiskTier,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default)]
    pub components: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PhasesDocument {
    #[serde(default)]
    pub phases: Vec<PhaseConfig>,
}

impl PhasesDocument {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let document: Self = parse_toml("phases", input)?;
        document.validate()?;
        Ok(document)
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseConfig> {
        self.phases.iter().find(|phase| phase.name == name)
    }

    pub fn phase_of(&self, component: &str) -> Option<&PhaseConfig> {
        self.phases
            .iter()
            .find(|phase| phase.components.iter().any(|name| name == component))
    }

    fn validate(&self) -> Result<()> {
        let mut phase_names = BTreeSet::new();
        let mut seen_components = BTreeSet::new();
        for phase in &self.phases {
            validate_identifier("phase name", &phase.name)?;
            if !phase_names.insert(phase.name.as_str()) {
                return Err(UpgradeError::validation(
                    "phases",
                    format!("phase '{}' is declared twice", phase.name),
                )
                .into());
            }
            for component in &phase.components {
                validate_identifier(&format!("phases.{}.components", phase.name), component)?;
                if !seen_components.insert(component.as_str()) {
                    return Err(UpgradeError::validation(
                        format!("phases.{}.components", phase.name),
                        format!("component '{component}' appears in more than one phase"),
                    )
                    .into());
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub lock_wait_secs: u64,
    pub lock_poll_millis: u64,
    pub retry_max_attempts: u32,
    pub retry_initial_delay_millis: u64,
    pub retry_max_delay_millis: u64,
    pub attempt_timeout_secs: u64,
    pub health_check_attempts: u32,
    pub health_check_interval_millis: u64,
    pub health_check_deadline_secs: u64,
    pub breaker_threshold: u32,
    pub breaker_window_secs: u64,
    pub breaker_cooldown_secs: u64,
    pub backup_retention_days: u64,
    pub history_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            lock_wait_secs: 30,
            lock_poll_millis: 100,
            retry_max_attempts: 3,
            retry_initial_delay_millis: 500,
            retry_max_delay_millis: 10_000,
            attempt_timeout_secs: 30,
            health_check_attempts: 3,
            health_check_interval_millis: 2_000,
            health_check_deadline_secs: 120,
            breaker_threshold: 5,
            breaker_window_secs: 60,
            breaker_cooldown_secs: 30,
            backup_retention_days: 7,
            history_limit: 50,
        }
    }
}

impl Settings {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let settings: Self = parse_toml("settings", input)?;
        if settings.retry_max_attempts == 0 {
            return Err(UpgradeError::validation("retry_max_attempts", "must be at least 1").into());
        }
        if settings.health_check_attempts == 0 {
            return Err(
                UpgradeError::validation("health_check_attempts", "must be at least 1").into(),
            );
        }
        if settings.breaker_threshold == 0 {
            return Err(UpgradeError::validation("breaker_threshold", "must be at least 1").into());
        }
        Ok(settings)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.lock_poll_millis)
    }

    pub fn backup_retention(&self) -> Duration {
        Duration::from_secs(self.backup_retention_days * 24 * 60 * 60)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    pub versions: PathBuf,
    pub phases: PathBuf,
    pub settings: Option<PathBuf>,
}

impl ConfigPaths {
    pub fn under(config_dir: &Path) -> Self {
        Self {
            versions: config_dir.join("versions.toml"),
            phases: config_dir.join("phases.toml"),
            settings: Some(config_dir.join("settings.toml")),
        }
    }
}

/// Versions, phases and settings loaded wholesale before planning begins.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigBundle {
    pub versions: VersionsDocument,
    pub phases: PhasesDocument,
    pub settings: Settings,
}

impl ConfigBundle {
    pub fn new(versions: VersionsDocument, phases: PhasesDocument, settings: Settings) -> Result<Self> {
        let bundle = Self {
            versions,
            phases,
            settings,
        };
        bundle.validate_cross_references()?;
        Ok(bundle)
    }

    pub fn load(paths: &ConfigPaths) -> Result<Self> {
        let versions = VersionsDocument::from_toml_str(&read_config(&paths.versions)?)
            .with_context(|| format!("invalid versions document: {}", paths.versions.display()))?;
        let phases = PhasesDocument::from_toml_str(&read_config(&paths.phases)?)
            .with_context(|| format!("invalid phases document: {}", paths.phases.display()))?;
        let settings = match &paths.settings {
            Some(path) if path.exists() => Settings::from_toml_str(&read_config(path)?)
                .with_context(|| format!("invalid settings document: {}", path.display()))?,
            _ => Settings::default(),
        };
        Self::new(versions, phases, settings)
    }

    fn validate_cross_references(&self) -> Result<()> {
        for phase in &self.phases.phases {
            for component in &phase.components {
                if self.versions.component(component).is_none() {
                    return Err(UpgradeError::validation(
                        format!("phases.{}.components", phase.name),
                        format!("component '{component}' has no entry in the versions document"),
                    )
                    .into());
                }
            }
        }
        Ok(())
    }
}

fn parse_toml<T: serde::de::DeserializeOwned>(document: &str, input: &str) -> Result<T> {
    toml::from_str(input).map_err(|err| {
        anyhow::Error::new(UpgradeError::validation(
            document,
            format!("failed to parse {document} document: {err}"),
        ))
    })
}

fn read_config(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|err| {
        anyhow::Error::new(UpgradeError::validation(
            "config",
            format!("cannot read {}: {err}", path.display()),
        ))
    })
}
