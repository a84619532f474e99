use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use semver::Version;
use stackup_core::{parse_strict_version, unix_now, validate_identifier, ComponentConfig, UpgradeError};
use stackup_retry::{Resilience, RetryPolicy};
use tracing::{debug, info, warn};

use crate::{CacheEntry, ReleaseSource, SourceLocation, StrategyRegistry, VersionCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOrigin {
    Resolved,
    Cached,
    Fallback,
}

impl ResolutionOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::Cached => "cached",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for ResolutionOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub version: Version,
    pub origin: ResolutionOrigin,
    pub strategy: String,
}

/// Turns a component's configured strategy into a concrete target version.
///
/// Upstream trouble never surfaces as an error: the configured fallback is
/// returned instead and flagged. Misconfiguration (unknown strategy, bad
/// pinned version, missing fallback) is a validation error.
pub struct VersionResolver {
    strategies: StrategyRegistry,
    source: Box<dyn ReleaseSource>,
    cache: Mutex<VersionCache>,
    resilience: Arc<Resilience>,
    policy: RetryPolicy,
}

impl VersionResolver {
    pub fn new(
        strategies: StrategyRegistry,
        source: Box<dyn ReleaseSource>,
        cache: VersionCache,
        resilience: Arc<Resilience>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            strategies,
            source,
            cache: Mutex::new(cache),
            resilience,
            policy,
        }
    }

    pub fn resolve(&self, component: &str, config: &ComponentConfig) -> Result<Resolution> {
        self.resolve_at(component, config, unix_now())
    }

    pub fn resolve_at(
        &self,
        component: &str,
        config: &ComponentConfig,
        now_unix: u64,
    ) -> Result<Resolution> {
        validate_identifier("component name", component)?;
        let strategy = self.strategies.get(&config.strategy).ok_or_else(|| {
            UpgradeError::validation(
                format!("components.{component}.strategy"),
                format!(
                    "unknown strategy '{}' (known: {})",
                    config.strategy,
                    self.strategies.names().collect::<Vec<_>>().join(", ")
                ),
            )
        })?;
        let argument = config.strategy_argument();

        if !strategy.needs_releases() {
            let version = strategy.select(component, argument, &[])?.ok_or_else(|| {
                UpgradeError::validation(
                    format!("components.{component}.strategy"),
                    format!("strategy '{}' produced no version", config.strategy),
                )
            })?;
            return Ok(Resolution {
                version,
                origin: ResolutionOrigin::Resolved,
                strategy: config.strategy.clone(),
            });
        }

        if let Some(entry) = self
            .cache
            .lock()
            .lookup(component, &config.strategy, argument, now_unix)
        {
            if let Ok(version) = Version::parse(&entry.version) {
                debug!(component, version = %version, "using cached resolution");
                return Ok(Resolution {
                    version,
                    origin: ResolutionOrigin::Cached,
                    strategy: config.strategy.clone(),
                });
            }
        }

        let raw_source = config.source.as_deref().ok_or_else(|| {
            UpgradeError::validation(
                format!("components.{component}.source"),
                format!("strategy '{}' requires a release source", config.strategy),
            )
        })?;
        let location = SourceLocation::parse(component, raw_source)?;
        let resource = location.resource_name();

        let listed = self.resilience.execute(&resource, &self.policy, |attempt| {
            self.source.list_releases(&location, attempt.timeout)
        });
        let releases = match listed {
            Ok(releases) => releases,
            Err(err) => {
                warn!(
                    component,
                    resource = %resource,
                    error = %err,
                    "release query failed, using fallback version"
                );
                return self.fallback(component, config);
            }
        };

        match strategy.select(component, argument, &releases)? {
            Some(version) => {
                info!(
                    component,
                    strategy = %config.strategy,
                    version = %version,
                    "resolved target version"
                );
                let mut cache = self.cache.lock();
                cache.store(CacheEntry {
                    component: component.to_string(),
                    strategy: config.strategy.clone(),
                    argument: argument.map(str::to_string),
                    version: version.to_string(),
                    resolved_at_unix: now_unix,
                });
                if let Err(err) = cache.persist() {
                    warn!(component, error = %format!("{err:#}"), "failed to persist version cache");
                }
                Ok(Resolution {
                    version,
                    origin: ResolutionOrigin::Resolved,
                    strategy: config.strategy.clone(),
                })
            }
            None => {
                warn!(
                    component,
                    strategy = %config.strategy,
                    releases = releases.len(),
                    "no upstream release satisfies strategy, using fallback version"
                );
                self.fallback(component, config)
            }
        }
    }

    fn fallback(&self, component: &str, config: &ComponentConfig) -> Result<Resolution> {
        let field = format!("components.{component}.fallback");
        let raw = config.fallback.as_deref().ok_or_else(|| {
            UpgradeError::validation(field.clone(), "no fallback version configured")
        })?;
        Ok(Resolution {
            version: parse_strict_version(&field, raw)?,
            origin: ResolutionOrigin::Fallback,
            strategy: config.strategy.clone(),
        })
    }
}
