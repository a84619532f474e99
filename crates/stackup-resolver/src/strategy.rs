use std::collections::BTreeMap;

use anyhow::Result;
use semver::Version;
use stackup_core::{parse_strict_version, parse_version_range, validate_identifier, UpgradeError};

use crate::Release;

/// A named rule that turns configuration plus an upstream release list into
/// one concrete version.
///
/// `Ok(None)` means nothing upstream qualified; the resolver then falls back.
/// `Err` is reserved for misconfiguration and is never softened.
pub trait ResolutionStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Strategies that only read configuration skip the upstream query and
    /// the cache entirely.
    fn needs_releases(&self) -> bool {
        true
    }

    fn select(
        &self,
        component: &str,
        argument: Option<&str>,
        releases: &[Release],
    ) -> Result<Option<Version>>;
}

pub struct PinnedStrategy;

impl ResolutionStrategy for PinnedStrategy {
    fn name(&self) -> &str {
        "pinned"
    }

    fn needs_releases(&self) -> bool {
        false
    }

    fn select(
        &self,
        component: &str,
        argument: Option<&str>,
        _releases: &[Release],
    ) -> Result<Option<Version>> {
        let field = format!("components.{component}.version");
        let raw = argument.ok_or_else(|| {
            UpgradeError::validation(field.clone(), "pinned strategy requires a version")
        })?;
        parse_strict_version(&field, raw).map(Some)
    }
}

pub struct LatestStrategy;

impl ResolutionStrategy for LatestStrategy {
    fn name(&self) -> &str {
        "latest"
    }

    fn select(
        &self,
        _component: &str,
        _argument: Option<&str>,
        releases: &[Release],
    ) -> Result<Option<Version>> {
        Ok(highest(releases.iter().filter(|release| release.is_stable())))
    }
}

pub struct RangeStrategy;

impl ResolutionStrategy for RangeStrategy {
    fn name(&self) -> &str {
        "range"
    }

    fn select(
        &self,
        component: &str,
        argument: Option<&str>,
        releases: &[Release],
    ) -> Result<Option<Version>> {
        let field = format!("components.{component}.range");
        let raw = argument.ok_or_else(|| {
            UpgradeError::validation(field.clone(), "range strategy requires a range")
        })?;
        let requirement = parse_version_range(&field, raw)?;
        Ok(highest(
            releases
                .iter()
                .filter(|release| !release.prerelease && requirement.matches(&release.version)),
        ))
    }
}

pub struct LtsStrategy;

impl ResolutionStrategy for LtsStrategy {
    fn name(&self) -> &str {
        "lts"
    }

    fn select(
        &self,
        _component: &str,
        _argument: Option<&str>,
        releases: &[Release],
    ) -> Result<Option<Version>> {
        Ok(highest(
            releases
                .iter()
                .filter(|release| release.lts && release.is_stable()),
        ))
    }
}

fn highest<'a>(releases: impl Iterator<Item = &'a Release>) -> Option<Version> {
    releases
        .map(|release| &release.version)
        .max()
        .cloned()
}

/// Strategies keyed by the name used in the versions document.
pub struct StrategyRegistry {
    strategies: BTreeMap<String, Box<dyn ResolutionStrategy>>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            strategies: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        for strategy in [
            Box::new(PinnedStrategy) as Box<dyn ResolutionStrategy>,
            Box::new(LatestStrategy),
            Box::new(RangeStrategy),
            Box::new(LtsStrategy),
        ] {
            registry.strategies.insert(strategy.name().to_string(), strategy);
        }
        registry
    }

    /// Adds or replaces a strategy under its own name.
    pub fn register(&mut self, strategy: Box<dyn ResolutionStrategy>) -> Result<()> {
        validate_identifier("strategy name", strategy.name())?;
        self.strategies.insert(strategy.name().to_string(), strategy);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn ResolutionStrategy> {
        self.strategies.get(name).map(|strategy| strategy.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.strategies.keys().map(String::as_str)
    }
}
