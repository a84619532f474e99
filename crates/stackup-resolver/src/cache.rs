use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use stackup_core::write_json_atomic;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub component: String,
    pub strategy: String,
    #[serde(default)]
    pub argument: Option<String>,
    pub version: String,
    pub resolved_at_unix: u64,
}

impl CacheEntry {
    fn matches(&self, component: &str, strategy: &str, argument: Option<&str>) -> bool {
        self.component == component
            && self.strategy == strategy
            && self.argument.as_deref() == argument
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheDocument {
    #[serde(default)]
    entries: Vec<CacheEntry>,
}

/// Resolved versions persisted between runs, keyed by component, strategy
/// and strategy argument. Entries older than the TTL are ignored.
#[derive(Debug)]
pub struct VersionCache {
    path: Option<PathBuf>,
    ttl: Duration,
    entries: Vec<CacheEntry>,
}

impl VersionCache {
    pub fn in_memory(ttl: Duration) -> Self {
        Self {
            path: None,
            ttl,
            entries: Vec::new(),
        }
    }

    /// The cache is advisory: an unreadable document is logged and replaced.
    pub fn load(path: &Path, ttl: Duration) -> Self {
        let entries = match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<CacheDocument>(&raw) {
                Ok(document) => document.entries,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "discarding unreadable version cache");
                    Vec::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read version cache");
                Vec::new()
            }
        };
        Self {
            path: Some(path.to_path_buf()),
            ttl,
            entries,
        }
    }

    pub fn lookup(
        &self,
        component: &str,
        strategy: &str,
        argument: Option<&str>,
        now_unix: u64,
    ) -> Option<&CacheEntry> {
        self.entries.iter().find(|entry| {
            entry.matches(component, strategy, argument)
                && now_unix.saturating_sub(entry.resolved_at_unix) < self.ttl.as_secs()
        })
    }

    pub fn store(&mut self, entry: CacheEntry) {
        self.entries.retain(|existing| existing.component != entry.component);
        self.entries.push(entry);
        self.entries
            .sort_by(|left, right| left.component.cmp(&right.component));
    }

    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }

    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let document = CacheDocument {
            entries: self.entries.clone(),
        };
        write_json_atomic(path, &document)
            .with_context(|| format!("failed to persist version cache: {}", path.display()))
    }
}
