use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Paths under the state root. Every name joined here has already passed
/// identifier validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir().join("state.json")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn lock_path(&self, resource: &str) -> PathBuf {
        self.locks_dir().join(format!("{resource}.lock"))
    }

    pub fn transactions_dir(&self) -> PathBuf {
        self.root.join("transactions")
    }

    pub fn transaction_path(&self, txid: &str) -> PathBuf {
        self.transactions_dir().join(format!("{txid}.json"))
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn component_backups_dir(&self, component: &str) -> PathBuf {
        self.backups_dir().join(component)
    }

    pub fn transaction_backup_dir(&self, component: &str, txid: &str) -> PathBuf {
        self.component_backups_dir(component).join(txid)
    }

    pub fn backup_manifest_path(&self, component: &str, txid: &str) -> PathBuf {
        self.transaction_backup_dir(component, txid)
            .join("manifest.json")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn version_cache_path(&self) -> PathBuf {
        self.cache_dir().join("versions.json")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.state_dir(),
            self.locks_dir(),
            self.transactions_dir(),
            self.backups_dir(),
            self.cache_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_state_root() -> Result<PathBuf> {
    if running_as_root() {
        return Ok(PathBuf::from("/var/lib/stackup"));
    }
    let home = std::env::var("HOME").context("HOME is not set; cannot resolve state root")?;
    Ok(PathBuf::from(home).join(".stackup"))
}

#[cfg(unix)]
fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}
