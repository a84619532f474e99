use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use stackup_core::{unix_now, validate_identifier, UpgradeError};
use tracing::{debug, info, warn};

use crate::fs_utils::remove_file_if_exists;

/// A reclaim guard older than this belongs to a reclaimer that died between
/// taking the guard and releasing it.
const RECLAIM_GUARD_STALE_AFTER: Duration = Duration::from_secs(10);

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub acquired_at_unix: u64,
    pub token: String,
}

/// Filesystem mutual exclusion keyed by resource name.
///
/// A lock is a small JSON record hard-linked into place, so the lock path
/// either does not exist or holds a complete record. Records whose owner pid
/// is gone are stale and reclaimed under a second, short-lived guard lock.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    wait: Duration,
    poll: Duration,
}

enum TryLock {
    Acquired(LockGuard),
    Busy { owner_pid: u32 },
    Retry,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>, wait: Duration, poll: Duration) -> Self {
        Self {
            dir: dir.into(),
            wait,
            poll: poll.max(Duration::from_millis(1)),
        }
    }

    pub fn lock_path(&self, resource: &str) -> PathBuf {
        self.dir.join(format!("{resource}.lock"))
    }

    /// Polls until the lock is ours or the bounded wait runs out, in which
    /// case the error is `UpgradeError::LockBusy` naming the current owner.
    pub fn acquire(&self, resource: &str) -> Result<LockGuard> {
        validate_identifier("lock resource", resource)?;
        let deadline = Instant::now() + self.wait;
        loop {
            let owner_pid = match self.try_lock(resource)? {
                TryLock::Acquired(guard) => return Ok(guard),
                TryLock::Retry => continue,
                TryLock::Busy { owner_pid } => owner_pid,
            };
            let now = Instant::now();
            if now >= deadline {
                return Err(UpgradeError::LockBusy {
                    resource: resource.to_string(),
                    owner_pid,
                }
                .into());
            }
            thread::sleep(self.poll.min(deadline - now));
        }
    }

    /// Single non-blocking attempt; `None` when a live process holds it.
    pub fn try_acquire(&self, resource: &str) -> Result<Option<LockGuard>> {
        validate_identifier("lock resource", resource)?;
        loop {
            match self.try_lock(resource)? {
                TryLock::Acquired(guard) => return Ok(Some(guard)),
                TryLock::Busy { .. } => return Ok(None),
                TryLock::Retry => continue,
            }
        }
    }

    pub fn is_held(&self, resource: &str) -> Result<bool> {
        Ok(self
            .owner(resource)?
            .is_some_and(|record| process_alive(record.pid)))
    }

    pub fn owner(&self, resource: &str) -> Result<Option<LockRecord>> {
        validate_identifier("lock resource", resource)?;
        read_record(&self.lock_path(resource))
    }

    fn try_lock(&self, resource: &str) -> Result<TryLock> {
        let path = self.lock_path(resource);
        if let Some(guard) = create_lock(&path)? {
            return Ok(TryLock::Acquired(guard));
        }

        let existing = read_record(&path)?;
        match existing {
            Some(record) if process_alive(record.pid) => Ok(TryLock::Busy {
                owner_pid: record.pid,
            }),
            // Vanished between create and read; go around again.
            None if !path.exists() => Ok(TryLock::Retry),
            stale => {
                let observed_token = stale.as_ref().map(|record| record.token.clone());
                if self.reclaim(resource, &path, observed_token.as_deref())? {
                    Ok(TryLock::Retry)
                } else {
                    Ok(TryLock::Busy {
                        owner_pid: stale.map(|record| record.pid).unwrap_or_default(),
                    })
                }
            }
        }
    }

    /// Removes a stale primary lock while holding the reclaim guard, but only
    /// if the primary still carries the token we judged stale.
    fn reclaim(&self, resource: &str, path: &Path, observed_token: Option<&str>) -> Result<bool> {
        let guard_path = self.dir.join(format!("{resource}.reclaim"));
        let guard = match create_lock(&guard_path)? {
            Some(guard) => guard,
            None => {
                if guard_age(&guard_path).is_some_and(|age| age > RECLAIM_GUARD_STALE_AFTER) {
                    warn!(resource, "removing abandoned reclaim guard");
                    remove_file_if_exists(&guard_path).with_context(|| {
                        format!("failed to remove reclaim guard: {}", guard_path.display())
                    })?;
                }
                return Ok(false);
            }
        };

        let current = read_record(path)?;
        let unchanged = current.as_ref().map(|record| record.token.as_str()) == observed_token;
        let reclaimed = if unchanged && path.exists() {
            info!(
                resource,
                stale_pid = current.as_ref().map(|record| record.pid).unwrap_or_default(),
                "reclaiming stale lock"
            );
            remove_file_if_exists(path)
                .with_context(|| format!("failed to remove stale lock: {}", path.display()))?;
            true
        } else {
            false
        };
        guard.release()?;
        Ok(reclaimed)
    }
}

/// Held lock; released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    token: String,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        release_path(&self.path, &self.token)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = release_path(&self.path, &self.token) {
                warn!(path = %self.path.display(), error = %format!("{err:#}"), "failed to release lock");
            }
        }
    }
}

fn release_path(path: &Path, token: &str) -> Result<()> {
    match read_record(path)? {
        Some(record) if record.token == token => {
            remove_file_if_exists(path)
                .with_context(|| format!("failed to remove lock: {}", path.display()))?;
            debug!(path = %path.display(), "released lock");
        }
        Some(record) => warn!(
            path = %path.display(),
            owner_pid = record.pid,
            "lock was taken over by another owner; leaving it in place"
        ),
        None => {}
    }
    Ok(())
}

/// Atomic create-if-absent: the record is written in full to a private temp
/// file and hard-linked onto the lock path, which fails if it already exists.
fn create_lock(path: &Path) -> Result<Option<LockGuard>> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let record = LockRecord {
        pid: std::process::id(),
        acquired_at_unix: unix_now(),
        token: next_token(),
    };
    let temp_path = parent.join(format!(".lock-{}", record.token));
    let write_result = (|| -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .with_context(|| format!("failed to create {}", temp_path.display()))?;
        let body = serde_json::to_vec(&record).context("failed to encode lock record")?;
        file.write_all(&body)
            .with_context(|| format!("failed to write {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", temp_path.display()))?;
        Ok(())
    })();
    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    let linked = fs::hard_link(&temp_path, path);
    let _ = fs::remove_file(&temp_path);
    match linked {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to create lock: {}", path.display()));
        }
    }

    // Double check: the record on disk must be ours.
    match read_record(path)? {
        Some(on_disk) if on_disk.token == record.token => Ok(Some(LockGuard {
            path: path.to_path_buf(),
            token: record.token,
            released: false,
        })),
        _ => Ok(None),
    }
}

fn read_record(path: &Path) -> Result<Option<LockRecord>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read lock: {}", path.display()));
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(record) => Ok(Some(record)),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable lock record treated as stale");
            Ok(Some(LockRecord {
                pid: 0,
                acquired_at_unix: 0,
                token: String::from_utf8_lossy(&raw).into_owned(),
            }))
        }
    }
}

fn guard_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|meta| meta.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn next_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let count = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{nanos}-{count}", std::process::id())
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    pid != 0
}
