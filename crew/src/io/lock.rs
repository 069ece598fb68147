//! Cross-process mutual exclusion over a single lock file.
//!
//! A lock is an exclusively created file containing `{pid, timestamp}`.
//! Contention is reported as `None` rather than an error; only genuine I/O
//! failures (unreadable directory, permission problems) propagate. A lock
//! whose owning process is dead *and* whose file is older than the stale
//! threshold is reaped by the next acquirer. Neither condition alone is
//! enough: a live process may hold a lock for a long time, and PIDs recycle.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Tuning knobs for [`acquire`].
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Total time to keep retrying before giving up. Zero means one attempt.
    pub timeout: Duration,
    /// Sleep between attempts while the lock is contended.
    pub retry_delay: Duration,
    /// Minimum file age before a dead-owner lock may be reaped.
    pub stale_lock_age: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        LockOptions {
            timeout: Duration::ZERO,
            retry_delay: Duration::from_millis(50),
            stale_lock_age: Duration::from_secs(30),
        }
    }
}

/// Contents of the lock file.
#[derive(Debug, Serialize, Deserialize)]
struct LockPayload {
    pid: i32,
    /// Epoch milliseconds at acquisition time.
    timestamp: i64,
}

/// Proof of a held lock. Consumed by [`release`]; there is no auto-release,
/// matching explicit acquire/release pairing at call sites.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Marker error for [`with_lock`] acquisition failure.
///
/// Callers downcast this to distinguish "the closure never ran" from "the
/// closure ran and failed".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTimeoutError {
    pub path: PathBuf,
}

impl std::fmt::Display for LockTimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timed out acquiring lock {}", self.path.display())
    }
}

impl std::error::Error for LockTimeoutError {}

/// Try to acquire the lock at `lock_path`, retrying up to `options.timeout`.
///
/// Returns `Ok(None)` when the lock stayed contended for the whole budget.
/// A second acquisition from the same PID contends like any foreign holder;
/// there is deliberately no re-entrancy.
pub fn acquire(lock_path: &Path, options: &LockOptions) -> Result<Option<LockHandle>> {
    let deadline = Instant::now() + options.timeout;
    loop {
        if try_create(lock_path)? {
            debug!(path = %lock_path.display(), "lock acquired");
            return Ok(Some(LockHandle {
                path: lock_path.to_path_buf(),
            }));
        }

        if reap_if_stale(lock_path, options.stale_lock_age)? {
            // Reaped: retry immediately, racing fairly with other acquirers.
            continue;
        }

        if Instant::now() >= deadline {
            debug!(path = %lock_path.display(), "lock acquisition timed out");
            return Ok(None);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        std::thread::sleep(options.retry_delay.min(remaining));
    }
}

/// Release a held lock, removing its file.
///
/// An already-missing file is not an error: the lock is gone either way.
pub fn release(handle: LockHandle) -> Result<()> {
    match fs::remove_file(&handle.path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!(path = %handle.path.display(), "lock file already removed");
            Ok(())
        }
        Err(err) => {
            Err(err).with_context(|| format!("remove lock file {}", handle.path.display()))
        }
    }
}

/// Run `f` while holding the lock, releasing on every exit path.
///
/// If acquisition fails within `options.timeout`, returns a
/// [`LockTimeoutError`] and `f` is never called.
pub fn with_lock<T>(
    lock_path: &Path,
    options: &LockOptions,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let handle = acquire(lock_path, options)?.ok_or_else(|| {
        anyhow::Error::new(LockTimeoutError {
            path: lock_path.to_path_buf(),
        })
    })?;
    let _guard = ReleaseOnDrop {
        path: handle.path.clone(),
    };
    f()
}

struct ReleaseOnDrop {
    path: PathBuf,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        // Unwind-safe release; a missing file means someone reaped us.
        let _ = fs::remove_file(&self.path);
    }
}

fn try_create(lock_path: &Path) -> Result<bool> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create lock directory {}", parent.display()))?;
    }
    let payload = LockPayload {
        pid: std::process::id() as i32,
        timestamp: Utc::now().timestamp_millis(),
    };
    let contents = serde_json::to_string(&payload)?;
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        Ok(mut file) => {
            file.write_all(contents.as_bytes())
                .with_context(|| format!("write lock payload {}", lock_path.display()))?;
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("create lock file {}", lock_path.display())),
    }
}

/// Delete the lock file if its owner is dead and the file is old enough.
/// Returns whether a reap happened.
fn reap_if_stale(lock_path: &Path, stale_lock_age: Duration) -> Result<bool> {
    let age = match lock_file_age(lock_path) {
        Some(age) => age,
        // Racing acquirer already took or reaped it; go around again.
        None => return Ok(true),
    };
    if age <= stale_lock_age {
        return Ok(false);
    }

    let owner_alive = match read_owner_pid(lock_path) {
        Some(pid) => pid_alive(pid),
        // Unreadable payload names no live owner to protect.
        None => false,
    };
    if owner_alive {
        return Ok(false);
    }

    match fs::remove_file(lock_path) {
        Ok(()) => {
            info!(path = %lock_path.display(), age_ms = age.as_millis() as u64, "reaped stale lock");
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(true),
        Err(err) => {
            Err(err).with_context(|| format!("reap stale lock {}", lock_path.display()))
        }
    }
}

fn lock_file_age(lock_path: &Path) -> Option<Duration> {
    let metadata = fs::metadata(lock_path).ok()?;
    let modified = metadata.modified().ok()?;
    modified.elapsed().ok()
}

fn read_owner_pid(lock_path: &Path) -> Option<i32> {
    let contents = fs::read_to_string(lock_path).ok()?;
    let payload: LockPayload = serde_json::from_str(&contents).ok()?;
    Some(payload.pid)
}

/// Signal-0 probe. `EPERM` still means the process exists.
fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}
