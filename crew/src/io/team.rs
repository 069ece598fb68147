//! On-disk team layout: canonical paths, scaffolding, sentinel files, and
//! the TTL-bounded shutdown signal.
//!
//! Every coordination channel here is a single-writer, single-topic file
//! (ready, done, heartbeat, inbox, shutdown ack). That invariant is what
//! makes the orchestrator's lock-free fan-in safe; do not replace these
//! files with a shared socket or queue without re-deriving it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::{DoneSignal, LaunchMode};

/// All canonical paths within a team root directory.
#[derive(Debug, Clone)]
pub struct TeamPaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub shutdown_signal_path: PathBuf,
    pub tasks_dir: PathBuf,
    pub workers_dir: PathBuf,
}

impl TeamPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_path: root.join("config.json"),
            shutdown_signal_path: root.join("shutdown.signal"),
            tasks_dir: root.join("tasks"),
            workers_dir: root.join("workers"),
            root,
        }
    }

    pub fn worker(&self, name: &str) -> WorkerPaths {
        WorkerPaths::new(&self.workers_dir, name)
    }
}

/// Per-worker file channels under `{team_root}/workers/{name}/`.
#[derive(Debug, Clone)]
pub struct WorkerPaths {
    pub dir: PathBuf,
    /// Touched periodically by the worker while it is making progress.
    pub heartbeat_path: PathBuf,
    /// Full instruction text, written by the orchestrator at spawn time.
    pub inbox_path: PathBuf,
    /// Free-form worker output log.
    pub outbox_path: PathBuf,
    /// Zero-content sentinel: the worker attached and began executing.
    pub ready_path: PathBuf,
    /// Structured completion payload, the worker's only return channel.
    pub done_path: PathBuf,
    /// Zero-content sentinel acknowledging a shutdown signal.
    pub shutdown_ack_path: PathBuf,
    /// Append-only log of orchestrator-to-worker messages.
    pub mailbox_path: PathBuf,
}

impl WorkerPaths {
    fn new(workers_dir: &Path, name: &str) -> Self {
        let dir = workers_dir.join(name);
        Self {
            heartbeat_path: dir.join("heartbeat"),
            inbox_path: dir.join("inbox.md"),
            outbox_path: dir.join("outbox.log"),
            ready_path: dir.join("ready"),
            done_path: dir.join("done.json"),
            shutdown_ack_path: dir.join("shutdown.ack"),
            mailbox_path: dir.join("mailbox.log"),
            dir,
        }
    }
}

/// One agent binary the team knows how to launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    pub binary: String,
    pub launch: LaunchMode,
    /// Pattern matched against captured pane text to detect readiness
    /// (interactive mode only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_pattern: Option<String>,
    /// Extra environment for the startup command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<(String, String)>,
}

/// Team configuration persisted at `{team_root}/config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamConfig {
    pub name: String,
    /// Multiplexer window the team's panes attach to.
    pub window: String,
    pub agents: Vec<AgentProfile>,
    /// User-extensible additions to the trusted binary prefixes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trusted_path_additions: Vec<PathBuf>,
    #[serde(default = "default_max_fix_attempts")]
    pub max_fix_attempts: u32,
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    #[serde(default = "default_done_poll_ms")]
    pub done_poll_ms: u64,
}

fn default_max_fix_attempts() -> u32 {
    3
}

fn default_ready_timeout_ms() -> u64 {
    15_000
}

fn default_done_poll_ms() -> u64 {
    500
}

/// Shutdown signal payload. A reader must ignore the signal once
/// `expires_at` has passed: a very old cancellation must never fire late.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownSignal {
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Create the team scaffolding and persist its config.
pub fn init_team(team_root: &Path, config: &TeamConfig) -> Result<TeamPaths> {
    let paths = TeamPaths::new(team_root);
    if paths.root.exists() && !paths.root.is_dir() {
        return Err(anyhow!(
            "team root {} exists but is not a directory",
            paths.root.display()
        ));
    }
    fs::create_dir_all(&paths.tasks_dir)
        .with_context(|| format!("create tasks dir {}", paths.tasks_dir.display()))?;
    fs::create_dir_all(&paths.workers_dir)
        .with_context(|| format!("create workers dir {}", paths.workers_dir.display()))?;
    write_json(&paths.config_path, config)?;
    debug!(team = %config.name, root = %paths.root.display(), "team initialized");
    Ok(paths)
}

/// Load the team config back from disk.
pub fn load_team_config(paths: &TeamPaths) -> Result<TeamConfig> {
    let contents = fs::read_to_string(&paths.config_path)
        .with_context(|| format!("read team config {}", paths.config_path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("parse team config {}", paths.config_path.display()))
}

/// Create a worker's directory and empty channel files.
pub fn init_worker_dir(paths: &TeamPaths, name: &str) -> Result<WorkerPaths> {
    let worker = paths.worker(name);
    fs::create_dir_all(&worker.dir)
        .with_context(|| format!("create worker dir {}", worker.dir.display()))?;
    for path in [&worker.outbox_path, &worker.mailbox_path] {
        if !path.exists() {
            fs::write(path, "").with_context(|| format!("create {}", path.display()))?;
        }
    }
    Ok(worker)
}

/// Destroy the team root on explicit teardown.
pub fn teardown_team(team_root: &Path) -> Result<()> {
    match fs::remove_dir_all(team_root) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove team root {}", team_root.display())),
    }
}

/// Write a cooperative shutdown signal valid for `ttl`.
pub fn request_shutdown(paths: &TeamPaths, ttl: Duration) -> Result<ShutdownSignal> {
    let now = Utc::now();
    let signal = ShutdownSignal {
        requested_at: now,
        expires_at: now
            + chrono::Duration::from_std(ttl).context("shutdown ttl out of range")?,
    };
    write_json(&paths.shutdown_signal_path, &signal)?;
    debug!(expires_at = %signal.expires_at, "shutdown requested");
    Ok(signal)
}

/// Whether an unexpired shutdown signal is present.
///
/// Missing, unparseable, and expired signals all read as "not requested";
/// an expired signal is stale and must not fire late.
pub fn shutdown_requested(paths: &TeamPaths) -> bool {
    let contents = match fs::read_to_string(&paths.shutdown_signal_path) {
        Ok(contents) => contents,
        Err(_) => return false,
    };
    let signal: ShutdownSignal = match serde_json::from_str(&contents) {
        Ok(signal) => signal,
        Err(err) => {
            warn!(err = %err, "unparseable shutdown signal ignored");
            return false;
        }
    };
    Utc::now() < signal.expires_at
}

/// Worker-side acknowledgement of an observed shutdown signal.
pub fn acknowledge_shutdown(worker: &WorkerPaths) -> Result<()> {
    fs::write(&worker.shutdown_ack_path, "")
        .with_context(|| format!("write {}", worker.shutdown_ack_path.display()))
}

pub fn shutdown_acknowledged(worker: &WorkerPaths) -> bool {
    worker.shutdown_ack_path.exists()
}

/// The ready sentinel's existence is the signal; content is irrelevant.
pub fn worker_ready(worker: &WorkerPaths) -> bool {
    worker.ready_path.exists()
}

/// Worker-side helper to create the ready sentinel.
pub fn mark_worker_ready(worker: &WorkerPaths) -> Result<()> {
    fs::write(&worker.ready_path, "")
        .with_context(|| format!("write {}", worker.ready_path.display()))
}

/// Read the done signal if the worker has produced one.
///
/// A present-but-unparseable file reads as `None`: the worker may still be
/// mid-write, and the poller will come back.
pub fn read_done_signal(worker: &WorkerPaths) -> Option<DoneSignal> {
    let contents = fs::read_to_string(&worker.done_path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(signal) => Some(signal),
        Err(err) => {
            warn!(path = %worker.done_path.display(), err = %err, "done signal not yet parseable");
            None
        }
    }
}

/// Worker-side helper to publish the done signal.
pub fn write_done_signal(worker: &WorkerPaths, signal: &DoneSignal) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(signal)?;
    buf.push('\n');
    fs::write(&worker.done_path, buf)
        .with_context(|| format!("write {}", worker.done_path.display()))
}

/// Update the worker heartbeat to "now".
pub fn touch_heartbeat(worker: &WorkerPaths) -> Result<()> {
    fs::write(&worker.heartbeat_path, Utc::now().to_rfc3339())
        .with_context(|| format!("write {}", worker.heartbeat_path.display()))
}

/// Time since the last heartbeat, if one exists.
pub fn heartbeat_age(worker: &WorkerPaths) -> Option<Duration> {
    let metadata = fs::metadata(&worker.heartbeat_path).ok()?;
    metadata.modified().ok()?.elapsed().ok()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &buf).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
