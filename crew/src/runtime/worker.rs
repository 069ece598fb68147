//! Worker lifecycle: spawn, instruct, monitor, and retire agent processes
//! attached to multiplexer panes.
//!
//! The orchestrator's only view of a worker is its pane text (unreliable,
//! human-oriented) and its sentinel files (authoritative). Spawning is
//! fail-open wherever blocking would stall the whole team: readiness
//! timeouts and untrusted binaries become advisories, and a spawn failure
//! in one worker never aborts the rest.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::core::pipeline::{MarkOutcome, Phase, PipelineState, mark_phase};
use crate::core::types::{Advisory, DoneStatus, LaunchMode, TaskStatus};
use crate::io::task_store::{Task, claim_task, finish_task, list_tasks};
use crate::io::team::{
    AgentProfile, TeamConfig, TeamPaths, WorkerPaths, init_worker_dir, read_done_signal,
    shutdown_requested,
};
use crate::mux::{Multiplexer, PaneId};
use crate::runtime::trust::{TrustPolicy, audit_binary};

/// First readiness poll interval; each retry grows by [`READY_BACKOFF`].
const READY_POLL_INITIAL: Duration = Duration::from_millis(200);
/// Progressive backoff multiplier; bounds total poll count well below a
/// fixed-interval scan for the same timeout.
const READY_BACKOFF: f64 = 1.5;
/// Pause between interrupt and resend during a delivery retry.
const INTERRUPT_RESEND_DELAY: Duration = Duration::from_millis(150);

/// Fallback prompt pattern when the agent profile does not supply one.
const DEFAULT_READY_PATTERN: &str = r"[$%>❯]\s*$";

/// Pane text suggesting the agent is mid-turn and not accepting input.
const BUSY_PATTERN: &str = r"(?i)esc to interrupt|working|thinking|\brunning\b";

/// Shared context for spawning and monitoring one team's workers.
pub struct WorkerRuntime {
    pub mux: Arc<dyn Multiplexer>,
    pub paths: TeamPaths,
    pub config: TeamConfig,
    pub trust: TrustPolicy,
    /// Working directory every worker pane starts in.
    pub workdir: PathBuf,
}

impl WorkerRuntime {
    pub fn new(
        mux: Arc<dyn Multiplexer>,
        paths: TeamPaths,
        config: TeamConfig,
        workdir: PathBuf,
    ) -> Self {
        let trust = TrustPolicy::with_additions(&config.trusted_path_additions);
        WorkerRuntime {
            mux,
            paths,
            config,
            trust,
            workdir,
        }
    }

    fn profile_for_task(&self, task_index: usize) -> Result<&AgentProfile> {
        if self.config.agents.is_empty() {
            return Err(anyhow!("team config declares no agent profiles"));
        }
        Ok(&self.config.agents[task_index % self.config.agents.len()])
    }
}

/// A spawned worker. The pane id is stable for the worker's lifetime.
#[derive(Debug, Clone)]
pub struct Worker {
    pub name: String,
    pub pane: PaneId,
    pub task_id: String,
    pub agent: String,
}

/// Result of a successful spawn, carrying any fail-open advisories.
#[derive(Debug)]
pub struct SpawnOutcome {
    pub worker: Worker,
    pub advisories: Vec<Advisory>,
}

/// Spawn one worker for the task at `task_index`.
///
/// Claims the task, scaffolds the worker directory, writes the inbox
/// instruction (always, in both launch modes, as the audit copy), audits
/// the agent binary, allocates a pane, and delivers the instruction per the
/// agent's launch mode.
#[instrument(skip_all, fields(worker = worker_name, task_index))]
pub fn spawn_worker_for_task(
    runtime: &WorkerRuntime,
    worker_name: &str,
    task_index: usize,
) -> Result<SpawnOutcome> {
    let tasks = list_tasks(&runtime.paths.root)?;
    let task = tasks
        .get(task_index)
        .ok_or_else(|| anyhow!("no task at index {task_index} ({} tasks)", tasks.len()))?;
    let task = claim_task(&runtime.paths.root, &task.id, worker_name)?;

    // The claim is on disk before the pane exists. If the launch dies the
    // task must not stay claimed by a worker that never ran; failing it
    // keeps the unit of work visible to the fan-in and fix loop.
    match launch_claimed_worker(runtime, worker_name, task_index, &task) {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            if let Err(finish_err) = finish_task(&runtime.paths.root, &task.id, TaskStatus::Failed)
            {
                warn!(task = %task.id, err = %finish_err, "could not fail orphaned claim");
            }
            Err(err)
        }
    }
}

fn launch_claimed_worker(
    runtime: &WorkerRuntime,
    worker_name: &str,
    task_index: usize,
    task: &Task,
) -> Result<SpawnOutcome> {
    let profile = runtime.profile_for_task(task_index)?;
    let worker_paths = init_worker_dir(&runtime.paths, worker_name)?;

    let instruction = compose_instruction(task, &worker_paths, &runtime.paths);
    fs::write(&worker_paths.inbox_path, &instruction)
        .with_context(|| format!("write inbox {}", worker_paths.inbox_path.display()))?;

    let mut advisories = Vec::new();
    let (resolved, trust_advisory) = audit_binary(&profile.binary, &runtime.trust)?;
    advisories.extend(trust_advisory);

    let command = startup_command(profile, &resolved.to_string_lossy(), &instruction);
    let pane = runtime
        .mux
        .split_pane(&runtime.config.window, &runtime.workdir, Some(&command))
        .with_context(|| format!("allocate pane for worker {worker_name}"))?;
    info!(pane = %pane, agent = %profile.name, task = %task.id, "worker pane created");

    if profile.launch == LaunchMode::Interactive {
        let timeout = Duration::from_millis(runtime.config.ready_timeout_ms);
        let pattern = ready_pattern(profile)?;
        let ready = poll_until_ready(
            runtime.mux.as_ref(),
            &pane,
            &pattern,
            timeout,
            READY_POLL_INITIAL,
        );
        if !ready {
            // Fail open: blocking team startup on one slow pane is worse
            // than a possibly-missed keystroke window.
            warn!(pane = %pane, timeout_ms = runtime.config.ready_timeout_ms,
                "pane never matched ready pattern; sending instruction anyway");
            advisories.push(Advisory::ReadinessTimeout {
                pane: pane.as_str().to_string(),
                timeout_ms: runtime.config.ready_timeout_ms,
            });
        }
        let message = inbox_message(&worker_paths);
        runtime.mux.send_literal(&pane, &message)?;
        runtime.mux.send_enter(&pane)?;
        append_mailbox(&worker_paths, &message)?;
    }

    Ok(SpawnOutcome {
        worker: Worker {
            name: worker_name.to_string(),
            pane,
            task_id: task.id.clone(),
            agent: profile.name.clone(),
        },
        advisories,
    })
}

/// Successful spawns and per-worker failures from one [`spawn_team`] call.
pub struct TeamSpawn {
    pub spawned: Vec<SpawnOutcome>,
    pub failures: Vec<(String, anyhow::Error)>,
}

/// Spawn workers for tasks `0..count`, isolating per-worker failures.
pub fn spawn_team(runtime: &WorkerRuntime, count: usize) -> TeamSpawn {
    let mut spawned = Vec::new();
    let mut failures = Vec::new();
    for index in 0..count {
        let name = format!("worker-{}", index + 1);
        match spawn_worker_for_task(runtime, &name, index) {
            Ok(outcome) => spawned.push(outcome),
            Err(err) => {
                warn!(worker = %name, err = %err, "worker spawn failed; continuing with the rest");
                failures.push((name, err));
            }
        }
    }
    TeamSpawn { spawned, failures }
}

/// Kill a worker's pane. Its files remain for post-mortem inspection.
pub fn retire_worker(runtime: &WorkerRuntime, worker: &Worker) -> Result<()> {
    runtime
        .mux
        .kill_pane(&worker.pane)
        .with_context(|| format!("kill pane {} for worker {}", worker.pane, worker.name))?;
    debug!(worker = %worker.name, pane = %worker.pane, "worker retired");
    Ok(())
}

/// Poll captured pane text against `ready` with progressive backoff.
///
/// Returns whether the pattern matched before `timeout`. Capture failures
/// are logged and treated as "not ready yet".
pub(crate) fn poll_until_ready(
    mux: &dyn Multiplexer,
    pane: &PaneId,
    ready: &Regex,
    timeout: Duration,
    initial_interval: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    let mut interval = initial_interval;
    loop {
        match mux.capture_pane(pane) {
            Ok(text) if ready.is_match(&text) => return true,
            Ok(_) => {}
            Err(err) => warn!(pane = %pane, err = %err, "capture failed during readiness poll"),
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(interval.min(deadline - now));
        interval = interval.mul_f64(READY_BACKOFF);
    }
}

/// At most one interrupt-and-resend attempt per delivered message.
#[derive(Debug, Default)]
pub struct DeliveryRetry {
    attempted: bool,
}

/// Best-effort recovery for a message that echoed into the prompt but was
/// never activated.
///
/// All four gates must hold: the pane looks busy, the message text is still
/// visible, the pane is not in copy/scroll mode, and no retry has been
/// attempted for this message. Failing any gate disables the retry, because
/// a mistimed interrupt can discard in-progress output. Returns whether a
/// resend happened.
pub fn retry_stuck_delivery(
    mux: &dyn Multiplexer,
    pane: &PaneId,
    message: &str,
    retry: &mut DeliveryRetry,
) -> Result<bool> {
    if retry.attempted {
        return Ok(false);
    }
    let capture = mux.capture_pane(pane)?;
    if !busy_pattern().is_match(&capture) || !capture.contains(message) {
        return Ok(false);
    }
    if mux.in_copy_mode(pane)? {
        return Ok(false);
    }

    info!(pane = %pane, "stuck delivery detected; interrupting and resending");
    // Marked before any keystroke goes out: a resend that fails after the
    // interrupt must not buy a second interrupt on the next call.
    retry.attempted = true;
    mux.send_interrupt(pane)?;
    std::thread::sleep(INTERRUPT_RESEND_DELAY);
    mux.send_literal(pane, message)?;
    mux.send_enter(pane)?;
    Ok(true)
}

/// Aggregate of a done-signal fan-in pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamFanIn {
    /// Workers whose done signal reported `completed`.
    pub completed: Vec<String>,
    /// Workers whose done signal reported `failed`.
    pub failed: Vec<String>,
    /// Workers that never signaled within the window (orphan candidates).
    pub pending: Vec<String>,
    /// An unexpired shutdown signal cut the wait short.
    pub shutdown: bool,
}

impl TeamFanIn {
    pub fn all_completed(&self) -> bool {
        !self.shutdown && self.failed.is_empty() && self.pending.is_empty()
    }
}

/// Poll every worker's done signal until all have signaled, a shutdown is
/// requested, or `timeout` elapses.
///
/// Completions arrive in no guaranteed order; each worker's sentinel file
/// is an independent single-writer channel, which is what makes this
/// lock-free fan-in safe.
#[instrument(skip_all, fields(workers = workers.len()))]
pub fn wait_for_done(
    paths: &TeamPaths,
    workers: &[Worker],
    poll: Duration,
    timeout: Duration,
) -> TeamFanIn {
    let deadline = Instant::now() + timeout;
    loop {
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut pending = Vec::new();
        for worker in workers {
            let worker_paths = paths.worker(&worker.name);
            match read_done_signal(&worker_paths) {
                Some(signal) => match signal.status {
                    DoneStatus::Completed => completed.push(worker.name.clone()),
                    DoneStatus::Failed => failed.push(worker.name.clone()),
                },
                None => pending.push(worker.name.clone()),
            }
        }

        if pending.is_empty() {
            debug!(completed = completed.len(), failed = failed.len(), "fan-in complete");
            return TeamFanIn {
                completed,
                failed,
                pending,
                shutdown: false,
            };
        }
        if shutdown_requested(paths) {
            info!("shutdown signal observed during fan-in");
            return TeamFanIn {
                completed,
                failed,
                pending,
                shutdown: true,
            };
        }
        if Instant::now() >= deadline {
            warn!(pending = ?pending, "fan-in timed out with unsignaled workers");
            return TeamFanIn {
                completed,
                failed,
                pending,
                shutdown: false,
            };
        }
        std::thread::sleep(poll);
    }
}

/// Advance the pipeline based on a fan-in result.
///
/// Shutdown maps to `Cancelled`, a clean sweep to `Complete`, and anything
/// else (failed or unsignaled workers) to a `TeamFix` retry, which the
/// pipeline may override to `Failed` once the fix loop is exhausted.
pub fn advance_after_fanin(state: &mut PipelineState, fanin: &TeamFanIn) -> MarkOutcome {
    if fanin.shutdown {
        state.request_cancel();
        return mark_phase(state, Phase::Cancelled, Some("shutdown requested"));
    }
    if fanin.all_completed() {
        return mark_phase(state, Phase::Complete, None);
    }
    let mut troubled: Vec<&str> = fanin
        .failed
        .iter()
        .chain(fanin.pending.iter())
        .map(String::as_str)
        .collect();
    troubled.sort_unstable();
    let reason = format!("workers unresolved: {}", troubled.join(", "));
    mark_phase(state, Phase::TeamFix, Some(&reason))
}

fn ready_pattern(profile: &AgentProfile) -> Result<Regex> {
    let pattern = profile
        .ready_pattern
        .as_deref()
        .unwrap_or(DEFAULT_READY_PATTERN);
    Regex::new(pattern).with_context(|| format!("invalid ready pattern for agent {}", profile.name))
}

fn busy_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(BUSY_PATTERN).expect("busy pattern is valid"))
}

/// Build the env-qualified startup command for a pane.
///
/// Prompt mode inlines the full instruction as one argument (never a file
/// reference): some agents exclude the inbox file from their own
/// file-visibility rules, and some cannot receive keystrokes at all.
fn startup_command(profile: &AgentProfile, binary: &str, instruction: &str) -> String {
    let mut command = String::new();
    for (key, value) in &profile.env {
        command.push_str(key);
        command.push('=');
        command.push_str(&shell_quote(value));
        command.push(' ');
    }
    command.push_str(&shell_quote(binary));
    if profile.launch == LaunchMode::Prompt {
        command.push(' ');
        command.push_str(&shell_quote(instruction));
    }
    command
}

fn inbox_message(worker: &WorkerPaths) -> String {
    format!(
        "Read {} and follow the instructions in it exactly.",
        worker.inbox_path.display()
    )
}

/// The instruction written to the worker's inbox. Also the audit copy in
/// prompt mode, where the agent receives the same text inline.
fn compose_instruction(task: &Task, worker: &WorkerPaths, team: &TeamPaths) -> String {
    format!(
        "# Task {id}: {subject}\n\
         \n\
         {description}\n\
         \n\
         ## Coordination contract\n\
         \n\
         1. Before anything else, create an empty file at `{ready}`.\n\
         2. Touch `{heartbeat}` periodically while you work.\n\
         3. Append progress notes to `{outbox}`.\n\
         4. When finished, update `{task_file}` and write `{done}` containing\n\
         \x20  `{{\"status\": \"completed\"}}` or `{{\"status\": \"failed\", \"summary\": \"...\"}}`.\n\
         5. If `{shutdown}` appears and has not expired, stop what you are doing,\n\
         \x20  write your done signal, and create `{ack}`.\n",
        id = task.id,
        subject = task.subject,
        description = task.description,
        ready = worker.ready_path.display(),
        heartbeat = worker.heartbeat_path.display(),
        outbox = worker.outbox_path.display(),
        task_file = crate::io::task_store::task_path(&team.root, &task.id).display(),
        done = worker.done_path.display(),
        shutdown = team.shutdown_signal_path.display(),
        ack = worker.shutdown_ack_path.display(),
    )
}

fn append_mailbox(worker: &WorkerPaths, message: &str) -> Result<()> {
    use std::io::Write;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&worker.mailbox_path)
        .with_context(|| format!("open mailbox {}", worker.mailbox_path.display()))?;
    writeln!(file, "[{}] {}", Utc::now().to_rfc3339(), message)
        .with_context(|| format!("append mailbox {}", worker.mailbox_path.display()))
}

fn shell_quote(text: &str) -> String {
    let safe = !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%".contains(c));
    if safe {
        text.to_string()
    } else {
        format!("'{}'", text.replace('\'', r"'\''"))
    }
}
