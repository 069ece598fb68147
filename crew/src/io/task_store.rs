//! Task storage: one JSON file per task under `{team_root}/tasks/`.
//!
//! The orchestrator claims tasks; the owning worker finishes them. Status
//! transitions are monotonic (`pending -> claimed -> {completed | failed}`)
//! and a terminal task is never reopened. Violations indicate a bug in the
//! caller and surface as errors.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::TaskStatus;

/// A decomposed unit of work assigned to at most one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub subject: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Subject/description pair from the decomposed work list.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub subject: String,
    pub description: String,
}

pub fn tasks_dir(team_root: &Path) -> PathBuf {
    team_root.join("tasks")
}

pub fn task_path(team_root: &Path, task_id: &str) -> PathBuf {
    tasks_dir(team_root).join(format!("{task_id}.json"))
}

/// Create one pending task file per spec, ids assigned by list position.
pub fn init_tasks(team_root: &Path, specs: &[TaskSpec]) -> Result<Vec<Task>> {
    fs::create_dir_all(tasks_dir(team_root))
        .with_context(|| format!("create tasks dir {}", tasks_dir(team_root).display()))?;

    let mut tasks = Vec::with_capacity(specs.len());
    for (index, spec) in specs.iter().enumerate() {
        let task = Task {
            id: format!("task-{:03}", index + 1),
            subject: spec.subject.clone(),
            description: spec.description.clone(),
            status: TaskStatus::Pending,
            owner: None,
        };
        write_task(team_root, &task)?;
        tasks.push(task);
    }
    debug!(count = tasks.len(), "tasks initialized");
    Ok(tasks)
}

/// Load a single task by id.
pub fn load_task(team_root: &Path, task_id: &str) -> Result<Task> {
    let path = task_path(team_root, task_id);
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read task {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse task {}", path.display()))
}

/// Load every task, sorted by id for deterministic iteration order.
pub fn list_tasks(team_root: &Path) -> Result<Vec<Task>> {
    let dir = tasks_dir(team_root);
    let mut tasks = Vec::new();
    let entries =
        fs::read_dir(&dir).with_context(|| format!("read tasks dir {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read tasks dir entry in {}", dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read task {}", path.display()))?;
        let task: Task = serde_json::from_str(&contents)
            .with_context(|| format!("parse task {}", path.display()))?;
        tasks.push(task);
    }
    tasks.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(tasks)
}

/// Claim a pending task for `owner`. Orchestrator-only: tasks are assigned
/// by index in the orchestrator's own loop, so at-most-one-claim holds by
/// construction rather than by locking.
pub fn claim_task(team_root: &Path, task_id: &str, owner: &str) -> Result<Task> {
    let mut task = load_task(team_root, task_id)?;
    if task.status != TaskStatus::Pending {
        return Err(anyhow!(
            "cannot claim task {} in status {:?}",
            task.id,
            task.status
        ));
    }
    task.status = TaskStatus::Claimed;
    task.owner = Some(owner.to_string());
    write_task(team_root, &task)?;
    debug!(task = %task.id, owner, "task claimed");
    Ok(task)
}

/// Move a claimed task to a terminal status. Written by the owning worker
/// (or by the orchestrator on the worker's behalf when it retires a pane).
pub fn finish_task(team_root: &Path, task_id: &str, status: TaskStatus) -> Result<Task> {
    if !status.is_terminal() {
        return Err(anyhow!("finish_task requires a terminal status, got {status:?}"));
    }
    let mut task = load_task(team_root, task_id)?;
    if task.status != TaskStatus::Claimed {
        return Err(anyhow!(
            "cannot finish task {} in status {:?}",
            task.id,
            task.status
        ));
    }
    task.status = status;
    write_task(team_root, &task)?;
    debug!(task = %task.id, ?status, "task finished");
    Ok(task)
}

fn write_task(team_root: &Path, task: &Task) -> Result<()> {
    let path = task_path(team_root, &task.id);
    let mut buf = serde_json::to_string_pretty(task)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp task {}", tmp_path.display()))?;
    fs::rename(&tmp_path, &path).with_context(|| format!("replace task {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(n: usize) -> Vec<TaskSpec> {
        (1..=n)
            .map(|i| TaskSpec {
                subject: format!("subject {i}"),
                description: format!("description {i}"),
            })
            .collect()
    }

    #[test]
    fn init_creates_one_pending_file_per_task() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tasks = init_tasks(temp.path(), &specs(3)).expect("init");

        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].id, "task-001");
        assert_eq!(tasks[2].id, "task-003");
        for task in &tasks {
            assert_eq!(task.status, TaskStatus::Pending);
            assert!(task_path(temp.path(), &task.id).is_file());
        }
    }

    #[test]
    fn list_returns_tasks_sorted_by_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_tasks(temp.path(), &specs(3)).expect("init");

        let listed = list_tasks(temp.path()).expect("list");
        let ids: Vec<&str> = listed.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["task-001", "task-002", "task-003"]);
    }

    #[test]
    fn claim_moves_pending_to_claimed_with_owner() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_tasks(temp.path(), &specs(1)).expect("init");

        let claimed = claim_task(temp.path(), "task-001", "worker-1").expect("claim");
        assert_eq!(claimed.status, TaskStatus::Claimed);
        assert_eq!(claimed.owner.as_deref(), Some("worker-1"));

        let reloaded = load_task(temp.path(), "task-001").expect("load");
        assert_eq!(reloaded, claimed);
    }

    #[test]
    fn double_claim_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_tasks(temp.path(), &specs(1)).expect("init");

        claim_task(temp.path(), "task-001", "worker-1").expect("claim");
        let err = claim_task(temp.path(), "task-001", "worker-2").unwrap_err();
        assert!(err.to_string().contains("cannot claim"));
    }

    #[test]
    fn finish_requires_claimed_and_terminal_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_tasks(temp.path(), &specs(1)).expect("init");

        let err = finish_task(temp.path(), "task-001", TaskStatus::Completed).unwrap_err();
        assert!(err.to_string().contains("cannot finish"));

        claim_task(temp.path(), "task-001", "worker-1").expect("claim");
        let err = finish_task(temp.path(), "task-001", TaskStatus::Claimed).unwrap_err();
        assert!(err.to_string().contains("terminal status"));

        let done = finish_task(temp.path(), "task-001", TaskStatus::Failed).expect("finish");
        assert_eq!(done.status, TaskStatus::Failed);
    }

    /// Terminal tasks are never reopened, by claim or by finish.
    #[test]
    fn terminal_tasks_stay_terminal() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_tasks(temp.path(), &specs(1)).expect("init");
        claim_task(temp.path(), "task-001", "worker-1").expect("claim");
        finish_task(temp.path(), "task-001", TaskStatus::Completed).expect("finish");

        assert!(claim_task(temp.path(), "task-001", "worker-2").is_err());
        assert!(finish_task(temp.path(), "task-001", TaskStatus::Failed).is_err());
        let task = load_task(temp.path(), "task-001").expect("load");
        assert_eq!(task.status, TaskStatus::Completed);
    }
}
