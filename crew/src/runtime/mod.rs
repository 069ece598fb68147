//! Orchestration runtime: worker lifecycle, window layout, and binary trust.

pub mod layout;
pub mod trust;
pub mod worker;

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::core::pipeline::{Phase, PipelineState, mark_phase};
    use crate::core::types::{DoneSignal, DoneStatus, LaunchMode};
    use crate::io::task_store::{TaskSpec, init_tasks};
    use crate::io::team::{init_team, mark_worker_ready, write_done_signal};
    use crate::mux::Multiplexer;
    use crate::runtime::layout::LayoutStabilizer;
    use crate::runtime::worker::{
        Worker, WorkerRuntime, advance_after_fanin, retire_worker, spawn_team, wait_for_done,
    };
    use crate::test_support::{FakeMux, MuxCall, team_config};

    /// Full exec round: three tasks fan out to three workers, every worker
    /// signals completion, and the pipeline lands in `Complete`.
    #[test]
    fn team_exec_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = team_config(LaunchMode::Prompt);
        let paths = init_team(temp.path(), &config).expect("init team");
        let specs: Vec<TaskSpec> = (1..=3)
            .map(|i| TaskSpec {
                subject: format!("part {i}"),
                description: format!("implement part {i}"),
            })
            .collect();
        init_tasks(temp.path(), &specs).expect("init tasks");

        let mux = Arc::new(FakeMux::new());
        let runtime = WorkerRuntime::new(
            Arc::clone(&mux) as Arc<dyn Multiplexer>,
            paths,
            config,
            temp.path().to_path_buf(),
        );

        let mut pipeline = PipelineState::new(3);
        mark_phase(&mut pipeline, Phase::TeamExec, None);

        let spawn = spawn_team(&runtime, 3);
        assert!(spawn.failures.is_empty());
        assert_eq!(spawn.spawned.len(), 3);
        let workers: Vec<Worker> = spawn.spawned.into_iter().map(|o| o.worker).collect();

        // Every spawn gets its own pane, in allocation order.
        let panes: Vec<&str> = workers.iter().map(|w| w.pane.as_str()).collect();
        assert_eq!(panes, vec!["%1", "%2", "%3"]);

        // Each spawn triggers a layout pass; bursts collapse via debounce.
        let stabilizer = LayoutStabilizer::with_tuning(
            Arc::clone(&mux) as Arc<dyn Multiplexer>,
            runtime.config.window.clone(),
            workers[0].pane.clone(),
            Duration::from_millis(20),
            50,
        );
        for _ in &workers {
            stabilizer.request_layout();
        }
        stabilizer.flush();
        let layouts = mux
            .calls()
            .iter()
            .filter(|call| matches!(call, MuxCall::Layout { .. }))
            .count();
        assert_eq!(layouts, 1, "spawn burst collapses into one apply");

        // Workers attach and complete out of spawn order.
        for name in ["worker-2", "worker-3", "worker-1"] {
            let wp = runtime.paths.worker(name);
            mark_worker_ready(&wp).expect("ready");
            write_done_signal(
                &wp,
                &DoneSignal {
                    status: DoneStatus::Completed,
                    summary: Some("done".to_string()),
                },
            )
            .expect("done");
        }

        let fanin = wait_for_done(
            &runtime.paths,
            &workers,
            Duration::from_millis(10),
            Duration::from_secs(2),
        );
        assert!(fanin.all_completed());
        assert_eq!(fanin.completed.len(), 3);

        let outcome = advance_after_fanin(&mut pipeline, &fanin);
        assert!(outcome.ok);
        assert_eq!(pipeline.phase, Phase::Complete);
        assert!(!pipeline.active);

        for worker in &workers {
            retire_worker(&runtime, worker).expect("retire");
        }
        let kills = mux
            .calls()
            .iter()
            .filter(|call| matches!(call, MuxCall::Kill { .. }))
            .count();
        assert_eq!(kills, 3);
    }
}
