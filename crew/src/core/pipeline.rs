//! Team pipeline state machine with bounded fix-loop retries.
//!
//! Pure transition logic: callers persist [`PipelineState`] through mode
//! state I/O and decide when to request transitions. The machine's only
//! hard rule is that repeated fix attempts cannot loop forever.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default failure reason recorded when the fix loop runs out of attempts.
pub const FIX_LOOP_EXHAUSTED_REASON: &str = "fix-loop-max-attempts-exceeded";

/// Pipeline phases. `Complete`, `Failed`, and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    TeamPlan,
    TeamExec,
    TeamFix,
    Complete,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed | Phase::Cancelled)
    }
}

/// One entry in the append-only phase history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseEntry {
    pub phase: Phase,
    pub entered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Bounded retry counter for the fix phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixLoop {
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
}

/// Cooperative-cancellation bookkeeping carried in the pipeline state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelState {
    pub requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<DateTime<Utc>>,
}

/// Persisted pipeline state (mode `team-pipeline` in mode state I/O).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    pub phase: Phase,
    pub phase_history: Vec<PhaseEntry>,
    pub fix_loop: FixLoop,
    #[serde(default)]
    pub cancel: CancelState,
    pub active: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineState {
    /// Fresh pipeline entering `TeamPlan` now.
    pub fn new(max_fix_attempts: u32) -> Self {
        let now = Utc::now();
        PipelineState {
            phase: Phase::TeamPlan,
            phase_history: vec![PhaseEntry {
                phase: Phase::TeamPlan,
                entered_at: now,
                reason: None,
            }],
            fix_loop: FixLoop {
                attempt: 0,
                max_attempts: max_fix_attempts,
                last_failure_reason: None,
            },
            cancel: CancelState::default(),
            active: true,
            started_at: now,
            completed_at: None,
        }
    }

    /// Record a cooperative cancellation request on the state itself.
    ///
    /// The caller still drives the phase to `Cancelled` via [`mark_phase`];
    /// this only stamps intent so late observers can see it.
    pub fn request_cancel(&mut self) {
        if !self.cancel.requested {
            self.cancel.requested = true;
            self.cancel.requested_at = Some(Utc::now());
        }
    }
}

/// Result of a [`mark_phase`] call.
///
/// `ok == false` means the requested transition was rejected in favor of a
/// forced terminal failure (fix loop exhausted); the state still changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkOutcome {
    pub ok: bool,
    pub reason: Option<String>,
}

impl MarkOutcome {
    fn accepted() -> Self {
        MarkOutcome {
            ok: true,
            reason: None,
        }
    }
}

/// Transition `state` to `next`, enforcing the fix-loop bound.
///
/// Same-phase transitions are idempotent no-ops, with one exception:
/// `TeamFix -> TeamFix` is a deliberate retry and increments the attempt
/// counter. Entering any terminal phase clears `active` and stamps
/// `completed_at`; terminal phases are absorbing, so any later transition
/// request is rejected with the state untouched. When a fix attempt would
/// exceed `max_attempts`, the transition is overridden to `Failed` and the
/// call reports `ok: false`.
pub fn mark_phase(state: &mut PipelineState, next: Phase, reason: Option<&str>) -> MarkOutcome {
    if state.phase == next && next != Phase::TeamFix {
        return MarkOutcome::accepted();
    }

    if state.phase.is_terminal() {
        return MarkOutcome {
            ok: false,
            reason: Some(format!(
                "Pipeline is already terminal in phase {:?}",
                state.phase
            )),
        };
    }

    if next == Phase::TeamFix {
        state.fix_loop.attempt += 1;
        if state.fix_loop.attempt > state.fix_loop.max_attempts {
            let failure_reason = reason
                .map(str::to_string)
                .unwrap_or_else(|| FIX_LOOP_EXHAUSTED_REASON.to_string());
            state.fix_loop.last_failure_reason = Some(failure_reason.clone());
            enter(state, Phase::Failed, Some(failure_reason));
            return MarkOutcome {
                ok: false,
                reason: Some("Fix loop exceeded max_attempts".to_string()),
            };
        }
        if let Some(reason) = reason {
            state.fix_loop.last_failure_reason = Some(reason.to_string());
        }
    }

    enter(state, next, reason.map(str::to_string));
    MarkOutcome::accepted()
}

fn enter(state: &mut PipelineState, phase: Phase, reason: Option<String>) {
    let now = Utc::now();
    state.phase = phase;
    state.phase_history.push(PhaseEntry {
        phase,
        entered_at: now,
        reason,
    });
    if phase.is_terminal() {
        state.active = false;
        state.completed_at = Some(now);
    }
}
