//! Debounced, serialized layout recalculation for the shared team window.
//!
//! Spawn and kill events arrive in bursts; re-laying the window on every one
//! causes visible churn and races inside the multiplexer. The stabilizer
//! collapses rapid requests into a single apply scheduled `debounce` after
//! the last request, and serializes applies through one background thread:
//! a request that lands mid-apply is queued and re-armed afterwards, never
//! run in parallel.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::mux::{Multiplexer, PaneId};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(150);
pub const DEFAULT_LEADER_WIDTH_PERCENT: u8 = 50;

/// The fixed layout applied to the team window.
const TEAM_LAYOUT: &str = "main-vertical";

#[derive(Debug, Default)]
struct State {
    /// When the pending debounced apply should fire, if any.
    deadline: Option<Instant>,
    running: bool,
    queued_while_running: bool,
    disposed: bool,
    applies_completed: u64,
}

struct Inner {
    mux: Arc<dyn Multiplexer>,
    window: String,
    leader: PaneId,
    leader_width_percent: u8,
    debounce: Duration,
    state: Mutex<State>,
    cond: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Debounced layout applier for one team window.
pub struct LayoutStabilizer {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl LayoutStabilizer {
    pub fn new(mux: Arc<dyn Multiplexer>, window: impl Into<String>, leader: PaneId) -> Self {
        Self::with_tuning(mux, window, leader, DEFAULT_DEBOUNCE, DEFAULT_LEADER_WIDTH_PERCENT)
    }

    pub fn with_tuning(
        mux: Arc<dyn Multiplexer>,
        window: impl Into<String>,
        leader: PaneId,
        debounce: Duration,
        leader_width_percent: u8,
    ) -> Self {
        let inner = Arc::new(Inner {
            mux,
            window: window.into(),
            leader,
            leader_width_percent,
            debounce,
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        });
        let worker = Arc::clone(&inner);
        let thread = std::thread::spawn(move || run_worker(&worker));
        LayoutStabilizer {
            inner,
            thread: Some(thread),
        }
    }

    /// Request a layout recalculation.
    ///
    /// Rapid repeated calls collapse into exactly one apply scheduled
    /// `debounce` after the last call. If an apply is currently running the
    /// request is queued instead of scheduling a parallel apply.
    pub fn request_layout(&self) {
        let mut state = self.inner.lock();
        if state.disposed {
            return;
        }
        if state.running {
            state.queued_while_running = true;
            return;
        }
        state.deadline = Some(Instant::now() + self.inner.debounce);
        self.inner.cond.notify_all();
    }

    /// Cancel any pending debounce and apply immediately, waiting for the
    /// apply (and any apply queued during it) to finish. Returns without
    /// applying when nothing is pending or the stabilizer is disposed.
    pub fn flush(&self) {
        let mut state = self.inner.lock();
        if state.deadline.is_some() {
            state.deadline = Some(Instant::now());
            self.inner.cond.notify_all();
        }
        while !state.disposed
            && (state.deadline.is_some() || state.running || state.queued_while_running)
        {
            state = self
                .inner
                .cond
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Cancel pending work and wake all flush waiters. Idempotent.
    pub fn dispose(&mut self) {
        {
            let mut state = self.inner.lock();
            state.disposed = true;
            state.deadline = None;
            state.queued_while_running = false;
            self.inner.cond.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    #[cfg(test)]
    fn applies_completed(&self) -> u64 {
        self.inner.lock().applies_completed
    }
}

impl Drop for LayoutStabilizer {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn run_worker(inner: &Arc<Inner>) {
    let mut state = inner.lock();
    loop {
        if state.disposed {
            inner.cond.notify_all();
            return;
        }
        match state.deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    state.deadline = None;
                    state.running = true;
                    drop(state);
                    apply_layout(inner);
                    state = inner.lock();
                    state.running = false;
                    state.applies_completed += 1;
                    if state.queued_while_running {
                        state.queued_while_running = false;
                        state.deadline = Some(Instant::now() + inner.debounce);
                    }
                    inner.cond.notify_all();
                } else {
                    state = inner
                        .cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .0;
                }
            }
            None => {
                state = inner
                    .cond
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
        }
    }
}

/// Arrange panes, size the leader, and return focus to the leader last.
///
/// Each step is independently best-effort: a transient one-pane-only state
/// must not abort the remaining steps, so failures are logged and swallowed.
fn apply_layout(inner: &Inner) {
    debug!(window = %inner.window, "applying layout");
    if let Err(err) = inner.mux.select_layout(&inner.window, TEAM_LAYOUT) {
        warn!(window = %inner.window, err = %err, "select-layout failed");
    }
    if let Err(err) = inner
        .mux
        .resize_pane(&inner.leader, inner.leader_width_percent)
    {
        warn!(pane = %inner.leader, err = %err, "resize leader pane failed");
    }
    // Focus must land on the control surface regardless of how many panes
    // came and went while this apply was pending.
    if let Err(err) = inner.mux.select_pane(&inner.leader) {
        warn!(pane = %inner.leader, err = %err, "select leader pane failed");
    }
}
