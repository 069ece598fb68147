//! Test-only helpers: a scripted multiplexer fake and team fixtures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Result, anyhow};

use crate::core::types::LaunchMode;
use crate::io::team::{AgentProfile, TeamConfig};
use crate::mux::{Multiplexer, PaneId};

/// Every call a [`FakeMux`] has served, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxCall {
    Split {
        window: String,
        workdir: PathBuf,
        command: Option<String>,
    },
    Capture {
        pane: String,
    },
    Literal {
        pane: String,
        text: String,
    },
    Enter {
        pane: String,
    },
    Interrupt {
        pane: String,
    },
    Layout {
        window: String,
        layout: String,
    },
    Resize {
        pane: String,
        width_percent: u8,
    },
    Select {
        pane: String,
    },
    Kill {
        pane: String,
    },
}

#[derive(Debug, Default)]
struct FakeMuxState {
    next_pane: u32,
    queued_captures: HashMap<String, VecDeque<String>>,
    default_capture: String,
    copy_mode: HashSet<String>,
    split_error: Option<String>,
    literal_error: Option<String>,
    calls: Vec<MuxCall>,
}

/// Scripted [`Multiplexer`] that records calls and serves queued captures
/// without touching a real terminal.
#[derive(Debug, Default)]
pub struct FakeMux {
    state: Mutex<FakeMuxState>,
}

impl FakeMux {
    pub fn new() -> Self {
        FakeMux::default()
    }

    /// Queue one capture result for `pane`; once the queue is empty the
    /// default capture is served.
    pub fn push_capture(&self, pane: &str, text: impl Into<String>) {
        let mut state = self.state.lock().expect("fake mux state");
        state
            .queued_captures
            .entry(pane.to_string())
            .or_default()
            .push_back(text.into());
    }

    pub fn set_default_capture(&self, text: impl Into<String>) {
        self.state.lock().expect("fake mux state").default_capture = text.into();
    }

    pub fn set_copy_mode(&self, pane: &str, in_copy_mode: bool) {
        let mut state = self.state.lock().expect("fake mux state");
        if in_copy_mode {
            state.copy_mode.insert(pane.to_string());
        } else {
            state.copy_mode.remove(pane);
        }
    }

    /// Make the next `split_pane` call fail with `message`.
    pub fn fail_next_split(&self, message: impl Into<String>) {
        self.state.lock().expect("fake mux state").split_error = Some(message.into());
    }

    /// Make the next `send_literal` call fail with `message`.
    pub fn fail_next_literal(&self, message: impl Into<String>) {
        self.state.lock().expect("fake mux state").literal_error = Some(message.into());
    }

    pub fn calls(&self) -> Vec<MuxCall> {
        self.state.lock().expect("fake mux state").calls.clone()
    }

    /// Literal sends to `pane`, in order.
    pub fn literals(&self, pane: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MuxCall::Literal { pane: p, text } if p == pane => Some(text),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: MuxCall) {
        self.state.lock().expect("fake mux state").calls.push(call);
    }
}

impl Multiplexer for FakeMux {
    fn split_pane(&self, window: &str, workdir: &Path, command: Option<&str>) -> Result<PaneId> {
        let mut state = self.state.lock().expect("fake mux state");
        state.calls.push(MuxCall::Split {
            window: window.to_string(),
            workdir: workdir.to_path_buf(),
            command: command.map(str::to_string),
        });
        if let Some(message) = state.split_error.take() {
            return Err(anyhow!(message));
        }
        state.next_pane += 1;
        Ok(PaneId::new(format!("%{}", state.next_pane)))
    }

    fn capture_pane(&self, pane: &PaneId) -> Result<String> {
        let mut state = self.state.lock().expect("fake mux state");
        state.calls.push(MuxCall::Capture {
            pane: pane.as_str().to_string(),
        });
        let text = state
            .queued_captures
            .get_mut(pane.as_str())
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| state.default_capture.clone());
        Ok(text)
    }

    fn send_literal(&self, pane: &PaneId, text: &str) -> Result<()> {
        let mut state = self.state.lock().expect("fake mux state");
        state.calls.push(MuxCall::Literal {
            pane: pane.as_str().to_string(),
            text: text.to_string(),
        });
        if let Some(message) = state.literal_error.take() {
            return Err(anyhow!(message));
        }
        Ok(())
    }

    fn send_enter(&self, pane: &PaneId) -> Result<()> {
        self.record(MuxCall::Enter {
            pane: pane.as_str().to_string(),
        });
        Ok(())
    }

    fn send_interrupt(&self, pane: &PaneId) -> Result<()> {
        self.record(MuxCall::Interrupt {
            pane: pane.as_str().to_string(),
        });
        Ok(())
    }

    fn select_layout(&self, window: &str, layout: &str) -> Result<()> {
        self.record(MuxCall::Layout {
            window: window.to_string(),
            layout: layout.to_string(),
        });
        Ok(())
    }

    fn resize_pane(&self, pane: &PaneId, width_percent: u8) -> Result<()> {
        self.record(MuxCall::Resize {
            pane: pane.as_str().to_string(),
            width_percent,
        });
        Ok(())
    }

    fn select_pane(&self, pane: &PaneId) -> Result<()> {
        self.record(MuxCall::Select {
            pane: pane.as_str().to_string(),
        });
        Ok(())
    }

    fn kill_pane(&self, pane: &PaneId) -> Result<()> {
        self.record(MuxCall::Kill {
            pane: pane.as_str().to_string(),
        });
        Ok(())
    }

    fn in_copy_mode(&self, pane: &PaneId) -> Result<bool> {
        let state = self.state.lock().expect("fake mux state");
        Ok(state.copy_mode.contains(pane.as_str()))
    }
}

/// Deterministic team config with one agent of the given launch mode.
pub fn team_config(launch: LaunchMode) -> TeamConfig {
    TeamConfig {
        name: "test-team".to_string(),
        window: "crew:0".to_string(),
        agents: vec![AgentProfile {
            name: "agent".to_string(),
            binary: "/bin/sh".to_string(),
            launch,
            ready_pattern: Some(r"\$\s*$".to_string()),
            env: Vec::new(),
        }],
        trusted_path_additions: Vec::new(),
        max_fix_attempts: 3,
        ready_timeout_ms: 200,
        done_poll_ms: 20,
    }
}
