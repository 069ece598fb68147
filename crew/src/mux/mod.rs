//! Multiplexer adapter seam.
//!
//! The [`Multiplexer`] trait decouples orchestration from the terminal
//! multiplexer (currently tmux). Any mechanism offering these primitives
//! satisfies the contract; tests use a scripted fake that records calls
//! without touching a real terminal.

use std::path::Path;

use anyhow::Result;

pub mod tmux;

/// Stable identifier of a pane for the lifetime of its worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PaneId(String);

impl PaneId {
    pub fn new(id: impl Into<String>) -> Self {
        PaneId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PaneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Primitive operations the orchestrator needs from a multiplexer.
pub trait Multiplexer: Send + Sync {
    /// Split a new pane into `window`, optionally running `command` in it
    /// (a bare shell otherwise). Returns the new pane's id.
    fn split_pane(&self, window: &str, workdir: &Path, command: Option<&str>) -> Result<PaneId>;

    /// Capture the pane's currently visible text.
    fn capture_pane(&self, pane: &PaneId) -> Result<String>;

    /// Send `text` as literal keystrokes (no key-name interpretation).
    fn send_literal(&self, pane: &PaneId, text: &str) -> Result<()>;

    /// Send the activation keystroke.
    fn send_enter(&self, pane: &PaneId) -> Result<()>;

    /// Send an interrupt keystroke.
    fn send_interrupt(&self, pane: &PaneId) -> Result<()>;

    /// Apply a named layout to the window.
    fn select_layout(&self, window: &str, layout: &str) -> Result<()>;

    /// Resize a pane to a percentage of the window width.
    fn resize_pane(&self, pane: &PaneId, width_percent: u8) -> Result<()>;

    /// Move focus to a pane.
    fn select_pane(&self, pane: &PaneId) -> Result<()>;

    /// Kill a pane and the process inside it.
    fn kill_pane(&self, pane: &PaneId) -> Result<()>;

    /// Whether the pane is in copy/scroll mode (keystrokes would be eaten).
    fn in_copy_mode(&self, pane: &PaneId) -> Result<bool>;
}
