//! Multi-agent team orchestration over a terminal multiplexer.
//!
//! This crate coordinates a team of coding-agent processes, each running in
//! its own multiplexer pane, through file-based channels on a shared team
//! directory. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (pipeline state machine, shared
//!   types). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting filesystem operations (locking, mode state,
//!   task store, team scaffolding). Isolated to enable temp-dir tests.
//! - **[`mux`]**: The multiplexer seam. Production code talks to tmux;
//!   tests talk to a scripted fake.
//! - **[`runtime`]**: Orchestration that combines core logic, I/O, and the
//!   multiplexer into the worker lifecycle.

pub mod core;
pub mod io;
pub mod logging;
pub mod mux;
pub mod runtime;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
