//! Pure, deterministic core logic.
//!
//! Nothing in this module touches the filesystem or spawns processes; the
//! orchestration layer feeds it inputs and persists its outputs.

pub mod pipeline;
pub mod types;
