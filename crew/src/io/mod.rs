//! Side-effecting filesystem primitives.
//!
//! Everything here touches disk; pure logic lives in [`crate::core`].

pub mod lock;
pub mod mode_state;
pub mod task_store;
pub mod team;
