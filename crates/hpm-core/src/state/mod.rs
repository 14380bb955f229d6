//! Upgrade state machine and action record interpreter.

pub mod actions;
pub mod machine;

pub use actions::{execute_records, interpret_records};
pub use machine::{UpgradeContext, UpgradeState};
