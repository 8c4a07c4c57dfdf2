//! Run model for brandflow.
//!
//! This module contains the state owned by one pipeline execution:
//! - Run and stage status enums
//! - The [`Run`] state machine and its [`StageExecution`] records

mod run;
mod status;

pub use run::{Run, StageExecution, STAGE_COUNT};
pub use status::{RunStatus, StageStatus};
