//! Logging setup and per-run summary events.

mod logging;
mod wide_events;

pub use logging::init_logging;
pub use wide_events::{run_summary, WideEventEmitter};
