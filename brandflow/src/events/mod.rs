//! Run and stage lifecycle events.
//!
//! The orchestrator and stage runner emit events such as `run.started`,
//! `stage.completed` or `prefix.cache_hit` through an [`EventSink`].
//! Emission never blocks the pipeline and never fails it.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink, RunEvent};
