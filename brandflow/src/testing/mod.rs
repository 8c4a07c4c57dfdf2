//! Test doubles and fixtures for brandflow pipelines.
//!
//! The doubles implement the collaborator traits in [`crate::ports`] with
//! scripted behavior and call counting. [`TestHarness`] wires them into an
//! [`crate::pipeline::Orchestrator`] with fast retry policies.

mod fixtures;
mod mocks;

pub use fixtures::{fast_config, opportunities_json, stage_json, TestHarness};
pub use mocks::{
    CountingRepair, FlakyStateStore, RecordingNotifier, ScriptedProvider, StaticDocuments,
    StaticProfiles,
};
