//! Processing pipeline — per-cycle orchestration over the classifiers.
//!
//! Every tick: fetch for all accounts → dedup → operator commands →
//! resolution → forward or ignore → shadow telemetry → persist, then
//! finalize the run and promote ripe shadow rules.

pub mod commands;
pub mod orchestrator;
pub mod retention;
pub mod types;

pub use orchestrator::{CycleSummary, ProcessingOrchestrator, spawn_cycle_task};
pub use types::EmailMessage;
