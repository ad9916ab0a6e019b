//! Intercom Orchestrator - capability-matched task assignment

pub mod orchestrator;
pub mod persistence;

pub use orchestrator::TaskOrchestrator;
pub use persistence::{JsonFileHook, OrchestratorSnapshot, PersistenceHook};
