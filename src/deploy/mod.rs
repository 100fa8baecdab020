//! Deployment: uploads, tiered submission, polling, rollback and run state.

pub mod engine;
pub mod monitor;
pub mod orchestrator;
pub mod retry;
pub mod state;
pub mod types;
pub mod uploader;
