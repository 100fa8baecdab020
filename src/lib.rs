//! Shardform: resource-graph synthesis into size-limited deployment documents.
//!
//! Splits a declared resource graph across documents that respect platform
//! limits, rewrites cross-document references into output/parameter pairs,
//! and deploys the documents tier by tier with retries, rollback and
//! resumable state.

pub mod cli;
pub mod core;
pub mod deploy;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod platform;
pub mod provenance;
