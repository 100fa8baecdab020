//! Provenance: BLAKE3 content hashing and the append-only deployment event log.

pub mod eventlog;
pub mod hasher;
