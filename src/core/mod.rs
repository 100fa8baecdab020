//! Core synthesis logic: graph types, parsing, metadata, assignment,
//! addressing, generation and tiering.

pub mod assigner;
pub mod collector;
pub mod context;
pub mod generator;
pub mod parser;
pub mod tiering;
pub mod types;
