//! Compiler core — entity model, resolution, task trees, extraction, serialization.

pub mod compiler;
pub mod context;
pub mod digest;
pub mod editable;
pub mod entity;
pub mod error;
pub mod graph;
pub mod macros;
pub mod parser;
pub mod reference;
pub mod serializer;
pub mod task;
pub mod tasktree;
pub mod types;
pub mod variable;

#[cfg(test)]
pub(crate) mod fixtures;
