//! bpforge — declarative multi-tier application blueprints.
//!
//! Entities (services, packages, substrates, deployments, profiles and
//! their roots) are declared into a graph, resolved, checked and rendered
//! into one versioned JSON document with its runtime-editable fields.

pub mod cli;
pub mod core;
pub mod kinds;
