//! BP-014: Compile pipeline.
//!
//! One call runs every pass in order over a fresh graph:
//! validate → bind variables → resolve references → check macros →
//! extract editables → serialize. Each pass advances the lifecycle of the
//! entities it touched; a failure anywhere aborts with no document.

use super::context::CompileContext;
use super::digest;
use super::editable::{self, EditableTree};
use super::error::{CompileError, CompileResult};
use super::graph::{EntityGraph, Lifecycle, Stage};
use super::macros;
use super::reference::{resolve_graph, ResolvedGraph};
use super::serializer;
use crate::kinds;
use serde_json::Value;
use tracing::info;

/// Output of one compile.
#[derive(Debug, Clone)]
pub struct Compiled {
    pub document: Value,
    pub editables: EditableTree,
    /// Non-fatal findings (unknown macros outside strict mode).
    pub warnings: Vec<String>,
    pub resolved: ResolvedGraph,
    pub lifecycle: Lifecycle,
}

impl Compiled {
    pub fn to_json(&self, pretty: bool) -> CompileResult<String> {
        let out = if pretty {
            serde_json::to_string_pretty(&self.document)
        } else {
            serde_json::to_string(&self.document)
        };
        out.map_err(|e| CompileError::serialization(e.to_string()))
    }

    pub fn digest(&self) -> CompileResult<String> {
        digest::payload_digest(&self.document)
    }
}

/// Compile a declared graph into its wire document.
pub fn compile(graph: EntityGraph, ctx: &CompileContext) -> CompileResult<Compiled> {
    let mut lifecycle = Lifecycle::new(&graph);
    let declared: Vec<_> = graph.iter().map(|(id, _)| id).collect();

    for (_, entity) in graph.iter() {
        kinds::validate(entity)?;
    }
    lifecycle.advance_all(&graph, &declared, Stage::VariablesBound)?;
    lifecycle.advance_all(&graph, &declared, Stage::ReferencesUnresolved)?;

    let resolved = resolve_graph(graph)?;
    let reachable = resolved.reachable().to_vec();
    lifecycle.advance_all(resolved.graph(), &reachable, Stage::ReferencesResolved)?;

    let warnings = macros::check(&resolved, ctx)?;

    let editables = editable::extract(&resolved);
    lifecycle.advance_all(resolved.graph(), &reachable, Stage::EditablesExtracted)?;

    let document = serializer::serialize(&resolved, &editables, ctx)?;
    lifecycle.advance_all(resolved.graph(), &reachable, Stage::Serialized)?;

    info!(
        "compiled {} '{}': {} entities, {} editable field(s)",
        resolved.entity(resolved.root()).kind,
        resolved.entity(resolved.root()).name,
        reachable.len(),
        editables.fields().count()
    );
    Ok(Compiled {
        document,
        editables,
        warnings,
        resolved,
        lifecycle,
    })
}
