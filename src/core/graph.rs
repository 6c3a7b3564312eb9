//! BP-006: Entity arena and per-entity lifecycle.
//!
//! Entities live in a flat arena addressed by `EntityId`; a side index maps
//! each declared `(kind, name)` to every id carrying it. Each entity also
//! records its declaration depth: the root is 0, entities of the root module
//! are 1, and entities pulled in through imports sit one hop further per
//! import level.

use super::entity::Entity;
use super::error::{CompileError, CompileResult};
use super::reference::Handle;
use super::types::{EntityId, EntityKey};
use rustc_hash::FxHashMap;
use std::fmt;

/// Depth of entities declared next to the root.
pub const MODULE_DEPTH: u32 = 1;

#[derive(Debug, Clone)]
struct Slot {
    entity: Entity,
    depth: u32,
}

/// Arena of every entity declared for one compile.
#[derive(Debug, Clone, Default)]
pub struct EntityGraph {
    slots: Vec<Slot>,
    index: FxHashMap<EntityKey, Vec<EntityId>>,
    root: Option<EntityId>,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an entity next to the root.
    pub fn declare(&mut self, entity: Entity) -> Handle {
        self.declare_at(entity, MODULE_DEPTH)
    }

    /// Declare an entity at an explicit hop distance from the root.
    pub fn declare_at(&mut self, entity: Entity, depth: u32) -> Handle {
        let id = EntityId(self.slots.len());
        let key = entity.key();
        self.index.entry(key.clone()).or_default().push(id);
        self.slots.push(Slot { entity, depth });
        Handle { id, key }
    }

    /// Declare the single root entity of this compile.
    pub fn declare_root(&mut self, entity: Entity) -> CompileResult<Handle> {
        if !entity.kind.is_root() {
            return Err(CompileError::validation(
                entity.key().to_string(),
                "cannot be the root of a document",
            ));
        }
        if let Some(existing) = self.root {
            return Err(CompileError::validation(
                entity.key().to_string(),
                format!("root already declared as {}", self.get(existing).key()),
            ));
        }
        let handle = self.declare_at(entity, 0);
        self.root = Some(handle.id);
        Ok(handle)
    }

    pub fn root(&self) -> Option<EntityId> {
        self.root
    }

    /// Entity at `id`. Ids only come from this arena, so the slot exists.
    pub fn get(&self, id: EntityId) -> &Entity {
        &self.slots[id.0].entity
    }

    pub fn try_get(&self, id: EntityId) -> Option<&Entity> {
        self.slots.get(id.0).map(|s| &s.entity)
    }

    pub fn depth(&self, id: EntityId) -> u32 {
        self.slots[id.0].depth
    }

    /// Every id declared under `key`, in declaration order.
    pub fn candidates(&self, key: &EntityKey) -> &[EntityId] {
        self.index.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, s)| (EntityId(i), &s.entity))
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Compilation stage of one entity. Stages advance strictly in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Declared,
    VariablesBound,
    ReferencesUnresolved,
    ReferencesResolved,
    EditablesExtracted,
    Serialized,
}

impl Stage {
    pub fn next(self) -> Option<Stage> {
        match self {
            Self::Declared => Some(Self::VariablesBound),
            Self::VariablesBound => Some(Self::ReferencesUnresolved),
            Self::ReferencesUnresolved => Some(Self::ReferencesResolved),
            Self::ReferencesResolved => Some(Self::EditablesExtracted),
            Self::EditablesExtracted => Some(Self::Serialized),
            Self::Serialized => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Declared => "declared",
            Self::VariablesBound => "variables-bound",
            Self::ReferencesUnresolved => "references-unresolved",
            Self::ReferencesResolved => "references-resolved",
            Self::EditablesExtracted => "editables-extracted",
            Self::Serialized => "serialized",
        };
        write!(f, "{}", s)
    }
}

/// Stage of every entity in one graph.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    stages: Vec<Stage>,
}

impl Lifecycle {
    pub fn new(graph: &EntityGraph) -> Self {
        Self {
            stages: vec![Stage::Declared; graph.len()],
        }
    }

    pub fn stage(&self, id: EntityId) -> Stage {
        self.stages[id.0]
    }

    /// Move `id` to `to`, which must be the stage right after its current one.
    pub fn advance(&mut self, graph: &EntityGraph, id: EntityId, to: Stage) -> CompileResult<()> {
        let from = self.stages[id.0];
        if from.next() != Some(to) {
            return Err(CompileError::Lifecycle {
                entity: graph.get(id).key().to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.stages[id.0] = to;
        Ok(())
    }

    /// Advance each listed entity.
    pub fn advance_all(
        &mut self,
        graph: &EntityGraph,
        ids: &[EntityId],
        to: Stage,
    ) -> CompileResult<()> {
        for &id in ids {
            self.advance(graph, id, to)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entity::EntityBuilder;
    use crate::core::types::EntityKind;

    fn service(name: &str) -> Entity {
        EntityBuilder::new(EntityKind::Service, name).build().unwrap()
    }

    #[test]
    fn test_bp006_declare_and_index() {
        let mut g = EntityGraph::new();
        let a = g.declare(service("A"));
        let b = g.declare_at(service("A"), 3);
        let key = EntityKey::new(EntityKind::Service, "A");
        assert_eq!(g.candidates(&key), &[a.id, b.id]);
        assert_eq!(g.depth(b.id), 3);
        assert_eq!(g.len(), 2);
        assert!(g.candidates(&EntityKey::new(EntityKind::Service, "B")).is_empty());
    }

    #[test]
    fn test_bp006_single_root() {
        let mut g = EntityGraph::new();
        let bp = EntityBuilder::new(EntityKind::Blueprint, "Bp").build().unwrap();
        let h = g.declare_root(bp.clone()).unwrap();
        assert_eq!(g.root(), Some(h.id));
        assert_eq!(g.depth(h.id), 0);
        assert!(g.declare_root(bp).is_err());
    }

    #[test]
    fn test_bp006_non_root_kind_rejected() {
        let mut g = EntityGraph::new();
        let err = g.declare_root(service("S")).unwrap_err();
        assert!(err.to_string().contains("cannot be the root"));
    }

    #[test]
    fn test_bp006_lifecycle_in_order() {
        let mut g = EntityGraph::new();
        let h = g.declare(service("S"));
        let mut lc = Lifecycle::new(&g);
        let mut stage = Stage::Declared;
        while let Some(next) = stage.next() {
            lc.advance(&g, h.id, next).unwrap();
            stage = next;
        }
        assert_eq!(lc.stage(h.id), Stage::Serialized);
    }

    #[test]
    fn test_bp006_lifecycle_rejects_skip_and_repeat() {
        let mut g = EntityGraph::new();
        let h = g.declare(service("S"));
        let mut lc = Lifecycle::new(&g);
        let err = lc.advance(&g, h.id, Stage::ReferencesResolved).unwrap_err();
        assert!(matches!(err, CompileError::Lifecycle { .. }));
        lc.advance(&g, h.id, Stage::VariablesBound).unwrap();
        assert!(lc.advance(&g, h.id, Stage::VariablesBound).is_err());
    }
}
