//! BP-005: Reference handles and the resolve pass.
//!
//! A `Ref` is just an identity until the resolve pass looks it up in the
//! arena. Named refs match on declared `(kind, name)`; when several entities
//! carry the same key, the one declared the fewest hops from the root wins
//! and a tie is a hard error. Bound refs pin one arena slot, which is how two
//! same-named entities can both reach the flatten step.
//!
//! Resolution walks breadth-first from the root, following ref slots in
//! declaration order and then task targets. Only what the walk reaches is
//! ever resolved, validated, or emitted.

use super::entity::Entity;
use super::error::{CompileError, CompileResult};
use super::graph::EntityGraph;
use super::types::{EntityId, EntityKey, EntityKind};
use crate::kinds::{self, DefaultTarget};
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use tracing::debug;

/// Symbolic pointer from one entity to another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ref {
    /// Resolve by declared kind and name.
    Named(EntityKey),
    /// Pinned to one declared instance.
    Bound { id: EntityId, key: EntityKey },
}

impl Ref {
    pub fn named(kind: EntityKind, name: impl Into<String>) -> Self {
        Self::Named(EntityKey::new(kind, name))
    }

    pub fn key(&self) -> &EntityKey {
        match self {
            Self::Named(key) | Self::Bound { key, .. } => key,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.key().kind
    }
}

/// Receipt for a declared entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle {
    pub id: EntityId,
    pub key: EntityKey,
}

impl Handle {
    /// Reference to exactly this instance.
    pub fn to_ref(&self) -> Ref {
        Ref::Bound {
            id: self.id,
            key: self.key.clone(),
        }
    }
}

impl From<&Handle> for Ref {
    fn from(h: &Handle) -> Self {
        h.to_ref()
    }
}

/// Resolve one handle against the arena.
pub fn resolve(handle: &Ref, graph: &EntityGraph, from: &str) -> CompileResult<EntityId> {
    let unresolved = |key: &EntityKey| CompileError::UnresolvedReference {
        from: from.to_string(),
        kind: key.kind.to_string(),
        name: key.name.clone(),
    };
    match handle {
        Ref::Bound { id, key } => match graph.try_get(*id) {
            Some(e) if e.key() == *key => Ok(*id),
            _ => Err(unresolved(key)),
        },
        Ref::Named(key) => {
            let candidates = graph.candidates(key);
            let nearest_depth = candidates
                .iter()
                .map(|&id| graph.depth(id))
                .min()
                .ok_or_else(|| unresolved(key))?;
            let nearest: Vec<EntityId> = candidates
                .iter()
                .copied()
                .filter(|&id| graph.depth(id) == nearest_depth)
                .collect();
            if nearest.len() > 1 {
                return Err(CompileError::AmbiguousReference {
                    from: from.to_string(),
                    kind: key.kind.to_string(),
                    name: key.name.clone(),
                    candidates: nearest.len(),
                    hops: nearest_depth.to_string(),
                });
            }
            if candidates.len() > 1 {
                debug!(
                    "{} -> {}: picked declaration at depth {} of {} candidates",
                    from,
                    key,
                    nearest_depth,
                    candidates.len()
                );
            }
            Ok(nearest[0])
        }
    }
}

// ============================================================================
// Resolved graph
// ============================================================================

type TargetKey = (EntityId, String, String);

/// The arena plus every binding made by the resolve pass.
#[derive(Debug, Clone)]
pub struct ResolvedGraph {
    graph: EntityGraph,
    root: EntityId,
    reachable: Vec<EntityId>,
    slots: FxHashMap<EntityId, IndexMap<String, Vec<EntityId>>>,
    targets: FxHashMap<TargetKey, EntityId>,
}

impl ResolvedGraph {
    pub fn graph(&self) -> &EntityGraph {
        &self.graph
    }

    pub fn root(&self) -> EntityId {
        self.root
    }

    pub fn entity(&self, id: EntityId) -> &Entity {
        self.graph.get(id)
    }

    /// Reachable entities in breadth-first order, root first.
    pub fn reachable(&self) -> &[EntityId] {
        &self.reachable
    }

    pub fn reachable_of_kind(&self, kind: EntityKind) -> Vec<EntityId> {
        self.reachable
            .iter()
            .copied()
            .filter(|&id| self.graph.get(id).kind == kind)
            .collect()
    }

    pub fn is_resolved(&self, id: EntityId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Resolved targets of one ref slot.
    pub fn slot(&self, id: EntityId, slot: &str) -> &[EntityId] {
        self.slots
            .get(&id)
            .and_then(|s| s.get(slot))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Resolved target of one task, explicit or defaulted.
    pub fn target(&self, id: EntityId, action: &str, task: &str) -> Option<EntityId> {
        self.targets
            .get(&(id, action.to_string(), task.to_string()))
            .copied()
    }
}

/// Resolve everything reachable from the root.
pub fn resolve_graph(graph: EntityGraph) -> CompileResult<ResolvedGraph> {
    let root = graph
        .root()
        .ok_or_else(|| CompileError::validation("document", "no root entity declared"))?;

    let mut resolved = ResolvedGraph {
        graph,
        root,
        reachable: vec![root],
        slots: FxHashMap::default(),
        targets: FxHashMap::default(),
    };
    let mut seen: FxHashSet<EntityId> = FxHashSet::default();
    seen.insert(root);
    let mut queue = VecDeque::from([root]);

    while let Some(id) = queue.pop_front() {
        let next = resolve_entity(&mut resolved, id)?;
        for n in next {
            if seen.insert(n) {
                resolved.reachable.push(n);
                queue.push_back(n);
            }
        }
    }

    debug!(
        "resolved {} of {} declared entities",
        resolved.reachable.len(),
        resolved.graph.len()
    );
    Ok(resolved)
}

/// Bind one entity's slots and task targets; returns its neighbours in order.
fn resolve_entity(resolved: &mut ResolvedGraph, id: EntityId) -> CompileResult<Vec<EntityId>> {
    let graph = &resolved.graph;
    let entity = graph.get(id);
    let from = entity.key().to_string();
    let schema = kinds::schema(entity.kind);
    let mut neighbours = Vec::new();

    let mut bound: IndexMap<String, Vec<EntityId>> = IndexMap::new();
    for (slot, refs) in &entity.references {
        let ids = refs
            .iter()
            .map(|r| resolve(r, graph, &from))
            .collect::<CompileResult<Vec<_>>>()?;
        neighbours.extend(ids.iter().copied());
        bound.insert(slot.clone(), ids);
    }
    for spec in schema.slots.iter().filter(|s| s.required) {
        if bound.get(spec.name).map_or(true, Vec::is_empty) {
            return Err(CompileError::UnresolvedReference {
                from: from.clone(),
                kind: spec.target.to_string(),
                name: format!("<{}>", spec.name),
            });
        }
    }

    let mut targets = Vec::new();
    for (action_name, action) in &entity.actions {
        let scope = format!("{}.{}", entity.name, action_name);
        for node in action.tree.all_nodes() {
            let target = match &node.target {
                Some(r) => Some(resolve(r, graph, &from)?),
                None if node.kind.needs_target() => Some(match schema.default_target {
                    DefaultTarget::SelfEntity => id,
                    DefaultTarget::Slot(slot) => bound
                        .get(slot)
                        .and_then(|ids| ids.first().copied())
                        .ok_or_else(|| {
                            CompileError::structural(
                                &scope,
                                format!("task '{}' has no target and '{}' is empty", node.name, slot),
                            )
                        })?,
                    DefaultTarget::None => {
                        return Err(CompileError::structural(
                            &scope,
                            format!("task '{}' needs an explicit target", node.name),
                        ))
                    }
                }),
                None => None,
            };
            if let Some(t) = target {
                let actual = graph.get(t).kind;
                if let Some(expected) = node.kind.required_target_kind() {
                    if actual != expected {
                        return Err(CompileError::structural(
                            &scope,
                            format!(
                                "task '{}' must target a {}, not a {}",
                                node.name, expected, actual
                            ),
                        ));
                    }
                }
                neighbours.push(t);
                targets.push(((id, action_name.clone(), node.name.clone()), t));
            }
        }
    }

    resolved.slots.insert(id, bound);
    resolved.targets.extend(targets);
    Ok(neighbours)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entity::EntityBuilder;

    fn svc(name: &str) -> Entity {
        EntityBuilder::new(EntityKind::Service, name).build().unwrap()
    }

    fn pkg(name: &str, service: Ref) -> Entity {
        EntityBuilder::new(EntityKind::Package, name)
            .reference("services", service)
            .build()
            .unwrap()
    }

    fn blueprint_root(g: &mut EntityGraph) {
        let rb = EntityBuilder::new(EntityKind::Blueprint, "Bp").build().unwrap();
        g.declare_root(rb).unwrap();
    }

    #[test]
    fn test_bp005_named_resolves() {
        let mut g = EntityGraph::new();
        let s = g.declare(svc("S"));
        let id = resolve(&Ref::named(EntityKind::Service, "S"), &g, "test").unwrap();
        assert_eq!(id, s.id);
    }

    #[test]
    fn test_bp005_unresolved() {
        let g = EntityGraph::new();
        let err = resolve(&Ref::named(EntityKind::Service, "Ghost"), &g, "pkg").unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedReference { .. }));
    }

    #[test]
    fn test_bp005_kind_is_part_of_identity() {
        let mut g = EntityGraph::new();
        g.declare(svc("X"));
        assert!(resolve(&Ref::named(EntityKind::Package, "X"), &g, "t").is_err());
    }

    #[test]
    fn test_bp005_fewest_hops_wins() {
        let mut g = EntityGraph::new();
        let far = g.declare_at(svc("S"), 3);
        let near = g.declare_at(svc("S"), 2);
        let id = resolve(&Ref::named(EntityKind::Service, "S"), &g, "t").unwrap();
        assert_eq!(id, near.id);
        assert_ne!(id, far.id);
    }

    #[test]
    fn test_bp005_tie_is_ambiguous() {
        let mut g = EntityGraph::new();
        g.declare(svc("S"));
        g.declare(svc("S"));
        let err = resolve(&Ref::named(EntityKind::Service, "S"), &g, "t").unwrap_err();
        match err {
            CompileError::AmbiguousReference { candidates, hops, .. } => {
                assert_eq!(candidates, 2);
                assert_eq!(hops, "1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bp005_bound_handle() {
        let mut g = EntityGraph::new();
        g.declare(svc("S"));
        let second = g.declare(svc("S"));
        let id = resolve(&second.to_ref(), &g, "t").unwrap();
        assert_eq!(id, second.id);
        let stale = Ref::Bound {
            id: EntityId(7),
            key: EntityKey::new(EntityKind::Service, "S"),
        };
        assert!(resolve(&stale, &g, "t").is_err());
    }

    #[test]
    fn test_bp005_forward_reference() {
        // The package is declared before the service it names.
        let mut g = EntityGraph::new();
        let p = g.declare(pkg("P", Ref::named(EntityKind::Service, "S")));
        let s = g.declare(svc("S"));
        blueprint_root(&mut g);
        let resolved_id = resolve(&Ref::named(EntityKind::Service, "S"), &g, "P").unwrap();
        assert_eq!(resolved_id, s.id);
        assert_eq!(g.get(p.id).references["services"][0].key().name, "S");
    }

    #[test]
    fn test_bp005_reachability_skips_unused() {
        let mut g = EntityGraph::new();
        let s = g.declare(svc("S"));
        g.declare(svc("Unused"));
        let p = g.declare(pkg("P", s.to_ref()));
        let sub = g.declare(EntityBuilder::new(EntityKind::Substrate, "VM").build().unwrap());
        let dep = g.declare(
            EntityBuilder::new(EntityKind::Deployment, "D")
                .reference("packages", p.to_ref())
                .reference("substrate", sub.to_ref())
                .build()
                .unwrap(),
        );
        let prof = g.declare(
            EntityBuilder::new(EntityKind::Profile, "Default")
                .reference("deployments", dep.to_ref())
                .build()
                .unwrap(),
        );
        let root = g
            .declare_root(
                EntityBuilder::new(EntityKind::Blueprint, "Bp")
                    .reference("profiles", prof.to_ref())
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let r = resolve_graph(g).unwrap();
        assert_eq!(
            r.reachable(),
            &[root.id, prof.id, dep.id, p.id, sub.id, s.id]
        );
        assert_eq!(r.slot(dep.id, "packages"), &[p.id]);
        assert_eq!(r.reachable_of_kind(EntityKind::Service), vec![s.id]);
    }

    #[test]
    fn test_bp005_required_slot_missing() {
        let mut g = EntityGraph::new();
        let root = EntityBuilder::new(EntityKind::Blueprint, "Bp").build().unwrap();
        g.declare_root(root).unwrap();
        let err = resolve_graph(g).unwrap_err();
        assert!(err.to_string().contains("<profiles>"));
    }

    #[test]
    fn test_bp005_no_root() {
        let g = EntityGraph::new();
        assert!(resolve_graph(g).is_err());
    }
}
