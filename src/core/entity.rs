//! BP-007: Entities, actions, and type composition.
//!
//! An entity is an immutable value produced by `EntityBuilder::build`.
//! Inheritance is explicit composition: `base_attributes` merges the listed
//! bases, then the builder overlays the subtype's own declarations.
//!
//! Merge rules:
//! - own variables, attributes and ref slots replace inherited ones by name;
//! - own actions replace an inherited action wholesale, otherwise the
//!   inherited action keeps pointing at the very same task tree;
//! - at most one base may share the subtype's kind, the rest must be mixins;
//! - two bases defining the same action or the same ref slot conflict;
//! - a variable or attribute offered by several bases comes from the first
//!   base listed.

use super::error::{CompileError, CompileResult};
use super::reference::Ref;
use super::task::TaskTree;
use super::types::{is_identifier, EntityKey, EntityKind};
use super::variable::Variable;
use crate::kinds;
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Whether an action is one of the kind's lifecycle hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    System,
    User,
}

impl ActionKind {
    pub fn wire(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
        }
    }
}

/// A named action body plus its local variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub name: String,
    pub description: String,
    pub kind: ActionKind,
    pub critical: bool,
    pub variables: IndexMap<String, Variable>,
    pub tree: Arc<TaskTree>,
}

impl Action {
    pub fn new(name: impl Into<String>, tree: TaskTree) -> Self {
        Self::shared(name, Arc::new(tree))
    }

    /// Action over an already shared body.
    pub fn shared(name: impl Into<String>, tree: Arc<TaskTree>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            kind: ActionKind::User,
            critical: false,
            variables: IndexMap::new(),
            tree,
        }
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    pub fn critical(mut self, yes: bool) -> Self {
        self.critical = yes;
        self
    }

    pub fn variable(mut self, var: Variable) -> Self {
        self.variables.insert(var.name.clone(), var);
        self
    }
}

/// A compiled container.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub kind: EntityKind,
    pub name: String,
    pub description: String,
    pub variables: IndexMap<String, Variable>,
    pub actions: IndexMap<String, Action>,
    pub references: IndexMap<String, Vec<Ref>>,
    pub attrs: IndexMap<String, Value>,
    /// Attribute paths (dot separated) that may be overridden at launch.
    pub editables: Vec<String>,
    /// Names of every base this entity was composed from, outermost first.
    pub lineage: Vec<String>,
}

impl Entity {
    fn blank(kind: EntityKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            description: String::new(),
            variables: IndexMap::new(),
            actions: IndexMap::new(),
            references: IndexMap::new(),
            attrs: IndexMap::new(),
            editables: Vec::new(),
            lineage: Vec::new(),
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.name.clone())
    }

    pub fn extends_from(&self, base: &str) -> bool {
        self.lineage.iter().any(|b| b == base)
    }
}

/// Merge `bases` into a fresh entity of `kind`.
pub fn base_attributes(kind: EntityKind, name: &str, bases: &[Entity]) -> CompileResult<Entity> {
    let subject = EntityKey::new(kind, name).to_string();
    let mut merged = Entity::blank(kind, name);
    let mut concrete: Option<&Entity> = None;

    for base in bases {
        if base.kind != EntityKind::Mixin && base.kind != kind {
            return Err(CompileError::merge(
                &subject,
                format!("cannot extend {}", base.key()),
            ));
        }
        if base.kind != EntityKind::Mixin {
            if let Some(prev) = concrete {
                return Err(CompileError::merge(
                    &subject,
                    format!(
                        "bases '{}' and '{}' are both {}s; their system actions would collide",
                        prev.name, base.name, kind
                    ),
                ));
            }
            concrete = Some(base);
        }

        for ancestor in base.lineage.iter().chain(std::iter::once(&base.name)) {
            if !merged.lineage.contains(ancestor) {
                merged.lineage.push(ancestor.clone());
            }
        }
        if merged.description.is_empty() {
            merged.description = base.description.clone();
        }
        for (n, v) in &base.variables {
            if merged.variables.contains_key(n) {
                debug!("{}: variable '{}' from '{}' shadowed by an earlier base", subject, n, base.name);
                continue;
            }
            merged.variables.insert(n.clone(), v.clone());
        }
        for (n, a) in &base.actions {
            if merged.actions.contains_key(n) {
                return Err(CompileError::merge(
                    &subject,
                    format!("action '{}' is defined by more than one base", n),
                ));
            }
            merged.actions.insert(n.clone(), a.clone());
        }
        for (slot, refs) in &base.references {
            if merged.references.contains_key(slot) {
                return Err(CompileError::merge(
                    &subject,
                    format!("reference slot '{}' is defined by more than one base", slot),
                ));
            }
            merged.references.insert(slot.clone(), refs.clone());
        }
        for (k, v) in &base.attrs {
            merged.attrs.entry(k.clone()).or_insert_with(|| v.clone());
        }
        for e in &base.editables {
            if !merged.editables.contains(e) {
                merged.editables.push(e.clone());
            }
        }
    }
    Ok(merged)
}

/// Accumulates one entity's declarations.
#[derive(Debug, Clone)]
pub struct EntityBuilder {
    kind: EntityKind,
    name: String,
    description: Option<String>,
    bases: Vec<Entity>,
    variables: Vec<Variable>,
    actions: Vec<Action>,
    references: IndexMap<String, Vec<Ref>>,
    attrs: IndexMap<String, Value>,
    editables: Vec<String>,
}

impl EntityBuilder {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            description: None,
            bases: Vec::new(),
            variables: Vec::new(),
            actions: Vec::new(),
            references: IndexMap::new(),
            attrs: IndexMap::new(),
            editables: Vec::new(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Compose from `base`. Bases merge in the order they are listed.
    pub fn extends(mut self, base: &Entity) -> Self {
        self.bases.push(base.clone());
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn variable(mut self, var: Variable) -> Self {
        self.variables.push(var);
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Append one target to a ref slot.
    pub fn reference(mut self, slot: impl Into<String>, target: impl Into<Ref>) -> Self {
        self.references
            .entry(slot.into())
            .or_default()
            .push(target.into());
        self
    }

    /// Set a ref slot to exactly `targets`.
    pub fn references(mut self, slot: impl Into<String>, targets: Vec<Ref>) -> Self {
        self.references.insert(slot.into(), targets);
        self
    }

    pub fn attr(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }

    /// Mark an attribute path as runtime-editable.
    pub fn editable(mut self, path: impl Into<String>) -> Self {
        self.editables.push(path.into());
        self
    }

    pub fn build(self) -> CompileResult<Entity> {
        let subject = EntityKey::new(self.kind, self.name.clone()).to_string();
        if self.name.trim().is_empty() {
            return Err(CompileError::validation(&subject, "name is empty"));
        }

        let mut entity = base_attributes(self.kind, &self.name, &self.bases)?;
        if let Some(d) = self.description {
            entity.description = d;
        }

        let mut seen = Vec::new();
        for var in self.variables {
            if seen.contains(&var.name) {
                return Err(CompileError::validation(
                    &subject,
                    format!("variable '{}' declared twice", var.name),
                ));
            }
            seen.push(var.name.clone());
            entity.variables.insert(var.name.clone(), var);
        }

        let mut seen = Vec::new();
        for action in self.actions {
            if !is_identifier(&action.name) {
                return Err(CompileError::validation(
                    &subject,
                    format!("action name '{}' is not a valid identifier", action.name),
                ));
            }
            if seen.contains(&action.name) {
                return Err(CompileError::validation(
                    &subject,
                    format!("action '{}' declared twice", action.name),
                ));
            }
            seen.push(action.name.clone());
            entity.actions.insert(action.name.clone(), action);
        }

        for (slot, refs) in self.references {
            entity.references.insert(slot, refs);
        }
        for (k, v) in self.attrs {
            entity.attrs.insert(k, v);
        }
        for e in self.editables {
            if !entity.editables.contains(&e) {
                entity.editables.push(e);
            }
        }

        kinds::finalize(&mut entity)?;
        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tasktree::{Step, TaskTreeBuilder};
    use crate::core::variable::VariableDecl;
    use serde_json::json;

    fn var(name: &str, value: &str) -> Variable {
        VariableDecl::simple(name, value).declare().unwrap()
    }

    fn tree(steps: &[&str]) -> TaskTree {
        let mut b = TaskTreeBuilder::new("t");
        for s in steps {
            b.step(Step::exec(*s, "true")).unwrap();
        }
        b.finish().unwrap()
    }

    fn base_service() -> Entity {
        EntityBuilder::new(EntityKind::Service, "Base")
            .description("base service")
            .variable(var("A", "1"))
            .variable(var("B", "2"))
            .variable(var("C", "3"))
            .action(Action::new("start", tree(&["s1"])))
            .action(Action::new("stop", tree(&["s2"])))
            .build()
            .unwrap()
    }

    #[test]
    fn test_bp007_override_law() {
        let base = base_service();
        let sub = EntityBuilder::new(EntityKind::Service, "Sub")
            .extends(&base)
            .variable(var("B", "new"))
            .build()
            .unwrap();
        assert_eq!(sub.variables["B"].value, "new");
        assert_eq!(sub.variables["A"], base.variables["A"]);
        assert_eq!(sub.variables["C"], base.variables["C"]);
        let names: Vec<&str> = sub.variables.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert_eq!(sub.description, "base service");
        assert_eq!(sub.lineage, vec!["Base".to_string()]);
    }

    #[test]
    fn test_bp007_inherited_action_shares_tree() {
        let base = base_service();
        let sub = EntityBuilder::new(EntityKind::Service, "Sub")
            .extends(&base)
            .action(Action::new("stop", tree(&["other"])))
            .build()
            .unwrap();
        assert!(Arc::ptr_eq(&sub.actions["start"].tree, &base.actions["start"].tree));
        assert!(!Arc::ptr_eq(&sub.actions["stop"].tree, &base.actions["stop"].tree));
        assert!(sub.actions["stop"].tree.get("s2").is_none());
        assert_eq!(sub.actions["start"].kind, ActionKind::System);
    }

    #[test]
    fn test_bp007_two_concrete_bases_conflict() {
        let a = base_service();
        let b = EntityBuilder::new(EntityKind::Service, "Other").build().unwrap();
        let err = EntityBuilder::new(EntityKind::Service, "Both")
            .extends(&a)
            .extends(&b)
            .build()
            .unwrap_err();
        assert!(matches!(err, CompileError::MergeConflict { .. }));
    }

    #[test]
    fn test_bp007_kind_mismatch_base() {
        let svc = base_service();
        let err = EntityBuilder::new(EntityKind::Package, "P")
            .extends(&svc)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("cannot extend service 'Base'"));
    }

    #[test]
    fn test_bp007_mixins_disjoint() {
        let logging = EntityBuilder::new(EntityKind::Mixin, "Logging")
            .variable(var("LOG_LEVEL", "info"))
            .action(Action::new("rotate_logs", tree(&["rotate"])))
            .build()
            .unwrap();
        let sub = EntityBuilder::new(EntityKind::Service, "App")
            .extends(&base_service())
            .extends(&logging)
            .build()
            .unwrap();
        assert!(sub.variables.contains_key("LOG_LEVEL"));
        assert_eq!(sub.actions["rotate_logs"].kind, ActionKind::User);
        assert!(sub.extends_from("Logging"));
    }

    #[test]
    fn test_bp007_mixin_action_overlap() {
        let m1 = EntityBuilder::new(EntityKind::Mixin, "M1")
            .action(Action::new("start", tree(&["x"])))
            .build()
            .unwrap();
        let err = EntityBuilder::new(EntityKind::Service, "S")
            .extends(&base_service())
            .extends(&m1)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("action 'start'"));
    }

    #[test]
    fn test_bp007_mixin_slot_overlap() {
        let s = Ref::named(EntityKind::Service, "S");
        let m1 = EntityBuilder::new(EntityKind::Mixin, "M1")
            .reference("depends_on", s.clone())
            .build()
            .unwrap();
        let m2 = EntityBuilder::new(EntityKind::Mixin, "M2")
            .reference("depends_on", s)
            .build()
            .unwrap();
        let err = EntityBuilder::new(EntityKind::Service, "X")
            .extends(&m1)
            .extends(&m2)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("reference slot 'depends_on'"));
    }

    #[test]
    fn test_bp007_variable_first_base_wins() {
        let m1 = EntityBuilder::new(EntityKind::Mixin, "M1")
            .variable(var("V", "first"))
            .build()
            .unwrap();
        let m2 = EntityBuilder::new(EntityKind::Mixin, "M2")
            .variable(var("V", "second"))
            .build()
            .unwrap();
        let e = EntityBuilder::new(EntityKind::Service, "X")
            .extends(&m1)
            .extends(&m2)
            .build()
            .unwrap();
        assert_eq!(e.variables["V"].value, "first");
    }

    #[test]
    fn test_bp007_duplicate_own_variable() {
        let err = EntityBuilder::new(EntityKind::Service, "X")
            .variable(var("V", "1"))
            .variable(var("V", "2"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn test_bp007_own_slot_replaces_inherited() {
        let base = EntityBuilder::new(EntityKind::Service, "B")
            .reference("depends_on", Ref::named(EntityKind::Service, "Db"))
            .build()
            .unwrap();
        let sub = EntityBuilder::new(EntityKind::Service, "S")
            .extends(&base)
            .reference("depends_on", Ref::named(EntityKind::Service, "Cache"))
            .build()
            .unwrap();
        assert_eq!(sub.references["depends_on"].len(), 1);
        assert_eq!(sub.references["depends_on"][0].key().name, "Cache");
    }

    #[test]
    fn test_bp007_attrs_and_editables() {
        let base = EntityBuilder::new(EntityKind::Deployment, "Base")
            .attr("max_replicas", json!(4))
            .editable("max_replicas")
            .build()
            .unwrap();
        let sub = EntityBuilder::new(EntityKind::Deployment, "D")
            .extends(&base)
            .attr("min_replicas", json!(2))
            .editable("min_replicas")
            .build()
            .unwrap();
        assert_eq!(sub.attrs["max_replicas"], json!(4));
        assert_eq!(sub.attrs["min_replicas"], json!(2));
        assert_eq!(sub.editables, vec!["max_replicas", "min_replicas"]);
    }

    #[test]
    fn test_bp007_empty_name() {
        assert!(EntityBuilder::new(EntityKind::Service, " ").build().is_err());
    }
}
