//! BP-011: Payload serializer.
//!
//! Renders a resolved graph into the versioned wire document. Identifiers are
//! v5 UUIDs over a fixed namespace and the entity's path inside the document,
//! so serializing the same graph twice yields the same bytes. Collections are
//! flattened in reachability order; two entities of one kind sharing a name
//! is an error at this point, as is an editable path the payload lacks.

use super::context::{CompileContext, LookupTable};
use super::editable::{self, EditableTree};
use super::entity::{Action, ActionKind, Entity};
use super::error::{CompileError, CompileResult};
use super::reference::ResolvedGraph;
use super::task::{TaskKind, TaskNode, TaskTree};
use super::types::{EntityId, EntityKind, SPEC_VERSION};
use super::variable::Variable;
use crate::kinds::{self, DefaultTarget, Placement};
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

/// Namespace every payload identifier is derived from.
pub const NAMESPACE: Uuid = Uuid::from_u128(0x3f1c_9a52_7be4_5d0e_a8c6_14f2_b09d_6e71);

/// Assigns one stable identifier per path for the lifetime of a serialize call.
#[derive(Debug, Default)]
pub struct IdAllocator {
    root: String,
    cache: FxHashMap<String, Uuid>,
}

impl IdAllocator {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            cache: FxHashMap::default(),
        }
    }

    pub fn id(&mut self, path: &str) -> Uuid {
        let full = format!("{}/{}", self.root, path);
        *self
            .cache
            .entry(full)
            .or_insert_with_key(|k| Uuid::new_v5(&NAMESPACE, k.as_bytes()))
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Child references and edges of one task level.
struct Level {
    children: Vec<Value>,
    edges: Vec<Value>,
}

/// Rendering state shared by every kind.
pub struct Renderer<'a> {
    resolved: &'a ResolvedGraph,
    ctx: &'a CompileContext,
    ids: IdAllocator,
}

impl<'a> Renderer<'a> {
    pub fn new(resolved: &'a ResolvedGraph, ctx: &'a CompileContext) -> Self {
        let root = &resolved.entity(resolved.root()).name;
        Self {
            resolved,
            ctx,
            ids: IdAllocator::new(root.clone()),
        }
    }

    pub fn resolved(&self) -> &'a ResolvedGraph {
        self.resolved
    }

    pub fn ctx(&self) -> &'a CompileContext {
        self.ctx
    }

    pub fn entity(&self, id: EntityId) -> &'a Entity {
        self.resolved.entity(id)
    }

    fn entity_path(&self, id: EntityId) -> String {
        let e = self.entity(id);
        format!("{}/{}", e.kind, e.name)
    }

    /// Identifier of the entity itself.
    pub fn uuid(&mut self, id: EntityId) -> String {
        let path = self.entity_path(id);
        self.ids.id(&path).to_string()
    }

    /// Identifier of something owned by the entity.
    pub fn sub_id(&mut self, id: EntityId, sub: &str) -> Uuid {
        let path = format!("{}/{}", self.entity_path(id), sub);
        self.ids.id(&path)
    }

    pub fn sub_uuid(&mut self, id: EntityId, sub: &str) -> String {
        self.sub_id(id, sub).to_string()
    }

    pub fn local_ref(&mut self, id: EntityId) -> Value {
        let e = self.entity(id);
        json!({
            "kind": e.kind.local_ref_kind(),
            "name": e.name,
            "uuid": self.uuid(id),
        })
    }

    pub fn slot_refs(&mut self, id: EntityId, slot: &str) -> Value {
        let ids = self.resolved.slot(id, slot).to_vec();
        Value::Array(ids.into_iter().map(|t| self.local_ref(t)).collect())
    }

    /// Single reference of a one-target slot, or null.
    pub fn slot_ref(&mut self, id: EntityId, slot: &str) -> Value {
        match self.resolved.slot(id, slot).first() {
            Some(&t) => self.local_ref(t),
            None => Value::Null,
        }
    }

    /// Attribute value, falling back to the kind's default.
    pub fn attr(&self, id: EntityId, key: &str) -> Value {
        kinds::attr_value(self.entity(id), key).unwrap_or(Value::Null)
    }

    /// `{name, description, uuid}` followed by every schema attribute.
    pub fn base_object(&mut self, id: EntityId) -> Map<String, Value> {
        let e = self.entity(id);
        let mut obj = Map::new();
        obj.insert("name".into(), json!(e.name));
        obj.insert("description".into(), json!(e.description));
        obj.insert("uuid".into(), json!(self.uuid(id)));
        self.insert_attrs(id, &mut obj);
        obj
    }

    /// Every schema attribute, in schema order.
    pub fn insert_attrs(&self, id: EntityId, obj: &mut Map<String, Value>) {
        let e = self.entity(id);
        for (key, _) in (kinds::schema(e.kind).defaults)() {
            obj.insert(key.to_string(), self.attr(id, key));
        }
    }

    /// Resolve a name through the read-only lookup tables.
    pub fn lookup(&self, table: LookupTable, name: &str, from: &str) -> CompileResult<Value> {
        let uuid = self.ctx.lookups.get(table, name).ok_or_else(|| {
            CompileError::UnresolvedReference {
                from: from.to_string(),
                kind: table.kind().to_string(),
                name: name.to_string(),
            }
        })?;
        Ok(json!({"kind": table.kind(), "name": name, "uuid": uuid.to_string()}))
    }

    /// Lookup references for every name in a string-array attribute.
    pub fn lookup_list(&self, id: EntityId, attr: &str, table: LookupTable) -> CompileResult<Value> {
        let from = self.entity(id).key().to_string();
        let names = self.attr(id, attr);
        let mut out = Vec::new();
        for name in names.as_array().into_iter().flatten() {
            let name = name.as_str().ok_or_else(|| {
                CompileError::validation(&from, format!("'{}' must list names", attr))
            })?;
            out.push(self.lookup(table, name, &from)?);
        }
        Ok(Value::Array(out))
    }

    pub fn variables(&mut self, id: EntityId) -> Value {
        let vars = &self.entity(id).variables;
        self.variable_list(id, "", vars)
    }

    fn variable_list(&mut self, id: EntityId, scope: &str, vars: &IndexMap<String, Variable>) -> Value {
        Value::Array(
            vars.values()
                .map(|v| {
                    let uuid = self.sub_id(id, &format!("{}variable/{}", scope, v.name));
                    v.render(uuid)
                })
                .collect(),
        )
    }

    /// Actions listed under `action_list`: system hooks first, then user actions.
    pub fn action_list(&mut self, id: EntityId) -> CompileResult<Value> {
        let e = self.entity(id);
        let schema = kinds::schema(e.kind);
        let mut out = Vec::new();
        for sa in schema.system_actions {
            if sa.placement != Placement::ActionList {
                continue;
            }
            match e.actions.get(sa.name) {
                Some(a) => out.push(self.action(id, a, sa.wire)?),
                None if schema.emit_all_system => {
                    let stub = stub_action(sa.name);
                    out.push(self.action(id, &stub, sa.wire)?);
                }
                None => {}
            }
        }
        for a in e.actions.values().filter(|a| a.kind == ActionKind::User) {
            out.push(self.action(id, a, &a.name)?);
        }
        Ok(Value::Array(out))
    }

    /// Runbook of a system action placed in a dedicated field.
    pub fn runbook_for(&mut self, id: EntityId, name: &str) -> CompileResult<Value> {
        match self.entity(id).actions.get(name) {
            Some(a) => self.runbook(id, a),
            None => self.runbook(id, &stub_action(name)),
        }
    }

    fn action(&mut self, id: EntityId, action: &Action, wire_name: &str) -> CompileResult<Value> {
        Ok(json!({
            "name": wire_name,
            "description": action.description,
            "uuid": self.sub_uuid(id, &format!("action/{}", action.name)),
            "type": action.kind.wire(),
            "critical": action.critical,
            "runbook": self.runbook(id, action)?,
        }))
    }

    fn runbook(&mut self, id: EntityId, action: &Action) -> CompileResult<Value> {
        let e = self.entity(id);
        let scope = format!("action/{}/", action.name);
        let dag_name = format!("{}_{}_dag", e.name, action.name);
        if action.tree.all_nodes().iter().any(|n| n.name == dag_name) {
            return Err(CompileError::structural(
                &action.name,
                format!("task name '{}' is reserved for the main task", dag_name),
            ));
        }
        let dag_ref = json!({
            "kind": "app_task",
            "name": dag_name,
            "uuid": self.sub_uuid(id, &format!("{}dag", scope)),
        });

        let mut tasks = vec![Value::Null];
        let top = self.level(id, action, &scope, &action.tree, &mut tasks)?;
        let mut dag = json!({
            "name": dag_name,
            "description": "",
            "uuid": dag_ref["uuid"],
            "type": "DAG",
            "attrs": {"edges": top.edges},
            "variable_list": [],
            "child_tasks_local_reference_list": top.children,
            "retries": 0,
            "timeout_secs": 0,
        });
        if let (Some(t), Some(obj)) = (self.default_target(id), dag.as_object_mut()) {
            let target = self.local_ref(t);
            obj.insert("target_any_local_reference".into(), target);
        }
        tasks[0] = dag;

        Ok(json!({
            "name": format!("{}_{}_runbook", e.name, action.name),
            "description": action.description,
            "uuid": self.sub_uuid(id, &format!("{}runbook", scope)),
            "main_task_local_reference": dag_ref,
            "task_definition_list": tasks,
            "variable_list": self.variable_list(id, &scope, &action.variables),
        }))
    }

    fn default_target(&self, id: EntityId) -> Option<EntityId> {
        match kinds::schema(self.entity(id).kind).default_target {
            DefaultTarget::SelfEntity => Some(id),
            DefaultTarget::Slot(slot) => self.resolved.slot(id, slot).first().copied(),
            DefaultTarget::None => None,
        }
    }

    fn task_ref(&mut self, id: EntityId, scope: &str, name: &str) -> Value {
        json!({
            "kind": "app_task",
            "name": name,
            "uuid": self.sub_uuid(id, &format!("{}task/{}", scope, name)),
        })
    }

    /// Render one tree level into `out`; returns its children and edges.
    fn level(
        &mut self,
        id: EntityId,
        action: &Action,
        scope: &str,
        tree: &TaskTree,
        out: &mut Vec<Value>,
    ) -> CompileResult<Level> {
        let mut level = Level {
            children: Vec::new(),
            edges: Vec::new(),
        };
        for node in tree.nodes() {
            self.task(id, action, scope, node, out)?;
            level.children.push(self.task_ref(id, scope, &node.name));
            for pred in &node.predecessors {
                level.edges.push(json!({
                    "from_task_reference": self.task_ref(id, scope, pred),
                    "to_task_reference": self.task_ref(id, scope, &node.name),
                }));
            }
        }
        Ok(level)
    }

    fn task(
        &mut self,
        id: EntityId,
        action: &Action,
        scope: &str,
        node: &TaskNode,
        out: &mut Vec<Value>,
    ) -> CompileResult<()> {
        let slot = out.len();
        out.push(Value::Null);

        let mut children = Vec::new();
        let attrs = match &node.kind {
            TaskKind::Exec {
                script_type,
                script,
            } => json!({"script_type": script_type.wire(), "script": script}),
            TaskKind::SetVariable {
                script_type,
                script,
                variables,
            } => json!({
                "script_type": script_type.wire(),
                "script": script,
                "eval_variables": variables,
            }),
            TaskKind::Http {
                method,
                url,
                body,
                headers,
                status_codes,
                response_paths,
            } => json!({
                "method": method,
                "url": url,
                "request_body": body,
                "headers": headers
                    .iter()
                    .map(|(k, v)| json!({"name": k, "value": v}))
                    .collect::<Vec<_>>(),
                "expected_response_params": status_codes
                    .iter()
                    .map(|c| json!({"status": "SUCCESS", "code": c}))
                    .collect::<Vec<_>>(),
                "response_paths": response_paths,
            }),
            TaskKind::Scaling { direction, count } => {
                json!({"scaling_type": direction.wire(), "scaling_count": count})
            }
            TaskKind::Delay { seconds } => json!({"interval_secs": seconds}),
            TaskKind::Input { inputs } => json!({
                "inputs": inputs
                    .iter()
                    .map(|i| json!({"name": i, "input_type": "text", "options": []}))
                    .collect::<Vec<_>>(),
            }),
            TaskKind::Decision {
                script_type,
                script,
                success,
                failure,
            } => {
                let s = self.level(id, action, scope, success, out)?;
                let f = self.level(id, action, scope, failure, out)?;
                json!({
                    "script_type": script_type.wire(),
                    "script": script,
                    "success_branch": {"child_tasks_local_reference_list": s.children, "edges": s.edges},
                    "failure_branch": {"child_tasks_local_reference_list": f.children, "edges": f.edges},
                })
            }
            TaskKind::Loop {
                iterations,
                loop_variable,
                body,
            } => {
                let b = self.level(id, action, scope, body, out)?;
                children = b.children;
                json!({
                    "iterations": iterations,
                    "loop_variable": loop_variable,
                    "exit_condition_type": "dont_care",
                    "edges": b.edges,
                })
            }
        };

        let mut obj = Map::new();
        obj.insert("name".into(), json!(node.name));
        obj.insert("description".into(), json!(node.description));
        obj.insert(
            "uuid".into(),
            json!(self.sub_uuid(id, &format!("{}task/{}", scope, node.name))),
        );
        obj.insert("type".into(), json!(node.kind.wire()));
        obj.insert("attrs".into(), attrs);
        obj.insert("variable_list".into(), json!([]));
        obj.insert("child_tasks_local_reference_list".into(), Value::Array(children));
        if let Some(t) = self.resolved.target(id, &action.name, &node.name) {
            let target = self.local_ref(t);
            obj.insert("target_any_local_reference".into(), target);
        }
        obj.insert("retries".into(), json!(node.retries));
        obj.insert("timeout_secs".into(), json!(node.timeout_secs));
        out[slot] = Value::Object(obj);
        Ok(())
    }

    /// Flattened collection of every reachable entity of `kind`.
    pub fn collection(&mut self, kind: EntityKind) -> CompileResult<Value> {
        let ids = self.resolved.reachable_of_kind(kind);
        let mut names: FxHashSet<&str> = FxHashSet::default();
        for &id in &ids {
            let name = self.entity(id).name.as_str();
            if !names.insert(name) {
                return Err(CompileError::serialization(format!(
                    "duplicate {} name '{}' after flattening",
                    kind, name
                )));
            }
        }
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(kinds::render(self, id)?);
        }
        Ok(Value::Array(out))
    }
}

fn stub_action(name: &str) -> Action {
    let mut a = Action::new(name, TaskTree::empty());
    a.kind = ActionKind::System;
    a
}

/// Render the resolved graph and its editable tree into the wire document.
pub fn serialize(
    resolved: &ResolvedGraph,
    editables: &EditableTree,
    ctx: &CompileContext,
) -> CompileResult<Value> {
    for &id in resolved.reachable() {
        if !resolved.is_resolved(id) {
            return Err(CompileError::serialization(format!(
                "{} was never resolved",
                resolved.entity(id).key()
            )));
        }
    }

    let root_id = resolved.root();
    let root = resolved.entity(root_id);
    let mut r = Renderer::new(resolved, ctx);
    let resources = kinds::roots::render_resources(&mut r)?;

    let mut metadata = json!({
        "kind": root.kind.local_ref_kind(),
        "name": root.name,
        "spec_version": SPEC_VERSION,
        "categories": {},
    });
    if let (Some(project), Some(meta)) = (&ctx.project, metadata.as_object_mut()) {
        let reference = r.lookup(LookupTable::Project, project, "document")?;
        meta.insert("project_reference".into(), reference);
    }

    let mut doc = json!({
        "api_version": ctx.api_version,
        "metadata": metadata,
        "spec": {
            "name": root.name,
            "description": root.description,
            "resources": resources,
        },
    });

    for path in editables.paths() {
        if editable::lookup(&doc, path).is_none() {
            return Err(CompileError::serialization(format!(
                "editable path '{}' does not exist in the payload",
                path
            )));
        }
    }
    if let Some(obj) = doc.as_object_mut() {
        obj.insert("runtime_editables".into(), editables.to_value());
    }
    debug!("assigned {} identifiers", r.ids.len());
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bp011_ids_stable() {
        let mut a = IdAllocator::new("Bp");
        let mut b = IdAllocator::new("Bp");
        let x = a.id("service/S");
        assert_eq!(x, a.id("service/S"));
        assert_eq!(x, b.id("service/S"));
        assert_ne!(x, a.id("service/T"));
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_bp011_ids_scoped_by_root() {
        let mut a = IdAllocator::new("One");
        let mut b = IdAllocator::new("Two");
        assert_ne!(a.id("service/S"), b.id("service/S"));
    }

    #[test]
    fn test_bp011_v5() {
        let mut a = IdAllocator::new("Bp");
        assert_eq!(a.id("x").get_version_num(), 5);
    }
}
