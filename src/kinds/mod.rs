//! Entity kinds — schema and wire rendering per container type.
//!
//! Each kind declares:
//! 1. Its ref slots (target kind, cardinality)
//! 2. Its system actions and where they land in the payload
//! 3. Its attributes and their defaults
//! 4. How a resolved instance renders into the wire document

pub mod credential;
pub mod deployment;
pub mod endpoint;
pub mod package;
pub mod profile;
pub mod roots;
pub mod service;
pub mod substrate;

use crate::core::entity::{ActionKind, Entity};
use crate::core::error::{CompileError, CompileResult};
use crate::core::serializer::Renderer;
use crate::core::types::{is_identifier, EntityId, EntityKind};
use serde_json::Value;

/// Where a task without an explicit target runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultTarget {
    SelfEntity,
    /// First entity bound in this slot.
    Slot(&'static str),
    None,
}

/// One named reference slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSpec {
    pub name: &'static str,
    pub target: EntityKind,
    pub required: bool,
    pub many: bool,
}

impl SlotSpec {
    pub const fn one(name: &'static str, target: EntityKind, required: bool) -> Self {
        Self {
            name,
            target,
            required,
            many: false,
        }
    }

    pub const fn many(name: &'static str, target: EntityKind, required: bool) -> Self {
        Self {
            name,
            target,
            required,
            many: true,
        }
    }
}

/// Where a system action's runbook is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// An entry of `action_list`.
    ActionList,
    /// A runbook at a fixed dotted path inside the entity object.
    Field(&'static str),
}

/// A lifecycle hook of a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemAction {
    pub name: &'static str,
    pub wire: &'static str,
    pub placement: Placement,
}

/// Everything the compiler knows about one kind.
pub struct KindSchema {
    pub kind: EntityKind,
    pub slots: &'static [SlotSpec],
    pub system_actions: &'static [SystemAction],
    pub user_actions: bool,
    /// Render every system action even when undeclared.
    pub emit_all_system: bool,
    pub required_actions: &'static [&'static str],
    pub default_target: DefaultTarget,
    pub defaults: fn() -> Vec<(&'static str, Value)>,
    pub check: fn(&Entity) -> CompileResult<()>,
}

impl KindSchema {
    pub fn slot(&self, name: &str) -> Option<&'static SlotSpec> {
        self.slots.iter().find(|s| s.name == name)
    }

    pub fn system_action(&self, name: &str) -> Option<&'static SystemAction> {
        self.system_actions.iter().find(|a| a.name == name)
    }

    pub fn has_attr(&self, key: &str) -> bool {
        (self.defaults)().iter().any(|(k, _)| *k == key)
    }

    pub fn attr_default(&self, key: &str) -> Option<Value> {
        (self.defaults)()
            .into_iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

pub(crate) fn no_check(_: &Entity) -> CompileResult<()> {
    Ok(())
}

fn no_attrs() -> Vec<(&'static str, Value)> {
    Vec::new()
}

static MIXIN: KindSchema = KindSchema {
    kind: EntityKind::Mixin,
    slots: &[],
    system_actions: &[],
    user_actions: true,
    emit_all_system: false,
    required_actions: &[],
    default_target: DefaultTarget::None,
    defaults: no_attrs,
    check: no_check,
};

/// Schema of `kind`.
pub fn schema(kind: EntityKind) -> &'static KindSchema {
    match kind {
        EntityKind::Service => &service::SCHEMA,
        EntityKind::Package => &package::SCHEMA,
        EntityKind::Substrate => &substrate::SCHEMA,
        EntityKind::Deployment => &deployment::SCHEMA,
        EntityKind::Profile => &profile::SCHEMA,
        EntityKind::Credential => &credential::SCHEMA,
        EntityKind::Endpoint => &endpoint::SCHEMA,
        EntityKind::Blueprint => &roots::BLUEPRINT,
        EntityKind::Runbook => &roots::RUNBOOK,
        EntityKind::Environment => &roots::ENVIRONMENT,
        EntityKind::Project => &roots::PROJECT,
        EntityKind::Policy => &roots::POLICY,
        EntityKind::Mixin => &MIXIN,
    }
}

/// Classify actions, then validate the entity against its kind.
pub fn finalize(entity: &mut Entity) -> CompileResult<()> {
    if entity.kind == EntityKind::Mixin {
        return Ok(());
    }
    let schema = schema(entity.kind);
    for action in entity.actions.values_mut() {
        action.kind = match schema.system_action(&action.name) {
            Some(_) => ActionKind::System,
            None => ActionKind::User,
        };
    }
    validate(entity)
}

/// Check a concrete entity against its kind's schema.
pub fn validate(entity: &Entity) -> CompileResult<()> {
    if entity.kind == EntityKind::Mixin {
        return Ok(());
    }
    let schema = schema(entity.kind);
    let subject = entity.key().to_string();

    for (slot, refs) in &entity.references {
        let spec = schema.slot(slot).ok_or_else(|| {
            CompileError::validation(&subject, format!("unknown reference slot '{}'", slot))
        })?;
        if !spec.many && refs.len() > 1 {
            return Err(CompileError::validation(
                &subject,
                format!("slot '{}' takes a single {}", slot, spec.target),
            ));
        }
        for r in refs {
            if r.kind() != spec.target {
                return Err(CompileError::validation(
                    &subject,
                    format!("slot '{}' expects a {}, got {}", slot, spec.target, r.key()),
                ));
            }
        }
    }

    for key in entity.attrs.keys() {
        if !schema.has_attr(key) {
            return Err(CompileError::validation(
                &subject,
                format!("unknown attribute '{}'", key),
            ));
        }
    }
    for path in &entity.editables {
        let top = path.split('.').next().unwrap_or_default();
        if !schema.has_attr(top) {
            return Err(CompileError::validation(
                &subject,
                format!("editable '{}' names no attribute", path),
            ));
        }
    }

    for required in schema.required_actions {
        if !entity.actions.contains_key(*required) {
            return Err(CompileError::validation(
                &subject,
                format!("missing required action '{}'", required),
            ));
        }
    }

    for (name, action) in &entity.actions {
        let expected = match schema.system_action(name) {
            Some(_) => ActionKind::System,
            None if schema.user_actions => ActionKind::User,
            None => {
                return Err(CompileError::validation(
                    &subject,
                    format!("{}s do not accept action '{}'", entity.kind, name),
                ))
            }
        };
        if action.kind != expected {
            return Err(CompileError::validation(
                &subject,
                format!("action '{}' must be a {} action", name, expected.wire()),
            ));
        }
        let scope = format!("{}.{}", entity.name, name);
        for var in action.variables.keys() {
            if !is_identifier(var) {
                return Err(CompileError::validation(&scope, format!("bad variable '{}'", var)));
            }
        }
        for node in action.tree.all_nodes() {
            match &node.target {
                None if node.kind.needs_target() && schema.default_target == DefaultTarget::None => {
                    return Err(CompileError::structural(
                        &scope,
                        format!("task '{}' needs an explicit target", node.name),
                    ));
                }
                Some(t) => {
                    if let Some(k) = node.kind.required_target_kind() {
                        if t.kind() != k {
                            return Err(CompileError::structural(
                                &scope,
                                format!("task '{}' must target a {}, not {}", node.name, k, t.key()),
                            ));
                        }
                    }
                }
                None => {}
            }
        }
    }

    (schema.check)(entity)
}

/// Value of a dotted attribute path, defaults applied at the top level.
pub fn attr_value(entity: &Entity, path: &str) -> Option<Value> {
    let mut parts = path.split('.');
    let top = parts.next()?;
    let mut current = match entity.attrs.get(top) {
        Some(v) => v.clone(),
        None => schema(entity.kind).attr_default(top)?,
    };
    for part in parts {
        current = current.get(part)?.clone();
    }
    Some(current)
}

/// Name an action carries in the payload.
pub fn action_wire_name(kind: EntityKind, action: &str) -> String {
    match schema(kind).system_action(action) {
        Some(sa) => sa.wire.to_string(),
        None => action.to_string(),
    }
}

/// Dotted path of an action's runbook, relative to the entity object.
pub fn action_path(kind: EntityKind, action: &str) -> String {
    match schema(kind).system_action(action) {
        Some(SystemAction {
            placement: Placement::Field(path),
            ..
        }) => path.to_string(),
        _ => format!("action_list[{}].runbook", action_wire_name(kind, action)),
    }
}

/// Integer view of an attribute that may be a number or a numeric string.
pub(crate) fn as_int(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Check a string attribute against a closed set of values.
pub(crate) fn check_one_of(entity: &Entity, key: &str, allowed: &[&str]) -> CompileResult<()> {
    let value = attr_value(entity, key).unwrap_or(Value::Null);
    match value.as_str() {
        Some(s) if allowed.contains(&s) => Ok(()),
        _ => Err(CompileError::validation(
            entity.key().to_string(),
            format!("'{}' must be one of: {}", key, allowed.join(", ")),
        )),
    }
}

/// Render one reachable collection member.
pub fn render(r: &mut Renderer<'_>, id: EntityId) -> CompileResult<Value> {
    match r.entity(id).kind {
        EntityKind::Service => service::render(r, id),
        EntityKind::Package => package::render(r, id),
        EntityKind::Substrate => substrate::render(r, id),
        EntityKind::Deployment => deployment::render(r, id),
        EntityKind::Profile => profile::render(r, id),
        EntityKind::Credential => credential::render(r, id),
        EntityKind::Endpoint => endpoint::render(r, id),
        other => Err(CompileError::serialization(format!(
            "a {} cannot appear inside a document",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entity::{Action, EntityBuilder};
    use crate::core::reference::Ref;
    use crate::core::tasktree::{Step, TaskTreeBuilder};
    use serde_json::json;

    fn one_step(step: Step) -> crate::core::task::TaskTree {
        let mut b = TaskTreeBuilder::new("a");
        b.step(step).unwrap();
        b.finish().unwrap()
    }

    #[test]
    fn test_bp020_unknown_slot() {
        let err = EntityBuilder::new(EntityKind::Service, "S")
            .reference("services", Ref::named(EntityKind::Service, "X"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown reference slot"));
    }

    #[test]
    fn test_bp020_slot_kind_mismatch() {
        let err = EntityBuilder::new(EntityKind::Package, "P")
            .reference("services", Ref::named(EntityKind::Substrate, "VM"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("expects a service"));
    }

    #[test]
    fn test_bp020_single_slot_cardinality() {
        let err = EntityBuilder::new(EntityKind::Deployment, "D")
            .reference("substrate", Ref::named(EntityKind::Substrate, "A"))
            .reference("substrate", Ref::named(EntityKind::Substrate, "B"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("single substrate"));
    }

    #[test]
    fn test_bp020_unknown_attr() {
        let err = EntityBuilder::new(EntityKind::Service, "S")
            .attr("colour", json!("red"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown attribute 'colour'"));
    }

    #[test]
    fn test_bp020_user_action_rejected_on_package() {
        let err = EntityBuilder::new(EntityKind::Package, "P")
            .action(Action::new("backup", one_step(Step::exec("x", "true"))))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("do not accept action 'backup'"));
    }

    #[test]
    fn test_bp020_exec_needs_target_on_profile() {
        let err = EntityBuilder::new(EntityKind::Profile, "Prof")
            .action(Action::new("scale", one_step(Step::exec("x", "true"))))
            .build()
            .unwrap_err();
        assert!(matches!(err, CompileError::StructuralTask { .. }));
    }

    #[test]
    fn test_bp020_scaling_target_kind() {
        let bad = Step::scale_out("up", Ref::named(EntityKind::Service, "S"), "1");
        let err = EntityBuilder::new(EntityKind::Profile, "Prof")
            .action(Action::new("scale", one_step(bad)))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("must target a deployment"));
        let good = Step::scale_out("up", Ref::named(EntityKind::Deployment, "D"), "1");
        assert!(EntityBuilder::new(EntityKind::Profile, "Prof")
            .action(Action::new("scale", one_step(good)))
            .build()
            .is_ok());
    }

    #[test]
    fn test_bp020_mixin_validated_on_merge() {
        let m = EntityBuilder::new(EntityKind::Mixin, "M")
            .attr("colour", json!("red"))
            .build()
            .unwrap();
        let err = EntityBuilder::new(EntityKind::Service, "S")
            .extends(&m)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("colour"));
    }

    #[test]
    fn test_bp020_action_paths() {
        assert_eq!(action_path(EntityKind::Service, "create"), "action_list[action_create].runbook");
        assert_eq!(action_path(EntityKind::Package, "install"), "options.install_runbook");
        assert_eq!(action_path(EntityKind::Profile, "backup"), "action_list[backup].runbook");
        assert_eq!(action_path(EntityKind::Runbook, "run"), "runbook");
    }

    #[test]
    fn test_bp020_attr_value_defaults_and_nesting() {
        let e = EntityBuilder::new(EntityKind::Substrate, "VM")
            .attr("create_spec", json!({"resources": {"num_vcpus": 2}}))
            .build()
            .unwrap();
        assert_eq!(attr_value(&e, "create_spec.resources.num_vcpus"), Some(json!(2)));
        assert_eq!(attr_value(&e, "os_type"), Some(json!("Linux")));
        assert_eq!(attr_value(&e, "create_spec.missing"), None);
    }
}
