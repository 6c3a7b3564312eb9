//! BP-021: Service kind — the software a deployment runs.

use super::{DefaultTarget, KindSchema, Placement, SlotSpec, SystemAction};
use crate::core::error::CompileResult;
use crate::core::serializer::Renderer;
use crate::core::types::{EntityId, EntityKind};
use serde_json::{json, Value};

const fn hook(name: &'static str, wire: &'static str) -> SystemAction {
    SystemAction {
        name,
        wire,
        placement: Placement::ActionList,
    }
}

pub(crate) static SCHEMA: KindSchema = KindSchema {
    kind: EntityKind::Service,
    slots: &[SlotSpec::many("depends_on", EntityKind::Service, false)],
    system_actions: &[
        hook("create", "action_create"),
        hook("start", "action_start"),
        hook("stop", "action_stop"),
        hook("restart", "action_restart"),
        hook("delete", "action_delete"),
        hook("soft_delete", "action_soft_delete"),
    ],
    user_actions: true,
    emit_all_system: true,
    required_actions: &[],
    default_target: DefaultTarget::SelfEntity,
    defaults,
    check: super::no_check,
};

fn defaults() -> Vec<(&'static str, Value)> {
    vec![
        ("singleton", json!(false)),
        ("tier", json!("")),
        ("port_list", json!([])),
        ("container_spec", json!({})),
    ]
}

/// Render a service definition. All six lifecycle actions are always present.
pub fn render(r: &mut Renderer<'_>, id: EntityId) -> CompileResult<Value> {
    let mut obj = r.base_object(id);
    obj.insert("depends_on_list".into(), r.slot_refs(id, "depends_on"));
    obj.insert("variable_list".into(), r.variables(id));
    obj.insert("action_list".into(), r.action_list(id)?);
    Ok(Value::Object(obj))
}
