//! BP-025: Profile kind — one launchable flavour of the application.

use super::{DefaultTarget, KindSchema, SlotSpec};
use crate::core::context::LookupTable;
use crate::core::error::CompileResult;
use crate::core::serializer::Renderer;
use crate::core::types::{EntityId, EntityKind};
use serde_json::{json, Value};

pub(crate) static SCHEMA: KindSchema = KindSchema {
    kind: EntityKind::Profile,
    slots: &[SlotSpec::many("deployments", EntityKind::Deployment, true)],
    system_actions: &[],
    user_actions: true,
    emit_all_system: false,
    required_actions: &[],
    default_target: DefaultTarget::None,
    defaults,
    check: super::no_check,
};

fn defaults() -> Vec<(&'static str, Value)> {
    vec![("environment", Value::Null)]
}

pub fn render(r: &mut Renderer<'_>, id: EntityId) -> CompileResult<Value> {
    let mut obj = r.base_object(id);
    let from = r.entity(id).key().to_string();
    let environments = match r.attr(id, "environment").as_str() {
        Some(env) => json!([r.lookup(LookupTable::Environment, env, &from)?]),
        None => json!([]),
    };
    obj.insert("environment_reference_list".into(), environments);
    obj.insert("deployment_local_reference_list".into(), r.slot_refs(id, "deployments"));
    obj.insert("variable_list".into(), r.variables(id));
    obj.insert("action_list".into(), r.action_list(id)?);
    Ok(Value::Object(obj))
}
