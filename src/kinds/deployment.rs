//! BP-024: Deployment kind — packages placed on a substrate, with replica bounds.

use super::{as_int, check_one_of, DefaultTarget, KindSchema, SlotSpec};
use crate::core::entity::Entity;
use crate::core::error::{CompileError, CompileResult};
use crate::core::serializer::Renderer;
use crate::core::types::{EntityId, EntityKind};
use serde_json::{json, Value};

pub(crate) static SCHEMA: KindSchema = KindSchema {
    kind: EntityKind::Deployment,
    slots: &[
        SlotSpec::many("packages", EntityKind::Package, true),
        SlotSpec::one("substrate", EntityKind::Substrate, true),
        SlotSpec::many("depends_on", EntityKind::Deployment, false),
    ],
    system_actions: &[],
    user_actions: false,
    emit_all_system: false,
    required_actions: &[],
    default_target: DefaultTarget::None,
    defaults,
    check,
};

fn defaults() -> Vec<(&'static str, Value)> {
    vec![
        ("min_replicas", json!("1")),
        ("max_replicas", json!("1")),
        ("default_replicas", Value::Null),
        ("type", json!("GREENFIELD")),
    ]
}

fn check(entity: &Entity) -> CompileResult<()> {
    check_one_of(entity, "type", &["GREENFIELD", "BROWNFIELD"])?;
    let attr = |k: &str| super::attr_value(entity, k).as_ref().and_then(as_int);
    if let (Some(min), Some(max)) = (attr("min_replicas"), attr("max_replicas")) {
        if min > max {
            return Err(CompileError::validation(
                entity.key().to_string(),
                format!("min_replicas {} exceeds max_replicas {}", min, max),
            ));
        }
        if let Some(default) = attr("default_replicas") {
            if default < min || default > max {
                return Err(CompileError::validation(
                    entity.key().to_string(),
                    format!("default_replicas {} outside {}..={}", default, min, max),
                ));
            }
        }
    }
    Ok(())
}

pub fn render(r: &mut Renderer<'_>, id: EntityId) -> CompileResult<Value> {
    let mut obj = r.base_object(id);
    obj.insert("package_local_reference_list".into(), r.slot_refs(id, "packages"));
    obj.insert("substrate_local_reference".into(), r.slot_ref(id, "substrate"));
    obj.insert("depends_on_list".into(), r.slot_refs(id, "depends_on"));
    obj.insert("variable_list".into(), r.variables(id));
    obj.insert("action_list".into(), r.action_list(id)?);
    Ok(Value::Object(obj))
}
