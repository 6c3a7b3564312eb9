//! BP-027: Endpoint kind — an existing machine or URL a runbook runs against.

use super::{check_one_of, DefaultTarget, KindSchema, SlotSpec};
use crate::core::entity::Entity;
use crate::core::error::{CompileError, CompileResult};
use crate::core::serializer::Renderer;
use crate::core::types::{EntityId, EntityKind};
use serde_json::{json, Value};

pub(crate) static SCHEMA: KindSchema = KindSchema {
    kind: EntityKind::Endpoint,
    slots: &[SlotSpec::one("credential", EntityKind::Credential, false)],
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
        ("type", json!("Linux")),
        ("addresses", json!([])),
        ("port", json!(22)),
        ("value_type", json!("IP")),
    ]
}

fn check(entity: &Entity) -> CompileResult<()> {
    check_one_of(entity, "type", &["Linux", "Windows", "HTTP"])?;
    check_one_of(entity, "value_type", &["IP", "VM"])?;
    let addresses = super::attr_value(entity, "addresses").unwrap_or(Value::Null);
    if !addresses.is_array() {
        return Err(CompileError::validation(
            entity.key().to_string(),
            "'addresses' must be a list",
        ));
    }
    Ok(())
}

pub fn render(r: &mut Renderer<'_>, id: EntityId) -> CompileResult<Value> {
    let mut obj = r.base_object(id);
    obj.insert(
        "login_credential_local_reference".into(),
        r.slot_ref(id, "credential"),
    );
    Ok(Value::Object(obj))
}
