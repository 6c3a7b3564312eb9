//! BP-026: Credential kind.

use super::{check_one_of, DefaultTarget, KindSchema};
use crate::core::entity::Entity;
use crate::core::error::CompileResult;
use crate::core::serializer::Renderer;
use crate::core::types::{EntityId, EntityKind};
use serde_json::{json, Value};

pub(crate) static SCHEMA: KindSchema = KindSchema {
    kind: EntityKind::Credential,
    slots: &[],
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
        ("username", json!("")),
        ("type", json!("PASSWORD")),
        ("secret", json!("")),
        ("default", json!(false)),
    ]
}

fn check(entity: &Entity) -> CompileResult<()> {
    check_one_of(entity, "type", &["PASSWORD", "KEY"])
}

/// Secrets are wrapped so the server knows a value was supplied.
pub fn render(r: &mut Renderer<'_>, id: EntityId) -> CompileResult<Value> {
    let mut obj = r.base_object(id);
    let secret = r.attr(id, "secret");
    let modified = secret.as_str().is_some_and(|s| !s.is_empty());
    obj.insert(
        "secret".into(),
        json!({"value": secret, "attrs": {"is_secret_modified": modified}}),
    );
    Ok(Value::Object(obj))
}
