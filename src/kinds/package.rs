//! BP-022: Package kind — install/uninstall recipe for one or more services.

use super::{check_one_of, DefaultTarget, KindSchema, Placement, SlotSpec, SystemAction};
use crate::core::entity::Entity;
use crate::core::error::CompileResult;
use crate::core::serializer::Renderer;
use crate::core::types::{EntityId, EntityKind};
use serde_json::{json, Value};

pub(crate) static SCHEMA: KindSchema = KindSchema {
    kind: EntityKind::Package,
    slots: &[SlotSpec::many("services", EntityKind::Service, true)],
    system_actions: &[
        SystemAction {
            name: "install",
            wire: "install_runbook",
            placement: Placement::Field("options.install_runbook"),
        },
        SystemAction {
            name: "uninstall",
            wire: "uninstall_runbook",
            placement: Placement::Field("options.uninstall_runbook"),
        },
    ],
    user_actions: false,
    emit_all_system: true,
    required_actions: &[],
    default_target: DefaultTarget::Slot("services"),
    defaults,
    check,
};

fn defaults() -> Vec<(&'static str, Value)> {
    vec![("type", json!("CUSTOM")), ("version", json!(""))]
}

fn check(entity: &Entity) -> CompileResult<()> {
    check_one_of(entity, "type", &["CUSTOM", "DEB", "CNTR_IMAGE", "SUBSTRATE_IMAGE"])
}

pub fn render(r: &mut Renderer<'_>, id: EntityId) -> CompileResult<Value> {
    let mut obj = r.base_object(id);
    obj.insert("service_local_reference_list".into(), r.slot_refs(id, "services"));
    obj.insert("variable_list".into(), r.variables(id));
    obj.insert(
        "options".into(),
        json!({
            "install_runbook": r.runbook_for(id, "install")?,
            "uninstall_runbook": r.runbook_for(id, "uninstall")?,
        }),
    );
    obj.insert("action_list".into(), r.action_list(id)?);
    Ok(Value::Object(obj))
}
