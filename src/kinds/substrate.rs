//! BP-023: Substrate kind — the VM or container a deployment lands on.

use super::{check_one_of, DefaultTarget, KindSchema, Placement, SlotSpec, SystemAction};
use crate::core::context::LookupTable;
use crate::core::entity::Entity;
use crate::core::error::CompileResult;
use crate::core::serializer::Renderer;
use crate::core::types::{EntityId, EntityKind};
use serde_json::{json, Value};

const TYPES: &[&str] = &[
    "AHV_VM",
    "VMWARE_VM",
    "AWS_VM",
    "AZURE_VM",
    "GCP_VM",
    "EXISTING_VM",
    "K8S_POD",
];

pub(crate) static SCHEMA: KindSchema = KindSchema {
    kind: EntityKind::Substrate,
    slots: &[SlotSpec::one("credential", EntityKind::Credential, false)],
    system_actions: &[
        SystemAction {
            name: "pre_create",
            wire: "pre_action_create",
            placement: Placement::ActionList,
        },
        SystemAction {
            name: "post_delete",
            wire: "post_action_delete",
            placement: Placement::ActionList,
        },
    ],
    user_actions: false,
    emit_all_system: false,
    required_actions: &[],
    default_target: DefaultTarget::SelfEntity,
    defaults,
    check,
};

fn defaults() -> Vec<(&'static str, Value)> {
    vec![
        ("type", json!("AHV_VM")),
        ("os_type", json!("Linux")),
        ("account", Value::Null),
        ("create_spec", json!({})),
        (
            "readiness_probe",
            json!({
                "connection_type": "SSH",
                "connection_port": 22,
                "address": "@@{platform.status.resources.nic_list[0].ip_endpoint_list[0].ip}@@",
                "disable_readiness_probe": false,
                "delay_secs": "60",
            }),
        ),
    ]
}

fn check(entity: &Entity) -> CompileResult<()> {
    check_one_of(entity, "type", TYPES)?;
    check_one_of(entity, "os_type", &["Linux", "Windows"])
}

pub fn render(r: &mut Renderer<'_>, id: EntityId) -> CompileResult<Value> {
    let mut obj = r.base_object(id);
    let from = r.entity(id).key().to_string();

    if let Some(account) = r.attr(id, "account").as_str() {
        let reference = r.lookup(LookupTable::Account, account, &from)?;
        obj.insert("account_uuid".into(), reference["uuid"].clone());
    }
    let credential = r.slot_ref(id, "credential");
    if let Some(probe) = obj.get_mut("readiness_probe").and_then(Value::as_object_mut) {
        if !credential.is_null() {
            probe.insert("login_credential_local_reference".into(), credential);
        }
    }
    obj.insert("variable_list".into(), r.variables(id));
    obj.insert("action_list".into(), r.action_list(id)?);
    Ok(Value::Object(obj))
}
