//! BP-028: Root kinds — blueprint, runbook, environment, project, policy.
//!
//! A root owns the document: its attributes and variables sit directly under
//! `spec.resources`, next to the flattened collections it pulls in.

use super::{as_int, DefaultTarget, KindSchema, Placement, SlotSpec, SystemAction};
use crate::core::context::LookupTable;
use crate::core::entity::Entity;
use crate::core::error::{CompileError, CompileResult};
use crate::core::serializer::Renderer;
use crate::core::types::EntityKind;
use serde_json::{json, Map, Value};

pub(crate) static BLUEPRINT: KindSchema = KindSchema {
    kind: EntityKind::Blueprint,
    slots: &[
        SlotSpec::many("services", EntityKind::Service, false),
        SlotSpec::many("packages", EntityKind::Package, false),
        SlotSpec::many("substrates", EntityKind::Substrate, false),
        SlotSpec::many("credentials", EntityKind::Credential, false),
        SlotSpec::many("profiles", EntityKind::Profile, true),
        SlotSpec::one("default_credential", EntityKind::Credential, false),
    ],
    system_actions: &[],
    user_actions: false,
    emit_all_system: false,
    required_actions: &[],
    default_target: DefaultTarget::None,
    defaults: blueprint_defaults,
    check: super::no_check,
};

pub(crate) static RUNBOOK: KindSchema = KindSchema {
    kind: EntityKind::Runbook,
    slots: &[
        SlotSpec::many("endpoints", EntityKind::Endpoint, false),
        SlotSpec::many("credentials", EntityKind::Credential, false),
        SlotSpec::one("default_target", EntityKind::Endpoint, false),
    ],
    system_actions: &[SystemAction {
        name: "run",
        wire: "runbook",
        placement: Placement::Field("runbook"),
    }],
    user_actions: false,
    emit_all_system: false,
    required_actions: &["run"],
    default_target: DefaultTarget::Slot("default_target"),
    defaults: no_attrs,
    check: super::no_check,
};

pub(crate) static ENVIRONMENT: KindSchema = KindSchema {
    kind: EntityKind::Environment,
    slots: &[
        SlotSpec::many("substrates", EntityKind::Substrate, false),
        SlotSpec::many("credentials", EntityKind::Credential, false),
    ],
    system_actions: &[],
    user_actions: false,
    emit_all_system: false,
    required_actions: &[],
    default_target: DefaultTarget::None,
    defaults: environment_defaults,
    check: super::no_check,
};

pub(crate) static PROJECT: KindSchema = KindSchema {
    kind: EntityKind::Project,
    slots: &[],
    system_actions: &[],
    user_actions: false,
    emit_all_system: false,
    required_actions: &[],
    default_target: DefaultTarget::None,
    defaults: project_defaults,
    check: project_check,
};

pub(crate) static POLICY: KindSchema = KindSchema {
    kind: EntityKind::Policy,
    slots: &[],
    system_actions: &[],
    user_actions: false,
    emit_all_system: false,
    required_actions: &[],
    default_target: DefaultTarget::None,
    defaults: policy_defaults,
    check: policy_check,
};

fn no_attrs() -> Vec<(&'static str, Value)> {
    Vec::new()
}

fn blueprint_defaults() -> Vec<(&'static str, Value)> {
    vec![("type", json!("USER"))]
}

fn environment_defaults() -> Vec<(&'static str, Value)> {
    vec![("accounts", json!([]))]
}

fn project_defaults() -> Vec<(&'static str, Value)> {
    vec![
        ("accounts", json!([])),
        ("environments", json!([])),
        ("users", json!([])),
        ("default_environment", Value::Null),
        ("quotas", Value::Null),
    ]
}

fn policy_defaults() -> Vec<(&'static str, Value)> {
    vec![
        ("enabled", json!(true)),
        ("event", Value::Null),
        ("priority", json!(0)),
        ("conditions", json!([])),
        ("approver_sets", json!([])),
    ]
}

fn project_check(entity: &Entity) -> CompileResult<()> {
    let default = super::attr_value(entity, "default_environment").unwrap_or(Value::Null);
    if let Some(name) = default.as_str() {
        let listed = super::attr_value(entity, "environments").unwrap_or(Value::Null);
        let listed = listed
            .as_array()
            .is_some_and(|envs| envs.iter().any(|e| e.as_str() == Some(name)));
        if !listed {
            return Err(CompileError::validation(
                entity.key().to_string(),
                format!("default environment '{}' is not in 'environments'", name),
            ));
        }
    }
    Ok(())
}

fn policy_check(entity: &Entity) -> CompileResult<()> {
    let subject = entity.key().to_string();
    let event = super::attr_value(entity, "event").unwrap_or(Value::Null);
    if event.as_str().map_or(true, str::is_empty) {
        return Err(CompileError::validation(&subject, "policy needs an 'event'"));
    }
    let sets = super::attr_value(entity, "approver_sets").unwrap_or(Value::Null);
    if sets.as_array().map_or(true, Vec::is_empty) {
        return Err(CompileError::validation(
            &subject,
            "policy needs at least one approver set",
        ));
    }
    let priority = super::attr_value(entity, "priority").unwrap_or(Value::Null);
    if as_int(&priority).is_none() {
        return Err(CompileError::validation(&subject, "'priority' must be an integer"));
    }
    Ok(())
}

/// Render `spec.resources` for the document root.
pub fn render_resources(r: &mut Renderer<'_>) -> CompileResult<Value> {
    let id = r.resolved().root();
    let root = r.entity(id);
    let from = root.key().to_string();
    let mut obj = Map::new();
    r.insert_attrs(id, &mut obj);

    match root.kind {
        EntityKind::Blueprint => {
            for kind in [
                EntityKind::Service,
                EntityKind::Package,
                EntityKind::Substrate,
                EntityKind::Deployment,
                EntityKind::Profile,
                EntityKind::Credential,
            ] {
                let key = kind.collection().unwrap_or_default();
                obj.insert(key.into(), r.collection(kind)?);
            }
            let default = r.slot_ref(id, "default_credential");
            if !default.is_null() {
                obj.insert("default_credential_local_reference".into(), default);
            }
            obj.insert("published_service_definition_list".into(), json!([]));
            obj.insert("client_attrs".into(), json!({}));
        }
        EntityKind::Runbook => {
            obj.insert("runbook".into(), r.runbook_for(id, "run")?);
            obj.insert(
                "endpoint_definition_list".into(),
                r.collection(EntityKind::Endpoint)?,
            );
            obj.insert(
                "credential_definition_list".into(),
                r.collection(EntityKind::Credential)?,
            );
            obj.insert("default_target_reference".into(), r.slot_ref(id, "default_target"));
        }
        EntityKind::Environment => {
            obj.insert(
                "substrate_definition_list".into(),
                r.collection(EntityKind::Substrate)?,
            );
            obj.insert(
                "credential_definition_list".into(),
                r.collection(EntityKind::Credential)?,
            );
            obj.insert(
                "account_reference_list".into(),
                r.lookup_list(id, "accounts", LookupTable::Account)?,
            );
        }
        EntityKind::Project => {
            obj.insert(
                "account_reference_list".into(),
                r.lookup_list(id, "accounts", LookupTable::Account)?,
            );
            obj.insert(
                "environment_reference_list".into(),
                r.lookup_list(id, "environments", LookupTable::Environment)?,
            );
            obj.insert(
                "user_reference_list".into(),
                r.lookup_list(id, "users", LookupTable::User)?,
            );
            let default = match r.attr(id, "default_environment").as_str() {
                Some(env) => r.lookup(LookupTable::Environment, env, &from)?,
                None => Value::Null,
            };
            obj.insert("default_environment_reference".into(), default);
        }
        EntityKind::Policy => {}
        other => {
            return Err(CompileError::serialization(format!(
                "a {} cannot be the document root",
                other
            )))
        }
    }

    obj.insert("variable_list".into(), r.variables(id));
    Ok(Value::Object(obj))
}
