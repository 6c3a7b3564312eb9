//! BP-002: Shared vocabulary — entity kinds, keys, script types, wire constants.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire schema version tag emitted in every payload.
pub const API_VERSION: &str = "3.0";

/// Spec version placed in payload metadata.
pub const SPEC_VERSION: u32 = 1;

// ============================================================================
// Entity kinds
// ============================================================================

/// Every container type the compiler knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Service,
    Package,
    Substrate,
    Deployment,
    Profile,
    Credential,
    Endpoint,
    Blueprint,
    Runbook,
    Environment,
    Project,
    Policy,
    /// Kind-agnostic attribute bundle; only ever used as a base.
    Mixin,
}

impl EntityKind {
    /// Kinds that may act as the root of a compiled document.
    pub fn is_root(self) -> bool {
        matches!(
            self,
            Self::Blueprint | Self::Runbook | Self::Environment | Self::Project | Self::Policy
        )
    }

    /// Kind name used in local references (`{"kind": ..., "name": ..., "uuid": ...}`).
    pub fn local_ref_kind(self) -> &'static str {
        match self {
            Self::Service => "app_service",
            Self::Package => "app_package",
            Self::Substrate => "app_substrate",
            Self::Deployment => "app_blueprint_deployment",
            Self::Profile => "app_profile",
            Self::Credential => "app_credential",
            Self::Endpoint => "app_endpoint",
            Self::Blueprint => "blueprint",
            Self::Runbook => "runbook",
            Self::Environment => "environment",
            Self::Project => "project",
            Self::Policy => "approval_policy",
            Self::Mixin => "mixin",
        }
    }

    /// Name of the flattened payload collection holding this kind.
    pub fn collection(self) -> Option<&'static str> {
        match self {
            Self::Service => Some("service_definition_list"),
            Self::Package => Some("package_definition_list"),
            Self::Substrate => Some("substrate_definition_list"),
            Self::Deployment => Some("deployment_definition_list"),
            Self::Profile => Some("app_profile_list"),
            Self::Credential => Some("credential_definition_list"),
            Self::Endpoint => Some("endpoint_definition_list"),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Service => "service",
            Self::Package => "package",
            Self::Substrate => "substrate",
            Self::Deployment => "deployment",
            Self::Profile => "profile",
            Self::Credential => "credential",
            Self::Endpoint => "endpoint",
            Self::Blueprint => "blueprint",
            Self::Runbook => "runbook",
            Self::Environment => "environment",
            Self::Project => "project",
            Self::Policy => "policy",
            Self::Mixin => "mixin",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "service" => Self::Service,
            "package" => Self::Package,
            "substrate" => Self::Substrate,
            "deployment" => Self::Deployment,
            "profile" => Self::Profile,
            "credential" => Self::Credential,
            "endpoint" => Self::Endpoint,
            "blueprint" => Self::Blueprint,
            "runbook" => Self::Runbook,
            "environment" => Self::Environment,
            "project" => Self::Project,
            "policy" => Self::Policy,
            "mixin" => Self::Mixin,
            other => return Err(format!("unknown entity kind '{}'", other)),
        })
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Index of an entity in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub usize);

/// Declared identity of an entity: `(kind, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub name: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.name)
    }
}

// ============================================================================
// Scripts
// ============================================================================

/// Interpreter for an inline script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    #[default]
    Sh,
    Escript,
    Powershell,
}

impl ScriptType {
    pub fn wire(self) -> &'static str {
        match self {
            Self::Sh => "sh",
            Self::Escript => "static_py3",
            Self::Powershell => "npsscript",
        }
    }
}

/// Valid identifier for variables, tasks and macro names.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
