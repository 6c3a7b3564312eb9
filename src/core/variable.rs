//! BP-003: Variable model — typed, validated value holders.
//!
//! Values are stored in their macro-substitutable string form. Validation
//! happens once, at declaration; `render` only coerces into the wire form.
//! Values containing `@@{...}@@` macros skip type checks since the server
//! substitutes them at run time.

use super::error::{CompileError, CompileResult};
use super::types::{is_identifier, ScriptType};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

const DATE_FORMAT: &str = "%d/%m/%Y";
const TIME_FORMAT: &str = "%H:%M";
const DATETIME_FORMAT: &str = "%d/%m/%Y - %H:%M";

/// Value type of a variable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarType {
    #[default]
    String,
    Int,
    Date,
    Time,
    Datetime,
    Multiline,
}

impl VarType {
    pub fn wire(self) -> &'static str {
        match self {
            Self::String => "STRING",
            Self::Int => "INT",
            Self::Date => "DATE",
            Self::Time => "TIME",
            Self::Datetime => "DATE_TIME",
            Self::Multiline => "MULTILINE_STRING",
        }
    }
}

/// Where a computed variable gets its value at run time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputedSource {
    Script {
        script_type: ScriptType,
        script: String,
    },
    Http {
        method: String,
        url: String,
        response_path: String,
    },
}

/// Variable kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarKind {
    Simple,
    Secret,
    WithOptions { choices: Vec<String> },
    /// Value fetched at run time; `secret` keeps it masked like a secret.
    Computed { source: ComputedSource, secret: bool },
}

/// Declared constraints on a variable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Constraints {
    pub var_type: VarType,
    pub is_runtime_editable: bool,
    pub is_mandatory: bool,
    pub is_hidden: bool,
    pub regex: Option<String>,
    pub default: Option<String>,
    /// Opt-in for secrets declared with a literal value.
    pub allow_plaintext_secret: bool,
    pub description: String,
    pub label: String,
}

/// A declared, validated variable. Immutable after declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub value: String,
    pub kind: VarKind,
    pub var_type: VarType,
    pub is_runtime_editable: bool,
    pub is_mandatory: bool,
    pub is_hidden: bool,
    pub regex: Option<String>,
    pub default: Option<String>,
    pub description: String,
    pub label: String,
}

/// Declare a variable, validating every constraint up front.
pub fn declare(
    name: &str,
    value: &str,
    kind: VarKind,
    constraints: Constraints,
) -> CompileResult<Variable> {
    let subject = format!("variable '{}'", name);
    if !is_identifier(name) {
        return Err(CompileError::validation(subject, "name is not a valid identifier"));
    }

    let pattern = match &constraints.regex {
        Some(raw) => Some(
            Regex::new(&format!("^(?:{})$", raw))
                .map_err(|e| CompileError::validation(&subject, format!("invalid regex: {}", e)))?,
        ),
        None => None,
    };

    for candidate in [Some(value), constraints.default.as_deref()]
        .into_iter()
        .flatten()
        .filter(|v| !v.is_empty())
    {
        if let Some(ref re) = pattern {
            if !has_macro(candidate) && !re.is_match(candidate) {
                return Err(CompileError::validation(
                    &subject,
                    format!("'{}' does not match regex", candidate),
                ));
            }
        }
        if !has_macro(candidate) {
            coerce(constraints.var_type, candidate).map_err(|r| CompileError::validation(&subject, r))?;
        }
    }

    match &kind {
        VarKind::Secret => {
            let has_literal = !value.is_empty() || constraints.default.is_some();
            if has_literal && !constraints.allow_plaintext_secret {
                return Err(CompileError::validation(
                    &subject,
                    "secret declared with a plaintext value; opt in explicitly",
                ));
            }
        }
        VarKind::WithOptions { choices } => {
            if choices.is_empty() {
                return Err(CompileError::validation(&subject, "options list is empty"));
            }
            for choice in choices {
                if !has_macro(choice) {
                    coerce(constraints.var_type, choice)
                        .map_err(|r| CompileError::validation(&subject, r))?;
                }
            }
            let effective = if value.is_empty() {
                constraints.default.as_deref().unwrap_or("")
            } else {
                value
            };
            if !effective.is_empty() && !choices.iter().any(|c| c == effective) {
                return Err(CompileError::validation(
                    &subject,
                    format!("'{}' is not one of: {}", effective, choices.join(", ")),
                ));
            }
        }
        VarKind::Computed {
            source: ComputedSource::Script { script, .. },
            ..
        } => {
            if script.trim().is_empty() {
                return Err(CompileError::validation(&subject, "computed script is empty"));
            }
        }
        VarKind::Computed {
            source: ComputedSource::Http { url, .. },
            ..
        } => {
            if url.trim().is_empty() {
                return Err(CompileError::validation(&subject, "computed HTTP url is empty"));
            }
        }
        VarKind::Simple => {}
    }

    let computed = matches!(kind, VarKind::Computed { .. });
    let effective_empty = value.is_empty() && constraints.default.as_deref().unwrap_or("").is_empty();
    if constraints.is_mandatory && effective_empty && !computed && !constraints.is_runtime_editable {
        return Err(CompileError::validation(
            &subject,
            "mandatory variable has no value and is not runtime-editable",
        ));
    }

    Ok(Variable {
        name: name.to_string(),
        value: value.to_string(),
        kind,
        var_type: constraints.var_type,
        is_runtime_editable: constraints.is_runtime_editable,
        is_mandatory: constraints.is_mandatory,
        is_hidden: constraints.is_hidden,
        regex: constraints.regex,
        default: constraints.default,
        description: constraints.description,
        label: constraints.label,
    })
}

/// True when the text contains a run-time macro.
pub fn has_macro(text: &str) -> bool {
    text.contains("@@{")
}

/// Coerce a raw string into the canonical wire form for `var_type`.
pub fn coerce(var_type: VarType, raw: &str) -> Result<String, String> {
    match var_type {
        VarType::String | VarType::Multiline => Ok(raw.to_string()),
        VarType::Int => raw
            .trim()
            .parse::<i64>()
            .map(|n| n.to_string())
            .map_err(|_| format!("'{}' is not an integer", raw)),
        VarType::Date => NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
            .ok()
            .filter(|d| four_digit_year(d.year()))
            .map(|d| d.format(DATE_FORMAT).to_string())
            .ok_or_else(|| format!("'{}' is not a dd/mm/yyyy date", raw)),
        VarType::Time => NaiveTime::parse_from_str(raw.trim(), TIME_FORMAT)
            .map(|t| t.format(TIME_FORMAT).to_string())
            .map_err(|_| format!("'{}' is not an hh:mm time", raw)),
        VarType::Datetime => NaiveDateTime::parse_from_str(raw.trim(), DATETIME_FORMAT)
            .ok()
            .filter(|dt| four_digit_year(dt.year()))
            .map(|dt| dt.format(DATETIME_FORMAT).to_string())
            .ok_or_else(|| format!("'{}' is not 'dd/mm/yyyy - hh:mm'", raw)),
    }
}

fn four_digit_year(year: i32) -> bool {
    (1000..=9999).contains(&year)
}

impl Variable {
    /// Value used at launch when nothing is overridden.
    pub fn effective_value(&self) -> &str {
        if self.value.is_empty() {
            self.default.as_deref().unwrap_or("")
        } else {
            &self.value
        }
    }

    /// Effective value coerced into its wire form.
    pub fn wire_value(&self) -> String {
        let raw = self.effective_value();
        if raw.is_empty() || has_macro(raw) {
            return raw.to_string();
        }
        coerce(self.var_type, raw).unwrap_or_else(|_| raw.to_string())
    }

    pub fn is_secret(&self) -> bool {
        matches!(self.kind, VarKind::Secret | VarKind::Computed { secret: true, .. })
    }

    fn wire_type(&self) -> &'static str {
        match &self.kind {
            VarKind::Simple | VarKind::WithOptions { .. } => "LOCAL",
            VarKind::Secret => "SECRET",
            VarKind::Computed { source, secret } => match (source, secret) {
                (ComputedSource::Script { .. }, false) => "EXEC_LOCAL",
                (ComputedSource::Script { .. }, true) => "EXEC_SECRET",
                (ComputedSource::Http { .. }, false) => "HTTP_LOCAL",
                (ComputedSource::Http { .. }, true) => "HTTP_SECRET",
            },
        }
    }

    /// Render the variable into its wire object.
    pub fn render(&self, uuid: Uuid) -> Value {
        let mut obj = json!({
            "name": self.name,
            "description": self.description,
            "label": self.label,
            "uuid": uuid.to_string(),
            "type": self.wire_type(),
            "val_type": self.var_type.wire(),
            "data_type": "BASE",
            "value": self.wire_value(),
            "attrs": {"is_secret_modified": self.is_secret() && !self.effective_value().is_empty()},
            "editables": {"value": self.is_runtime_editable},
            "is_hidden": self.is_hidden,
            "is_mandatory": self.is_mandatory,
        });

        let options = match &self.kind {
            VarKind::WithOptions { choices } => Some(json!({
                "type": "PREDEFINED",
                "choices": choices
                    .iter()
                    .map(|c| if has_macro(c) { c.clone() } else { coerce(self.var_type, c).unwrap_or_else(|_| c.clone()) })
                    .collect::<Vec<_>>(),
            })),
            VarKind::Computed {
                source: ComputedSource::Script { script_type, script },
                ..
            } => Some(json!({
                "type": "EXEC",
                "attrs": {"script_type": script_type.wire(), "script": script},
            })),
            VarKind::Computed {
                source:
                    ComputedSource::Http {
                        method,
                        url,
                        response_path,
                    },
                ..
            } => Some(json!({
                "type": "HTTP",
                "attrs": {
                    "method": method,
                    "url": url,
                    "request_body": "",
                    "headers": [],
                    "expected_response_params": [{"status": "SUCCESS", "code": 200}],
                    "response_paths": {self.name.clone(): response_path},
                },
            })),
            VarKind::Simple | VarKind::Secret => None,
        };
        if let (Some(options), Some(map)) = (options, obj.as_object_mut()) {
            map.insert("options".to_string(), options);
        }
        if let (Some(ref re), Some(map)) = (&self.regex, obj.as_object_mut()) {
            map.insert(
                "regex".to_string(),
                json!({"value": re, "should_validate": true}),
            );
        }
        obj
    }
}

// ============================================================================
// Builder sugar
// ============================================================================

/// Fluent front-end over [`declare`].
#[derive(Debug, Clone)]
pub struct VariableDecl {
    name: String,
    value: String,
    kind: VarKind,
    constraints: Constraints,
}

impl VariableDecl {
    pub fn simple(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::with_kind(name, value, VarKind::Simple)
    }

    pub fn secret(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::with_kind(name, value, VarKind::Secret)
    }

    pub fn options(
        name: impl Into<String>,
        choices: Vec<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::with_kind(name, value, VarKind::WithOptions { choices })
    }

    pub fn computed(name: impl Into<String>, source: ComputedSource) -> Self {
        Self::with_kind(name, "", VarKind::Computed { source, secret: false })
    }

    pub fn computed_secret(name: impl Into<String>, source: ComputedSource) -> Self {
        Self::with_kind(name, "", VarKind::Computed { source, secret: true })
    }

    pub fn with_kind(name: impl Into<String>, value: impl Into<String>, kind: VarKind) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            kind,
            constraints: Constraints::default(),
        }
    }

    pub fn var_type(mut self, var_type: VarType) -> Self {
        self.constraints.var_type = var_type;
        self
    }

    pub fn runtime_editable(mut self, yes: bool) -> Self {
        self.constraints.is_runtime_editable = yes;
        self
    }

    pub fn mandatory(mut self, yes: bool) -> Self {
        self.constraints.is_mandatory = yes;
        self
    }

    pub fn hidden(mut self, yes: bool) -> Self {
        self.constraints.is_hidden = yes;
        self
    }

    pub fn regex(mut self, pattern: impl Into<String>) -> Self {
        self.constraints.regex = Some(pattern.into());
        self
    }

    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.constraints.default = Some(value.into());
        self
    }

    pub fn plaintext_ok(mut self) -> Self {
        self.constraints.allow_plaintext_secret = true;
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.constraints.description = text.into();
        self
    }

    pub fn label(mut self, text: impl Into<String>) -> Self {
        self.constraints.label = text.into();
        self
    }

    pub fn declare(self) -> CompileResult<Variable> {
        declare(&self.name, &self.value, self.kind, self.constraints)
    }
}
