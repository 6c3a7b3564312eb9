//! BP-010: Runtime-editable extraction.
//!
//! Walks the resolved graph and collects every field marked as overridable at
//! launch: runtime-editable variables (entity and action scope) and the
//! attribute paths an entity lists under `editables`. Each field carries the
//! dotted path that addresses it inside the rendered payload, where `seg[key]`
//! selects the array element whose `name` is `key`.

use super::reference::ResolvedGraph;
use super::types::EntityId;
use super::variable::Variable;
use crate::kinds;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Section holding the document root's own fields.
pub const ROOT_SECTION: &str = "root";

/// One editable value and where it lives in the payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub name: String,
    pub path: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditableAction {
    pub name: String,
    #[serde(rename = "variable_list")]
    pub variables: Vec<Field>,
}

/// Editable fields of one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditableEntity {
    pub name: String,
    #[serde(rename = "variable_list")]
    pub variables: Vec<Field>,
    pub attrs: Vec<Field>,
    #[serde(rename = "action_list")]
    pub actions: Vec<EditableAction>,
}

impl EditableEntity {
    fn is_empty(&self) -> bool {
        self.variables.is_empty() && self.attrs.is_empty() && self.actions.is_empty()
    }

    fn fields(&self) -> impl Iterator<Item = &Field> {
        self.variables
            .iter()
            .chain(self.attrs.iter())
            .chain(self.actions.iter().flat_map(|a| a.variables.iter()))
    }
}

/// Path-addressed tree of every editable field, grouped by payload collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct EditableTree {
    sections: IndexMap<String, Vec<EditableEntity>>,
}

impl EditableTree {
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn section(&self, name: &str) -> &[EditableEntity] {
        self.sections.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.sections.values().flatten().flat_map(EditableEntity::fields)
    }

    /// Payload path of every editable field.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.fields().map(|f| f.path.as_str())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

fn entity_base(resolved: &ResolvedGraph, id: EntityId) -> (String, String) {
    let e = resolved.entity(id);
    match e.kind.collection() {
        Some(collection) if id != resolved.root() => (
            collection.to_string(),
            format!("spec.resources.{}[{}]", collection, e.name),
        ),
        _ => (ROOT_SECTION.to_string(), "spec.resources".to_string()),
    }
}

fn variable_fields<'a>(
    base: &str,
    vars: impl Iterator<Item = &'a Variable>,
) -> Vec<Field> {
    vars.filter(|v| v.is_runtime_editable)
        .map(|v| Field {
            name: v.name.clone(),
            path: format!("{}.variable_list[{}].value", base, v.name),
            value: Value::String(v.wire_value()),
        })
        .collect()
}

/// Collect the editable tree of everything reachable from the root.
pub fn extract(resolved: &ResolvedGraph) -> EditableTree {
    let mut tree = EditableTree::default();
    for &id in resolved.reachable() {
        let e = resolved.entity(id);
        let (section, base) = entity_base(resolved, id);

        let variables = variable_fields(&base, e.variables.values());
        let attrs = e
            .editables
            .iter()
            .map(|path| Field {
                name: path.clone(),
                path: format!("{}.{}", base, path),
                value: kinds::attr_value(e, path).unwrap_or(Value::Null),
            })
            .collect();
        let actions = e
            .actions
            .values()
            .filter_map(|a| {
                let scope = format!("{}.{}", base, kinds::action_path(e.kind, &a.name));
                let variables = variable_fields(&scope, a.variables.values());
                (!variables.is_empty()).then(|| EditableAction {
                    name: kinds::action_wire_name(e.kind, &a.name),
                    variables,
                })
            })
            .collect();

        let entry = EditableEntity {
            name: e.name.clone(),
            variables,
            attrs,
            actions,
        };
        if !entry.is_empty() {
            tree.sections.entry(section).or_default().push(entry);
        }
    }
    debug!("extracted {} editable field(s)", tree.fields().count());
    tree
}

/// Split a payload path on dots outside brackets.
fn segments(path: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in path.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            '.' if depth == 0 => {
                out.push(&path[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&path[start..]);
    out
}

/// Value at a payload path, if the document has one there.
pub fn lookup<'v>(doc: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = doc;
    for seg in segments(path) {
        let (field, key) = match seg.find('[') {
            Some(i) if seg.ends_with(']') => (&seg[..i], Some(&seg[i + 1..seg.len() - 1])),
            _ => (seg, None),
        };
        current = current.get(field)?;
        if let Some(key) = key {
            current = current
                .as_array()?
                .iter()
                .find(|item| item.get("name").and_then(Value::as_str) == Some(key))?;
        }
    }
    Some(current)
}
