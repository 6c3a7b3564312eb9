//! BP-015: YAML source modules.
//!
//! A module declares entities by section (`services`, `packages`, ...), the
//! document root under `root`, and may import library modules. Loading runs
//! in three steps:
//! - substitute `{{params.key}}` in every string of the module;
//! - collect every entity declaration of the module and its imports, each at
//!   its hop distance from the root;
//! - build them base-first (Kahn's algorithm over `extends`, declaration
//!   order breaking ties) and declare the concrete ones into one graph.
//!
//! Files named by a module (`script_file`, `create_spec_file`, `secret_file`)
//! are read eagerly through the `SourceReader`, relative to that module.

use super::context::SourceReader;
use super::entity::{Action, Entity, EntityBuilder};
use super::error::{CompileError, CompileResult};
use super::graph::{EntityGraph, MODULE_DEPTH};
use super::reference::Ref;
use super::tasktree::{Decision, Loop, Step, TaskTreeBuilder};
use super::types::{EntityKey, EntityKind, ScriptType};
use super::variable::{ComputedSource, VarKind, VarType, Variable, VariableDecl};
use crate::kinds;
use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use serde::Deserialize;
use serde_yaml_ng::Value as YamlValue;
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Source module format version.
pub const MODULE_VERSION: &str = "1.0";

// ============================================================================
// Document model
// ============================================================================

fn default_version() -> String {
    MODULE_VERSION.to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModuleDoc {
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    kind: Option<EntityKind>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    imports: Vec<String>,
    #[serde(default)]
    mixins: IndexMap<String, EntityDoc>,
    #[serde(default)]
    credentials: IndexMap<String, EntityDoc>,
    #[serde(default)]
    services: IndexMap<String, EntityDoc>,
    #[serde(default)]
    packages: IndexMap<String, EntityDoc>,
    #[serde(default)]
    substrates: IndexMap<String, EntityDoc>,
    #[serde(default)]
    deployments: IndexMap<String, EntityDoc>,
    #[serde(default)]
    profiles: IndexMap<String, EntityDoc>,
    #[serde(default)]
    endpoints: IndexMap<String, EntityDoc>,
    #[serde(default)]
    root: Option<EntityDoc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct EntityDoc {
    #[serde(default)]
    extends: Vec<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    variables: IndexMap<String, VariableSpec>,
    #[serde(default)]
    actions: IndexMap<String, ActionSpec>,
    #[serde(default)]
    refs: IndexMap<String, OneOrMany>,
    #[serde(default)]
    attrs: IndexMap<String, serde_json::Value>,
    #[serde(default)]
    editables: Vec<String>,
    #[serde(default)]
    create_spec_file: Option<String>,
    #[serde(default)]
    secret_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn to_vec(&self) -> Vec<&str> {
        match self {
            Self::One(s) => vec![s.as_str()],
            Self::Many(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum VarKindDoc {
    #[default]
    Simple,
    Secret,
    Options,
    Computed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum VariableSpec {
    Full(Box<VariableDoc>),
    Short(YamlValue),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct VariableDoc {
    #[serde(default)]
    value: Option<YamlValue>,
    #[serde(default)]
    default: Option<YamlValue>,
    #[serde(default)]
    kind: VarKindDoc,
    #[serde(default, rename = "type")]
    var_type: VarType,
    #[serde(default)]
    runtime: bool,
    #[serde(default)]
    mandatory: bool,
    #[serde(default)]
    hidden: bool,
    #[serde(default)]
    regex: Option<String>,
    #[serde(default)]
    choices: Vec<YamlValue>,
    #[serde(default)]
    plaintext: bool,
    /// Mask a computed value like a secret.
    #[serde(default)]
    secret: bool,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    script_file: Option<String>,
    #[serde(default)]
    script_type: ScriptType,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    response_path: Option<String>,
    #[serde(default)]
    label: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ActionSpec {
    Steps(Vec<StepDoc>),
    Full(ActionDoc),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ActionDoc {
    #[serde(default)]
    description: String,
    #[serde(default)]
    critical: bool,
    #[serde(default)]
    variables: IndexMap<String, VariableSpec>,
    #[serde(default)]
    steps: Vec<StepDoc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StepDoc {
    Exec(TaskDoc),
    SetVariable(TaskDoc),
    Http(TaskDoc),
    Delay(TaskDoc),
    ScaleOut(TaskDoc),
    ScaleIn(TaskDoc),
    Input(TaskDoc),
    Parallel(Vec<StepDoc>),
    Serial(Vec<StepDoc>),
    Decision(DecisionDoc),
    Loop(LoopDoc),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskDoc {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    script_file: Option<String>,
    #[serde(default)]
    script_type: Option<ScriptType>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    retries: u32,
    #[serde(default)]
    timeout_secs: u32,
    #[serde(default)]
    variables: Vec<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    headers: IndexMap<String, String>,
    #[serde(default)]
    status_codes: Vec<u16>,
    #[serde(default)]
    response_paths: IndexMap<String, String>,
    #[serde(default)]
    seconds: Option<u64>,
    #[serde(default)]
    count: Option<YamlValue>,
    #[serde(default)]
    inputs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DecisionDoc {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    script_file: Option<String>,
    #[serde(default)]
    script_type: ScriptType,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    success: Vec<StepDoc>,
    #[serde(default)]
    failure: Vec<StepDoc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoopDoc {
    name: String,
    #[serde(default)]
    description: String,
    iterations: YamlValue,
    #[serde(default)]
    loop_variable: Option<String>,
    #[serde(default)]
    body: Vec<StepDoc>,
}

// ============================================================================
// Templates
// ============================================================================

/// Render a scalar YAML value as text.
pub fn yaml_value_to_string(val: &YamlValue) -> String {
    match val {
        YamlValue::String(s) => s.clone(),
        YamlValue::Number(n) => n.to_string(),
        YamlValue::Bool(b) => b.to_string(),
        YamlValue::Null => String::new(),
        other => format!("{:?}", other),
    }
}

/// Substitute `{{params.key}}` placeholders. Other `{{...}}` text is kept.
pub fn resolve_params(template: &str, params: &IndexMap<String, YamlValue>) -> Result<String, String> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = match result[open..].find("}}") {
            Some(c) => open + c + 2,
            None => break,
        };
        let key = result[open + 2..close - 2].trim();
        let Some(param) = key.strip_prefix("params.") else {
            start = close;
            continue;
        };
        let value = params
            .get(param)
            .map(yaml_value_to_string)
            .ok_or_else(|| format!("unknown param: {}", param))?;
        result.replace_range(open..close, &value);
        start = open + value.len();
    }

    Ok(result)
}

fn substitute(value: &mut YamlValue, params: &IndexMap<String, YamlValue>) -> Result<(), String> {
    match value {
        YamlValue::String(s) => *s = resolve_params(s, params)?,
        YamlValue::Sequence(items) => {
            for item in items {
                substitute(item, params)?;
            }
        }
        YamlValue::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                substitute(item, params)?;
            }
        }
        YamlValue::Tagged(tagged) => substitute(&mut tagged.value, params)?,
        YamlValue::Null | YamlValue::Bool(_) | YamlValue::Number(_) => {}
    }
    Ok(())
}

// ============================================================================
// Loader
// ============================================================================

/// One entity declaration waiting to be built.
#[derive(Debug)]
struct Pending {
    kind: EntityKind,
    /// Declared name; `extends` refers to this.
    key: String,
    depth: u32,
    module: PathBuf,
    doc: EntityDoc,
    is_root: bool,
}

impl Pending {
    fn final_name(&self) -> &str {
        self.doc.name.as_deref().unwrap_or(&self.key)
    }

    fn subject(&self) -> String {
        EntityKey::new(self.kind, self.final_name()).to_string()
    }
}

struct Loader<'r> {
    reader: &'r dyn SourceReader,
    pending: Vec<Pending>,
    loaded: FxHashSet<PathBuf>,
}

/// Load a module and everything it imports into one entity graph.
pub fn load_module(path: &Path, reader: &dyn SourceReader) -> CompileResult<EntityGraph> {
    let mut loader = Loader {
        reader,
        pending: Vec::new(),
        loaded: FxHashSet::default(),
    };
    let mut queue = VecDeque::from([(path.to_path_buf(), 0, IndexMap::new())]);
    while let Some((module, level, params)) = queue.pop_front() {
        for (next, inherited) in loader.collect(&module, level, &params)? {
            queue.push_back((next, level + 1, inherited));
        }
    }
    loader.build()
}

fn parse_err(path: &Path, reason: impl Into<String>) -> CompileError {
    CompileError::Parse {
        source_name: path.display().to_string(),
        reason: reason.into(),
    }
}

impl Loader<'_> {
    /// Read one module and queue its declarations. Returns its imports with
    /// the params they inherit. Modules are visited level by level, so the
    /// first visit is always the shortest import path.
    fn collect(
        &mut self,
        path: &Path,
        level: u32,
        inherited: &IndexMap<String, YamlValue>,
    ) -> CompileResult<Vec<(PathBuf, IndexMap<String, YamlValue>)>> {
        if !self.loaded.insert(path.to_path_buf()) {
            debug!("{} already loaded", path.display());
            return Ok(Vec::new());
        }
        let text = self.reader.read(path)?;
        let mut raw: YamlValue = serde_yaml_ng::from_str(&text).map_err(|e| parse_err(path, e.to_string()))?;

        let mut params: IndexMap<String, YamlValue> = match raw.as_mapping_mut().and_then(|m| m.remove("params")) {
            Some(p) => serde_yaml_ng::from_value(p).map_err(|e| parse_err(path, format!("params: {}", e)))?,
            None => IndexMap::new(),
        };
        for (k, v) in inherited {
            params.insert(k.clone(), v.clone());
        }
        substitute(&mut raw, &params).map_err(|e| parse_err(path, e))?;
        let doc: ModuleDoc = serde_yaml_ng::from_value(raw).map_err(|e| parse_err(path, e.to_string()))?;

        if doc.version != MODULE_VERSION {
            return Err(parse_err(
                path,
                format!("version must be \"{}\", got \"{}\"", MODULE_VERSION, doc.version),
            ));
        }

        let depth = MODULE_DEPTH + level;
        let sections = [
            (EntityKind::Mixin, &doc.mixins),
            (EntityKind::Credential, &doc.credentials),
            (EntityKind::Service, &doc.services),
            (EntityKind::Package, &doc.packages),
            (EntityKind::Substrate, &doc.substrates),
            (EntityKind::Deployment, &doc.deployments),
            (EntityKind::Profile, &doc.profiles),
            (EntityKind::Endpoint, &doc.endpoints),
        ];
        for (kind, entries) in sections {
            for (key, entity) in entries {
                self.pending.push(Pending {
                    kind,
                    key: key.clone(),
                    depth,
                    module: path.to_path_buf(),
                    doc: entity.clone(),
                    is_root: false,
                });
            }
        }

        if level == 0 {
            let kind = doc
                .kind
                .ok_or_else(|| parse_err(path, "the root module needs a 'kind'"))?;
            let name = doc
                .name
                .clone()
                .ok_or_else(|| parse_err(path, "the root module needs a 'name'"))?;
            let mut root = doc.root.clone().unwrap_or_default();
            if root.description.is_empty() {
                root.description = doc.description.clone();
            }
            self.pending.push(Pending {
                kind,
                key: name,
                depth: 0,
                module: path.to_path_buf(),
                doc: root,
                is_root: true,
            });
        } else if doc.kind.is_some() || doc.root.is_some() {
            return Err(parse_err(path, "an imported module cannot declare a root"));
        }

        Ok(doc
            .imports
            .iter()
            .map(|import| (self.reader.join(path, import), params.clone()))
            .collect())
    }

    /// Index of the base `name` for pending entry `idx`: nearest wins.
    fn find_base(&self, idx: usize, name: &str) -> CompileResult<usize> {
        let me = &self.pending[idx];
        let candidates: Vec<usize> = self
            .pending
            .iter()
            .enumerate()
            .filter(|(j, p)| {
                *j != idx && p.key == name && !p.is_root && (p.kind == me.kind || p.kind == EntityKind::Mixin)
            })
            .map(|(j, _)| j)
            .collect();
        let nearest = candidates.iter().map(|&j| self.pending[j].depth).min();
        let Some(depth) = nearest else {
            return Err(CompileError::UnresolvedReference {
                from: me.subject(),
                kind: format!("{} or mixin", me.kind),
                name: name.to_string(),
            });
        };
        let at: Vec<usize> = candidates
            .into_iter()
            .filter(|&j| self.pending[j].depth == depth)
            .collect();
        match at.as_slice() {
            [one] => Ok(*one),
            _ => Err(CompileError::AmbiguousReference {
                from: me.subject(),
                kind: me.kind.to_string(),
                name: name.to_string(),
                candidates: at.len(),
                hops: depth.to_string(),
            }),
        }
    }

    /// Build order with every base ahead of the entities extending it.
    fn build_order(&self) -> CompileResult<(Vec<usize>, Vec<Vec<usize>>)> {
        let n = self.pending.len();
        let mut bases: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut in_degree = vec![0usize; n];
        for (i, p) in self.pending.iter().enumerate() {
            for base in &p.doc.extends {
                let j = self.find_base(i, base)?;
                bases[i].push(j);
                dependents[j].push(i);
                in_degree[i] += 1;
            }
        }

        // Kahn's algorithm, declaration order breaking ties
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(current) = ready.pop_first() {
            order.push(current);
            for &next in &dependents[current] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() != n {
            let ordered: FxHashSet<usize> = order.iter().copied().collect();
            let members: Vec<String> = (0..n)
                .filter(|i| !ordered.contains(i))
                .map(|i| self.pending[i].subject())
                .collect();
            return Err(CompileError::validation(
                "module",
                format!("inheritance cycle involving: {}", members.join(", ")),
            ));
        }
        Ok((order, bases))
    }

    fn build(self) -> CompileResult<EntityGraph> {
        let (order, bases) = self.build_order()?;
        let mut built: Vec<Option<Entity>> = vec![None; self.pending.len()];
        let mut graph = EntityGraph::new();

        for i in order {
            let p = &self.pending[i];
            let parents: Vec<&Entity> = bases[i].iter().filter_map(|&j| built[j].as_ref()).collect();
            let entity = self.build_entity(p, &parents)?;
            if p.is_root {
                graph.declare_root(entity.clone())?;
            } else if p.kind != EntityKind::Mixin {
                graph.declare_at(entity.clone(), p.depth);
            }
            built[i] = Some(entity);
        }
        debug!("loaded {} entities", graph.len());
        Ok(graph)
    }

    fn build_entity(&self, p: &Pending, parents: &[&Entity]) -> CompileResult<Entity> {
        let subject = p.subject();
        let cx = FileCx {
            reader: self.reader,
            module: &p.module,
        };
        let mut b = EntityBuilder::new(p.kind, p.final_name()).description(&p.doc.description);
        for parent in parents {
            b = b.extends(parent);
        }
        for (name, spec) in &p.doc.variables {
            b = b.variable(cx.variable(name, spec)?);
        }
        for (name, spec) in &p.doc.actions {
            b = b.action(cx.action(&subject, name, spec)?);
        }
        let schema = kinds::schema(p.kind);
        for (slot, targets) in &p.doc.refs {
            let hint = schema.slot(slot).map(|s| s.target);
            let refs = targets
                .to_vec()
                .into_iter()
                .map(|t| parse_ref(t, hint, &subject))
                .collect::<CompileResult<Vec<_>>>()?;
            b = b.references(slot.clone(), refs);
        }
        for (key, value) in &p.doc.attrs {
            b = b.attr(key.clone(), value.clone());
        }
        if let Some(file) = &p.doc.create_spec_file {
            b = b.attr("create_spec", cx.file_attr(&subject, p.kind, EntityKind::Substrate, file, &p.doc, "create_spec")?);
        }
        if let Some(file) = &p.doc.secret_file {
            b = b.attr("secret", cx.file_attr(&subject, p.kind, EntityKind::Credential, file, &p.doc, "secret")?);
        }
        for path in &p.doc.editables {
            b = b.editable(path.clone());
        }
        b.build()
    }
}

/// `kind/Name`, or a bare `Name` of the hinted kind.
fn parse_ref(text: &str, hint: Option<EntityKind>, subject: &str) -> CompileResult<Ref> {
    match text.split_once('/') {
        Some((kind, name)) => {
            let kind: EntityKind = kind.parse().map_err(|e: String| CompileError::validation(subject, e))?;
            Ok(Ref::named(kind, name))
        }
        None => match hint {
            Some(kind) => Ok(Ref::named(kind, text)),
            None => Err(CompileError::validation(
                subject,
                format!("reference '{}' needs the form kind/Name", text),
            )),
        },
    }
}

/// File access relative to the module being built.
struct FileCx<'a> {
    reader: &'a dyn SourceReader,
    module: &'a Path,
}

impl FileCx<'_> {
    fn read(&self, relative: &str) -> CompileResult<String> {
        self.reader.read(&self.reader.join(self.module, relative))
    }

    /// Inline `script` or the contents of `script_file`, exactly one of them.
    fn script(&self, subject: &str, inline: &Option<String>, file: &Option<String>) -> CompileResult<String> {
        match (inline, file) {
            (Some(s), None) => Ok(s.clone()),
            (None, Some(f)) => self.read(f),
            (Some(_), Some(_)) => Err(CompileError::validation(subject, "give either 'script' or 'script_file'")),
            (None, None) => Err(CompileError::validation(subject, "missing 'script'")),
        }
    }

    fn file_attr(
        &self,
        subject: &str,
        kind: EntityKind,
        expected: EntityKind,
        file: &str,
        doc: &EntityDoc,
        attr: &str,
    ) -> CompileResult<serde_json::Value> {
        if kind != expected {
            return Err(CompileError::validation(
                subject,
                format!("only a {} takes a '{}' file", expected, attr),
            ));
        }
        if doc.attrs.contains_key(attr) {
            return Err(CompileError::validation(
                subject,
                format!("'{}' is given both inline and as a file", attr),
            ));
        }
        let text = self.read(file)?;
        if attr == "secret" {
            return Ok(serde_json::Value::String(text.trim_end().to_string()));
        }
        serde_yaml_ng::from_str(&text).map_err(|e| CompileError::Parse {
            source_name: file.to_string(),
            reason: e.to_string(),
        })
    }

    fn variable(&self, name: &str, spec: &VariableSpec) -> CompileResult<Variable> {
        let doc = match spec {
            VariableSpec::Full(doc) => doc.as_ref().clone(),
            VariableSpec::Short(YamlValue::Mapping(_) | YamlValue::Sequence(_)) => {
                return Err(CompileError::validation(name, "malformed variable declaration"))
            }
            VariableSpec::Short(value) => VariableDoc {
                value: Some(value.clone()),
                ..VariableDoc::default()
            },
        };
        let value = doc.value.as_ref().map(yaml_value_to_string).unwrap_or_default();
        let decl = match doc.kind {
            VarKindDoc::Simple => VariableDecl::simple(name, value),
            VarKindDoc::Secret => {
                let decl = VariableDecl::secret(name, value);
                if doc.plaintext {
                    decl.plaintext_ok()
                } else {
                    decl
                }
            }
            VarKindDoc::Options => VariableDecl::options(
                name,
                doc.choices.iter().map(yaml_value_to_string).collect(),
                value,
            ),
            VarKindDoc::Computed => {
                let source = match (&doc.url, &doc.script, &doc.script_file) {
                    (Some(url), None, None) => ComputedSource::Http {
                        method: doc.method.clone().unwrap_or_else(|| "GET".to_string()),
                        url: url.clone(),
                        response_path: doc.response_path.clone().unwrap_or_else(|| "$".to_string()),
                    },
                    (None, script, file) => ComputedSource::Script {
                        script_type: doc.script_type,
                        script: self.script(name, script, file)?,
                    },
                    (Some(_), _, _) => {
                        return Err(CompileError::validation(
                            name,
                            "a computed variable takes a script or a url, not both",
                        ))
                    }
                };
                VariableDecl::with_kind(
                    name,
                    value,
                    VarKind::Computed {
                        source,
                        secret: doc.secret,
                    },
                )
            }
        };
        let mut decl = decl
            .var_type(doc.var_type)
            .runtime_editable(doc.runtime)
            .mandatory(doc.mandatory)
            .hidden(doc.hidden)
            .description(doc.description)
            .label(doc.label);
        if let Some(re) = doc.regex {
            decl = decl.regex(re);
        }
        if let Some(default) = &doc.default {
            decl = decl.default_value(yaml_value_to_string(default));
        }
        decl.declare()
    }

    fn action(&self, subject: &str, name: &str, spec: &ActionSpec) -> CompileResult<Action> {
        let (description, critical, variables, steps) = match spec {
            ActionSpec::Steps(steps) => (String::new(), false, None, steps),
            ActionSpec::Full(doc) => (doc.description.clone(), doc.critical, Some(&doc.variables), &doc.steps),
        };
        let mut tree = TaskTreeBuilder::new(name);
        self.steps(&mut tree, &format!("{}.{}", subject, name), steps)?;
        let mut action = Action::new(name, tree.finish()?)
            .description(description)
            .critical(critical);
        for (var, spec) in variables.into_iter().flatten() {
            action = action.variable(self.variable(var, spec)?);
        }
        Ok(action)
    }

    fn steps(&self, tree: &mut TaskTreeBuilder, scope: &str, steps: &[StepDoc]) -> CompileResult<()> {
        for step in steps {
            match step {
                StepDoc::Parallel(inner) => tree.parallel(|t| self.steps(t, scope, inner))?,
                StepDoc::Serial(inner) => tree.serial(|t| self.steps(t, scope, inner))?,
                StepDoc::Decision(d) => {
                    let script = self.script(&d.name, &d.script, &d.script_file)?;
                    let mut header = Decision::new(&d.name, script)
                        .script_type(d.script_type)
                        .description(&d.description);
                    if let Some(target) = &d.target {
                        header = header.target(parse_ref(target, None, scope)?);
                    }
                    tree.decision(
                        header,
                        |t| self.steps(t, scope, &d.success),
                        |t| self.steps(t, scope, &d.failure),
                    )?
                }
                StepDoc::Loop(l) => {
                    let mut header = Loop::new(&l.name, yaml_value_to_string(&l.iterations))
                        .description(&l.description);
                    if let Some(var) = &l.loop_variable {
                        header = header.loop_variable(var);
                    }
                    tree.repeat(header, |t| self.steps(t, scope, &l.body))?
                }
                leaf => tree.step(self.leaf(scope, leaf)?)?,
            }
        }
        Ok(())
    }

    fn leaf(&self, scope: &str, doc: &StepDoc) -> CompileResult<Step> {
        let scaling = matches!(doc, StepDoc::ScaleOut(_) | StepDoc::ScaleIn(_));
        let missing = |t: &TaskDoc, field: &str| {
            CompileError::validation(format!("{}.{}", scope, t.name), format!("missing '{}'", field))
        };
        let (t, step) = match doc {
            StepDoc::Exec(t) => (t, Step::exec(&t.name, self.script(&t.name, &t.script, &t.script_file)?)),
            StepDoc::SetVariable(t) => (
                t,
                Step::set_variable(
                    &t.name,
                    self.script(&t.name, &t.script, &t.script_file)?,
                    t.variables.clone(),
                ),
            ),
            StepDoc::Http(t) => {
                let url = t.url.as_ref().ok_or_else(|| missing(t, "url"))?;
                let mut step = Step::http(&t.name, t.method.as_deref().unwrap_or("GET"), url);
                if let Some(body) = &t.body {
                    step = step.body(body);
                }
                for (k, v) in &t.headers {
                    step = step.header(k, v);
                }
                if !t.status_codes.is_empty() {
                    step = step.status_codes(t.status_codes.clone());
                }
                for (var, path) in &t.response_paths {
                    step = step.response_path(var, path);
                }
                (t, step)
            }
            StepDoc::Delay(t) => (t, Step::delay(&t.name, t.seconds.ok_or_else(|| missing(t, "seconds"))?)),
            StepDoc::ScaleOut(t) | StepDoc::ScaleIn(t) => {
                let target = t.target.as_ref().ok_or_else(|| missing(t, "target"))?;
                let target = parse_ref(target, Some(EntityKind::Deployment), scope)?;
                let count = t.count.as_ref().map(yaml_value_to_string).unwrap_or_else(|| "1".to_string());
                let step = match doc {
                    StepDoc::ScaleOut(_) => Step::scale_out(&t.name, target, count),
                    _ => Step::scale_in(&t.name, target, count),
                };
                (t, step)
            }
            StepDoc::Input(t) => (t, Step::input(&t.name, t.inputs.clone())),
            StepDoc::Parallel(_) | StepDoc::Serial(_) | StepDoc::Decision(_) | StepDoc::Loop(_) => {
                return Err(CompileError::structural(scope, "scope used where a step was expected"))
            }
        };

        let mut step = step
            .description(&t.description)
            .retries(t.retries)
            .timeout_secs(t.timeout_secs);
        if let Some(st) = t.script_type {
            step = step.script_type(st);
        }
        if let (Some(target), false) = (&t.target, scaling) {
            step = step.target(parse_ref(target, None, scope)?);
        }
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compiler::compile;
    use crate::core::context::{CompileContext, MemoryReader};
    use crate::core::editable;
    use serde_json::json;
    use uuid::Uuid;

    const LAMP: &str = r#"
version: "1.0"
kind: blueprint
name: Lamp
description: LAMP stack
imports: [lib/common.yaml]
params:
  env: DEV
  replicas: 2
services:
  Web:
    extends: [Tagged]
    variables:
      ENV: "{{params.env}}"
      PORT: {value: 8080, type: int, runtime: true}
    actions:
      check:
        - decision:
            name: is_up
            script: "curl -sf localhost:@@{PORT}@@"
            success:
              - exec: {name: ok, script: "echo up"}
            failure:
              - exec: {name: fix, script_file: scripts/fix.sh}
packages:
  WebPkg:
    refs: {services: Web}
    actions:
      install:
        - exec: {name: step1, script: "echo one"}
        - parallel:
            - exec: {name: a, script: "echo a"}
            - exec: {name: b, script: "echo b"}
substrates:
  VM:
    refs: {credential: Root}
    create_spec_file: specs/vm.yaml
deployments:
  D:
    refs: {packages: [WebPkg], substrate: VM}
    attrs: {max_replicas: "{{params.replicas}}"}
profiles:
  Default:
    refs: {deployments: D}
    actions:
      scale:
        - scale_out: {name: up, target: D, count: 1}
root:
  refs: {profiles: [Default]}
"#;

    const COMMON: &str = r#"
mixins:
  Tagged:
    variables:
      OWNER: ops
credentials:
  Root:
    attrs: {username: root, type: KEY}
    secret_file: keys/root.pem
"#;

    fn lamp_reader() -> MemoryReader {
        MemoryReader::new()
            .with("bp.yaml", LAMP)
            .with("lib/common.yaml", COMMON)
            .with("lib/keys/root.pem", "KEYDATA\n")
            .with("scripts/fix.sh", "systemctl restart httpd")
            .with("specs/vm.yaml", "resources:\n  num_vcpus: 2\n")
    }

    fn load(reader: &MemoryReader) -> CompileResult<EntityGraph> {
        load_module(Path::new("bp.yaml"), reader)
    }

    fn find<'v>(list: &'v serde_json::Value, name: &str) -> &'v serde_json::Value {
        list.as_array()
            .and_then(|items| items.iter().find(|i| i["name"] == name))
            .unwrap_or(&serde_json::Value::Null)
    }

    #[test]
    fn test_bp015_resolve_params() {
        let mut params = IndexMap::new();
        params.insert("name".to_string(), YamlValue::String("world".to_string()));
        params.insert("n".to_string(), serde_yaml_ng::from_str("3").unwrap());
        assert_eq!(resolve_params("hello {{params.name}}", &params).unwrap(), "hello world");
        assert_eq!(resolve_params("{{ params.n }}x{{params.n}}", &params).unwrap(), "3x3");
        assert_eq!(resolve_params("keep {{ .Values.x }}", &params).unwrap(), "keep {{ .Values.x }}");
        assert!(resolve_params("{{params.missing}}", &params).unwrap_err().contains("missing"));
    }

    #[test]
    fn test_bp015_load_and_compile() {
        let graph = load(&lamp_reader()).unwrap();
        let out = compile(graph, &CompileContext::default()).unwrap();
        assert!(out.warnings.is_empty(), "{:?}", out.warnings);
        let res = &out.document["spec"]["resources"];
        assert_eq!(out.document["spec"]["description"], "LAMP stack");

        let web = find(&res["service_definition_list"], "Web");
        assert_eq!(find(&web["variable_list"], "ENV")["value"], "DEV");
        assert_eq!(find(&web["variable_list"], "OWNER")["value"], "ops");
        assert_eq!(find(&web["variable_list"], "PORT")["val_type"], "INT");

        let check = find(&web["action_list"], "check");
        let tasks = &check["runbook"]["task_definition_list"];
        assert_eq!(find(tasks, "fix")["attrs"]["script"], "systemctl restart httpd");

        let pkg = find(&res["package_definition_list"], "WebPkg");
        let install = &pkg["options"]["install_runbook"]["task_definition_list"];
        let names: Vec<&str> = install
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        assert_eq!(names, vec!["WebPkg_install_dag", "step1", "a", "b"]);

        let vm = find(&res["substrate_definition_list"], "VM");
        assert_eq!(vm["create_spec"], json!({"resources": {"num_vcpus": 2}}));
        let root = find(&res["credential_definition_list"], "Root");
        assert_eq!(root["secret"]["value"], "KEYDATA");
        assert_eq!(find(&res["deployment_definition_list"], "D")["max_replicas"], "2");

        let path = "spec.resources.service_definition_list[Web].variable_list[PORT].value";
        assert_eq!(out.editables.paths().collect::<Vec<_>>(), vec![path]);
        assert_eq!(editable::lookup(&out.document, path), Some(&json!("8080")));
    }

    #[test]
    fn test_bp015_import_depth() {
        let graph = load(&lamp_reader()).unwrap();
        let web = graph.candidates(&EntityKey::new(EntityKind::Service, "Web"))[0];
        let cred = graph.candidates(&EntityKey::new(EntityKind::Credential, "Root"))[0];
        assert_eq!(graph.depth(web), MODULE_DEPTH);
        assert_eq!(graph.depth(cred), MODULE_DEPTH + 1);
        assert!(graph
            .candidates(&EntityKey::new(EntityKind::Mixin, "Tagged"))
            .is_empty());
    }

    #[test]
    fn test_bp015_name_override() {
        let text = r#"
kind: blueprint
name: Bp
services:
  Web: {name: web_frontend}
packages:
  P:
    refs: {services: web_frontend}
    actions:
      install: [{exec: {name: s, script: "true"}}]
substrates:
  VM: {}
deployments:
  D: {refs: {packages: P, substrate: VM}}
profiles:
  Default: {refs: {deployments: D}}
root:
  refs: {profiles: Default}
"#;
        let reader = MemoryReader::new().with("bp.yaml", text);
        let out = compile(load(&reader).unwrap(), &CompileContext::default()).unwrap();
        let svc = &out.document["spec"]["resources"]["service_definition_list"][0];
        assert_eq!(svc["name"], "web_frontend");
    }

    #[test]
    fn test_bp015_bad_version() {
        let reader = MemoryReader::new().with("bp.yaml", "version: \"2.0\"\nkind: blueprint\nname: B\n");
        let err = load(&reader).unwrap_err();
        assert!(matches!(err, CompileError::Parse { .. }));
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_bp015_unknown_field() {
        let reader = MemoryReader::new().with(
            "bp.yaml",
            "kind: blueprint\nname: B\nservices:\n  S: {colour: red}\n",
        );
        assert!(matches!(load(&reader).unwrap_err(), CompileError::Parse { .. }));
    }

    #[test]
    fn test_bp015_unknown_param() {
        let reader = MemoryReader::new().with(
            "bp.yaml",
            "kind: blueprint\nname: B\nservices:\n  S: {description: \"{{params.nope}}\"}\n",
        );
        assert!(load(&reader).unwrap_err().to_string().contains("unknown param: nope"));
    }

    #[test]
    fn test_bp015_inheritance_cycle() {
        let reader = MemoryReader::new().with(
            "bp.yaml",
            "kind: blueprint\nname: B\nservices:\n  A: {extends: [C]}\n  C: {extends: [A]}\n",
        );
        let err = load(&reader).unwrap_err();
        assert!(err.to_string().contains("inheritance cycle"), "{}", err);
    }

    #[test]
    fn test_bp015_unknown_base() {
        let reader = MemoryReader::new().with(
            "bp.yaml",
            "kind: blueprint\nname: B\nservices:\n  A: {extends: [Ghost]}\n",
        );
        assert!(matches!(load(&reader).unwrap_err(), CompileError::UnresolvedReference { .. }));
    }

    #[test]
    fn test_bp015_base_order_independent() {
        // derived declared before its base
        let reader = MemoryReader::new().with(
            "bp.yaml",
            "kind: blueprint\nname: B\nservices:\n  Child: {extends: [Parent]}\n  Parent:\n    variables: {X: \"1\"}\n",
        );
        let graph = load(&reader).unwrap();
        let child = graph.candidates(&EntityKey::new(EntityKind::Service, "Child"))[0];
        assert_eq!(graph.get(child).variables["X"].value, "1");
        assert!(graph.get(child).extends_from("Parent"));
    }

    #[test]
    fn test_bp015_import_cannot_declare_root() {
        let reader = MemoryReader::new()
            .with("bp.yaml", "kind: blueprint\nname: B\nimports: [lib.yaml]\n")
            .with("lib.yaml", "kind: blueprint\nname: Other\n");
        let err = load(&reader).unwrap_err();
        assert!(err.to_string().contains("cannot declare a root"));
    }

    #[test]
    fn test_bp015_import_cycle_loads_once() {
        let reader = MemoryReader::new()
            .with("bp.yaml", "kind: blueprint\nname: B\nimports: [a.yaml]\n")
            .with("a.yaml", "imports: [b.yaml]\nservices:\n  A: {}\n")
            .with("b.yaml", "imports: [a.yaml]\nservices:\n  B2: {}\n");
        let graph = load(&reader).unwrap();
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn test_bp015_diamond_import_takes_shortest_path() {
        let reader = MemoryReader::new()
            .with("bp.yaml", "kind: blueprint\nname: B\nimports: [a.yaml, c.yaml]\n")
            .with("a.yaml", "imports: [c.yaml]\nservices:\n  A: {}\n")
            .with("c.yaml", "services:\n  C: {}\n");
        let graph = load(&reader).unwrap();
        let a = graph.candidates(&EntityKey::new(EntityKind::Service, "A"))[0];
        let c = graph.candidates(&EntityKey::new(EntityKind::Service, "C"));
        assert_eq!(c.len(), 1);
        assert_eq!(graph.depth(a), MODULE_DEPTH + 1);
        assert_eq!(graph.depth(c[0]), MODULE_DEPTH + 1);
    }

    const AROUND_S: &str = r#"
kind: blueprint
name: B
imports: [a.yaml, c.yaml]
packages:
  P:
    refs: {services: S}
substrates:
  VM: {}
deployments:
  D:
    refs: {packages: [P], substrate: VM}
profiles:
  Default:
    refs: {deployments: D}
root:
  refs: {profiles: [Default]}
"#;

    #[test]
    fn test_bp015_equal_import_depth_is_ambiguous() {
        let reader = MemoryReader::new()
            .with("bp.yaml", AROUND_S)
            .with("a.yaml", "imports: [c.yaml]\nservices:\n  S: {}\n")
            .with("c.yaml", "services:\n  S: {}\n");
        let err = compile(load(&reader).unwrap(), &CompileContext::default()).unwrap_err();
        assert!(
            matches!(err, CompileError::AmbiguousReference { .. }),
            "{}",
            err
        );
    }

    #[test]
    fn test_bp015_nearer_import_wins() {
        let reader = MemoryReader::new()
            .with("bp.yaml", AROUND_S.replace("[a.yaml, c.yaml]", "[a.yaml]"))
            .with("a.yaml", "imports: [c.yaml]\nservices:\n  S:\n    variables: {FROM: a}\n")
            .with("c.yaml", "services:\n  S:\n    variables: {FROM: c}\n");
        let out = compile(load(&reader).unwrap(), &CompileContext::default()).unwrap();
        let svc = &out.document["spec"]["resources"]["service_definition_list"];
        assert_eq!(svc.as_array().map(Vec::len), Some(1));
        assert_eq!(find(&svc[0]["variable_list"], "FROM")["value"], "a");
    }

    #[test]
    fn test_bp015_script_and_file_conflict() {
        let reader = MemoryReader::new().with(
            "bp.yaml",
            "kind: blueprint\nname: B\nservices:\n  S:\n    actions:\n      go: [{exec: {name: x, script: a, script_file: b.sh}}]\n",
        );
        assert!(load(&reader).unwrap_err().to_string().contains("either 'script' or 'script_file'"));
    }

    #[test]
    fn test_bp015_missing_file() {
        let reader = MemoryReader::new().with(
            "bp.yaml",
            "kind: blueprint\nname: B\nsubstrates:\n  VM: {create_spec_file: nope.yaml}\n",
        );
        assert!(matches!(load(&reader).unwrap_err(), CompileError::Io { .. }));
    }

    #[test]
    fn test_bp015_variable_forms() {
        let reader = MemoryReader::new().with(
            "bp.yaml",
            r#"
kind: blueprint
name: B
services:
  S:
    variables:
      SIZE: {kind: options, choices: [small, large], value: small}
      PASS: {kind: secret, value: hunter2, plaintext: true}
      IP: {kind: computed, script: "echo 10.0.0.1"}
      REMOTE: {kind: computed, url: "https://cmdb/ip", response_path: "$.ip"}
      TOKEN: {kind: computed, script: "vault read token", secret: true}
      KEY: {kind: computed, url: "https://vault/key", secret: true}
"#,
        );
        let graph = load(&reader).unwrap();
        let s = graph.get(graph.candidates(&EntityKey::new(EntityKind::Service, "S"))[0]);
        assert!(matches!(s.variables["SIZE"].kind, VarKind::WithOptions { .. }));
        assert!(s.variables["PASS"].is_secret());
        assert!(matches!(
            s.variables["REMOTE"].kind,
            VarKind::Computed {
                source: ComputedSource::Http { .. },
                secret: false
            }
        ));
        assert!(s.variables["TOKEN"].is_secret());
        assert_eq!(s.variables["TOKEN"].render(Uuid::nil())["type"], "EXEC_SECRET");
        assert_eq!(s.variables["KEY"].render(Uuid::nil())["type"], "HTTP_SECRET");
        assert_eq!(s.variables["IP"].render(Uuid::nil())["type"], "EXEC_LOCAL");
    }

    #[test]
    fn test_bp015_secret_needs_opt_in() {
        let reader = MemoryReader::new().with(
            "bp.yaml",
            "kind: blueprint\nname: B\nservices:\n  S:\n    variables:\n      P: {kind: secret, value: x}\n",
        );
        assert!(matches!(load(&reader).unwrap_err(), CompileError::Validation { .. }));
    }

    #[test]
    fn test_bp015_ref_forms() {
        assert_eq!(
            parse_ref("deployment/D", None, "x").unwrap(),
            Ref::named(EntityKind::Deployment, "D")
        );
        assert_eq!(
            parse_ref("S", Some(EntityKind::Service), "x").unwrap(),
            Ref::named(EntityKind::Service, "S")
        );
        assert!(parse_ref("S", None, "x").is_err());
        assert!(parse_ref("machine/S", None, "x").is_err());
    }
}
