//! BP-012: Macro scope checking.
//!
//! Scripts, HTTP fields and variable values may carry `@@{NAME}@@` macros that
//! the orchestration server expands at run time. Nothing is substituted here;
//! each macro head is only checked against the scope chain visible from where
//! it appears: action variables and task outputs, then the owning entity, then
//! related services (for packages), every reachable profile, the root, and
//! finally the server builtins. A dotted head such as `@@{S.address}@@` is in
//! scope when its first segment names a reachable entity.

use super::context::CompileContext;
use super::entity::{Action, Entity};
use super::error::{CompileError, CompileResult};
use super::reference::ResolvedGraph;
use super::task::TaskKind;
use super::types::{EntityId, EntityKind};
use super::variable::{ComputedSource, VarKind, Variable};
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

const OPEN: &str = "@@{";
const CLOSE: &str = "}@@";

/// Names the server always provides.
const BUILTINS: &[&str] = &["platform", "address", "id", "name", "endpoint", "vm", "app"];

/// Every macro body in `text`, trimmed. An unclosed opener yields an error.
pub fn scan(text: &str) -> Result<Vec<&str>, String> {
    let mut out = Vec::new();
    let mut start = 0;
    while let Some(open) = text[start..].find(OPEN) {
        let open = start + open;
        let close = text[open..]
            .find(CLOSE)
            .ok_or_else(|| format!("unclosed macro at position {}", open))?;
        let close = open + close;
        out.push(text[open + OPEN.len()..close].trim());
        start = close + CLOSE.len();
    }
    Ok(out)
}

/// Leading identifier of a macro body: `a.b[0].c` → `a`.
fn head(body: &str) -> &str {
    let end = body.find(['.', '[']).unwrap_or(body.len());
    &body[..end]
}

fn is_builtin(name: &str) -> bool {
    name.starts_with("calm_") || BUILTINS.contains(&name)
}

/// Names visible from one entity, outermost scopes included.
struct Scope {
    names: FxHashSet<String>,
}

impl Scope {
    fn knows(&self, body: &str) -> bool {
        let head = head(body);
        is_builtin(head) || self.names.contains(head) || self.names.contains(body)
    }
}

fn variable_texts(var: &Variable) -> Vec<&str> {
    let mut out = vec![var.value.as_str()];
    out.extend(var.default.as_deref());
    match &var.kind {
        VarKind::WithOptions { choices } => out.extend(choices.iter().map(String::as_str)),
        VarKind::Computed { source, .. } => match source {
            ComputedSource::Script { script, .. } => out.push(script),
            ComputedSource::Http { url, .. } => out.push(url),
        },
        VarKind::Simple | VarKind::Secret => {}
    }
    out
}

/// Names an action introduces: its variables plus every task output.
fn action_names(action: &Action) -> FxHashSet<String> {
    let mut names: FxHashSet<String> = action.variables.keys().cloned().collect();
    for node in action.tree.all_nodes() {
        match &node.kind {
            TaskKind::SetVariable { variables, .. } => names.extend(variables.iter().cloned()),
            TaskKind::Http { response_paths, .. } => names.extend(response_paths.keys().cloned()),
            TaskKind::Input { inputs } => names.extend(inputs.iter().cloned()),
            TaskKind::Loop { loop_variable, .. } => {
                names.insert(loop_variable.clone());
            }
            _ => {}
        }
    }
    names
}

struct Checker<'a> {
    resolved: &'a ResolvedGraph,
    ctx: &'a CompileContext,
    /// Entity names, profile variables and root variables.
    shared: FxHashSet<String>,
    warnings: Vec<String>,
}

impl<'a> Checker<'a> {
    fn new(resolved: &'a ResolvedGraph, ctx: &'a CompileContext) -> Self {
        let mut shared = FxHashSet::default();
        for &id in resolved.reachable() {
            let e = resolved.entity(id);
            shared.insert(e.name.clone());
            if e.kind == EntityKind::Profile || id == resolved.root() {
                shared.extend(e.variables.keys().cloned());
            }
        }
        Self {
            resolved,
            ctx,
            shared,
            warnings: Vec::new(),
        }
    }

    fn entity_scope(&self, id: EntityId) -> FxHashSet<String> {
        let e = self.resolved.entity(id);
        let mut names = self.shared.clone();
        names.extend(e.variables.keys().cloned());
        if e.kind == EntityKind::Package {
            for &svc in self.resolved.slot(id, "services") {
                names.extend(self.resolved.entity(svc).variables.keys().cloned());
            }
        }
        names
    }

    fn check_text(&mut self, scope: &Scope, site: &str, text: &str) -> CompileResult<()> {
        let bodies = match scan(text) {
            Ok(b) => b,
            Err(reason) => return self.report(site, reason),
        };
        for body in bodies {
            if !scope.knows(body) {
                self.report(site, format!("macro '@@{{{}}}@@' names nothing in scope", body))?;
            }
        }
        Ok(())
    }

    fn report(&mut self, site: &str, reason: String) -> CompileResult<()> {
        if self.ctx.strict_macros {
            return Err(CompileError::validation(site, reason));
        }
        warn!("{}: {}", site, reason);
        self.warnings.push(format!("{}: {}", site, reason));
        Ok(())
    }

    fn check_entity(&mut self, id: EntityId) -> CompileResult<()> {
        let resolved = self.resolved;
        let e: &Entity = resolved.entity(id);
        let outer = Scope {
            names: self.entity_scope(id),
        };
        for var in e.variables.values() {
            let site = format!("{}.{}", e.name, var.name);
            for text in variable_texts(var) {
                self.check_text(&outer, &site, text)?;
            }
        }
        for action in e.actions.values() {
            let mut names = outer.names.clone();
            names.extend(action_names(action));
            let scope = Scope { names };
            for var in action.variables.values() {
                let site = format!("{}.{}.{}", e.name, action.name, var.name);
                for text in variable_texts(var) {
                    self.check_text(&scope, &site, text)?;
                }
            }
            for node in action.tree.all_nodes() {
                let site = format!("{}.{}.{}", e.name, action.name, node.name);
                for text in node.kind.texts() {
                    self.check_text(&scope, &site, text)?;
                }
            }
        }
        Ok(())
    }
}

/// Check every macro reachable from the root; returns the warnings raised.
pub fn check(resolved: &ResolvedGraph, ctx: &CompileContext) -> CompileResult<Vec<String>> {
    let mut checker = Checker::new(resolved, ctx);
    for &id in resolved.reachable() {
        checker.check_entity(id)?;
    }
    debug!("macro check finished with {} warning(s)", checker.warnings.len());
    Ok(checker.warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entity::Action;
    use crate::core::fixtures;
    use crate::core::reference::resolve_graph;
    use crate::core::tasktree::{Step, TaskTreeBuilder};
    use crate::core::variable::VariableDecl;

    fn with_script(kind: EntityKind, action: &'static str, script: &'static str) -> ResolvedGraph {
        let graph = fixtures::scenario_a_with(move |b| {
            if b.kind() != kind {
                return b;
            }
            let mut t = TaskTreeBuilder::new(action);
            t.step(Step::set_variable("read", "echo OUT=1", vec!["OUT".into()]))
                .unwrap();
            t.step(Step::exec("use", script)).unwrap();
            b.action(
                Action::new(action, t.finish().unwrap())
                    .variable(VariableDecl::simple("LOCAL", "x").declare().unwrap()),
            )
        });
        resolve_graph(graph).unwrap()
    }

    #[test]
    fn test_bp012_scan() {
        assert_eq!(scan("a @@{X}@@ b @@{ y.z }@@").unwrap(), vec!["X", "y.z"]);
        assert!(scan("plain").unwrap().is_empty());
        assert!(scan("broken @@{X").is_err());
        assert_eq!(head("platform.status[0].ip"), "platform");
        assert_eq!(head("nics[0]"), "nics");
    }

    #[test]
    fn test_bp012_scope_chain() {
        let resolved = with_script(
            EntityKind::Service,
            "probe",
            "echo @@{ENV}@@ @@{LOCAL}@@ @@{OUT}@@ @@{calm_array_index}@@ @@{VM.address}@@",
        );
        let warnings = check(&resolved, &CompileContext::default()).unwrap();
        assert!(warnings.is_empty(), "{:?}", warnings);
    }

    #[test]
    fn test_bp012_package_sees_service_vars() {
        let graph = fixtures::scenario_a_with(|b| match b.kind() {
            EntityKind::Package => b.variable(VariableDecl::simple("URL", "http://@@{ENV}@@").declare().unwrap()),
            _ => b,
        });
        let resolved = resolve_graph(graph).unwrap();
        assert!(check(&resolved, &CompileContext::default()).unwrap().is_empty());
    }

    #[test]
    fn test_bp012_unknown_warns_or_fails() {
        let resolved = with_script(EntityKind::Service, "probe", "echo @@{NOPE}@@");
        let warnings = check(&resolved, &CompileContext::default()).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("NOPE"));

        let strict = CompileContext {
            strict_macros: true,
            ..CompileContext::default()
        };
        let err = check(&resolved, &strict).unwrap_err();
        assert!(matches!(err, CompileError::Validation { .. }));
    }

    #[test]
    fn test_bp012_unrelated_entity_scope() {
        // service variables are not visible from a substrate
        let resolved = with_script(EntityKind::Substrate, "pre_create", "echo @@{LOCAL}@@ @@{ENV}@@");
        let warnings = check(&resolved, &CompileContext::default()).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("ENV"));
    }
}
