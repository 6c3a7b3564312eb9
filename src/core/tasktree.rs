//! BP-008: Task-tree builder.
//!
//! Action bodies are authored procedurally. Opening a scope returns a
//! `ScopeToken` that must be handed back to `close`; tokens are not `Clone`,
//! so a scope cannot be closed twice, and closing anything but the innermost
//! open scope is a structural error.
//!
//! Ordering rules:
//! - outside any parallel scope each step depends on the one before it;
//! - every member of a parallel scope depends on the scope's entry set and
//!   the scope's exit set (all members) is what the next step waits on;
//! - decision branches and loop bodies are separate trees rooted at their
//!   node, which itself takes one place in the enclosing sequence.

use super::error::{CompileError, CompileResult};
use super::reference::Ref;
use super::task::{ScaleDirection, TaskKind, TaskNode, TaskTree};
use super::types::ScriptType;
use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_BUILDER: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Step specifications
// ============================================================================

/// A leaf step waiting to be placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    name: String,
    description: String,
    kind: TaskKind,
    target: Option<Ref>,
    retries: u32,
    timeout_secs: u32,
}

impl Step {
    fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            kind,
            target: None,
            retries: 0,
            timeout_secs: 0,
        }
    }

    pub fn exec(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(
            name,
            TaskKind::Exec {
                script_type: ScriptType::Sh,
                script: script.into(),
            },
        )
    }

    pub fn set_variable(
        name: impl Into<String>,
        script: impl Into<String>,
        variables: Vec<String>,
    ) -> Self {
        Self::new(
            name,
            TaskKind::SetVariable {
                script_type: ScriptType::Sh,
                script: script.into(),
                variables,
            },
        )
    }

    pub fn http(name: impl Into<String>, method: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            name,
            TaskKind::Http {
                method: method.into(),
                url: url.into(),
                body: String::new(),
                headers: IndexMap::new(),
                status_codes: vec![200],
                response_paths: IndexMap::new(),
            },
        )
    }

    pub fn delay(name: impl Into<String>, seconds: u64) -> Self {
        Self::new(name, TaskKind::Delay { seconds })
    }

    pub fn scale_out(name: impl Into<String>, deployment: Ref, count: impl Into<String>) -> Self {
        Self::scale(name, ScaleDirection::Out, deployment, count)
    }

    pub fn scale_in(name: impl Into<String>, deployment: Ref, count: impl Into<String>) -> Self {
        Self::scale(name, ScaleDirection::In, deployment, count)
    }

    fn scale(
        name: impl Into<String>,
        direction: ScaleDirection,
        deployment: Ref,
        count: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            TaskKind::Scaling {
                direction,
                count: count.into(),
            },
        )
        .target(deployment)
    }

    pub fn input(name: impl Into<String>, inputs: Vec<String>) -> Self {
        Self::new(name, TaskKind::Input { inputs })
    }

    pub fn target(mut self, target: Ref) -> Self {
        self.target = Some(target);
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    pub fn script_type(mut self, st: ScriptType) -> Self {
        if let TaskKind::Exec { script_type, .. } | TaskKind::SetVariable { script_type, .. } =
            &mut self.kind
        {
            *script_type = st;
        }
        self
    }

    pub fn body(mut self, text: impl Into<String>) -> Self {
        if let TaskKind::Http { body, .. } = &mut self.kind {
            *body = text.into();
        }
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TaskKind::Http { headers, .. } = &mut self.kind {
            headers.insert(key.into(), value.into());
        }
        self
    }

    pub fn status_codes(mut self, codes: Vec<u16>) -> Self {
        if let TaskKind::Http { status_codes, .. } = &mut self.kind {
            *status_codes = codes;
        }
        self
    }

    pub fn response_path(mut self, variable: impl Into<String>, path: impl Into<String>) -> Self {
        if let TaskKind::Http { response_paths, .. } = &mut self.kind {
            response_paths.insert(variable.into(), path.into());
        }
        self
    }

    pub fn retries(mut self, n: u32) -> Self {
        self.retries = n;
        self
    }

    pub fn timeout_secs(mut self, secs: u32) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Header of a decision node; branches are added through scopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    name: String,
    description: String,
    script_type: ScriptType,
    script: String,
    target: Option<Ref>,
}

impl Decision {
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            script_type: ScriptType::Sh,
            script: script.into(),
            target: None,
        }
    }

    pub fn target(mut self, target: Ref) -> Self {
        self.target = Some(target);
        self
    }

    pub fn script_type(mut self, st: ScriptType) -> Self {
        self.script_type = st;
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }
}

/// Header of a loop node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loop {
    name: String,
    description: String,
    iterations: String,
    loop_variable: String,
}

impl Loop {
    pub fn new(name: impl Into<String>, iterations: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            iterations: iterations.into(),
            loop_variable: "iteration".to_string(),
        }
    }

    pub fn loop_variable(mut self, var: impl Into<String>) -> Self {
        self.loop_variable = var.into();
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }
}

// ============================================================================
// Scopes
// ============================================================================

/// Which side of a decision a branch scope fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Success,
    Failure,
}

/// Kind of an open scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Serial,
    Parallel,
    Decision,
    Success,
    Failure,
    Loop,
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Serial => "serial",
            Self::Parallel => "parallel",
            Self::Decision => "decision",
            Self::Success => "success branch",
            Self::Failure => "failure branch",
            Self::Loop => "loop",
        };
        write!(f, "{}", s)
    }
}

/// Proof that a scope is open. Hand it back to [`TaskTreeBuilder::close`].
#[derive(Debug)]
#[must_use = "an opened scope must be closed"]
pub struct ScopeToken {
    builder: u64,
    seq: u64,
    kind: ScopeKind,
}

impl ScopeToken {
    pub fn kind(&self) -> ScopeKind {
        self.kind
    }
}

#[derive(Debug)]
struct PendingDecision {
    header: Decision,
    predecessors: Vec<String>,
    success: Option<TaskTree>,
    failure: Option<TaskTree>,
}

#[derive(Debug)]
struct PendingLoop {
    header: Loop,
    predecessors: Vec<String>,
}

#[derive(Debug)]
enum FrameKind {
    Root,
    Serial,
    Parallel,
    Decision(PendingDecision),
    Branch(Branch),
    Loop(PendingLoop),
}

#[derive(Debug)]
struct Frame {
    seq: u64,
    kind: FrameKind,
    /// Predecessors every member of a parallel frame starts from.
    entry: Vec<String>,
    /// Predecessors of the next member of a sequential frame.
    cursor: Vec<String>,
    /// Members of a parallel frame, i.e. what a following step joins on.
    exits: Vec<String>,
    members: usize,
}

impl Frame {
    fn new(seq: u64, kind: FrameKind, preds: Vec<String>) -> Self {
        Self {
            seq,
            kind,
            entry: preds.clone(),
            cursor: preds,
            exits: Vec::new(),
            members: 0,
        }
    }

    fn scope_kind(&self) -> Option<ScopeKind> {
        match self.kind {
            FrameKind::Root => None,
            FrameKind::Serial => Some(ScopeKind::Serial),
            FrameKind::Parallel => Some(ScopeKind::Parallel),
            FrameKind::Decision(_) => Some(ScopeKind::Decision),
            FrameKind::Branch(Branch::Success) => Some(ScopeKind::Success),
            FrameKind::Branch(Branch::Failure) => Some(ScopeKind::Failure),
            FrameKind::Loop(_) => Some(ScopeKind::Loop),
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Accumulates one action body.
#[derive(Debug)]
pub struct TaskTreeBuilder {
    id: u64,
    action: String,
    next_seq: u64,
    frames: Vec<Frame>,
    /// One node list per open tree level (root, branches, loop bodies).
    levels: Vec<Vec<TaskNode>>,
    names: FxHashSet<String>,
}

impl TaskTreeBuilder {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            id: NEXT_BUILDER.fetch_add(1, Ordering::Relaxed),
            action: action.into(),
            next_seq: 1,
            frames: vec![Frame::new(0, FrameKind::Root, Vec::new())],
            levels: vec![Vec::new()],
            names: FxHashSet::default(),
        }
    }

    fn err(&self, reason: impl Into<String>) -> CompileError {
        CompileError::structural(&self.action, reason)
    }

    fn top(&self) -> &Frame {
        &self.frames[self.frames.len() - 1]
    }

    fn top_mut(&mut self) -> &mut Frame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn reserve(&mut self, name: &str) -> CompileResult<()> {
        if name.trim().is_empty() {
            return Err(self.err("task name is empty"));
        }
        if !self.names.insert(name.to_string()) {
            return Err(self.err(format!("duplicate task name '{}'", name)));
        }
        Ok(())
    }

    /// Predecessor set the next member of the innermost scope starts from.
    fn next_predecessors(&self) -> CompileResult<Vec<String>> {
        let top = self.top();
        match top.kind {
            FrameKind::Parallel => Ok(top.entry.clone()),
            FrameKind::Decision(ref d) => Err(self.err(format!(
                "steps inside decision '{}' must go in its success or failure branch",
                d.header.name
            ))),
            _ => Ok(top.cursor.clone()),
        }
    }

    /// Record a finished member whose completion is signalled by `outflow`.
    fn record_member(&mut self, outflow: Vec<String>) {
        let top = self.top_mut();
        top.members += 1;
        match top.kind {
            FrameKind::Parallel => top.exits.extend(outflow),
            _ => top.cursor = outflow,
        }
    }

    fn place(&mut self, node: TaskNode) {
        let name = node.name.clone();
        let last = self.levels.len() - 1;
        self.levels[last].push(node);
        self.record_member(vec![name]);
    }

    fn push_frame(&mut self, kind: FrameKind, preds: Vec<String>) -> ScopeToken {
        let seq = self.next_seq;
        self.next_seq += 1;
        let frame = Frame::new(seq, kind, preds);
        let kind = frame.scope_kind().unwrap_or(ScopeKind::Serial);
        self.frames.push(frame);
        ScopeToken {
            builder: self.id,
            seq,
            kind,
        }
    }

    /// Append a leaf step at the current insertion point.
    pub fn step(&mut self, step: Step) -> CompileResult<()> {
        if matches!(step.kind, TaskKind::Decision { .. } | TaskKind::Loop { .. }) {
            return Err(self.err(format!(
                "'{}': decisions and loops are opened as scopes",
                step.name
            )));
        }
        let predecessors = self.next_predecessors()?;
        self.reserve(&step.name)?;
        self.place(TaskNode {
            name: step.name,
            description: step.description,
            kind: step.kind,
            target: step.target,
            predecessors,
            retries: step.retries,
            timeout_secs: step.timeout_secs,
        });
        Ok(())
    }

    pub fn open_serial(&mut self) -> CompileResult<ScopeToken> {
        let preds = self.next_predecessors()?;
        Ok(self.push_frame(FrameKind::Serial, preds))
    }

    pub fn open_parallel(&mut self) -> CompileResult<ScopeToken> {
        let preds = self.next_predecessors()?;
        Ok(self.push_frame(FrameKind::Parallel, preds))
    }

    pub fn open_decision(&mut self, header: Decision) -> CompileResult<ScopeToken> {
        let predecessors = self.next_predecessors()?;
        self.reserve(&header.name)?;
        let pending = PendingDecision {
            header,
            predecessors,
            success: None,
            failure: None,
        };
        Ok(self.push_frame(FrameKind::Decision(pending), Vec::new()))
    }

    /// Open one branch of the innermost decision.
    pub fn open_branch(&mut self, branch: Branch) -> CompileResult<ScopeToken> {
        let taken = match &self.top().kind {
            FrameKind::Decision(d) => match branch {
                Branch::Success => d.success.is_some(),
                Branch::Failure => d.failure.is_some(),
            },
            _ => return Err(self.err("branch opened outside a decision")),
        };
        if taken {
            return Err(self.err(format!("{:?} branch declared twice", branch).to_lowercase()));
        }
        self.levels.push(Vec::new());
        Ok(self.push_frame(FrameKind::Branch(branch), Vec::new()))
    }

    pub fn open_loop(&mut self, header: Loop) -> CompileResult<ScopeToken> {
        let predecessors = self.next_predecessors()?;
        self.reserve(&header.name)?;
        if header.iterations.trim().is_empty() {
            return Err(self.err(format!("loop '{}' has no iteration count", header.name)));
        }
        self.levels.push(Vec::new());
        let pending = PendingLoop {
            header,
            predecessors,
        };
        Ok(self.push_frame(FrameKind::Loop(pending), Vec::new()))
    }

    /// Close the innermost open scope; `token` must be the one it returned.
    pub fn close(&mut self, token: ScopeToken) -> CompileResult<()> {
        if token.builder != self.id {
            return Err(self.err(format!("{} scope token belongs to another action", token.kind)));
        }
        if self.frames.len() == 1 {
            return Err(self.err(format!("{} closed but never opened", token.kind)));
        }
        let top = self.top();
        if top.seq != token.seq {
            let open = top.scope_kind().unwrap_or(ScopeKind::Serial);
            return Err(self.err(format!(
                "mismatched close: innermost open scope is {}, got {}",
                open, token.kind
            )));
        }
        let frame = match self.frames.pop() {
            Some(f) => f,
            None => return Err(self.err("scope stack is empty")),
        };

        match frame.kind {
            FrameKind::Root => Err(self.err("cannot close the action body")),
            FrameKind::Serial => {
                if frame.members > 0 {
                    self.record_member(frame.cursor);
                }
                Ok(())
            }
            FrameKind::Parallel => {
                if frame.members > 0 {
                    self.record_member(frame.exits);
                }
                Ok(())
            }
            FrameKind::Branch(branch) => {
                let tree = TaskTree::from_nodes(self.levels.pop().unwrap_or_default());
                match &mut self.top_mut().kind {
                    FrameKind::Decision(d) => {
                        match branch {
                            Branch::Success => d.success = Some(tree),
                            Branch::Failure => d.failure = Some(tree),
                        }
                        Ok(())
                    }
                    _ => Err(self.err("branch closed outside a decision")),
                }
            }
            FrameKind::Decision(d) => {
                let (success, failure) = match (d.success, d.failure) {
                    (Some(s), Some(f)) => (s, f),
                    (None, _) => {
                        return Err(self.err(format!(
                            "decision '{}' is missing its success branch",
                            d.header.name
                        )))
                    }
                    (_, None) => {
                        return Err(self.err(format!(
                            "decision '{}' is missing its failure branch",
                            d.header.name
                        )))
                    }
                };
                let h = d.header;
                self.place(TaskNode {
                    name: h.name,
                    description: h.description,
                    kind: TaskKind::Decision {
                        script_type: h.script_type,
                        script: h.script,
                        success: Arc::new(success),
                        failure: Arc::new(failure),
                    },
                    target: h.target,
                    predecessors: d.predecessors,
                    retries: 0,
                    timeout_secs: 0,
                });
                Ok(())
            }
            FrameKind::Loop(l) => {
                let body = self.levels.pop().unwrap_or_default();
                if body.is_empty() {
                    return Err(self.err(format!("loop '{}' has an empty body", l.header.name)));
                }
                let h = l.header;
                self.place(TaskNode {
                    name: h.name,
                    description: h.description,
                    kind: TaskKind::Loop {
                        iterations: h.iterations,
                        loop_variable: h.loop_variable,
                        body: Arc::new(TaskTree::from_nodes(body)),
                    },
                    target: None,
                    predecessors: l.predecessors,
                    retries: 0,
                    timeout_secs: 0,
                });
                Ok(())
            }
        }
    }

    /// Finish the body. Every opened scope must have been closed.
    pub fn finish(mut self) -> CompileResult<TaskTree> {
        if let Some(open) = self.frames.last().and_then(Frame::scope_kind) {
            return Err(self.err(format!("{} scope opened but never closed", open)));
        }
        Ok(TaskTree::from_nodes(self.levels.pop().unwrap_or_default()))
    }

    // -- closure helpers --

    pub fn parallel<F>(&mut self, body: F) -> CompileResult<()>
    where
        F: FnOnce(&mut Self) -> CompileResult<()>,
    {
        let token = self.open_parallel()?;
        body(self)?;
        self.close(token)
    }

    pub fn serial<F>(&mut self, body: F) -> CompileResult<()>
    where
        F: FnOnce(&mut Self) -> CompileResult<()>,
    {
        let token = self.open_serial()?;
        body(self)?;
        self.close(token)
    }

    pub fn decision<S, F>(&mut self, header: Decision, success: S, failure: F) -> CompileResult<()>
    where
        S: FnOnce(&mut Self) -> CompileResult<()>,
        F: FnOnce(&mut Self) -> CompileResult<()>,
    {
        let token = self.open_decision(header)?;
        let s = self.open_branch(Branch::Success)?;
        success(self)?;
        self.close(s)?;
        let f = self.open_branch(Branch::Failure)?;
        failure(self)?;
        self.close(f)?;
        self.close(token)
    }

    pub fn repeat<F>(&mut self, header: Loop, body: F) -> CompileResult<()>
    where
        F: FnOnce(&mut Self) -> CompileResult<()>,
    {
        let token = self.open_loop(header)?;
        body(self)?;
        self.close(token)
    }
}
