//! Shared test graphs.

use super::compiler::{compile as run, Compiled};
use super::context::CompileContext;
use super::entity::{Action, EntityBuilder};
use super::graph::EntityGraph;
use super::reference::Ref;
use super::tasktree::{Step, TaskTreeBuilder};
use super::types::EntityKind;
use super::variable::VariableDecl;

/// Scenario A: service S (ENV=DEV), package P installing S in two steps,
/// substrate VM, deployment D, profile Default, blueprint Bp.
pub fn scenario_a() -> EntityGraph {
    scenario_a_with(|b| b)
}

/// Scenario A with `tweak` applied to every builder before it is built.
pub fn scenario_a_with(tweak: impl Fn(EntityBuilder) -> EntityBuilder) -> EntityGraph {
    let mut g = EntityGraph::new();
    let s = tweak(
        EntityBuilder::new(EntityKind::Service, "S")
            .variable(VariableDecl::simple("ENV", "DEV").declare().unwrap()),
    );
    let s = g.declare(s.build().unwrap());
    build_rest(&mut g, vec![s.to_ref()], &tweak);
    g
}

/// Package, substrate, deployment, profile and blueprint around `services`.
pub fn declare_around(g: &mut EntityGraph, services: Vec<Ref>) {
    build_rest(g, services, &|b| b);
}

fn build_rest(g: &mut EntityGraph, services: Vec<Ref>, tweak: &dyn Fn(EntityBuilder) -> EntityBuilder) {
    let mut install = TaskTreeBuilder::new("install");
    install.step(Step::exec("step1", "echo installing")).unwrap();
    install.step(Step::exec("step2", "echo configuring")).unwrap();
    let p = tweak(
        EntityBuilder::new(EntityKind::Package, "P")
            .references("services", services)
            .action(Action::new("install", install.finish().unwrap())),
    );
    let p = g.declare(p.build().unwrap());

    let vm = g.declare(tweak(EntityBuilder::new(EntityKind::Substrate, "VM")).build().unwrap());
    let d = g.declare(
        tweak(
            EntityBuilder::new(EntityKind::Deployment, "D")
                .reference("packages", &p)
                .reference("substrate", &vm),
        )
        .build()
        .unwrap(),
    );
    let prof = g.declare(
        tweak(EntityBuilder::new(EntityKind::Profile, "Default").reference("deployments", &d))
            .build()
            .unwrap(),
    );
    let bp = tweak(EntityBuilder::new(EntityKind::Blueprint, "Bp").reference("profiles", &prof));
    g.declare_root(bp.build().unwrap()).unwrap();
}

/// Compile with the default context; panics on error.
pub fn compile(graph: EntityGraph) -> Compiled {
    run(graph, &CompileContext::default()).unwrap()
}
