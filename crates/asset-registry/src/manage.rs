//! Manage-reference assignment.
//!
//! A prioritized multi-round breadth-first traversal over the dependency
//! graph that tags every transitively "managed" asset with a Manage-category
//! edge from its manager. Rounds run in descending manager-priority order so
//! that higher-priority managers' claims are visible (as "already managed")
//! to lower-priority rounds' predicates.

use std::collections::VecDeque;

use fnv::FnvHashSet;

use crate::graph::{DependencyCategory, DependencyGraph, DependencyProperties, DependencyQuery};
use crate::types::AssetIdentifier;

/// Per-edge verdict from the caller's predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManageDecision {
    /// Set the manage edge and recurse through the target's dependencies.
    Set,
    /// Set the manage edge but do not recurse.
    SetButNoRecurse,
    /// Neither set nor recurse.
    Skip,
}

/// Everything the predicate sees about one visited edge.
pub struct ManageEdgeContext<'a> {
    pub manager: &'a AssetIdentifier,
    /// The node the traversal arrived from (the manager itself for seeds).
    pub source: &'a AssetIdentifier,
    pub target: &'a AssetIdentifier,
    pub properties: DependencyProperties,
    /// Whether any manager (this round or a higher-priority one) already
    /// claimed the target.
    pub target_already_managed: bool,
    /// Whether this is a direct seed claim rather than a recursion step.
    pub is_direct: bool,
}

/// Predicate deciding, per visited edge, whether to set the manage edge.
pub type ManagePredicate<'a> = dyn FnMut(&ManageEdgeContext<'_>) -> ManageDecision + 'a;

/// One manager and its directly-claimed assets.
#[derive(Debug, Clone)]
pub struct ManageSeed {
    pub manager: AssetIdentifier,
    pub priority: i32,
    pub targets: Vec<AssetIdentifier>,
}

/// Arguments for [`set_manage_references`].
pub struct ManageReferencesContext<'a> {
    pub seeds: Vec<ManageSeed>,
    /// Edge categories followed when recursing.
    pub recurse_categories: Vec<DependencyCategory>,
    /// Property filter applied to recursed edges.
    pub recurse_query: DependencyQuery,
    /// Per-edge verdict; `None` uses the default predicate (skip
    /// already-managed targets, otherwise set and recurse).
    pub predicate: Option<&'a mut ManagePredicate<'a>>,
}

impl Default for ManageReferencesContext<'_> {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            recurse_categories: vec![DependencyCategory::Package],
            recurse_query: DependencyQuery::default(),
            predicate: None,
        }
    }
}

/// Runs the manage-reference graph search, mutating `graph` in place.
pub fn set_manage_references(graph: &mut DependencyGraph, mut context: ManageReferencesContext<'_>) {
    // Highest priority first; claims made by earlier rounds are visible to
    // later rounds through `managed`.
    context.seeds.sort_by(|a, b| b.priority.cmp(&a.priority));
    let mut managed: FnvHashSet<AssetIdentifier> = FnvHashSet::default();

    let mut round_start = 0;
    while round_start < context.seeds.len() {
        let priority = context.seeds[round_start].priority;
        let mut round_end = round_start;
        while round_end < context.seeds.len() && context.seeds[round_end].priority == priority {
            round_end += 1;
        }

        for seed_index in round_start..round_end {
            let seed = context.seeds[seed_index].clone();
            run_round(
                graph,
                &seed,
                &context.recurse_categories,
                context.recurse_query,
                &mut managed,
                context.predicate.as_deref_mut(),
            );
        }
        round_start = round_end;
    }
}

fn run_round(
    graph: &mut DependencyGraph,
    seed: &ManageSeed,
    recurse_categories: &[DependencyCategory],
    recurse_query: DependencyQuery,
    managed: &mut FnvHashSet<AssetIdentifier>,
    mut predicate: Option<&mut ManagePredicate<'_>>,
) {
    let manager_node = graph.create_or_find_node(&seed.manager);
    // (source, target, properties, direct)
    let mut queue: VecDeque<(AssetIdentifier, AssetIdentifier, DependencyProperties, bool)> = seed
        .targets
        .iter()
        .map(|target| {
            (
                seed.manager.clone(),
                target.clone(),
                DependencyProperties::DIRECT,
                true,
            )
        })
        .collect();
    let mut visited: FnvHashSet<AssetIdentifier> = FnvHashSet::default();

    while let Some((source, target, properties, is_direct)) = queue.pop_front() {
        if !visited.insert(target.clone()) {
            continue;
        }
        let decision = {
            let edge_context = ManageEdgeContext {
                manager: &seed.manager,
                source: &source,
                target: &target,
                properties,
                target_already_managed: managed.contains(&target),
                is_direct,
            };
            match predicate.as_deref_mut() {
                Some(predicate) => predicate(&edge_context),
                None => default_predicate(&edge_context),
            }
        };
        if decision == ManageDecision::Skip {
            continue;
        }

        let target_node = graph.create_or_find_node(&target);
        let edge_properties = if is_direct {
            DependencyProperties::DIRECT
        } else {
            DependencyProperties::empty()
        };
        graph.add_edge(manager_node, target_node, DependencyCategory::Manage, edge_properties);
        managed.insert(target.clone());

        if decision == ManageDecision::Set {
            for dependency in graph.get_dependencies(&target, recurse_categories, recurse_query) {
                queue.push_back((target.clone(), dependency.identifier, dependency.properties, false));
            }
        }
    }
}

/// Default verdict: an already-managed target is left to its current
/// manager; everything else is claimed and recursed into.
fn default_predicate(context: &ManageEdgeContext<'_>) -> ManageDecision {
    if context.target_already_managed {
        ManageDecision::Skip
    } else {
        ManageDecision::Set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> AssetIdentifier {
        AssetIdentifier::from_package(name)
    }

    fn graph_with_chain() -> DependencyGraph {
        // A -> B -> C
        let mut graph = DependencyGraph::new();
        let a = graph.create_or_find_node(&id("/Game/A"));
        let b = graph.create_or_find_node(&id("/Game/B"));
        let c = graph.create_or_find_node(&id("/Game/C"));
        graph.add_edge(a, b, DependencyCategory::Package, DependencyProperties::HARD);
        graph.add_edge(b, c, DependencyCategory::Package, DependencyProperties::HARD);
        graph
    }

    fn manager_of(graph: &DependencyGraph, target: &str) -> Vec<AssetIdentifier> {
        graph
            .get_referencers(&id(target), &[DependencyCategory::Manage], DependencyQuery::default())
            .into_iter()
            .map(|dep| dep.identifier)
            .collect()
    }

    #[test]
    fn recursion_claims_transitive_dependencies() {
        let mut graph = graph_with_chain();
        set_manage_references(
            &mut graph,
            ManageReferencesContext {
                seeds: vec![ManageSeed {
                    manager: id("/Managers/M1"),
                    priority: 10,
                    targets: vec![id("/Game/A")],
                }],
                ..ManageReferencesContext::default()
            },
        );

        assert_eq!(manager_of(&graph, "/Game/A"), vec![id("/Managers/M1")]);
        assert_eq!(manager_of(&graph, "/Game/B"), vec![id("/Managers/M1")]);
        assert_eq!(manager_of(&graph, "/Game/C"), vec![id("/Managers/M1")]);

        // Direct seeds carry the DIRECT flag; transitive claims do not.
        let direct = graph.get_dependencies(
            &id("/Managers/M1"),
            &[DependencyCategory::Manage],
            DependencyQuery::with_required(DependencyProperties::DIRECT),
        );
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].identifier, id("/Game/A"));
    }

    #[test]
    fn higher_priority_round_wins_shared_dependencies() {
        let mut graph = graph_with_chain();
        set_manage_references(
            &mut graph,
            ManageReferencesContext {
                seeds: vec![
                    ManageSeed {
                        manager: id("/Managers/M2"),
                        priority: 5,
                        targets: vec![id("/Game/B")],
                    },
                    ManageSeed {
                        manager: id("/Managers/M1"),
                        priority: 10,
                        targets: vec![id("/Game/A")],
                    },
                ],
                ..ManageReferencesContext::default()
            },
        );

        // M1's round ran first and claimed B transitively from A, so M2's
        // direct claim on B was skipped as already-managed.
        assert_eq!(manager_of(&graph, "/Game/B"), vec![id("/Managers/M1")]);
        assert_eq!(manager_of(&graph, "/Game/C"), vec![id("/Managers/M1")]);
    }

    #[test]
    fn predicate_can_stop_recursion() {
        let mut graph = graph_with_chain();
        let mut predicate = |context: &ManageEdgeContext<'_>| {
            if context.target == &id("/Game/B") {
                ManageDecision::SetButNoRecurse
            } else if context.target_already_managed {
                ManageDecision::Skip
            } else {
                ManageDecision::Set
            }
        };
        set_manage_references(
            &mut graph,
            ManageReferencesContext {
                seeds: vec![ManageSeed {
                    manager: id("/Managers/M1"),
                    priority: 0,
                    targets: vec![id("/Game/A")],
                }],
                predicate: Some(&mut predicate),
                ..ManageReferencesContext::default()
            },
        );

        assert_eq!(manager_of(&graph, "/Game/B"), vec![id("/Managers/M1")]);
        assert!(manager_of(&graph, "/Game/C").is_empty());
    }

    #[test]
    fn recurse_query_filters_followed_edges() {
        let mut graph = DependencyGraph::new();
        let a = graph.create_or_find_node(&id("/Game/A"));
        let hard = graph.create_or_find_node(&id("/Game/Hard"));
        let soft = graph.create_or_find_node(&id("/Game/Soft"));
        graph.add_edge(a, hard, DependencyCategory::Package, DependencyProperties::HARD);
        graph.add_edge(a, soft, DependencyCategory::Package, DependencyProperties::empty());

        set_manage_references(
            &mut graph,
            ManageReferencesContext {
                seeds: vec![ManageSeed {
                    manager: id("/Managers/M1"),
                    priority: 0,
                    targets: vec![id("/Game/A")],
                }],
                recurse_query: DependencyQuery::with_required(DependencyProperties::HARD),
                ..ManageReferencesContext::default()
            },
        );

        assert_eq!(manager_of(&graph, "/Game/Hard"), vec![id("/Managers/M1")]);
        assert!(manager_of(&graph, "/Game/Soft").is_empty());
    }
}
