//! Topological ordering and cycle detection.
//!
//! Recreation batches come from Kahn's algorithm over "depends on" edges:
//! batch 0 holds everything with no dependencies, batch `n` everything whose
//! dependencies all sit in earlier batches. Cleanup runs the same batches in
//! reverse so dependents always go before what they depend on.

use super::DependencyGraph;
use crate::resource::ResourceKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;

/// Graph has no valid order. `path` starts and ends on the same node.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("dependency cycle detected: {}", render_path(.path))]
pub struct CycleError {
    pub path: Vec<ResourceKey>,
}

fn render_path(path: &[ResourceKey]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Ordered cleanup and recreation batches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    /// Dependents first
    pub cleanup_batches: Vec<Vec<ResourceKey>>,
    /// Dependencies first
    pub recreation_batches: Vec<Vec<ResourceKey>>,
}

impl RecoveryPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recreation_batches.is_empty()
    }

    /// Number of resources covered by the plan.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.recreation_batches.iter().map(Vec::len).sum()
    }
}

/// Result of analyzing a graph that may contain cycles
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Analysis {
    /// Plan over everything not blocked by a cycle
    pub plan: RecoveryPlan,
    pub cycles: Vec<Vec<ResourceKey>>,
    /// Cycle members and everything that transitively depends on them
    pub blocked: BTreeSet<ResourceKey>,
}

impl Analysis {
    #[must_use]
    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search with an explicit recursion stack. Every back edge
/// yields one cycle. Stops after the first cycle when `first_only`.
fn find_cycles(graph: &DependencyGraph, first_only: bool) -> Vec<Vec<ResourceKey>> {
    let mut marks: BTreeMap<&ResourceKey, Mark> =
        graph.keys().map(|key| (key, Mark::Unvisited)).collect();
    let mut cycles = Vec::new();

    for root in graph.keys() {
        if marks.get(root) != Some(&Mark::Unvisited) {
            continue;
        }

        // (node, its dependencies, next index to visit)
        let mut stack: Vec<(&ResourceKey, Vec<&ResourceKey>, usize)> =
            vec![(root, graph.dependencies_of(root).collect(), 0)];
        marks.insert(root, Mark::OnStack);

        while let Some((node, children, next)) = stack.last_mut() {
            let Some(child) = children.get(*next).copied() else {
                marks.insert(*node, Mark::Done);
                stack.pop();
                continue;
            };
            *next += 1;

            match marks.get(child).copied().unwrap_or(Mark::Unvisited) {
                Mark::Unvisited => {
                    marks.insert(child, Mark::OnStack);
                    stack.push((child, graph.dependencies_of(child).collect(), 0));
                }
                Mark::OnStack => {
                    let start = stack
                        .iter()
                        .position(|(key, _, _)| *key == child)
                        .unwrap_or(0);
                    let mut path: Vec<ResourceKey> =
                        stack[start..].iter().map(|(key, _, _)| (*key).clone()).collect();
                    path.push(child.clone());
                    cycles.push(path);
                    if first_only {
                        return cycles;
                    }
                }
                Mark::Done => {}
            }
        }
    }
    cycles
}

/// Kahn layering over the nodes of an acyclic graph.
fn recreation_batches(graph: &DependencyGraph) -> Vec<Vec<ResourceKey>> {
    let mut remaining: BTreeMap<&ResourceKey, usize> = graph
        .keys()
        .map(|key| (key, graph.dependencies_of(key).count()))
        .collect();

    let mut ready: VecDeque<&ResourceKey> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(key, _)| *key)
        .collect();

    let mut batches = Vec::new();
    while !ready.is_empty() {
        let batch: BTreeSet<&ResourceKey> = ready.drain(..).collect();
        let mut next = BTreeSet::new();
        for key in &batch {
            remaining.remove(*key);
            for dependent in graph.dependents_of(key) {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        next.insert(dependent);
                    }
                }
            }
        }
        batches.push(batch.into_iter().cloned().collect());
        ready.extend(next);
    }
    batches
}

fn plan_for(graph: &DependencyGraph) -> RecoveryPlan {
    let recreation_batches = recreation_batches(graph);
    let mut cleanup_batches = recreation_batches.clone();
    cleanup_batches.reverse();
    RecoveryPlan {
        cleanup_batches,
        recreation_batches,
    }
}

/// Order the whole graph, failing on the first cycle.
pub fn order(graph: &DependencyGraph) -> Result<RecoveryPlan, CycleError> {
    if let Some(path) = find_cycles(graph, true).into_iter().next() {
        return Err(CycleError { path });
    }
    Ok(plan_for(graph))
}

/// Order what can be ordered and report what cannot.
#[must_use]
pub fn analyze(graph: &DependencyGraph) -> Analysis {
    let cycles = find_cycles(graph, false);

    let mut blocked: BTreeSet<ResourceKey> = cycles.iter().flatten().cloned().collect();
    let mut queue: VecDeque<ResourceKey> = blocked.iter().cloned().collect();
    while let Some(key) = queue.pop_front() {
        for dependent in graph.dependents_of(&key) {
            if blocked.insert(dependent.clone()) {
                queue.push_back(dependent.clone());
            }
        }
    }

    let free: BTreeSet<ResourceKey> = graph
        .keys()
        .filter(|key| !blocked.contains(*key))
        .cloned()
        .collect();
    let plan = plan_for(&graph.subgraph(&free));

    Analysis {
        plan,
        cycles,
        blocked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeKind;

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("Kustomization", "flux-system", name)
    }

    fn graph(pairs: &[(&str, &str)]) -> DependencyGraph {
        let pairs: Vec<_> = pairs.iter().map(|(a, b)| (key(a), key(b))).collect();
        DependencyGraph::from_pairs(&pairs, EdgeKind::Orchestration)
    }

    fn position(batches: &[Vec<ResourceKey>], k: &ResourceKey) -> usize {
        batches.iter().position(|b| b.contains(k)).unwrap()
    }

    #[test]
    fn chain_orders_both_ways() {
        let plan = graph(&[("a", "b"), ("b", "c")]).order().unwrap();
        assert_eq!(
            plan.cleanup_batches,
            vec![vec![key("a")], vec![key("b")], vec![key("c")]]
        );
        assert_eq!(
            plan.recreation_batches,
            vec![vec![key("c")], vec![key("b")], vec![key("a")]]
        );
    }

    #[test]
    fn two_cycle_reports_path() {
        let err = graph(&[("x", "y"), ("y", "x")]).order().unwrap_err();
        assert_eq!(err.path, vec![key("x"), key("y"), key("x")]);
        assert!(err.to_string().contains("Kustomization/flux-system/x -> "));
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let err = graph(&[("x", "x")]).order().unwrap_err();
        assert_eq!(err.path, vec![key("x"), key("x")]);
    }

    #[test]
    fn independent_nodes_share_a_batch() {
        let plan = graph(&[("app", "db"), ("app", "cache"), ("web", "db")]).order().unwrap();
        assert_eq!(plan.recreation_batches[0], vec![key("cache"), key("db")]);
        assert_eq!(plan.recreation_batches[1], vec![key("app"), key("web")]);
        assert_eq!(plan.resource_count(), 4);
    }

    #[test]
    fn every_edge_respects_batch_order() {
        let pairs = [
            ("ingress", "cert"),
            ("apps", "ingress"),
            ("apps", "storage"),
            ("monitoring", "apps"),
            ("monitoring", "storage"),
            ("storage", "crds"),
            ("cert", "crds"),
        ];
        let g = graph(&pairs);
        let plan = g.order().unwrap();
        assert_eq!(plan.resource_count(), g.len());

        for edge in g.edges() {
            assert!(
                position(&plan.recreation_batches, &edge.to)
                    < position(&plan.recreation_batches, &edge.from)
            );
            assert!(
                position(&plan.cleanup_batches, &edge.from)
                    < position(&plan.cleanup_batches, &edge.to)
            );
        }
    }

    #[test]
    fn analyze_isolates_cycles() {
        let g = graph(&[
            ("x", "y"),
            ("y", "x"),
            ("dependent", "x"),
            ("free", "base"),
        ]);
        let analysis = g.analyze();

        assert!(analysis.has_cycles());
        assert_eq!(analysis.cycles, vec![vec![key("x"), key("y"), key("x")]]);
        assert_eq!(
            analysis.blocked,
            BTreeSet::from([key("dependent"), key("x"), key("y")])
        );
        assert_eq!(
            analysis.plan.recreation_batches,
            vec![vec![key("base")], vec![key("free")]]
        );
    }

    #[test]
    fn analyze_acyclic_matches_order() {
        let g = graph(&[("a", "b"), ("b", "c")]);
        let analysis = g.analyze();
        assert!(!analysis.has_cycles());
        assert!(analysis.blocked.is_empty());
        assert_eq!(analysis.plan, g.order().unwrap());
    }
}
