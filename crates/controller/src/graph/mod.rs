//! # Dependency Graph
//!
//! Immutable snapshot of how cluster resources depend on each other. An edge
//! `from → to` always reads "`from` depends on `to`":
//!
//! - **ownership**: an owned object depends on its owner
//! - **data**: a workload depends on the ConfigMaps, Secrets, PVCs and
//!   Services it references
//! - **orchestration**: a Flux object depends on its `dependsOn` entries and
//!   its source
//!
//! Graphs are built by [`GraphBuilder`] and never mutated afterwards; each
//! recovery or analysis builds a fresh one.

pub mod builder;
pub mod extract;
pub mod impact;
pub mod order;

use crate::resource::ResourceKey;
use kube::api::DynamicObject;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

pub use builder::GraphBuilder;
pub use impact::{ImpactReport, SinglePointOfFailure};
pub use order::{Analysis, CycleError, RecoveryPlan};

/// Why one resource depends on another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Ownership,
    Data,
    Orchestration,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EdgeKind::Ownership => "ownership",
            EdgeKind::Data => "data",
            EdgeKind::Orchestration => "orchestration",
        })
    }
}

/// `from` depends on `to`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DependencyEdge {
    pub from: ResourceKey,
    pub to: ResourceKey,
    pub kind: EdgeKind,
}

impl DependencyEdge {
    #[must_use]
    pub fn new(from: ResourceKey, to: ResourceKey, kind: EdgeKind) -> Self {
        Self { from, to, kind }
    }
}

/// A resource in the graph. Resources only known from references carry no
/// snapshot.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    pub key: ResourceKey,
    pub snapshot: Option<DynamicObject>,
}

impl ResourceNode {
    #[must_use]
    pub fn observed(key: ResourceKey, snapshot: DynamicObject) -> Self {
        Self {
            key,
            snapshot: Some(snapshot),
        }
    }

    #[must_use]
    pub fn referenced(key: ResourceKey) -> Self {
        Self {
            key,
            snapshot: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<ResourceKey, ResourceNode>,
    edges: BTreeSet<DependencyEdge>,
    /// key → what it depends on
    dependencies: BTreeMap<ResourceKey, BTreeSet<ResourceKey>>,
    /// key → what depends on it
    dependents: BTreeMap<ResourceKey, BTreeSet<ResourceKey>>,
}

impl DependencyGraph {
    /// Assemble a graph. Edge endpoints missing from `nodes` are added as
    /// referenced-only nodes.
    #[must_use]
    pub fn new(
        nodes: impl IntoIterator<Item = ResourceNode>,
        edges: impl IntoIterator<Item = DependencyEdge>,
    ) -> Self {
        let mut graph = Self::default();
        for node in nodes {
            graph.dependencies.entry(node.key.clone()).or_default();
            graph.dependents.entry(node.key.clone()).or_default();
            graph.nodes.insert(node.key.clone(), node);
        }
        for edge in edges {
            for key in [&edge.from, &edge.to] {
                if !graph.nodes.contains_key(key) {
                    graph
                        .nodes
                        .insert(key.clone(), ResourceNode::referenced(key.clone()));
                }
            }
            graph
                .dependencies
                .entry(edge.from.clone())
                .or_default()
                .insert(edge.to.clone());
            graph
                .dependents
                .entry(edge.to.clone())
                .or_default()
                .insert(edge.from.clone());
            graph.dependencies.entry(edge.to.clone()).or_default();
            graph.dependents.entry(edge.from.clone()).or_default();
            graph.edges.insert(edge);
        }
        graph
    }

    /// Graph from `(from, to)` pairs sharing one edge kind.
    #[must_use]
    pub fn from_pairs(pairs: &[(ResourceKey, ResourceKey)], kind: EdgeKind) -> Self {
        Self::new(
            std::iter::empty(),
            pairs
                .iter()
                .map(|(from, to)| DependencyEdge::new(from.clone(), to.clone(), kind)),
        )
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.nodes.contains_key(key)
    }

    #[must_use]
    pub fn node(&self, key: &ResourceKey) -> Option<&ResourceNode> {
        self.nodes.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.nodes.keys()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &DependencyEdge> {
        self.edges.iter()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// What `key` depends on.
    pub fn dependencies_of<'a>(&'a self, key: &ResourceKey) -> impl Iterator<Item = &'a ResourceKey> {
        self.dependencies.get(key).into_iter().flatten()
    }

    /// What depends on `key`.
    pub fn dependents_of<'a>(&'a self, key: &ResourceKey) -> impl Iterator<Item = &'a ResourceKey> {
        self.dependents.get(key).into_iter().flatten()
    }

    /// Edges pointing at `key`, with their kinds.
    pub fn incoming<'a>(&'a self, key: &'a ResourceKey) -> impl Iterator<Item = &'a DependencyEdge> {
        self.edges.iter().filter(move |edge| &edge.to == key)
    }

    /// Transitive dependents of `key` through ownership edges only.
    #[must_use]
    pub fn owned_closure(&self, key: &ResourceKey) -> BTreeSet<ResourceKey> {
        let mut owned = BTreeSet::new();
        let mut queue = VecDeque::from([key.clone()]);
        while let Some(current) = queue.pop_front() {
            for edge in self.incoming(&current) {
                if edge.kind == EdgeKind::Ownership && edge.from != *key && owned.insert(edge.from.clone()) {
                    queue.push_back(edge.from.clone());
                }
            }
        }
        owned
    }

    /// Induced subgraph over `keys`.
    #[must_use]
    pub fn subgraph(&self, keys: &BTreeSet<ResourceKey>) -> Self {
        Self::new(
            keys.iter()
                .filter_map(|key| self.nodes.get(key).cloned()),
            self.edges
                .iter()
                .filter(|edge| keys.contains(&edge.from) && keys.contains(&edge.to))
                .cloned(),
        )
    }

    /// Cleanup/recreation plan, or the first cycle found.
    pub fn order(&self) -> Result<RecoveryPlan, CycleError> {
        order::order(self)
    }

    /// Partial plan plus every cycle and the nodes blocked behind them.
    #[must_use]
    pub fn analyze(&self) -> Analysis {
        order::analyze(self)
    }

    /// Direct and cascading impact of `key` failing, up to `max_depth` hops.
    #[must_use]
    pub fn impact(&self, key: &ResourceKey, max_depth: usize) -> ImpactReport {
        impact::impact(self, key, max_depth)
    }

    /// Nodes with at least `threshold` transitive dependents, most depended-on first.
    #[must_use]
    pub fn single_points_of_failure(&self, threshold: usize) -> Vec<SinglePointOfFailure> {
        impact::single_points_of_failure(self, threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("Deployment", "apps", name)
    }

    #[test]
    fn referenced_endpoints_become_nodes() {
        let graph = DependencyGraph::from_pairs(&[(key("a"), key("b"))], EdgeKind::Data);
        assert_eq!(graph.len(), 2);
        assert!(graph.node(&key("b")).unwrap().snapshot.is_none());
        assert_eq!(graph.dependencies_of(&key("a")).collect::<Vec<_>>(), vec![&key("b")]);
        assert_eq!(graph.dependents_of(&key("b")).collect::<Vec<_>>(), vec![&key("a")]);
        assert_eq!(graph.dependents_of(&key("a")).count(), 0);
    }

    #[test]
    fn owned_closure_follows_only_ownership() {
        let deploy = key("web");
        let rs = ResourceKey::new("ReplicaSet", "apps", "web-1");
        let pod = ResourceKey::new("Pod", "apps", "web-1-x");
        let consumer = key("reader");
        let graph = DependencyGraph::new(
            std::iter::empty(),
            [
                DependencyEdge::new(rs.clone(), deploy.clone(), EdgeKind::Ownership),
                DependencyEdge::new(pod.clone(), rs.clone(), EdgeKind::Ownership),
                DependencyEdge::new(consumer, deploy.clone(), EdgeKind::Data),
            ],
        );

        let owned = graph.owned_closure(&deploy);
        assert_eq!(owned, BTreeSet::from([rs, pod]));
    }

    #[test]
    fn subgraph_keeps_internal_edges() {
        let graph = DependencyGraph::from_pairs(
            &[(key("a"), key("b")), (key("b"), key("c"))],
            EdgeKind::Orchestration,
        );
        let sub = graph.subgraph(&BTreeSet::from([key("a"), key("b")]));
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.edge_count(), 1);
    }
}
