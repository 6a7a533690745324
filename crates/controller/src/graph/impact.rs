//! Impact analysis over dependents. Reporting only; never drives recovery.

use super::DependencyGraph;
use crate::resource::ResourceKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImpactReport {
    pub target: ResourceKey,
    /// Immediate dependents
    pub direct: BTreeSet<ResourceKey>,
    /// Every dependent reachable within `max_depth` hops, direct ones included
    pub cascading: BTreeSet<ResourceKey>,
    /// Hop distance of each cascading dependent
    pub depth: BTreeMap<ResourceKey, usize>,
    pub max_depth: usize,
    /// Dependents exist beyond `max_depth`
    pub truncated: bool,
}

/// Dependents of `target`. Immediate dependents are always reported; `max_depth`
/// caps the cascade beyond them.
pub fn impact(graph: &DependencyGraph, target: &ResourceKey, max_depth: usize) -> ImpactReport {
    let max_depth = max_depth.max(1);
    let mut depth: BTreeMap<ResourceKey, usize> = BTreeMap::new();
    let mut truncated = false;
    let mut queue = VecDeque::from([(target.clone(), 0_usize)]);

    while let Some((key, hops)) = queue.pop_front() {
        for dependent in graph.dependents_of(&key) {
            if dependent == target || depth.contains_key(dependent) {
                continue;
            }
            if hops + 1 > max_depth {
                truncated = true;
                continue;
            }
            depth.insert(dependent.clone(), hops + 1);
            queue.push_back((dependent.clone(), hops + 1));
        }
    }

    let direct = depth
        .iter()
        .filter(|(_, hops)| **hops == 1)
        .map(|(key, _)| key.clone())
        .collect();
    let cascading = depth.keys().cloned().collect();

    ImpactReport {
        target: target.clone(),
        direct,
        cascading,
        depth,
        max_depth,
        truncated,
    }
}

/// A heavily depended-on resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinglePointOfFailure {
    pub key: ResourceKey,
    pub dependents: usize,
}

pub fn single_points_of_failure(graph: &DependencyGraph, threshold: usize) -> Vec<SinglePointOfFailure> {
    let mut ranked: Vec<SinglePointOfFailure> = graph
        .keys()
        .map(|key| SinglePointOfFailure {
            key: key.clone(),
            dependents: impact(graph, key, usize::MAX).cascading.len(),
        })
        .filter(|spof| spof.dependents > 0 && spof.dependents >= threshold)
        .collect();
    ranked.sort_by(|a, b| b.dependents.cmp(&a.dependents).then_with(|| a.key.cmp(&b.key)));
    ranked
}
