//! Cheapest chain of packages between two versions.
//!
//! Versions are nodes, packages are directed edges weighted by archive size.
//! Dijkstra minimises total bytes downloaded, not the number of steps.

use crate::error::{Result, UpdaterError};
use crate::manifest::{MasterManifest, Package};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::debug;

/// A package together with the version it leads to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedStep {
    pub to_version: String,
    pub package: Package,
}

/// Packages to download and apply, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPath {
    pub from_version: String,
    pub steps: Vec<ResolvedStep>,
}

impl ResolvedPath {
    /// Bytes to download for the whole chain.
    pub fn total_size(&self) -> u64 {
        self.steps.iter().map(|step| step.package.size).sum()
    }

    /// Version the chain ends at; the starting version for an empty chain.
    pub fn target_version(&self) -> &str {
        self.steps
            .last()
            .map(|step| step.to_version.as_str())
            .unwrap_or(&self.from_version)
    }

    /// True when nothing needs to be applied.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of packages in the chain.
    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

/// Resolve the minimum-download chain from `current` to `target`.
///
/// Returns an empty path when `current == target`. Among equal-cost chains
/// the first one relaxed wins.
pub fn resolve(manifest: &MasterManifest, current: &str, target: &str) -> Result<ResolvedPath> {
    let no_path = || UpdaterError::NoPath {
        from: current.to_string(),
        to: target.to_string(),
    };
    if !manifest.versions.contains_key(current) || !manifest.versions.contains_key(target) {
        return Err(no_path());
    }
    if current == target {
        return Ok(ResolvedPath {
            from_version: current.to_string(),
            steps: Vec::new(),
        });
    }

    let mut edges: HashMap<&str, Vec<(&str, &Package)>> = HashMap::new();
    for (to_version, packages) in &manifest.packages {
        for package in packages {
            edges
                .entry(package.from_version.as_str())
                .or_default()
                .push((to_version.as_str(), package));
        }
    }

    let mut distance: HashMap<&str, u64> = HashMap::new();
    let mut previous: HashMap<&str, (&str, &Package)> = HashMap::new();
    let mut queue = BinaryHeap::new();
    distance.insert(current, 0);
    queue.push(Reverse((0u64, current)));

    while let Some(Reverse((dist, node))) = queue.pop() {
        if distance.get(node).is_some_and(|&best| dist > best) {
            continue;
        }
        if node == target {
            break;
        }
        let Some(out) = edges.get(node) else { continue };
        for &(next, package) in out {
            let candidate = dist.saturating_add(package.size);
            let improved = distance.get(next).map_or(true, |&best| candidate < best);
            if improved {
                distance.insert(next, candidate);
                previous.insert(next, (node, package));
                queue.push(Reverse((candidate, next)));
            }
        }
    }

    let mut steps = Vec::new();
    let mut cursor = target;
    while cursor != current {
        let &(prev, package) = previous.get(cursor).ok_or_else(no_path)?;
        steps.push(ResolvedStep {
            to_version: cursor.to_string(),
            package: package.clone(),
        });
        cursor = prev;
    }
    steps.reverse();

    let path = ResolvedPath {
        from_version: current.to_string(),
        steps,
    };
    debug!(
        target: "updater",
        from = current,
        to = target,
        steps = path.len(),
        bytes = path.total_size(),
        "resolved update path"
    );
    Ok(path)
}
