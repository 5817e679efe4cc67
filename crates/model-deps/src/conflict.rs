//! Version conflict resolution.
//!
//! Runs in three steps over a discovered [`DependencyGraph`]:
//!
//! 1. manifest overrides force a ref on the packages they name;
//! 2. package-level cycles are rejected before any version reasoning;
//! 3. every remaining node's requested refs are reduced to one.
//!
//! Step 3 only picks automatically when every request is a strict version
//! tag with the same major version; the highest one wins. Everything else
//! with more than one distinct ref is a hard error that names the
//! dependents and suggests an override.

use crate::graph::{DependencyGraph, GraphNode};
use crate::specifier::{detect_ref_type, RefType};
use crate::version::{self, ParsedVersion};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

/// One requested ref and the packages requesting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintRequest {
    pub git_ref: String,
    pub dependents: Vec<String>,
}

impl fmt::Display for ConstraintRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (from {})", self.git_ref, self.dependents.join(", "))
    }
}

/// Why a set of refs could not be reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    DifferentBranches,
    DifferentCommits,
    MixedRefTypes,
    DifferentMajorVersions,
    UnparseableTag,
    /// Same-major tags while automatic upgrades are disabled.
    StrictVersions,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DifferentBranches => "different branches requested; the intended branch is ambiguous",
            Self::DifferentCommits => "different commits pinned; explicit pins must match exactly",
            Self::MixedRefTypes => "tags, branches and commits are mixed; these intents are incompatible",
            Self::DifferentMajorVersions => "different major versions requested; upgrading risks breaking changes",
            Self::UnparseableTag => "a requested tag is not a strict version and cannot be compared",
            Self::StrictVersions => "strict version mode forbids picking the latest automatically",
        })
    }
}

/// Errors from conflict resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictError {
    #[error("version conflict for '{package}': {reason}\n  {}", format_requests(.requests))]
    VersionConflict {
        package: String,
        reason: ConflictReason,
        requests: Vec<ConstraintRequest>,
        hint: String,
    },

    #[error("cyclic dependency: {}", .cycle.join(" → "))]
    CyclicDependency { cycle: Vec<String> },
}

fn format_requests(requests: &[ConstraintRequest]) -> String {
    requests
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n  ")
}

impl ConflictError {
    /// Suggested fix, if the error has one.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::VersionConflict { hint, .. } => Some(hint.clone()),
            Self::CyclicDependency { cycle } => Some(format!(
                "remove one of the dependencies in the cycle starting at '{}'",
                cycle.first().map_or("", String::as_str)
            )),
        }
    }
}

/// An override that replaced the computed constraints of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedOverride {
    pub package: String,
    pub git_ref: String,
    /// Refs the override replaced.
    pub replaced: Vec<String>,
}

/// A same-major tag conflict resolved by taking the latest version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoResolution {
    pub package: String,
    pub chosen: String,
    pub requests: Vec<ConstraintRequest>,
}

/// Everything the resolver decided on its own or because of overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionReport {
    pub overrides: Vec<AppliedOverride>,
    pub auto_resolved: Vec<AutoResolution>,
    /// Override keys naming packages that are not in the graph.
    pub unused_overrides: Vec<String>,
}

impl ResolutionReport {
    /// Returns true if nothing noteworthy happened.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty() && self.auto_resolved.is_empty() && self.unused_overrides.is_empty()
    }
}

/// Reconciles requested refs into one ref per package.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    strict_versions: bool,
}

impl ConflictResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to pick the latest of same-major tags.
    #[must_use]
    pub fn with_strict_versions(mut self, strict: bool) -> Self {
        self.strict_versions = strict;
        self
    }

    /// Choose a ref for every node, setting `resolved_ref` and `ref_type`.
    ///
    /// # Errors
    ///
    /// Returns [`ConflictError::CyclicDependency`] for any cycle and
    /// [`ConflictError::VersionConflict`] for the first node whose refs
    /// cannot be reconciled. The graph must be discarded on error.
    pub fn resolve(
        &self,
        graph: &mut DependencyGraph,
        overrides: &BTreeMap<String, String>,
    ) -> Result<ResolutionReport, ConflictError> {
        let mut report = ResolutionReport::default();

        for (package, git_ref) in overrides {
            let Some(node) = graph.nodes.get_mut(package) else {
                warn!(package = %package, "Override names a package that is not a dependency; ignoring it");
                report.unused_overrides.push(package.clone());
                continue;
            };
            let replaced: Vec<String> = node.constraints.keys().cloned().collect();
            info!(package = %package, git_ref = %git_ref, replaced = ?replaced, "Applying override");
            node.resolved_ref = Some(git_ref.clone());
            node.ref_type = Some(detect_ref_type(git_ref));
            report.overrides.push(AppliedOverride {
                package: package.clone(),
                git_ref: git_ref.clone(),
                replaced,
            });
        }

        if let Some(cycle) = find_cycle(graph) {
            return Err(ConflictError::CyclicDependency { cycle });
        }

        for node in graph.nodes.values_mut() {
            if node.resolved_ref.is_some() {
                continue;
            }
            let chosen = match self.reconcile(node)? {
                Chosen::Only(git_ref) => git_ref,
                Chosen::Latest(git_ref) => {
                    let requests = requests_of(node);
                    info!(
                        package = %node.package_key,
                        chosen = %git_ref,
                        requested = ?node.constraints.keys().collect::<Vec<_>>(),
                        "Resolved version conflict by picking the latest"
                    );
                    report.auto_resolved.push(AutoResolution {
                        package: node.package_key.clone(),
                        chosen: git_ref.clone(),
                        requests,
                    });
                    git_ref
                }
            };
            node.ref_type = Some(detect_ref_type(&chosen));
            node.resolved_ref = Some(chosen);
        }

        Ok(report)
    }

    fn reconcile(&self, node: &GraphNode) -> Result<Chosen, ConflictError> {
        let refs: Vec<&String> = node.constraints.keys().collect();
        match refs.as_slice() {
            [] => return Ok(Chosen::Only(node.ref_constraint.clone())),
            [only] => return Ok(Chosen::Only((*only).clone())),
            _ => {}
        }

        let types: BTreeSet<RefType> = refs.iter().map(|r| detect_ref_type(r)).collect();
        let conflict = |reason| Err(version_conflict(node, reason));
        if types.len() > 1 {
            return conflict(ConflictReason::MixedRefTypes);
        }

        match types.into_iter().next() {
            Some(RefType::Branch) => conflict(ConflictReason::DifferentBranches),
            Some(RefType::Commit) => conflict(ConflictReason::DifferentCommits),
            Some(RefType::Tag) | None => {
                let Some(parsed) = refs
                    .iter()
                    .map(|r| ParsedVersion::parse(r))
                    .collect::<Option<Vec<_>>>()
                else {
                    return conflict(ConflictReason::UnparseableTag);
                };
                let majors: BTreeSet<u64> = parsed.iter().map(|v| v.major).collect();
                if majors.len() > 1 {
                    return conflict(ConflictReason::DifferentMajorVersions);
                }
                if self.strict_versions {
                    return conflict(ConflictReason::StrictVersions);
                }
                match version::pick_latest(&refs) {
                    Some(latest) => Ok(Chosen::Latest(latest)),
                    None => conflict(ConflictReason::UnparseableTag),
                }
            }
        }
    }
}

enum Chosen {
    Only(String),
    Latest(String),
}

fn requests_of(node: &GraphNode) -> Vec<ConstraintRequest> {
    node.constraints
        .iter()
        .map(|(git_ref, dependents)| ConstraintRequest {
            git_ref: git_ref.clone(),
            dependents: dependents.clone(),
        })
        .collect()
}

fn version_conflict(node: &GraphNode, reason: ConflictReason) -> ConflictError {
    let requests = requests_of(node);
    let refs: Vec<&String> = node.constraints.keys().collect();
    let suggested = version::pick_latest(&refs).unwrap_or_else(|| node.ref_constraint.clone());
    let hint = format!(
        "choose one ref for all dependents by adding an override to model.toml:\n\n[overrides]\n\"{}\" = \"{}\"",
        node.package_key, suggested
    );
    ConflictError::VersionConflict {
        package: node.package_key.clone(),
        reason,
        requests,
        hint,
    }
}

/// Find a cycle over package dependency edges.
///
/// Returns the path with the first package repeated at the end, e.g.
/// `[a, b, c, a]`. Nodes are visited in key order so the result is stable.
#[must_use]
pub fn find_cycle(graph: &DependencyGraph) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();

    for start in graph.nodes.keys() {
        if marks.contains_key(start.as_str()) {
            continue;
        }

        let mut path: Vec<&str> = Vec::new();
        let mut stack: Vec<(&str, std::collections::btree_set::Iter<'_, String>)> = Vec::new();
        marks.insert(start.as_str(), Mark::Visiting);
        path.push(start.as_str());
        stack.push((start.as_str(), graph.nodes[start].dependencies.iter()));

        while let Some((current, edges)) = stack.last_mut() {
            let Some(next) = edges.next() else {
                marks.insert(*current, Mark::Done);
                path.pop();
                stack.pop();
                continue;
            };
            let Some(next_node) = graph.nodes.get(next) else {
                continue;
            };
            match marks.get(next.as_str()) {
                Some(Mark::Done) => {}
                Some(Mark::Visiting) => {
                    let from = path.iter().position(|p| *p == next.as_str()).unwrap_or(0);
                    let mut cycle: Vec<String> = path[from..].iter().map(|p| (*p).to_string()).collect();
                    cycle.push(next.clone());
                    return Some(cycle);
                }
                None => {
                    marks.insert(next.as_str(), Mark::Visiting);
                    path.push(next.as_str());
                    stack.push((next.as_str(), next_node.dependencies.iter()));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specifier::DependencyIdentifier;

    fn node(key: &str, requests: &[(&str, &str)], deps: &[&str]) -> GraphNode {
        let id = DependencyIdentifier::parse(key).unwrap();
        let mut constraints: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut dependents = Vec::new();
        for (git_ref, from) in requests {
            constraints
                .entry((*git_ref).to_string())
                .or_default()
                .push((*from).to_string());
            dependents.push((*from).to_string());
        }
        GraphNode {
            package_key: key.to_string(),
            ref_constraint: requests[0].0.to_string(),
            repo_url: id.repo_url(),
            identifier: id,
            constraints,
            dependents,
            dependencies: deps.iter().map(|d| (*d).to_string()).collect(),
            resolved_ref: None,
            ref_type: None,
            commit: None,
            integrity: None,
            fetched: None,
        }
    }

    fn graph(nodes: Vec<GraphNode>) -> DependencyGraph {
        DependencyGraph {
            root: "app".to_string(),
            direct: BTreeSet::new(),
            nodes: nodes.into_iter().map(|n| (n.package_key.clone(), n)).collect(),
        }
    }

    fn resolve(g: &mut DependencyGraph) -> Result<ResolutionReport, ConflictError> {
        ConflictResolver::new().resolve(g, &BTreeMap::new())
    }

    fn reason_of(err: ConflictError) -> ConflictReason {
        match err {
            ConflictError::VersionConflict { reason, .. } => reason,
            other => panic!("expected version conflict, got {other}"),
        }
    }

    #[test]
    fn identical_refs_do_not_conflict() {
        let mut g = graph(vec![node("acme/s", &[("main", "acme/a"), ("main", "acme/b")], &[])]);
        let report = resolve(&mut g).unwrap();
        assert!(report.is_empty());
        assert_eq!(g.nodes["acme/s"].resolved_ref.as_deref(), Some("main"));
        assert_eq!(g.nodes["acme/s"].ref_type, Some(RefType::Branch));
    }

    #[test]
    fn same_major_tags_pick_latest() {
        let mut g = graph(vec![node(
            "acme/s",
            &[("v1.2.0", "acme/a"), ("v1.5.0", "acme/b")],
            &[],
        )]);
        let report = resolve(&mut g).unwrap();
        assert_eq!(g.nodes["acme/s"].resolved_ref.as_deref(), Some("v1.5.0"));
        assert_eq!(report.auto_resolved.len(), 1);
        assert_eq!(report.auto_resolved[0].chosen, "v1.5.0");
        assert_eq!(report.auto_resolved[0].requests.len(), 2);
    }

    #[test]
    fn different_majors_name_both_dependents() {
        let mut g = graph(vec![node(
            "acme/s",
            &[("v1.0.0", "acme/a"), ("v2.0.0", "acme/b")],
            &[],
        )]);
        let err = resolve(&mut g).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("acme/a"), "{message}");
        assert!(message.contains("acme/b"), "{message}");
        assert!(message.contains("v1.0.0") && message.contains("v2.0.0"));
        let hint = err.hint().unwrap();
        assert!(hint.contains("[overrides]\n\"acme/s\" = \"v2.0.0\""), "{hint}");
        assert_eq!(reason_of(err), ConflictReason::DifferentMajorVersions);
        assert!(g.nodes["acme/s"].resolved_ref.is_none());
    }

    #[test]
    fn policy_table() {
        let cases = [
            (("main", "develop"), ConflictReason::DifferentBranches),
            (("abc1234", "def5678"), ConflictReason::DifferentCommits),
            (("v1.0.0", "main"), ConflictReason::MixedRefTypes),
            (("v1.0.0", "v1.2.3.4"), ConflictReason::UnparseableTag),
            (("1.0.0+build", "v1.0.0"), ConflictReason::UnparseableTag),
        ];
        for ((left, right), expected) in cases {
            let mut g = graph(vec![node("acme/s", &[(left, "acme/a"), (right, "acme/b")], &[])]);
            let err = resolve(&mut g).unwrap_err();
            assert_eq!(reason_of(err), expected, "{left} vs {right}");
        }
    }

    #[test]
    fn strict_versions_refuse_latest_wins() {
        let mut g = graph(vec![node(
            "acme/s",
            &[("v1.2.0", "acme/a"), ("v1.5.0", "acme/b")],
            &[],
        )]);
        let err = ConflictResolver::new()
            .with_strict_versions(true)
            .resolve(&mut g, &BTreeMap::new())
            .unwrap_err();
        assert_eq!(reason_of(err), ConflictReason::StrictVersions);
    }

    #[test]
    fn override_forces_ref() {
        let mut g = graph(vec![node(
            "acme/s",
            &[("v1.0.0", "acme/a"), ("v2.0.0", "acme/b")],
            &[],
        )]);
        let overrides = BTreeMap::from([
            ("acme/s".to_string(), "v2.1.0".to_string()),
            ("acme/missing".to_string(), "main".to_string()),
        ]);
        let report = ConflictResolver::new().resolve(&mut g, &overrides).unwrap();
        assert_eq!(g.nodes["acme/s"].resolved_ref.as_deref(), Some("v2.1.0"));
        assert_eq!(g.nodes["acme/s"].ref_type, Some(RefType::Tag));
        assert_eq!(report.overrides[0].replaced, vec!["v1.0.0", "v2.0.0"]);
        assert_eq!(report.unused_overrides, vec!["acme/missing"]);
    }

    #[test]
    fn cycle_is_reported_with_full_path() {
        let mut g = graph(vec![
            node("acme/a", &[("v1.0.0", "app"), ("v1.0.0", "acme/c")], &["acme/b"]),
            node("acme/b", &[("v1.0.0", "acme/a")], &["acme/c"]),
            node("acme/c", &[("v1.0.0", "acme/b")], &["acme/a"]),
        ]);
        let err = resolve(&mut g).unwrap_err();
        assert_eq!(
            err,
            ConflictError::CyclicDependency {
                cycle: vec![
                    "acme/a".to_string(),
                    "acme/b".to_string(),
                    "acme/c".to_string(),
                    "acme/a".to_string()
                ]
            }
        );
        assert!(err.to_string().contains("acme/a → acme/b → acme/c → acme/a"));
    }

    #[test]
    fn cycle_detection_runs_before_version_checks() {
        let mut g = graph(vec![
            node("acme/a", &[("v1.0.0", "app"), ("v2.0.0", "acme/b")], &["acme/b"]),
            node("acme/b", &[("v1.0.0", "acme/a")], &["acme/a"]),
        ]);
        assert!(matches!(
            resolve(&mut g),
            Err(ConflictError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let g = graph(vec![
            node("acme/a", &[("v1.0.0", "app")], &["acme/b", "acme/c"]),
            node("acme/b", &[("v1.0.0", "acme/a")], &["acme/d"]),
            node("acme/c", &[("v1.0.0", "acme/a")], &["acme/d"]),
            node("acme/d", &[("v1.0.0", "acme/b"), ("v1.0.0", "acme/c")], &[]),
        ]);
        assert_eq!(find_cycle(&g), None);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let g = graph(vec![node("acme/a", &[("v1.0.0", "app")], &["acme/a"])]);
        assert_eq!(
            find_cycle(&g),
            Some(vec!["acme/a".to_string(), "acme/a".to_string()])
        );
    }
}
