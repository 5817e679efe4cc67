//! Dependency graph discovery.
//!
//! The graph is built breadth-first from the workspace's direct git
//! dependencies. Each package appears exactly once, keyed by `owner/repo`,
//! no matter how many dependents request it; every request adds its ref to
//! the node's constraint set for [`crate::conflict`] to reconcile.

use crate::cache::{CacheError, RepositoryCache};
use crate::lockfile::LockFile;
use crate::manifest::{ManifestError, ModelManifest};
use crate::specifier::{DependencyIdentifier, RefType};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors from graph discovery.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("dependency resolution was cancelled")]
    Cancelled,

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("invalid manifest in '{package}': {source}")]
    Manifest {
        package: String,
        #[source]
        source: ManifestError,
    },
}

/// Shared flag that stops a resolution before its next fetch.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Create a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The commit a node's manifest was read from during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedCommit {
    pub git_ref: String,
    pub ref_type: RefType,
    pub commit: String,
}

/// A package in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    /// `owner/repo`.
    pub package_key: String,
    /// Repository identity as first requested, without a subpath.
    pub identifier: DependencyIdentifier,
    /// Ref of the first request.
    pub ref_constraint: String,
    /// Every distinct ref requested, mapped to the packages requesting it.
    pub constraints: BTreeMap<String, Vec<String>>,
    /// Packages depending on this one, in discovery order.
    pub dependents: Vec<String>,
    /// Package keys this package depends on.
    pub dependencies: BTreeSet<String>,
    /// HTTPS clone URL.
    pub repo_url: String,
    pub resolved_ref: Option<String>,
    pub ref_type: Option<RefType>,
    pub commit: Option<String>,
    pub integrity: Option<String>,
    /// Set while discovering; lets commit resolution skip a second lookup.
    pub fetched: Option<FetchedCommit>,
}

impl GraphNode {
    fn new(identifier: &DependencyIdentifier, dependent: &str) -> Self {
        let identifier = identifier.without_subpath();
        let mut constraints = BTreeMap::new();
        constraints.insert(identifier.git_ref.clone(), vec![dependent.to_string()]);
        Self {
            package_key: identifier.package_key(),
            ref_constraint: identifier.git_ref.clone(),
            repo_url: identifier.repo_url(),
            identifier,
            constraints,
            dependents: vec![dependent.to_string()],
            dependencies: BTreeSet::new(),
            resolved_ref: None,
            ref_type: None,
            commit: None,
            integrity: None,
            fetched: None,
        }
    }

    fn add_constraint(&mut self, git_ref: &str, dependent: &str) {
        let requesters = self.constraints.entry(git_ref.to_string()).or_default();
        if !requesters.iter().any(|d| d == dependent) {
            requesters.push(dependent.to_string());
        }
        if !self.dependents.iter().any(|d| d == dependent) {
            self.dependents.push(dependent.to_string());
        }
    }

    /// Returns true if more than one distinct ref was requested.
    #[must_use]
    pub fn has_conflict(&self) -> bool {
        self.constraints.len() > 1
    }

    /// Returns true once a commit has been chosen.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolved_ref.is_some() && self.commit.is_some()
    }
}

/// Every package reachable from a workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// Name used for the workspace as a dependent.
    pub root: String,
    /// Package keys the workspace depends on directly.
    pub direct: BTreeSet<String>,
    pub nodes: BTreeMap<String, GraphNode>,
}

impl DependencyGraph {
    #[must_use]
    pub fn get(&self, package_key: &str) -> Option<&GraphNode> {
        self.nodes.get(package_key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Breadth-first graph discovery over a repository cache.
pub struct GraphBuilder<'a> {
    cache: &'a RepositoryCache,
    lock: Option<&'a LockFile>,
    cancel: Option<&'a CancellationToken>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(cache: &'a RepositoryCache) -> Self {
        Self {
            cache,
            lock: None,
            cancel: None,
        }
    }

    /// Prefer commits pinned by an existing lock file.
    #[must_use]
    pub fn with_lock(mut self, lock: Option<&'a LockFile>) -> Self {
        self.lock = lock;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: Option<&'a CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Discover the graph reachable from a workspace manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if a package cannot be fetched, its manifest is
    /// invalid, or the token is cancelled.
    pub fn build(&self, root: &str, manifest: &ModelManifest) -> Result<DependencyGraph, GraphError> {
        let mut graph = DependencyGraph {
            root: root.to_string(),
            ..DependencyGraph::default()
        };
        let mut queue: VecDeque<(DependencyIdentifier, String)> = VecDeque::new();

        for (_, id) in manifest.git_dependencies() {
            graph.direct.insert(id.package_key());
            queue.push_back((id.clone(), root.to_string()));
        }

        while let Some((id, parent)) = queue.pop_front() {
            let key = id.package_key();
            if let Some(node) = graph.nodes.get_mut(&key) {
                node.add_constraint(&id.git_ref, &parent);
                continue;
            }

            if self.cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(GraphError::Cancelled);
            }

            let mut node = GraphNode::new(&id, &parent);
            let fetched = self.fetch_commit(&node.identifier)?;
            let checkout = self.cache.ensure_checkout(&node.identifier, &fetched.commit)?;
            let package_manifest = self
                .cache
                .manifests()
                .load_package(&checkout)
                .map_err(|source| GraphError::Manifest {
                    package: key.clone(),
                    source,
                })?;

            if let Some(package_manifest) = package_manifest {
                for (_, dep) in package_manifest.git_dependencies() {
                    node.dependencies.insert(dep.package_key());
                    queue.push_back((dep.clone(), key.clone()));
                }
                for (name, _) in package_manifest.local_dependencies() {
                    debug!(package = %key, dependency = %name, "Skipping local dependency of a fetched package");
                }
            }

            debug!(package = %key, commit = %fetched.commit, deps = node.dependencies.len(), "Discovered package");
            node.fetched = Some(fetched);
            graph.nodes.insert(key, node);
        }

        Ok(graph)
    }

    fn fetch_commit(&self, id: &DependencyIdentifier) -> Result<FetchedCommit, CacheError> {
        if let Some(pin) = self.lock.and_then(|l| l.pin(&id.package_key(), &id.git_ref)) {
            return Ok(FetchedCommit {
                git_ref: id.git_ref.clone(),
                ref_type: pin.ref_type,
                commit: pin.commit.clone(),
            });
        }
        let resolved = self.cache.resolve_commit(id)?;
        Ok(FetchedCommit {
            git_ref: resolved.git_ref,
            ref_type: resolved.ref_type,
            commit: resolved.commit,
        })
    }
}
