//! Turning chosen refs into exact commits.

use crate::cache::{CacheError, RepositoryCache};
use crate::graph::{DependencyGraph, FetchedCommit};
use crate::lockfile::LockFile;
use thiserror::Error;
use tracing::debug;

/// Errors from commit resolution.
#[derive(Error, Debug)]
pub enum CommitError {
    #[error("'{package}' has no chosen ref; resolve conflicts first")]
    NoChosenRef { package: String },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Pins every node of a conflict-resolved graph to a commit.
///
/// A package already locked at the same ref keeps its locked commit and
/// integrity without touching the network.
pub struct CommitResolver<'a> {
    cache: &'a RepositoryCache,
    lock: Option<&'a LockFile>,
}

impl<'a> CommitResolver<'a> {
    pub fn new(cache: &'a RepositoryCache) -> Self {
        Self { cache, lock: None }
    }

    #[must_use]
    pub fn with_lock(mut self, lock: Option<&'a LockFile>) -> Self {
        self.lock = lock;
        self
    }

    /// Set `commit`, `ref_type` and `integrity` on every node.
    ///
    /// # Errors
    ///
    /// Returns an error if a node has no chosen ref, its ref cannot be
    /// resolved, or its checkout cannot be fetched.
    pub fn resolve(&self, graph: &mut DependencyGraph) -> Result<(), CommitError> {
        for (key, node) in &mut graph.nodes {
            let git_ref = node
                .resolved_ref
                .clone()
                .ok_or_else(|| CommitError::NoChosenRef {
                    package: key.clone(),
                })?;

            if let Some(pin) = self.lock.and_then(|l| l.pin(key, &git_ref)) {
                debug!(package = %key, commit = %pin.commit, "Using locked commit");
                node.commit = Some(pin.commit.clone());
                node.ref_type = Some(pin.ref_type);
                node.integrity = match &pin.integrity {
                    Some(integrity) => Some(integrity.clone()),
                    None => Some(self.cache.integrity(&node.identifier, &pin.commit)?),
                };
                continue;
            }

            let fetched = match &node.fetched {
                Some(fetched) if fetched.git_ref == git_ref || node.ref_constraint == git_ref => {
                    fetched.clone()
                }
                _ => {
                    let resolved = self
                        .cache
                        .resolve_commit(&node.identifier.with_ref(git_ref.as_str()))?;
                    FetchedCommit {
                        git_ref: resolved.git_ref,
                        ref_type: resolved.ref_type,
                        commit: resolved.commit,
                    }
                }
            };

            // The lock keeps the ref as requested, even when the remote
            // spells the tag without (or with) its `v`.
            debug!(
                package = %key,
                git_ref = %git_ref,
                remote_ref = %fetched.git_ref,
                commit = %fetched.commit,
                "Resolved commit"
            );
            node.integrity = Some(self.cache.integrity(&node.identifier, &fetched.commit)?);
            node.ref_type = Some(fetched.ref_type);
            node.commit = Some(fetched.commit);
        }
        Ok(())
    }
}
