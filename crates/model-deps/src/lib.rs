//! Dependency management for model workspaces.
//!
//! This crate provides:
//! - Parsing of git dependency specifiers (`owner/repo/sub@ref`, git URLs)
//! - Parsing and validation of `model.toml` manifests
//! - Breadth-first discovery of the full dependency graph
//! - Version conflict resolution with overrides and cycle detection
//! - Lock file support for reproducible, offline builds
//! - A content-addressed cache of repository checkouts
//!
//! [`WorkspaceManager`] ties these together; most callers need nothing else.

mod cache;
mod commit;
mod config;
mod conflict;
mod diagnostic;
mod git;
mod graph;
mod lockfile;
mod manifest;
mod specifier;
mod version;
mod workspace;

#[cfg(test)]
mod testutil;

pub use cache::{CacheError, RepositoryCache, ResolvedCommit, INTEGRITY_PREFIX};
pub use commit::{CommitError, CommitResolver};
pub use config::{ResolverConfig, CACHE_DIR_ENV, OFFLINE_ENV};
pub use conflict::{
    find_cycle, AppliedOverride, AutoResolution, ConflictError, ConflictReason, ConflictResolver,
    ConstraintRequest, ResolutionReport,
};
pub use diagnostic::{Diagnostic, DiagnosticKind};
pub use git::{parse_ls_remote, GitCli, GitError, GitTransport, RemoteRef};
pub use graph::{CancellationToken, DependencyGraph, FetchedCommit, GraphBuilder, GraphError, GraphNode};
pub use lockfile::{
    LockError, LockFile, LockedDependency, KNOWN_FORMAT_VERSIONS, LOCK_FILE, LOCK_FORMAT_VERSION,
};
pub use manifest::{
    ManifestDependency, ManifestError, ManifestStore, ModelManifest, ModelSection,
    DEFAULT_ENTRY_FILE, MANIFEST_FILE, PATH_ALIAS_PREFIX,
};
pub use specifier::{
    detect_ref_type, explicit_ref, is_full_commit, is_git_specifier, looks_like_commit,
    parse_specifier, DependencyIdentifier, Platform, RefType, SpecifierError, DEFAULT_REF,
};
pub use version::{compare, filter_stable, is_pre_release, pick_latest, sort_descending, ParsedVersion};
pub use workspace::{
    DependencyStatus, LockState, Resolution, TreeNode, WorkspaceError, WorkspaceManager,
    WorkspaceRoot, WorkspaceStatus,
};
