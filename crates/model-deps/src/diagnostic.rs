//! Structured error reports for editors and command-line front ends.

use crate::cache::CacheError;
use crate::commit::CommitError;
use crate::conflict::ConflictError;
use crate::graph::GraphError;
use crate::lockfile::LockError;
use crate::manifest::ManifestError;
use crate::workspace::WorkspaceError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticKind {
    InvalidSpecifier,
    UnresolvableRef,
    EntryPointNotFound,
    InvalidManifest,
    ManifestNotFound,
    VersionConflict,
    CyclicDependency,
    MissingLockFile,
    InvalidLockFile,
    IntegrityMismatch,
    Offline,
    Cancelled,
    NotInitialized,
    UnknownDependency,
    LocalDependency,
    UnknownPathAlias,
    InvalidImport,
    Git,
    Io,
}

impl DiagnosticKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidSpecifier => "invalid-specifier",
            Self::UnresolvableRef => "unresolvable-ref",
            Self::EntryPointNotFound => "entry-point-not-found",
            Self::InvalidManifest => "invalid-manifest",
            Self::ManifestNotFound => "manifest-not-found",
            Self::VersionConflict => "version-conflict",
            Self::CyclicDependency => "cyclic-dependency",
            Self::MissingLockFile => "missing-lock-file",
            Self::InvalidLockFile => "invalid-lock-file",
            Self::IntegrityMismatch => "integrity-mismatch",
            Self::Offline => "offline",
            Self::Cancelled => "cancelled",
            Self::NotInitialized => "not-initialized",
            Self::UnknownDependency => "unknown-dependency",
            Self::LocalDependency => "local-dependency",
            Self::UnknownPathAlias => "unknown-path-alias",
            Self::InvalidImport => "invalid-import",
            Self::Git => "git",
            Self::Io => "io",
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A serializable `{kind, message, hint}` error report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl Diagnostic {
    /// Render as a JSON object.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<&WorkspaceError> for Diagnostic {
    fn from(err: &WorkspaceError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            hint: err.hint(),
        }
    }
}

impl From<WorkspaceError> for Diagnostic {
    fn from(err: WorkspaceError) -> Self {
        Self::from(&err)
    }
}

fn manifest_kind(err: &ManifestError) -> DiagnosticKind {
    match err {
        ManifestError::NotFound { .. } => DiagnosticKind::ManifestNotFound,
        ManifestError::Io(_) => DiagnosticKind::Io,
        _ => DiagnosticKind::InvalidManifest,
    }
}

fn cache_kind(err: &CacheError) -> DiagnosticKind {
    match err {
        CacheError::Git(_) => DiagnosticKind::Git,
        CacheError::Io(_) => DiagnosticKind::Io,
        CacheError::Manifest(e) => manifest_kind(e),
        CacheError::UnresolvableRef { .. } => DiagnosticKind::UnresolvableRef,
        CacheError::EntryPointNotFound { .. } => DiagnosticKind::EntryPointNotFound,
        CacheError::Offline { .. } => DiagnosticKind::Offline,
        CacheError::IntegrityMismatch { .. } => DiagnosticKind::IntegrityMismatch,
    }
}

fn cache_hint(err: &CacheError) -> Option<String> {
    match err {
        CacheError::UnresolvableRef { package, .. } => Some(format!(
            "check that the tag, branch or commit exists in '{package}'"
        )),
        CacheError::EntryPointNotFound { .. } => Some(
            "set `entry` under [model] in the package's model.toml, or import a file subpath"
                .to_string(),
        ),
        CacheError::Offline { .. } => {
            Some("allow network access, or run once online to fill the cache".to_string())
        }
        CacheError::IntegrityMismatch { .. } => {
            Some("clear the repository cache and resolve again".to_string())
        }
        _ => None,
    }
}

impl WorkspaceError {
    /// Category of this error.
    #[must_use]
    pub fn kind(&self) -> DiagnosticKind {
        match self {
            Self::Manifest(e) => manifest_kind(e),
            Self::Lock(LockError::Io(_)) => DiagnosticKind::Io,
            Self::Lock(_) => DiagnosticKind::InvalidLockFile,
            Self::Specifier(_) => DiagnosticKind::InvalidSpecifier,
            Self::Graph(GraphError::Cancelled) => DiagnosticKind::Cancelled,
            Self::Graph(GraphError::Cache(e)) | Self::Commit(CommitError::Cache(e)) | Self::Cache(e) => {
                cache_kind(e)
            }
            Self::Graph(GraphError::Manifest { .. }) => DiagnosticKind::InvalidManifest,
            Self::Commit(CommitError::NoChosenRef { .. }) => DiagnosticKind::VersionConflict,
            Self::Conflict(ConflictError::VersionConflict { .. }) => DiagnosticKind::VersionConflict,
            Self::Conflict(ConflictError::CyclicDependency { .. }) => DiagnosticKind::CyclicDependency,
            Self::MissingLockFile { .. } => DiagnosticKind::MissingLockFile,
            Self::NotInitialized | Self::InitializationFailed(_) => DiagnosticKind::NotInitialized,
            Self::UnknownDependency { .. } => DiagnosticKind::UnknownDependency,
            Self::LocalDependency { .. } => DiagnosticKind::LocalDependency,
            Self::NotLocked { .. } => DiagnosticKind::MissingLockFile,
            Self::UnknownPathAlias { .. } => DiagnosticKind::UnknownPathAlias,
            Self::InvalidImport { .. } => DiagnosticKind::InvalidImport,
        }
    }

    /// A concrete next step for the user, when there is one.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::Conflict(e) => e.hint(),
            Self::Graph(GraphError::Cache(e)) | Self::Commit(CommitError::Cache(e)) | Self::Cache(e) => {
                cache_hint(e)
            }
            Self::Manifest(ManifestError::NotFound { .. }) => {
                Some("create a model.toml at the workspace root".to_string())
            }
            Self::MissingLockFile { .. } => {
                Some("allow network access so dependencies can be resolved and locked".to_string())
            }
            Self::NotLocked { .. } => Some("resolve dependencies again to update model.lock".to_string()),
            Self::NotInitialized => Some("initialize the workspace first".to_string()),
            Self::UnknownDependency { name } => Some(format!(
                "declare it under [dependencies], e.g. \"{name}\" = \"v1.0.0\""
            )),
            Self::LocalDependency { .. } => {
                Some("add a path alias under [paths] and import through it".to_string())
            }
            Self::UnknownPathAlias { .. } => {
                Some("declare the alias under [paths], e.g. \"@shared\" = \"models/shared\"".to_string())
            }
            _ => None,
        }
    }
}
