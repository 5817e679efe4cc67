//! Lock file (`model.lock`) for reproducible resolution.
//!
//! ```toml
//! version = "1"
//!
//! [dependencies."acme/core-types"]
//! ref = "v1.5.0"
//! refType = "tag"
//! resolved = "https://github.com/acme/core-types.git"
//! commit = "0123456789abcdef0123456789abcdef01234567"
//! integrity = "sha256-…"
//! ```
//!
//! Reading is forgiving: a damaged entry is dropped and reported instead of
//! failing the whole file. Writing is strict and deterministic.

use crate::graph::DependencyGraph;
use crate::specifier::{is_full_commit, RefType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// The lock filename.
pub const LOCK_FILE: &str = "model.lock";

/// Format versions this crate can read, oldest first.
pub const KNOWN_FORMAT_VERSIONS: [&str; 1] = ["1"];

/// Format version written by this crate.
pub const LOCK_FORMAT_VERSION: &str = "1";

const HEADER: &str = "# This file is generated by model-deps. Do not edit it by hand.\n\n";

/// Errors reading or writing lock files.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("failed to access lock file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse lock file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize lock file: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("cannot lock '{package}': it has no resolved commit")]
    Unresolved { package: String },
}

/// One pinned dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedDependency {
    /// The ref that was resolved.
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub ref_type: RefType,
    /// Repository URL the commit was fetched from.
    pub resolved: String,
    /// Full commit hash.
    pub commit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
}

/// A decoded lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockFile {
    #[serde(rename = "version")]
    pub format_version: String,
    pub dependencies: BTreeMap<String, LockedDependency>,
}

impl Default for LockFile {
    fn default() -> Self {
        Self {
            format_version: LOCK_FORMAT_VERSION.to_string(),
            dependencies: BTreeMap::new(),
        }
    }
}

impl LockFile {
    /// Build a lock file from a fully resolved graph.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Unresolved`] if any node lacks a ref or commit.
    pub fn from_graph(graph: &DependencyGraph) -> Result<Self, LockError> {
        let mut dependencies = BTreeMap::new();
        for (key, node) in &graph.nodes {
            let unresolved = || LockError::Unresolved {
                package: key.clone(),
            };
            let git_ref = node.resolved_ref.clone().ok_or_else(unresolved)?;
            let commit = node
                .commit
                .clone()
                .filter(|c| is_full_commit(c))
                .ok_or_else(unresolved)?;
            let ref_type = node.ref_type.ok_or_else(unresolved)?;

            dependencies.insert(
                key.clone(),
                LockedDependency {
                    git_ref,
                    ref_type,
                    resolved: node.repo_url.clone(),
                    commit,
                    integrity: node.integrity.clone(),
                },
            );
        }

        Ok(Self {
            format_version: LOCK_FORMAT_VERSION.to_string(),
            dependencies,
        })
    }

    /// Decode a lock file, dropping entries that are incomplete or invalid.
    ///
    /// # Errors
    ///
    /// Returns an error only if the content is not TOML at all.
    pub fn parse(content: &str) -> Result<Self, LockError> {
        let table: toml::Table = toml::from_str(content)?;

        let format_version = match table.get("version").and_then(toml::Value::as_str) {
            Some(v) if KNOWN_FORMAT_VERSIONS.contains(&v) => v.to_string(),
            other => {
                if let Some(v) = other {
                    warn!(version = v, "Unknown lock file version, reading as version 1");
                }
                KNOWN_FORMAT_VERSIONS[0].to_string()
            }
        };

        let mut dependencies = BTreeMap::new();
        if let Some(entries) = table.get("dependencies").and_then(toml::Value::as_table) {
            for (key, value) in entries {
                match decode_entry(key, value) {
                    Ok(entry) => {
                        dependencies.insert(key.clone(), entry);
                    }
                    Err(reason) => {
                        warn!(package = %key, reason = %reason, "Dropping invalid lock file entry");
                    }
                }
            }
        }

        Ok(Self {
            format_version,
            dependencies,
        })
    }

    /// Read a lock file from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not TOML.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Read a lock file if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn read_optional(path: impl AsRef<Path>) -> Result<Option<Self>, LockError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Ok(None);
        }
        Self::read(path).map(Some)
    }

    /// Serialize with sorted keys.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, LockError> {
        let body = toml::to_string(self)?;
        Ok(format!("{HEADER}{body}"))
    }

    /// Write the lock file, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), LockError> {
        let path = path.as_ref();
        let content = self.encode()?;
        let tmp = path.with_extension("lock.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// The locked entry for a package, if it was locked at `git_ref`.
    #[must_use]
    pub fn pin(&self, package_key: &str, git_ref: &str) -> Option<&LockedDependency> {
        self.dependencies
            .get(package_key)
            .filter(|entry| entry.git_ref == git_ref)
    }

    #[must_use]
    pub fn get(&self, package_key: &str) -> Option<&LockedDependency> {
        self.dependencies.get(package_key)
    }
}

fn decode_entry(key: &str, value: &toml::Value) -> Result<LockedDependency, String> {
    let segments: Vec<&str> = key.split('/').collect();
    if segments.len() != 2 || segments.iter().any(|s| s.is_empty()) {
        return Err("key is not 'owner/repo'".to_string());
    }
    let entry: LockedDependency = value.clone().try_into().map_err(|e: toml::de::Error| e.to_string())?;
    if !is_full_commit(&entry.commit) {
        return Err(format!("'{}' is not a full commit hash", entry.commit));
    }
    Ok(LockedDependency {
        commit: entry.commit.to_ascii_lowercase(),
        ..entry
    })
}
