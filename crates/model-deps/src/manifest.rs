//! Workspace manifest (`model.toml`) parsing, validation and caching.
//!
//! ```toml
//! [model]
//! name = "billing"
//! entry = "src/billing.model"
//!
//! [dependencies]
//! "acme/core-types" = "v1.2.0"
//! shared = { source = "gitlab:acme/shared", ref = "main" }
//! vendored = { path = "./vendor/legacy" }
//!
//! [paths]
//! "@common" = "models/common"
//!
//! [overrides]
//! "acme/core-types" = "v1.5.0"
//! ```
//!
//! Dependency entries come in several shapes; they are normalized into
//! [`ManifestDependency`] as soon as the file is parsed.

use crate::specifier::{self, DependencyIdentifier};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;
use thiserror::Error;
use tracing::debug;

/// The manifest filename.
pub const MANIFEST_FILE: &str = "model.toml";

/// Entry file used when a package declares none.
pub const DEFAULT_ENTRY_FILE: &str = "index.model";

/// Prefix every path alias must start with.
pub const PATH_ALIAS_PREFIX: char = '@';

/// Errors that can occur when working with manifests.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no model.toml found in {} or any parent directory", .start.display())]
    NotFound { start: PathBuf },

    #[error("invalid dependency '{key}': {reason}")]
    InvalidDependency { key: String, reason: String },

    #[error("invalid path alias '{alias}': {reason}")]
    InvalidPathAlias { alias: String, reason: String },

    #[error("invalid override for '{key}': {reason}")]
    InvalidOverride { key: String, reason: String },
}

impl ManifestError {
    /// Returns true for structural problems in the manifest contents.
    #[must_use]
    pub fn is_invalid_manifest(&self) -> bool {
        matches!(
            self,
            Self::Parse(_)
                | Self::InvalidDependency { .. }
                | Self::InvalidPathAlias { .. }
                | Self::InvalidOverride { .. }
        )
    }
}

/// On-disk shape of the manifest.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    #[serde(default)]
    model: ModelSection,

    #[serde(default)]
    dependencies: BTreeMap<String, DependencySpec>,

    #[serde(default)]
    paths: BTreeMap<String, String>,

    #[serde(default)]
    overrides: BTreeMap<String, String>,
}

/// The `[model]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSection {
    /// Model package name.
    #[serde(default)]
    pub name: Option<String>,

    /// Model package version.
    #[serde(default)]
    pub version: Option<String>,

    /// Entry file, relative to the package root.
    #[serde(default)]
    pub entry: Option<String>,

    /// Older spelling of `entry`.
    #[serde(default)]
    pub main: Option<String>,
}

/// Dependency entry as written: a string or a table.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DependencySpec {
    Simple(String),
    Detailed(DetailedDependency),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DetailedDependency {
    #[serde(default)]
    source: Option<String>,

    #[serde(default, rename = "ref")]
    git_ref: Option<String>,

    #[serde(default)]
    path: Option<String>,
}

/// A normalized dependency entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestDependency {
    /// A git-hosted package.
    Git {
        /// Source exactly as written, without any `@ref` suffix.
        source: String,
        /// Parsed identifier carrying the requested ref.
        identifier: DependencyIdentifier,
    },
    /// A directory inside the workspace.
    Local {
        /// Path relative to the workspace root.
        path: PathBuf,
    },
}

impl ManifestDependency {
    /// The git identifier, for git dependencies.
    #[must_use]
    pub fn identifier(&self) -> Option<&DependencyIdentifier> {
        match self {
            Self::Git { identifier, .. } => Some(identifier),
            Self::Local { .. } => None,
        }
    }

    /// Returns true if this is a local path dependency.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local { .. })
    }
}

/// A validated workspace manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelManifest {
    /// The `[model]` section.
    pub model: ModelSection,

    /// Declared dependencies by key.
    pub dependencies: BTreeMap<String, ManifestDependency>,

    /// Import path aliases (`@alias` → relative directory).
    pub path_aliases: BTreeMap<String, PathBuf>,

    /// Forced refs by package key.
    pub overrides: BTreeMap<String, String>,
}

impl ModelManifest {
    /// Load and validate a manifest file.
    ///
    /// The directory containing the file is the root local paths must stay in.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate a manifest from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a section fails validation.
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let raw: RawManifest = toml::from_str(content)?;

        let mut dependencies = BTreeMap::new();
        for (key, spec) in raw.dependencies {
            let dep = normalize_dependency(&key, spec)?;
            dependencies.insert(key, dep);
        }

        let mut path_aliases = BTreeMap::new();
        for (alias, target) in raw.paths {
            validate_alias_name(&alias)?;
            let path = validate_relative_path(&target).map_err(|reason| {
                ManifestError::InvalidPathAlias {
                    alias: alias.clone(),
                    reason,
                }
            })?;
            path_aliases.insert(alias, path);
        }

        for (key, git_ref) in &raw.overrides {
            validate_override(key, git_ref)?;
        }

        Ok(Self {
            model: raw.model,
            dependencies,
            path_aliases,
            overrides: raw.overrides,
        })
    }

    /// The declared entry file, if any.
    #[must_use]
    pub fn entry(&self) -> Option<&str> {
        self.model.entry.as_deref().or(self.model.main.as_deref())
    }

    /// Git dependencies in key order.
    pub fn git_dependencies(&self) -> impl Iterator<Item = (&String, &DependencyIdentifier)> {
        self.dependencies
            .iter()
            .filter_map(|(key, dep)| dep.identifier().map(|id| (key, id)))
    }

    /// Local path dependencies in key order.
    pub fn local_dependencies(&self) -> impl Iterator<Item = (&String, &Path)> {
        self.dependencies.iter().filter_map(|(key, dep)| match dep {
            ManifestDependency::Local { path } => Some((key, path.as_path())),
            ManifestDependency::Git { .. } => None,
        })
    }
}

/// Normalize one dependency entry into its canonical form.
fn normalize_dependency(key: &str, spec: DependencySpec) -> Result<ManifestDependency, ManifestError> {
    let invalid = |reason: String| ManifestError::InvalidDependency {
        key: key.to_string(),
        reason,
    };

    match spec {
        DependencySpec::Simple(value) => {
            let value = value.trim();
            if value.is_empty() {
                return Err(invalid("value cannot be empty".to_string()));
            }
            if specifier::is_local_path(value) {
                return local_dependency(value).map_err(invalid);
            }
            // `"owner/repo" = "v1.0.0"`: the key is the source, the value the ref.
            if specifier::is_git_specifier(key) && !value.contains('@') && !value.contains("://") {
                return git_dependency(key, Some(value)).map_err(invalid);
            }
            if specifier::is_git_specifier(value) {
                return git_dependency(value, None).map_err(invalid);
            }
            Err(invalid(format!(
                "'{value}' is neither a local path nor a git specifier, and the key is not 'owner/repo'"
            )))
        }
        DependencySpec::Detailed(detail) => match (detail.source, detail.path) {
            (Some(_), Some(_)) => Err(invalid(
                "specify exactly one of 'source' or 'path', not both".to_string(),
            )),
            (None, None) => Err(invalid(
                "specify exactly one of 'source' or 'path'".to_string(),
            )),
            (None, Some(path)) => {
                if detail.git_ref.is_some() {
                    return Err(invalid("'ref' cannot be used with 'path'".to_string()));
                }
                local_dependency(&path).map_err(invalid)
            }
            (Some(source), None) => git_dependency(&source, detail.git_ref.as_deref()).map_err(invalid),
        },
    }
}

fn git_dependency(source: &str, git_ref: Option<&str>) -> Result<ManifestDependency, String> {
    let source = source.trim();
    let embedded = specifier::explicit_ref(source);
    let git_ref = match (embedded, git_ref.map(str::trim)) {
        (Some(a), Some(b)) if a != b => {
            return Err(format!(
                "source pins '{a}' but 'ref' says '{b}'; keep only one"
            ))
        }
        (_, Some("")) => return Err("'ref' cannot be empty".to_string()),
        (Some(r), _) | (None, Some(r)) => r.to_string(),
        (None, None) => {
            return Err(format!(
                "git dependency '{source}' needs a ref, e.g. \"{source}@v1.0.0\""
            ))
        }
    };

    let bare = match embedded {
        Some(r) => &source[..source.len() - r.len() - 1],
        None => source,
    };
    let identifier = DependencyIdentifier::parse(bare)
        .map_err(|e| e.to_string())?
        .with_ref(git_ref);

    Ok(ManifestDependency::Git {
        source: bare.to_string(),
        identifier,
    })
}

fn local_dependency(path: &str) -> Result<ManifestDependency, String> {
    Ok(ManifestDependency::Local {
        path: validate_relative_path(path)?,
    })
}

/// Check that a path is relative and cannot leave the directory it is relative to.
///
/// Returns the lexically normalized path.
fn validate_relative_path(raw: &str) -> Result<PathBuf, String> {
    let path = Path::new(raw);
    if path.is_absolute() || raw.starts_with('/') || raw.starts_with('\\') {
        return Err(format!("'{raw}' must be a relative path"));
    }

    let mut normalized = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => {
                normalized.push(part);
                depth += 1;
            }
            Component::ParentDir => {
                if depth == 0 {
                    return Err(format!("'{raw}' points outside the workspace root"));
                }
                normalized.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("'{raw}' must be a relative path"));
            }
        }
    }
    Ok(normalized)
}

fn validate_alias_name(alias: &str) -> Result<(), ManifestError> {
    let name = alias.strip_prefix(PATH_ALIAS_PREFIX).ok_or_else(|| {
        ManifestError::InvalidPathAlias {
            alias: alias.to_string(),
            reason: format!("aliases must start with '{PATH_ALIAS_PREFIX}'"),
        }
    })?;
    if name.is_empty() || name.contains('/') {
        return Err(ManifestError::InvalidPathAlias {
            alias: alias.to_string(),
            reason: "alias name must be a single non-empty segment".to_string(),
        });
    }
    Ok(())
}

fn validate_override(key: &str, git_ref: &str) -> Result<(), ManifestError> {
    let segments: Vec<&str> = key.split('/').collect();
    if segments.len() != 2 || segments.iter().any(|s| s.is_empty()) {
        return Err(ManifestError::InvalidOverride {
            key: key.to_string(),
            reason: "override keys are package keys of the form 'owner/repo'".to_string(),
        });
    }
    if git_ref.trim().is_empty() {
        return Err(ManifestError::InvalidOverride {
            key: key.to_string(),
            reason: "ref cannot be empty".to_string(),
        });
    }
    Ok(())
}

/// Size and modification time of a manifest file when it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

impl FileStamp {
    fn of(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

#[derive(Debug)]
struct CachedManifest {
    stamp: FileStamp,
    manifest: Arc<ModelManifest>,
}

/// Reads manifests and keeps them until the file changes.
#[derive(Debug, Default)]
pub struct ManifestStore {
    cache: Mutex<HashMap<PathBuf, CachedManifest>>,
    reads: AtomicUsize,
}

impl ManifestStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the manifest by searching upward from a directory.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::NotFound`] if no ancestor contains a manifest.
    pub fn find_manifest_path(start: impl AsRef<Path>) -> Result<PathBuf, ManifestError> {
        let start = start.as_ref();
        let mut current = Some(start);

        while let Some(dir) = current {
            let candidate = dir.join(MANIFEST_FILE);
            if candidate.is_file() {
                return Ok(candidate);
            }
            current = dir.parent();
        }

        Err(ManifestError::NotFound {
            start: start.to_path_buf(),
        })
    }

    /// Load a manifest, reusing the cached copy while the file is unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or fails validation.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Arc<ModelManifest>, ManifestError> {
        let path = path.as_ref();
        let stamp = FileStamp::of(path)?;

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = cache.get(path) {
            if cached.stamp == stamp && stamp.modified.is_some() {
                return Ok(Arc::clone(&cached.manifest));
            }
        }

        debug!(path = %path.display(), "Reading manifest");
        self.reads.fetch_add(1, Ordering::Relaxed);
        let manifest = Arc::new(ModelManifest::from_path(path)?);
        cache.insert(
            path.to_path_buf(),
            CachedManifest {
                stamp,
                manifest: Arc::clone(&manifest),
            },
        );
        Ok(manifest)
    }

    /// Load the manifest of a package directory, if it has one.
    ///
    /// # Errors
    ///
    /// Returns an error if a manifest exists but cannot be loaded.
    pub fn load_package(&self, package_root: &Path) -> Result<Option<Arc<ModelManifest>>, ManifestError> {
        let path = package_root.join(MANIFEST_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        self.load(path).map(Some)
    }

    /// Forget the cached copy of one manifest.
    pub fn invalidate(&self, path: &Path) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }

    /// Forget every cached manifest.
    pub fn clear(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of times a manifest file has actually been read.
    #[must_use]
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}
