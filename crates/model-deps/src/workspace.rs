//! Workspace management.
//!
//! [`WorkspaceManager`] is the entry point for tools: it owns the manifest
//! and lock file lifecycle and maps import specifiers to files on disk.
//!
//! ```text
//! Uninitialized ── initialize() ──▶ Initializing ──▶ Ready
//!       ▲                                 │
//!       └──────────── failure ◀───────────┘
//! ```
//!
//! Resolution discovers the graph, reconciles versions, pins commits and
//! writes `model.lock` only once every step has succeeded.

use crate::cache::{CacheError, RepositoryCache};
use crate::commit::{CommitError, CommitResolver};
use crate::config::ResolverConfig;
use crate::conflict::{ConflictError, ConflictResolver, ResolutionReport};
use crate::git::{GitCli, GitTransport};
use crate::graph::{CancellationToken, GraphBuilder, GraphError};
use crate::lockfile::{LockError, LockFile, LOCK_FILE};
use crate::manifest::{ManifestDependency, ManifestError, ManifestStore, ModelManifest};
use crate::specifier::{DependencyIdentifier, SpecifierError};
use crate::version::ParsedVersion;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur when working with a workspace.
#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Specifier(#[from] SpecifierError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("no model.lock in {} and network access is disabled", .root.display())]
    MissingLockFile { root: PathBuf },

    #[error("workspace is not initialized")]
    NotInitialized,

    #[error("workspace initialization failed: {0}")]
    InitializationFailed(String),

    #[error("'{name}' is not a declared dependency")]
    UnknownDependency { name: String },

    #[error("'{name}' is a local path dependency; import it through a path alias")]
    LocalDependency { name: String },

    #[error("'{package}' is missing from model.lock; run an update")]
    NotLocked { package: String },

    #[error("'{import}' does not start with a declared path alias")]
    UnknownPathAlias { import: String },

    #[error("invalid import '{import}': {reason}")]
    InvalidImport { import: String, reason: String },
}

/// Locations of an initialized workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceRoot {
    /// Directory containing the manifest.
    pub root: PathBuf,
    pub manifest_path: PathBuf,
    pub lock_path: PathBuf,
}

#[derive(Debug)]
enum InitState {
    Uninitialized,
    Initializing,
    Ready(Arc<WorkspaceRoot>),
    Failed(String),
}

/// Result of a full resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub lock: Arc<LockFile>,
    pub report: ResolutionReport,
}

/// Whether existing lock pins are honoured during resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PinMode {
    Keep,
    Refresh,
}

/// Lock state of one direct dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    /// Locked at the requested (or overridden) ref.
    Locked { commit: String },
    /// Locked at a newer compatible version chosen during conflict resolution.
    Upgraded { locked_ref: String, commit: String },
    /// Locked at a ref the manifest no longer asks for.
    Stale { locked_ref: String },
    /// Not in the lock file.
    Missing,
}

/// Status of one direct git dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyStatus {
    /// Manifest key.
    pub name: String,
    pub package: String,
    pub requested: String,
    pub state: LockState,
}

/// Lock status of the whole workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceStatus {
    pub lock_file_present: bool,
    pub dependencies: Vec<DependencyStatus>,
}

impl WorkspaceStatus {
    /// Returns true if every direct dependency is locked as requested.
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.lock_file_present
            && self
                .dependencies
                .iter()
                .all(|d| matches!(d.state, LockState::Locked { .. } | LockState::Upgraded { .. }))
    }
}

/// A node of the rendered dependency tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub name: String,
    pub git_ref: Option<String>,
    pub commit: Option<String>,
    /// Already shown elsewhere in the tree; children omitted.
    pub repeated: bool,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn write_children(&self, f: &mut fmt::Formatter<'_>, prefix: &str) -> fmt::Result {
        let count = self.children.len();
        for (i, child) in self.children.iter().enumerate() {
            let last = i + 1 == count;
            write!(f, "\n{prefix}{}{}", if last { "└── " } else { "├── " }, child.label())?;
            let next = format!("{prefix}{}", if last { "    " } else { "│   " });
            child.write_children(f, &next)?;
        }
        Ok(())
    }

    fn label(&self) -> String {
        let mut label = self.name.clone();
        if let Some(ref git_ref) = self.git_ref {
            label.push(' ');
            label.push_str(git_ref);
        }
        if let Some(ref commit) = self.commit {
            label.push_str(&format!(" ({})", &commit[..commit.len().min(7)]));
        }
        if self.repeated {
            label.push_str(" (*)");
        }
        label
    }
}

impl fmt::Display for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())?;
        self.write_children(f, "")
    }
}

/// Manages one workspace's manifest, lock file and dependency cache.
pub struct WorkspaceManager {
    config: ResolverConfig,
    cache: RepositoryCache,
    manifests: Arc<ManifestStore>,
    state: Mutex<InitState>,
    ready: Condvar,
    lock: Mutex<Option<Arc<LockFile>>>,
    verified: Mutex<BTreeSet<String>>,
    cancel: CancellationToken,
}

impl fmt::Debug for WorkspaceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkspaceManager")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkspaceManager {
    /// Create a manager that talks to remotes through the `git` program.
    #[must_use]
    pub fn new(config: ResolverConfig) -> Self {
        let transport = Arc::new(GitCli::new(config.git_program.clone()));
        Self::with_transport(config, transport)
    }

    /// Create a manager with a custom git transport.
    #[must_use]
    pub fn with_transport(config: ResolverConfig, transport: Arc<dyn GitTransport>) -> Self {
        let manifests = Arc::new(ManifestStore::new());
        let cache = RepositoryCache::new(config.cache_dir.clone(), transport)
            .with_manifest_store(Arc::clone(&manifests))
            .with_network(config.allow_network);
        Self {
            config,
            cache,
            manifests,
            state: Mutex::new(InitState::Uninitialized),
            ready: Condvar::new(),
            lock: Mutex::new(None),
            verified: Mutex::new(BTreeSet::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Use a caller-owned token to abort resolutions.
    #[must_use]
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &RepositoryCache {
        &self.cache
    }

    /// Number of manifest files read so far.
    #[must_use]
    pub fn manifest_reads(&self) -> usize {
        self.manifests.read_count()
    }

    /// Locate and load the workspace containing `start`.
    ///
    /// Safe to call from many threads: one caller does the work and the
    /// others wait for its result. Once ready, later calls return the same
    /// workspace whatever path they pass.
    ///
    /// # Errors
    ///
    /// Returns an error if no manifest is found or it is invalid.
    pub fn initialize(&self, start: impl AsRef<Path>) -> Result<Arc<WorkspaceRoot>, WorkspaceError> {
        let mut state = guard(&self.state);
        let mut waited = false;
        loop {
            match &*state {
                InitState::Ready(root) => return Ok(Arc::clone(root)),
                InitState::Failed(message) if waited => {
                    return Err(WorkspaceError::InitializationFailed(message.clone()));
                }
                InitState::Uninitialized | InitState::Failed(_) => break,
                InitState::Initializing => {}
            }
            waited = true;
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *state = InitState::Initializing;
        drop(state);

        let result = self.load_workspace(start.as_ref());

        let mut state = guard(&self.state);
        *state = match &result {
            Ok(root) => InitState::Ready(Arc::clone(root)),
            Err(e) => InitState::Failed(e.to_string()),
        };
        self.ready.notify_all();
        result
    }

    fn load_workspace(&self, start: &Path) -> Result<Arc<WorkspaceRoot>, WorkspaceError> {
        let manifest_path = ManifestStore::find_manifest_path(start)?;
        let root = manifest_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        self.manifests.load(&manifest_path)?;

        let workspace = WorkspaceRoot {
            lock_path: root.join(LOCK_FILE),
            manifest_path,
            root,
        };
        info!(root = %workspace.root.display(), "Workspace initialized");
        Ok(Arc::new(workspace))
    }

    /// The initialized workspace.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::NotInitialized`] before [`Self::initialize`] succeeds.
    pub fn workspace(&self) -> Result<Arc<WorkspaceRoot>, WorkspaceError> {
        match &*guard(&self.state) {
            InitState::Ready(root) => Ok(Arc::clone(root)),
            _ => Err(WorkspaceError::NotInitialized),
        }
    }

    /// The workspace manifest, re-read only if the file changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the workspace is not initialized or the manifest is invalid.
    pub fn manifest(&self) -> Result<Arc<ModelManifest>, WorkspaceError> {
        let ws = self.workspace()?;
        Ok(self.manifests.load(&ws.manifest_path)?)
    }

    /// The lock file, resolving and writing one if necessary.
    ///
    /// Tries the in-memory copy, then `model.lock` on disk, then a full
    /// resolution when the network is allowed.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::MissingLockFile`] if there is no lock file
    /// and network access is disabled, or any resolution error.
    pub fn ensure_lock_file(&self) -> Result<Arc<LockFile>, WorkspaceError> {
        let ws = self.workspace()?;
        let cached = guard(&self.lock).clone();
        if let Some(lock) = cached {
            return Ok(lock);
        }
        if let Some(lock) = LockFile::read_optional(&ws.lock_path)? {
            debug!(path = %ws.lock_path.display(), "Loaded lock file");
            let lock = Arc::new(lock);
            *guard(&self.lock) = Some(Arc::clone(&lock));
            return Ok(lock);
        }
        if !self.config.allow_network {
            return Err(WorkspaceError::MissingLockFile { root: ws.root.clone() });
        }
        Ok(self.resolve()?.lock)
    }

    /// Resolve all dependencies and write the lock file.
    ///
    /// Packages already locked at the ref they are requested at keep their
    /// commit.
    ///
    /// # Errors
    ///
    /// Returns any manifest, discovery, conflict or fetch error. The lock
    /// file is left untouched on error.
    pub fn resolve(&self) -> Result<Resolution, WorkspaceError> {
        self.run_resolution(PinMode::Keep)
    }

    /// Like [`Self::resolve`], but re-resolves every ref against the remotes.
    ///
    /// # Errors
    ///
    /// Same as [`Self::resolve`].
    pub fn update(&self) -> Result<Resolution, WorkspaceError> {
        self.run_resolution(PinMode::Refresh)
    }

    fn run_resolution(&self, mode: PinMode) -> Result<Resolution, WorkspaceError> {
        let ws = self.workspace()?;
        let manifest = self.manifests.load(&ws.manifest_path)?;
        let previous = match mode {
            PinMode::Keep => self.current_lock(&ws)?,
            PinMode::Refresh => None,
        };

        let root_name = manifest.model.name.as_deref().unwrap_or("root");
        let mut graph = GraphBuilder::new(&self.cache)
            .with_lock(previous.as_deref())
            .with_cancellation(Some(&self.cancel))
            .build(root_name, &manifest)?;
        let report = ConflictResolver::new()
            .with_strict_versions(self.config.strict_versions)
            .resolve(&mut graph, &manifest.overrides)?;
        CommitResolver::new(&self.cache)
            .with_lock(previous.as_deref())
            .resolve(&mut graph)?;

        let lock = LockFile::from_graph(&graph)?;
        lock.write(&ws.lock_path)?;
        info!(
            path = %ws.lock_path.display(),
            packages = lock.dependencies.len(),
            auto_resolved = report.auto_resolved.len(),
            overrides = report.overrides.len(),
            "Wrote lock file"
        );

        let lock = Arc::new(lock);
        *guard(&self.lock) = Some(Arc::clone(&lock));
        Ok(Resolution { lock, report })
    }

    /// The in-memory lock file, or the one on disk, without resolving.
    fn current_lock(&self, ws: &WorkspaceRoot) -> Result<Option<Arc<LockFile>>, WorkspaceError> {
        let cached = guard(&self.lock).clone();
        match cached {
            Some(lock) => Ok(Some(lock)),
            None => Ok(LockFile::read_optional(&ws.lock_path)?.map(Arc::new)),
        }
    }

    /// Map an import specifier to the git dependency it names.
    ///
    /// The longest declared key that equals the specifier or prefixes it at
    /// a `/` boundary wins; whatever follows becomes a subpath.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::UnknownDependency`] for undeclared names and
    /// [`WorkspaceError::LocalDependency`] for local path dependencies.
    pub fn resolve_dependency_import(&self, specifier: &str) -> Result<DependencyIdentifier, WorkspaceError> {
        let manifest = self.manifest()?;
        let specifier = specifier.trim().trim_end_matches('/');

        let matched = manifest
            .dependencies
            .iter()
            .filter_map(|(key, dep)| {
                let rest = specifier.strip_prefix(key.as_str())?;
                if rest.is_empty() {
                    Some((key, dep, None))
                } else {
                    rest.strip_prefix('/').map(|sub| (key, dep, Some(sub)))
                }
            })
            .max_by_key(|(key, _, _)| key.len());

        let Some((key, dep, rest)) = matched else {
            return Err(WorkspaceError::UnknownDependency {
                name: specifier.to_string(),
            });
        };

        let identifier = match dep {
            ManifestDependency::Local { .. } => {
                return Err(WorkspaceError::LocalDependency { name: key.clone() });
            }
            ManifestDependency::Git { identifier, .. } => identifier,
        };

        let mut resolved = identifier.clone();
        if let Some(rest) = rest {
            check_relative(specifier, rest)?;
            resolved.subpath = Some(match &identifier.subpath {
                Some(base) => format!("{base}/{rest}"),
                None => rest.to_string(),
            });
        }
        Ok(resolved)
    }

    /// Map an import specifier to its entry file in the checkout cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the import is not a declared git dependency, the
    /// package is not locked, its checkout does not match the locked
    /// integrity, or no entry file exists.
    pub fn resolve_import_entry(&self, specifier: &str) -> Result<PathBuf, WorkspaceError> {
        let identifier = self.resolve_dependency_import(specifier)?;
        let lock = self.ensure_lock_file()?;
        let package = identifier.package_key();
        let locked = lock
            .get(&package)
            .ok_or_else(|| WorkspaceError::NotLocked {
                package: package.clone(),
            })?;

        if let Some(expected) = &locked.integrity {
            let already_checked = guard(&self.verified).contains(&locked.commit);
            if !already_checked {
                self.cache
                    .verify_integrity(&identifier, &locked.commit, expected)?;
                debug!(package = %package, commit = %locked.commit, "Checkout integrity verified");
                guard(&self.verified).insert(locked.commit.clone());
            }
        }
        Ok(self.cache.resolve_entry_point(&identifier, &locked.commit)?)
    }

    /// Map an `@alias/rest` import to a path inside the workspace.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::UnknownPathAlias`] if no alias matches, or
    /// [`WorkspaceError::InvalidImport`] if the rest leaves the alias target.
    pub fn resolve_path_alias(&self, import: &str) -> Result<PathBuf, WorkspaceError> {
        let ws = self.workspace()?;
        let manifest = self.manifest()?;

        let matched = manifest
            .path_aliases
            .iter()
            .filter_map(|(alias, target)| {
                let rest = import.strip_prefix(alias.as_str())?;
                if rest.is_empty() {
                    Some((target, ""))
                } else {
                    rest.strip_prefix('/').map(|r| (target, r))
                }
            })
            .next();

        let Some((target, rest)) = matched else {
            return Err(WorkspaceError::UnknownPathAlias {
                import: import.to_string(),
            });
        };
        let mut path = ws.root.join(target);
        if !rest.is_empty() {
            check_relative(import, rest)?;
            path.push(rest);
        }
        Ok(path)
    }

    /// The locked dependency graph as a tree rooted at the workspace.
    ///
    /// Packages reachable along several paths are expanded once and marked
    /// as repeated elsewhere.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no lock file or a locked checkout is
    /// unavailable.
    pub fn dependency_tree(&self) -> Result<TreeNode, WorkspaceError> {
        let manifest = self.manifest()?;
        let lock = self.ensure_lock_file()?;

        let mut expanded = BTreeSet::new();
        let mut children = Vec::new();
        for (_, id) in manifest.git_dependencies() {
            children.push(self.tree_node(&id.package_key(), &lock, &mut expanded)?);
        }
        Ok(TreeNode {
            name: manifest.model.name.clone().unwrap_or_else(|| "root".to_string()),
            git_ref: manifest.model.version.clone(),
            commit: None,
            repeated: false,
            children,
        })
    }

    fn tree_node(
        &self,
        package: &str,
        lock: &LockFile,
        expanded: &mut BTreeSet<String>,
    ) -> Result<TreeNode, WorkspaceError> {
        let Some(locked) = lock.get(package) else {
            return Err(WorkspaceError::NotLocked {
                package: package.to_string(),
            });
        };
        let mut node = TreeNode {
            name: package.to_string(),
            git_ref: Some(locked.git_ref.clone()),
            commit: Some(locked.commit.clone()),
            repeated: false,
            children: Vec::new(),
        };
        if !expanded.insert(package.to_string()) {
            node.repeated = true;
            return Ok(node);
        }

        let identifier = DependencyIdentifier::parse(&locked.resolved)?;
        let checkout = self.cache.ensure_checkout(&identifier, &locked.commit)?;
        if let Some(package_manifest) = self.manifests.load_package(&checkout)? {
            let deps: BTreeSet<String> = package_manifest
                .git_dependencies()
                .map(|(_, id)| id.package_key())
                .collect();
            for dep in deps {
                node.children.push(self.tree_node(&dep, lock, expanded)?);
            }
        }
        Ok(node)
    }

    /// Compare the manifest's direct dependencies with the lock file.
    ///
    /// Never touches the network.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest or lock file cannot be read.
    pub fn status(&self) -> Result<WorkspaceStatus, WorkspaceError> {
        let ws = self.workspace()?;
        let manifest = self.manifest()?;
        let lock = self.current_lock(&ws)?;

        let dependencies = manifest
            .git_dependencies()
            .map(|(name, id)| {
                let package = id.package_key();
                let wanted = manifest
                    .overrides
                    .get(&package)
                    .unwrap_or(&id.git_ref);
                let state = match lock.as_ref().and_then(|l| l.get(&package)) {
                    None => LockState::Missing,
                    Some(locked) if &locked.git_ref == wanted => LockState::Locked {
                        commit: locked.commit.clone(),
                    },
                    Some(locked) if is_compatible_upgrade(wanted, &locked.git_ref) => {
                        LockState::Upgraded {
                            locked_ref: locked.git_ref.clone(),
                            commit: locked.commit.clone(),
                        }
                    }
                    Some(locked) => LockState::Stale {
                        locked_ref: locked.git_ref.clone(),
                    },
                };
                DependencyStatus {
                    name: name.clone(),
                    package,
                    requested: wanted.clone(),
                    state,
                }
            })
            .collect();

        Ok(WorkspaceStatus {
            lock_file_present: lock.is_some(),
            dependencies,
        })
    }

    /// Forget the cached manifest so the next access re-reads it.
    pub fn invalidate_manifest(&self) {
        if let Ok(ws) = self.workspace() {
            debug!(path = %ws.manifest_path.display(), "Invalidating manifest");
            self.manifests.invalidate(&ws.manifest_path);
        }
    }

    /// Forget the in-memory lock file so the next access reloads it.
    pub fn invalidate_lock(&self) {
        debug!("Invalidating lock file");
        *guard(&self.lock) = None;
    }

    /// Forget every cached manifest and the lock file.
    pub fn invalidate_all(&self) {
        self.manifests.clear();
        self.invalidate_lock();
        guard(&self.verified).clear();
    }

    /// Remove every cached checkout.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be removed.
    pub fn clear_cache(&self) -> Result<(), WorkspaceError> {
        guard(&self.verified).clear();
        Ok(self.cache.clear_cache()?)
    }
}

/// A newer version with the same major as the requested one.
fn is_compatible_upgrade(requested: &str, locked: &str) -> bool {
    match (ParsedVersion::parse(requested), ParsedVersion::parse(locked)) {
        (Some(r), Some(l)) => r.major == l.major && l.precedence(&r).is_gt(),
        _ => false,
    }
}

fn check_relative(import: &str, rest: &str) -> Result<(), WorkspaceError> {
    let ok = Path::new(rest)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(())
    } else {
        Err(WorkspaceError::InvalidImport {
            import: import.to_string(),
            reason: "path segments must stay inside the target".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictReason;
    use crate::manifest::MANIFEST_FILE;
    use crate::testutil::FakeTransport;
    use std::fs;
    use std::thread;
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        transport: Arc<FakeTransport>,
    }

    impl Fixture {
        fn new(manifest: &str) -> Self {
            let tmp = TempDir::new().unwrap();
            fs::create_dir_all(tmp.path().join("ws")).unwrap();
            fs::write(tmp.path().join("ws").join(MANIFEST_FILE), manifest).unwrap();
            Self {
                tmp,
                transport: Arc::new(FakeTransport::new()),
            }
        }

        fn root(&self) -> PathBuf {
            self.tmp.path().join("ws")
        }

        fn config(&self) -> ResolverConfig {
            ResolverConfig::default()
                .with_cache_dir(self.tmp.path().join("cache"))
                .with_network(true)
                .with_strict_versions(false)
        }

        fn manager(&self) -> WorkspaceManager {
            self.manager_with(self.config())
        }

        fn manager_with(&self, config: ResolverConfig) -> WorkspaceManager {
            let manager = WorkspaceManager::with_transport(config, self.transport.clone());
            manager.initialize(self.root()).unwrap();
            manager
        }
    }

    const DIAMOND: &str = r#"
[model]
name = "app"

[dependencies]
"acme/a" = "v1.0.0"
"acme/b" = "v1.0.0"
"#;

    fn publish_diamond(transport: &FakeTransport, b_wants: &str) {
        transport.tag_package("acme/a", "v1.0.0", "\"acme/shared\" = \"v1.2.0\"\n");
        transport.tag_package("acme/b", "v1.0.0", &format!("\"acme/shared\" = \"{b_wants}\"\n"));
        transport.tag_package("acme/shared", "v1.2.0", "");
        transport.tag_package("acme/shared", b_wants, "");
    }

    #[test]
    fn operations_require_initialization() {
        let fx = Fixture::new("");
        let manager = WorkspaceManager::with_transport(fx.config(), fx.transport.clone());
        assert!(matches!(manager.ensure_lock_file(), Err(WorkspaceError::NotInitialized)));
        assert!(matches!(manager.manifest(), Err(WorkspaceError::NotInitialized)));
    }

    #[test]
    fn initialize_finds_manifest_from_subdirectory() {
        let fx = Fixture::new("");
        let nested = fx.root().join("models/deep");
        fs::create_dir_all(&nested).unwrap();

        let manager = WorkspaceManager::with_transport(fx.config(), fx.transport.clone());
        let ws = manager.initialize(&nested).unwrap();
        assert_eq!(ws.root, fx.root());
        assert_eq!(ws.lock_path, fx.root().join(LOCK_FILE));
        // second call returns the same workspace
        assert!(Arc::ptr_eq(&ws, &manager.initialize(fx.tmp.path()).unwrap()));
    }

    #[test]
    fn concurrent_initialize_reads_manifest_once() {
        let fx = Fixture::new(DIAMOND);
        let manager = Arc::new(WorkspaceManager::with_transport(fx.config(), fx.transport.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let root = fx.root();
                thread::spawn(move || manager.initialize(root).unwrap())
            })
            .collect();
        let roots: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(roots.iter().all(|r| Arc::ptr_eq(r, &roots[0])));
        assert_eq!(manager.manifest_reads(), 1);
    }

    #[test]
    fn failed_initialize_can_be_retried() {
        let fx = Fixture::new("[dependencies]\nbad = { path = \"../../etc\" }\n");
        let manager = WorkspaceManager::with_transport(fx.config(), fx.transport.clone());
        let err = manager.initialize(fx.root()).unwrap_err();
        assert!(matches!(err, WorkspaceError::Manifest(ref e) if e.is_invalid_manifest()));
        assert_eq!(fx.transport.listing_count(), 0);

        fs::write(fx.root().join(MANIFEST_FILE), "").unwrap();
        manager.initialize(fx.root()).unwrap();
    }

    #[test]
    fn latest_wins_is_written_to_lock_file() {
        let fx = Fixture::new(DIAMOND);
        publish_diamond(&fx.transport, "v1.5.0");
        let manager = fx.manager();

        let resolution = manager.resolve().unwrap();
        assert_eq!(resolution.report.auto_resolved.len(), 1);

        let on_disk = LockFile::read(fx.root().join(LOCK_FILE)).unwrap();
        assert_eq!(on_disk.get("acme/shared").unwrap().git_ref, "v1.5.0");
        assert_eq!(on_disk.dependencies.len(), 3);
        assert_eq!(&on_disk, resolution.lock.as_ref());
    }

    #[test]
    fn major_conflict_fails_without_writing_lock() {
        let fx = Fixture::new(DIAMOND);
        publish_diamond(&fx.transport, "v2.0.0");
        let manager = fx.manager();

        let err = manager.resolve().unwrap_err();
        match &err {
            WorkspaceError::Conflict(ConflictError::VersionConflict { reason, requests, .. }) => {
                assert_eq!(*reason, ConflictReason::DifferentMajorVersions);
                let dependents: Vec<&str> = requests
                    .iter()
                    .flat_map(|r| r.dependents.iter().map(String::as_str))
                    .collect();
                assert_eq!(dependents, vec!["acme/a", "acme/b"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!fx.root().join(LOCK_FILE).exists());
    }

    #[test]
    fn override_resolves_major_conflict() {
        let fx = Fixture::new(&format!("{DIAMOND}\n[overrides]\n\"acme/shared\" = \"v2.0.0\"\n"));
        publish_diamond(&fx.transport, "v2.0.0");
        let manager = fx.manager();

        let resolution = manager.resolve().unwrap();
        assert_eq!(resolution.lock.get("acme/shared").unwrap().git_ref, "v2.0.0");
        assert_eq!(resolution.report.overrides.len(), 1);
    }

    #[test]
    fn cycle_fails_resolution() {
        let fx = Fixture::new("[dependencies]\n\"acme/a\" = \"v1.0.0\"\n");
        fx.transport.tag_package("acme/a", "v1.0.0", "\"acme/b\" = \"v1.0.0\"\n");
        fx.transport.tag_package("acme/b", "v1.0.0", "\"acme/c\" = \"v1.0.0\"\n");
        fx.transport.tag_package("acme/c", "v1.0.0", "\"acme/a\" = \"v1.0.0\"\n");
        let manager = fx.manager();

        let err = manager.resolve().unwrap_err();
        assert!(
            err.to_string().contains("acme/a → acme/b → acme/c → acme/a"),
            "{err}"
        );
        assert!(!fx.root().join(LOCK_FILE).exists());
    }

    #[test]
    fn offline_without_lock_file_fails() {
        let fx = Fixture::new(DIAMOND);
        let manager = fx.manager_with(fx.config().with_network(false));
        assert!(matches!(
            manager.ensure_lock_file(),
            Err(WorkspaceError::MissingLockFile { .. })
        ));
    }

    #[test]
    fn second_workspace_load_is_offline_and_checkout_free() {
        let fx = Fixture::new(DIAMOND);
        publish_diamond(&fx.transport, "v1.5.0");
        fx.manager().ensure_lock_file().unwrap();
        let listings = fx.transport.listing_count();
        let checkouts = fx.transport.checkout_count();

        let offline = fx.manager_with(fx.config().with_network(false));
        let entry = offline.resolve_import_entry("acme/a").unwrap();
        assert!(entry.ends_with("index.model"));
        assert_eq!(fx.transport.listing_count(), listings);
        assert_eq!(fx.transport.checkout_count(), checkouts);
    }

    #[test]
    fn tampered_checkout_is_refused() {
        let fx = Fixture::new(DIAMOND);
        publish_diamond(&fx.transport, "v1.5.0");
        let lock = fx.manager().ensure_lock_file().unwrap();
        let locked = lock.get("acme/a").unwrap();
        assert!(locked.integrity.is_some());

        let offline = fx.manager_with(fx.config().with_network(false));
        let id = DependencyIdentifier::parse("acme/a@v1.0.0").unwrap();
        let checkout = offline.cache().checkout_path(&id, &locked.commit);
        fs::write(checkout.join("index.model"), "tampered").unwrap();

        let err = offline.resolve_import_entry("acme/a").unwrap_err();
        assert!(
            matches!(err, WorkspaceError::Cache(CacheError::IntegrityMismatch { .. })),
            "{err}"
        );
    }

    #[test]
    fn unprefixed_remote_tag_stays_locked() {
        let fx = Fixture::new("[dependencies]\n\"acme/a\" = \"v1.2.0\"\n");
        fx.transport.tag_package("acme/a", "1.2.0", "");
        let manager = fx.manager();
        let resolution = manager.resolve().unwrap();
        assert_eq!(resolution.lock.get("acme/a").unwrap().git_ref, "v1.2.0");

        let status = manager.status().unwrap();
        assert!(
            matches!(status.dependencies[0].state, LockState::Locked { .. }),
            "{:?}",
            status.dependencies[0].state
        );
        assert!(status.is_up_to_date());

        let listings = fx.transport.listing_count();
        manager.resolve().unwrap();
        assert_eq!(fx.transport.listing_count(), listings);
    }

    #[test]
    fn unchanged_manifest_is_not_reread() {
        let fx = Fixture::new(DIAMOND);
        publish_diamond(&fx.transport, "v1.5.0");
        let manager = fx.manager();
        let reads = manager.manifest_reads();

        manager.ensure_lock_file().unwrap();
        manager.manifest().unwrap();
        manager.status().unwrap();
        manager.resolve_dependency_import("acme/a").unwrap();
        // Package manifests are read once each during discovery.
        let after_first = manager.manifest_reads();
        manager.resolve().unwrap();
        manager.manifest().unwrap();
        assert_eq!(manager.manifest_reads(), after_first);
        assert!(after_first >= reads);

        manager.invalidate_manifest();
        manager.manifest().unwrap();
        assert_eq!(manager.manifest_reads(), after_first + 1);
    }

    #[test]
    fn invalidate_lock_reloads_from_disk() {
        let fx = Fixture::new(DIAMOND);
        publish_diamond(&fx.transport, "v1.5.0");
        let manager = fx.manager();
        let first = manager.ensure_lock_file().unwrap();
        assert!(Arc::ptr_eq(&first, &manager.ensure_lock_file().unwrap()));

        manager.invalidate_lock();
        let reloaded = manager.ensure_lock_file().unwrap();
        assert!(!Arc::ptr_eq(&first, &reloaded));
        assert_eq!(first, reloaded);
    }

    #[test]
    fn dependency_import_mapping() {
        let fx = Fixture::new(
            r#"
[dependencies]
"acme/models" = "v1.0.0"
shared = { source = "gitlab:group/shared/lib", ref = "main" }
"acme/models/extra" = "acme/extra@v2.0.0"
vendored = { path = "./vendor/x" }
"#,
        );
        let manager = fx.manager();

        let id = manager.resolve_dependency_import("acme/models").unwrap();
        assert_eq!(id.to_string(), "acme/models@v1.0.0");

        let id = manager.resolve_dependency_import("acme/models/domain/core").unwrap();
        assert_eq!(id.subpath.as_deref(), Some("domain/core"));
        assert_eq!(id.to_string(), "acme/models/domain/core@v1.0.0");

        // longest key wins
        let id = manager.resolve_dependency_import("acme/models/extra/x").unwrap();
        assert_eq!(id.package_key(), "acme/extra");
        assert_eq!(id.subpath.as_deref(), Some("x"));

        let id = manager.resolve_dependency_import("shared/types").unwrap();
        assert_eq!(id.to_string(), "gitlab.com/group/shared/lib/types@main");

        assert!(matches!(
            manager.resolve_dependency_import("vendored"),
            Err(WorkspaceError::LocalDependency { .. })
        ));
        assert!(matches!(
            manager.resolve_dependency_import("acme/unknown"),
            Err(WorkspaceError::UnknownDependency { .. })
        ));
        assert!(matches!(
            manager.resolve_dependency_import("acme/models/../secret"),
            Err(WorkspaceError::InvalidImport { .. })
        ));
        // a key that is only a string prefix does not match
        assert!(matches!(
            manager.resolve_dependency_import("acme/modelsx"),
            Err(WorkspaceError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn path_alias_mapping() {
        let fx = Fixture::new("[paths]\n\"@common\" = \"models/common\"\n");
        let manager = fx.manager();

        assert_eq!(
            manager.resolve_path_alias("@common/types.model").unwrap(),
            fx.root().join("models/common/types.model")
        );
        assert_eq!(
            manager.resolve_path_alias("@common").unwrap(),
            fx.root().join("models/common")
        );
        assert!(matches!(
            manager.resolve_path_alias("@other/x"),
            Err(WorkspaceError::UnknownPathAlias { .. })
        ));
        assert!(matches!(
            manager.resolve_path_alias("@common/../../etc"),
            Err(WorkspaceError::InvalidImport { .. })
        ));
    }

    #[test]
    fn dependency_tree_marks_repeats() {
        let fx = Fixture::new(DIAMOND);
        publish_diamond(&fx.transport, "v1.5.0");
        let manager = fx.manager();

        let tree = manager.dependency_tree().unwrap();
        assert_eq!(tree.name, "app");
        assert_eq!(tree.children.len(), 2);
        assert!(!tree.children[0].children[0].repeated);
        assert!(tree.children[1].children[0].repeated);

        let rendered = tree.to_string();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "app");
        assert!(lines[1].starts_with("├── acme/a v1.0.0 ("));
        assert!(lines[2].starts_with("│   └── acme/shared v1.5.0 ("));
        assert!(lines[3].starts_with("└── acme/b v1.0.0 ("));
        assert!(lines[4].starts_with("    └── acme/shared v1.5.0 ("));
        assert!(lines[4].ends_with("(*)"));
    }

    #[test]
    fn status_reports_lock_state() {
        let fx = Fixture::new(DIAMOND);
        publish_diamond(&fx.transport, "v1.5.0");
        let manager = fx.manager();

        let status = manager.status().unwrap();
        assert!(!status.lock_file_present);
        assert!(status.dependencies.iter().all(|d| d.state == LockState::Missing));

        manager.resolve().unwrap();
        assert!(manager.status().unwrap().is_up_to_date());

        fs::write(
            fx.root().join(MANIFEST_FILE),
            format!("{DIAMOND}\"acme/c\" = \"v1.0.0\"\n").replace(
                "\"acme/a\" = \"v1.0.0\"",
                "\"acme/a\" = \"v1.1.0\"",
            ),
        )
        .unwrap();
        let status = manager.status().unwrap();
        let by_name = |name: &str| {
            status
                .dependencies
                .iter()
                .find(|d| d.name == name)
                .unwrap()
                .state
                .clone()
        };
        assert_eq!(
            by_name("acme/a"),
            LockState::Stale {
                locked_ref: "v1.0.0".to_string()
            }
        );
        assert_eq!(by_name("acme/c"), LockState::Missing);
        assert!(!status.is_up_to_date());
    }

    #[test]
    fn compatible_upgrade_detection() {
        assert!(is_compatible_upgrade("v1.2.0", "v1.5.0"));
        assert!(!is_compatible_upgrade("v1.5.0", "v1.2.0"));
        assert!(!is_compatible_upgrade("v1.2.0", "v2.0.0"));
        assert!(!is_compatible_upgrade("main", "v1.0.0"));
    }

    #[test]
    fn cancelled_resolution_leaves_no_lock() {
        let fx = Fixture::new(DIAMOND);
        publish_diamond(&fx.transport, "v1.5.0");
        let token = CancellationToken::new();
        let manager = WorkspaceManager::with_transport(fx.config(), fx.transport.clone())
            .with_cancellation_token(token.clone());
        manager.initialize(fx.root()).unwrap();

        token.cancel();
        assert!(matches!(
            manager.resolve(),
            Err(WorkspaceError::Graph(GraphError::Cancelled))
        ));
        assert!(!fx.root().join(LOCK_FILE).exists());
    }
}
