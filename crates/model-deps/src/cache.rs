//! Content-addressed checkout cache.
//!
//! Every checkout lives at `<root>/<platform>/<owner>/<repo>/<commit>/`.
//! A commit never changes, so a directory that exists is always valid and
//! nothing is evicted automatically.

use crate::git::{GitError, GitTransport, RemoteRef};
use crate::manifest::{ManifestError, ManifestStore, DEFAULT_ENTRY_FILE};
use crate::specifier::{detect_ref_type, is_full_commit, DependencyIdentifier, RefType};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Prefix of integrity strings.
pub const INTEGRITY_PREFIX: &str = "sha256-";

/// Errors from cache operations and ref resolution.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The ref does not name anything the remote advertises.
    #[error("cannot resolve '{git_ref}' for '{package}': {reason}")]
    UnresolvableRef {
        package: String,
        git_ref: String,
        reason: String,
    },

    /// The checkout has no usable entry file.
    #[error("no entry file for '{package}' at {commit}: looked for {}", .searched.join(", "))]
    EntryPointNotFound {
        package: String,
        commit: String,
        searched: Vec<String>,
    },

    /// The operation needs the network but it is disabled.
    #[error("'{package}' is not available offline (needs {operation})")]
    Offline { package: String, operation: String },

    /// A checkout no longer matches its recorded digest.
    #[error("integrity mismatch for '{package}': expected {expected}, found {actual}")]
    IntegrityMismatch {
        package: String,
        expected: String,
        actual: String,
    },
}

/// Outcome of resolving a ref against a remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommit {
    /// The ref as found on the remote; may differ from the request by a `v` prefix.
    pub git_ref: String,
    /// How the ref was matched.
    pub ref_type: RefType,
    /// Full commit hash.
    pub commit: String,
}

/// On-disk cache of repository checkouts.
pub struct RepositoryCache {
    root: PathBuf,
    transport: Arc<dyn GitTransport>,
    manifests: Arc<ManifestStore>,
    allow_network: bool,
    checkouts: AtomicUsize,
}

impl std::fmt::Debug for RepositoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryCache")
            .field("root", &self.root)
            .field("allow_network", &self.allow_network)
            .finish_non_exhaustive()
    }
}

static STAGING_COUNTER: AtomicUsize = AtomicUsize::new(0);

impl RepositoryCache {
    /// Create a cache rooted at `root` that fetches through `transport`.
    pub fn new(root: impl Into<PathBuf>, transport: Arc<dyn GitTransport>) -> Self {
        Self {
            root: root.into(),
            transport,
            manifests: Arc::new(ManifestStore::new()),
            allow_network: true,
            checkouts: AtomicUsize::new(0),
        }
    }

    /// Share a manifest store with other components.
    #[must_use]
    pub fn with_manifest_store(mut self, manifests: Arc<ManifestStore>) -> Self {
        self.manifests = manifests;
        self
    }

    /// Enable or disable network access.
    #[must_use]
    pub fn with_network(mut self, allow_network: bool) -> Self {
        self.allow_network = allow_network;
        self
    }

    /// The cache root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The manifest store used for package manifests.
    #[must_use]
    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// Whether remote operations are permitted.
    #[must_use]
    pub fn allows_network(&self) -> bool {
        self.allow_network
    }

    /// Number of checkouts this cache has performed.
    #[must_use]
    pub fn checkout_count(&self) -> usize {
        self.checkouts.load(Ordering::Relaxed)
    }

    /// Directory a commit of a repository is checked out to.
    #[must_use]
    pub fn checkout_path(&self, id: &DependencyIdentifier, commit: &str) -> PathBuf {
        self.root
            .join(id.platform.as_str())
            .join(&id.owner)
            .join(&id.repo)
            .join(commit)
    }

    /// Returns true if the commit is already checked out.
    #[must_use]
    pub fn is_cached(&self, id: &DependencyIdentifier, commit: &str) -> bool {
        self.checkout_path(id, commit).is_dir()
    }

    /// Make sure a commit is checked out, fetching it on a miss.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkout is missing and cannot be fetched.
    pub fn ensure_checkout(&self, id: &DependencyIdentifier, commit: &str) -> Result<PathBuf, CacheError> {
        let dest = self.checkout_path(id, commit);
        if dest.is_dir() {
            debug!(package = %id.package_key(), commit, "Cache hit");
            return Ok(dest);
        }
        if !self.allow_network {
            return Err(CacheError::Offline {
                package: id.package_key(),
                operation: format!("checkout of {commit}"),
            });
        }

        let parent = dest
            .parent()
            .map_or_else(|| self.root.clone(), Path::to_path_buf);
        fs::create_dir_all(&parent)?;

        let staging = parent.join(format!(
            ".{commit}.tmp-{}-{}",
            std::process::id(),
            STAGING_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }

        info!(package = %id.package_key(), commit, "Fetching");
        self.checkouts.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.transport.checkout(&id.repo_url(), commit, &staging) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e.into());
        }

        match fs::rename(&staging, &dest) {
            Ok(()) => {}
            Err(_) if dest.is_dir() => {
                // Another process finished the same commit first.
                debug!(package = %id.package_key(), commit, "Checkout already present");
                let _ = fs::remove_dir_all(&staging);
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(e.into());
            }
        }
        Ok(dest)
    }

    /// Resolve the identifier's ref to a full commit hash.
    ///
    /// A full hash resolves without network access. Anything else is looked
    /// up in the remote's advertised refs.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::UnresolvableRef`] if the remote has no matching
    /// ref, or a git error if the remote cannot be listed.
    pub fn resolve_commit(&self, id: &DependencyIdentifier) -> Result<ResolvedCommit, CacheError> {
        let git_ref = id.git_ref.as_str();
        if is_full_commit(git_ref) {
            return Ok(ResolvedCommit {
                git_ref: git_ref.to_string(),
                ref_type: RefType::Commit,
                commit: git_ref.to_ascii_lowercase(),
            });
        }
        if !self.allow_network {
            return Err(CacheError::Offline {
                package: id.package_key(),
                operation: format!("lookup of '{git_ref}'"),
            });
        }

        let refs = self.transport.list_remote_refs(&id.repo_url())?;
        let unresolvable = |reason: String| CacheError::UnresolvableRef {
            package: id.package_key(),
            git_ref: git_ref.to_string(),
            reason,
        };
        if refs.is_empty() {
            return Err(unresolvable("the remote advertises no refs".to_string()));
        }

        let found = match detect_ref_type(git_ref) {
            RefType::Tag => find_tag(&refs, git_ref)
                .or_else(|| find_tag(&refs, &toggle_v_prefix(git_ref)))
                .or_else(|| find_branch(&refs, git_ref)),
            RefType::Branch => find_branch(&refs, git_ref).or_else(|| find_tag(&refs, git_ref)),
            RefType::Commit => find_branch(&refs, git_ref)
                .or_else(|| find_tag(&refs, git_ref))
                .map_or_else(|| find_commit_prefix(&refs, git_ref), |r| Ok(Some(r)))
                .map_err(unresolvable)?,
        };

        let resolved = found.ok_or_else(|| unresolvable("no matching tag, branch or commit".to_string()))?;
        debug!(
            package = %id.package_key(),
            git_ref,
            commit = %resolved.commit,
            "Resolved ref"
        );
        Ok(resolved)
    }

    /// Find the entry file of a package at a commit, checking it out if needed.
    ///
    /// With a subpath, a file is returned as is and a directory is searched
    /// like a package root. A package root uses its manifest's `entry` (or
    /// `main`), falling back to [`DEFAULT_ENTRY_FILE`].
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::EntryPointNotFound`] if no entry file exists.
    pub fn resolve_entry_point(&self, id: &DependencyIdentifier, commit: &str) -> Result<PathBuf, CacheError> {
        let checkout = self.ensure_checkout(id, commit)?;
        let not_found = |searched: Vec<String>| CacheError::EntryPointNotFound {
            package: id.package_key(),
            commit: commit.to_string(),
            searched,
        };

        let package_root = match id.subpath.as_deref() {
            Some(sub) => {
                let target = checkout.join(sub);
                if target.is_file() {
                    return Ok(target);
                }
                if !target.is_dir() {
                    return Err(not_found(vec![sub.to_string()]));
                }
                target
            }
            None => checkout,
        };

        let candidate = match self.manifests.load_package(&package_root)? {
            Some(manifest) => manifest.entry().unwrap_or(DEFAULT_ENTRY_FILE).to_string(),
            None => DEFAULT_ENTRY_FILE.to_string(),
        };
        let is_contained = Path::new(&candidate)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        let entry = package_root.join(&candidate);
        if is_contained && entry.is_file() {
            Ok(entry)
        } else {
            Err(not_found(vec![candidate]))
        }
    }

    /// Digest of a checkout, as `sha256-<hex>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkout cannot be fetched or read.
    pub fn integrity(&self, id: &DependencyIdentifier, commit: &str) -> Result<String, CacheError> {
        let dir = self.ensure_checkout(id, commit)?;
        Ok(format!("{INTEGRITY_PREFIX}{}", dir_checksum_sha256(&dir)?))
    }

    /// Check a checkout against a recorded digest.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::IntegrityMismatch`] if the digests differ.
    pub fn verify_integrity(
        &self,
        id: &DependencyIdentifier,
        commit: &str,
        expected: &str,
    ) -> Result<(), CacheError> {
        let actual = self.integrity(id, commit)?;
        if actual == expected {
            Ok(())
        } else {
            Err(CacheError::IntegrityMismatch {
                package: id.package_key(),
                expected: expected.to_string(),
                actual,
            })
        }
    }

    /// Remove every checkout.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be removed.
    pub fn clear_cache(&self) -> Result<(), CacheError> {
        if self.root.exists() {
            info!(root = %self.root.display(), "Clearing repository cache");
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}

fn find_tag(refs: &[RemoteRef], tag: &str) -> Option<ResolvedCommit> {
    let name = format!("refs/tags/{tag}");
    let peeled = format!("{name}^{{}}");
    refs.iter()
        .find(|r| r.name == peeled)
        .or_else(|| refs.iter().find(|r| r.name == name))
        .map(|r| ResolvedCommit {
            git_ref: tag.to_string(),
            ref_type: RefType::Tag,
            commit: r.commit.to_ascii_lowercase(),
        })
}

fn find_branch(refs: &[RemoteRef], branch: &str) -> Option<ResolvedCommit> {
    let name = if branch == "HEAD" {
        "HEAD".to_string()
    } else {
        format!("refs/heads/{branch}")
    };
    refs.iter().find(|r| r.name == name).map(|r| ResolvedCommit {
        git_ref: branch.to_string(),
        ref_type: RefType::Branch,
        commit: r.commit.to_ascii_lowercase(),
    })
}

/// Match an abbreviated hash against advertised commits.
fn find_commit_prefix(refs: &[RemoteRef], prefix: &str) -> Result<Option<ResolvedCommit>, String> {
    let prefix = prefix.to_ascii_lowercase();
    let mut matches: Vec<String> = refs
        .iter()
        .map(|r| r.commit.to_ascii_lowercase())
        .filter(|c| c.starts_with(&prefix))
        .collect();
    matches.sort();
    matches.dedup();

    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop().map(|commit| ResolvedCommit {
            git_ref: prefix.clone(),
            ref_type: RefType::Commit,
            commit,
        })),
        n => Err(format!(
            "abbreviated hash is ambiguous ({n} advertised commits match); use the full hash"
        )),
    }
}

fn toggle_v_prefix(tag: &str) -> String {
    match tag.strip_prefix('v') {
        Some(bare) => bare.to_string(),
        None => format!("v{tag}"),
    }
}

/// SHA-256 over a checkout's files, in sorted relative-path order.
///
/// Each file contributes its `/`-separated path and its contents, both
/// prefixed with their byte length so no two trees share a framing.
fn dir_checksum_sha256(dir: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    for (rel, path) in tree_files(dir)? {
        let mut file = File::open(&path)?;
        let len = file.metadata()?.len();
        hasher.update((rel.len() as u64).to_le_bytes());
        hasher.update(rel.as_bytes());
        hasher.update(len.to_le_bytes());
        let copied = io::copy(&mut (&mut file).take(len), &mut hasher)?;
        if copied != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} changed while hashing", path.display()),
            ));
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Regular files under `root`, keyed by their `/`-separated relative path.
fn tree_files(root: &Path) -> io::Result<BTreeMap<String, PathBuf>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let Ok(rel) = path.strip_prefix(root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                files.insert(key, path);
            }
        }
    }
    Ok(files)
}
