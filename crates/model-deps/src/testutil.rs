//! In-memory git remotes for tests.

use crate::git::{GitError, GitTransport, RemoteRef};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct FakeRemote {
    refs: Vec<RemoteRef>,
    trees: HashMap<String, BTreeMap<String, String>>,
}

/// A [`GitTransport`] serving scripted repositories from memory.
///
/// Repositories are addressed by `owner/repo` and served at the GitHub
/// HTTPS URL a shorthand specifier resolves to.
#[derive(Debug, Default)]
pub(crate) struct FakeTransport {
    remotes: Mutex<HashMap<String, FakeRemote>>,
    checkouts: AtomicUsize,
    listings: AtomicUsize,
}

pub(crate) fn url_for(package_key: &str) -> String {
    format!("https://github.com/{package_key}.git")
}

/// Deterministic 40-hex commit id for a package at a ref.
pub(crate) fn commit_for(package_key: &str, git_ref: &str) -> String {
    let digest = Sha256::digest(format!("{package_key}@{git_ref}").as_bytes());
    hex::encode(digest)[..40].to_string()
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Publish a tag whose tree holds `files`. Returns the tagged commit.
    pub(crate) fn tag(&self, package_key: &str, tag: &str, files: &[(&str, &str)]) -> String {
        self.publish(package_key, &format!("refs/tags/{tag}"), tag, files)
    }

    /// Publish a tagged package with an entry file and the given
    /// `[dependencies]` lines.
    pub(crate) fn tag_package(&self, package_key: &str, tag: &str, deps: &str) -> String {
        let manifest = format!("[dependencies]\n{deps}");
        self.tag(
            package_key,
            tag,
            &[("model.toml", &manifest), ("index.model", "model {}\n")],
        )
    }

    /// Publish an annotated tag: the tag object and the peeled commit differ.
    pub(crate) fn annotated_tag(
        &self,
        package_key: &str,
        tag: &str,
        files: &[(&str, &str)],
    ) -> String {
        let commit = commit_for(package_key, tag);
        let tag_object = commit_for(package_key, &format!("{tag}^tag-object"));
        let mut remotes = self.remotes.lock().unwrap();
        let remote = remotes.entry(url_for(package_key)).or_default();
        remote
            .refs
            .push(RemoteRef::new(format!("refs/tags/{tag}"), tag_object));
        remote
            .refs
            .push(RemoteRef::new(format!("refs/tags/{tag}^{{}}"), commit.clone()));
        remote.trees.insert(commit.clone(), tree(files));
        commit
    }

    /// Publish a branch head. Returns the head commit.
    pub(crate) fn branch(&self, package_key: &str, branch: &str, files: &[(&str, &str)]) -> String {
        self.publish(package_key, &format!("refs/heads/{branch}"), branch, files)
    }

    /// Register a repository that advertises no refs at all.
    pub(crate) fn empty_repo(&self, package_key: &str) {
        self.remotes
            .lock()
            .unwrap()
            .entry(url_for(package_key))
            .or_default();
    }

    fn publish(&self, package_key: &str, ref_name: &str, short: &str, files: &[(&str, &str)]) -> String {
        let commit = commit_for(package_key, short);
        let mut remotes = self.remotes.lock().unwrap();
        let remote = remotes.entry(url_for(package_key)).or_default();
        remote.refs.push(RemoteRef::new(ref_name, commit.clone()));
        if ref_name == "refs/heads/main" {
            remote.refs.push(RemoteRef::new("HEAD", commit.clone()));
        }
        remote.trees.insert(commit.clone(), tree(files));
        commit
    }

    pub(crate) fn checkout_count(&self) -> usize {
        self.checkouts.load(Ordering::SeqCst)
    }

    pub(crate) fn listing_count(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }
}

fn tree(files: &[(&str, &str)]) -> BTreeMap<String, String> {
    files
        .iter()
        .map(|(path, contents)| ((*path).to_string(), (*contents).to_string()))
        .collect()
}

impl GitTransport for FakeTransport {
    fn list_remote_refs(&self, url: &str) -> Result<Vec<RemoteRef>, GitError> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        let remotes = self.remotes.lock().unwrap();
        remotes
            .get(url)
            .map(|remote| remote.refs.clone())
            .ok_or_else(|| GitError::Command {
                command: "ls-remote".to_string(),
                url: url.to_string(),
                stderr: "repository not found".to_string(),
            })
    }

    fn checkout(&self, url: &str, commit: &str, dest: &Path) -> Result<(), GitError> {
        self.checkouts.fetch_add(1, Ordering::SeqCst);
        let files = {
            let remotes = self.remotes.lock().unwrap();
            remotes
                .get(url)
                .and_then(|remote| remote.trees.get(commit))
                .cloned()
                .ok_or_else(|| GitError::Command {
                    command: "fetch".to_string(),
                    url: url.to_string(),
                    stderr: format!("couldn't find remote ref {commit}"),
                })?
        };

        fs::create_dir_all(dest)?;
        for (path, contents) in files {
            let target = dest.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(target, contents)?;
        }
        Ok(())
    }
}
