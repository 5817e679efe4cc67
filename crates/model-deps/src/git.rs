//! Access to remote git repositories.
//!
//! [`GitTransport`] is the seam between resolution and the network. The
//! production implementation, [`GitCli`], shells out to the `git` binary.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::debug;

/// Errors from git operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// The git program could not be started.
    #[error("failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// git ran but reported failure.
    #[error("git {command} failed for '{url}': {stderr}")]
    Command {
        command: String,
        url: String,
        stderr: String,
    },

    /// Filesystem error around a checkout.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A ref advertised by a remote repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRef {
    /// Full ref name, e.g. `refs/tags/v1.0.0` or `HEAD`.
    pub name: String,
    /// Commit the ref points at.
    pub commit: String,
}

impl RemoteRef {
    /// Create a remote ref.
    pub fn new(name: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commit: commit.into(),
        }
    }
}

/// Network access to git repositories.
pub trait GitTransport: Send + Sync {
    /// List the refs a remote advertises.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote cannot be queried.
    fn list_remote_refs(&self, url: &str) -> Result<Vec<RemoteRef>, GitError>;

    /// Materialize the tree of `commit` into `dest`.
    ///
    /// `dest` does not exist when this is called. On success it contains the
    /// working tree only, with no version-control metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository or commit cannot be fetched.
    fn checkout(&self, url: &str, commit: &str, dest: &Path) -> Result<(), GitError>;
}

/// [`GitTransport`] backed by the `git` command-line program.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitCli {
    /// Use the given git executable.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run<I, S>(&self, command: &str, url: &str, args: I) -> Result<String, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = Command::new(&self.program)
            .args(args)
            // never block on a credential prompt
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .map_err(|source| GitError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(GitError::Command {
                command: command.to_string(),
                url: url.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl GitTransport for GitCli {
    fn list_remote_refs(&self, url: &str) -> Result<Vec<RemoteRef>, GitError> {
        debug!(url, "Listing remote refs");
        let stdout = self.run("ls-remote", url, ["ls-remote", url])?;
        Ok(parse_ls_remote(&stdout))
    }

    fn checkout(&self, url: &str, commit: &str, dest: &Path) -> Result<(), GitError> {
        debug!(url, commit, dest = %dest.display(), "Shallow checkout");
        let dest_os = dest.as_os_str();

        self.run(
            "clone",
            url,
            [
                OsStr::new("clone"),
                OsStr::new("--quiet"),
                OsStr::new("--depth"),
                OsStr::new("1"),
                OsStr::new("--no-checkout"),
                OsStr::new(url),
                dest_os,
            ],
        )?;
        self.run(
            "fetch",
            url,
            [
                OsStr::new("-C"),
                dest_os,
                OsStr::new("fetch"),
                OsStr::new("--quiet"),
                OsStr::new("--depth"),
                OsStr::new("1"),
                OsStr::new("origin"),
                OsStr::new(commit),
            ],
        )?;
        self.run(
            "checkout",
            url,
            [
                OsStr::new("-C"),
                dest_os,
                OsStr::new("checkout"),
                OsStr::new("--quiet"),
                OsStr::new("--detach"),
                OsStr::new(commit),
            ],
        )?;

        let git_dir = dest.join(".git");
        if git_dir.exists() {
            fs::remove_dir_all(git_dir)?;
        }
        Ok(())
    }
}

/// Parse `git ls-remote` output (`<sha>\t<ref>` per line).
#[must_use]
pub fn parse_ls_remote(output: &str) -> Vec<RemoteRef> {
    output
        .lines()
        .filter_map(|line| {
            let (commit, name) = line.trim().split_once(char::is_whitespace)?;
            let name = name.trim();
            if commit.is_empty() || name.is_empty() {
                return None;
            }
            Some(RemoteRef::new(name, commit))
        })
        .collect()
}
