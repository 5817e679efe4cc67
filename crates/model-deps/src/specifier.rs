//! Dependency specifiers: parsing `owner/repo@ref` strings and git URLs.
//!
//! Supported forms:
//! - `owner/repo` and `owner/repo@v1.0.0` (GitHub shorthand)
//! - `owner/repo/models/core@main` (with a subpath inside the repository)
//! - `github:owner/repo`, `gitlab:group/repo`, `bitbucket:team/repo`
//! - `gitlab.example.com/group/repo@v2.0.0`
//! - `https://github.com/owner/repo.git@v1.0.0`
//! - `git@gitlab.com:group/repo.git@main`
//!
//! Detection is purely textual; no network access happens here.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Ref used when a specifier does not name one.
pub const DEFAULT_REF: &str = "main";

/// Errors produced while parsing a specifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecifierError {
    /// The string is not a recognizable git specifier.
    #[error("invalid dependency specifier '{specifier}': {reason}")]
    Invalid { specifier: String, reason: String },
}

impl SpecifierError {
    fn invalid(specifier: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            specifier: specifier.to_string(),
            reason: reason.into(),
        }
    }
}

/// Git hosting platform, detected from the host name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Platform {
    GitHub,
    GitLab,
    Bitbucket,
    /// Any other git host, keyed by its host name.
    Generic(String),
}

impl Platform {
    /// Classify a host name.
    #[must_use]
    pub fn from_host(host: &str) -> Self {
        let host = host.to_ascii_lowercase();
        if host.contains("github") {
            Self::GitHub
        } else if host.contains("gitlab") {
            Self::GitLab
        } else if host.contains("bitbucket") {
            Self::Bitbucket
        } else {
            Self::Generic(host)
        }
    }

    /// Directory name used for this platform in the checkout cache.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
            Self::Bitbucket => "bitbucket",
            Self::Generic(host) => host,
        }
    }

    fn default_host(&self) -> &str {
        match self {
            Self::GitHub => "github.com",
            Self::GitLab => "gitlab.com",
            Self::Bitbucket => "bitbucket.org",
            Self::Generic(host) => host,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a ref string is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefType {
    Tag,
    Branch,
    Commit,
}

impl RefType {
    /// Returns the ref type as a string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tag => "tag",
            Self::Branch => "branch",
            Self::Commit => "commit",
        }
    }
}

impl fmt::Display for RefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RefType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tag" => Ok(Self::Tag),
            "branch" => Ok(Self::Branch),
            "commit" => Ok(Self::Commit),
            other => Err(format!("unknown ref type '{other}'")),
        }
    }
}

/// A parsed dependency specifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyIdentifier {
    /// Hosting platform.
    pub platform: Platform,
    /// Host name the repository lives on.
    pub host: String,
    /// Repository owner (user, organization or group).
    pub owner: String,
    /// Repository name, without a `.git` suffix.
    pub repo: String,
    /// Requested ref (tag, branch or commit).
    pub git_ref: String,
    /// Path inside the repository, if any.
    pub subpath: Option<String>,
}

impl DependencyIdentifier {
    /// Parse a specifier string.
    ///
    /// # Errors
    ///
    /// Returns [`SpecifierError::Invalid`] if the string is neither GitHub
    /// shorthand nor a recognized git URL.
    pub fn parse(specifier: &str) -> Result<Self, SpecifierError> {
        parse_specifier(specifier)
    }

    /// Canonical `owner/repo` key identifying this package in a graph.
    #[must_use]
    pub fn package_key(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// HTTPS clone URL of the repository.
    #[must_use]
    pub fn repo_url(&self) -> String {
        format!("https://{}/{}/{}.git", self.host, self.owner, self.repo)
    }

    /// Classification of the requested ref.
    #[must_use]
    pub fn ref_type(&self) -> RefType {
        detect_ref_type(&self.git_ref)
    }

    /// Same repository and subpath, different ref.
    #[must_use]
    pub fn with_ref(&self, git_ref: impl Into<String>) -> Self {
        Self {
            git_ref: git_ref.into(),
            ..self.clone()
        }
    }

    /// Same repository and ref, without a subpath.
    #[must_use]
    pub fn without_subpath(&self) -> Self {
        Self {
            subpath: None,
            ..self.clone()
        }
    }
}

impl fmt::Display for DependencyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.platform != Platform::GitHub || self.host != "github.com" {
            write!(f, "{}/", self.host)?;
        }
        write!(f, "{}/{}", self.owner, self.repo)?;
        if let Some(ref subpath) = self.subpath {
            write!(f, "/{subpath}")?;
        }
        write!(f, "@{}", self.git_ref)
    }
}

/// Returns true if `s` looks like a git specifier rather than a local path.
///
/// This never fails; callers use it to decide whether [`parse_specifier`]
/// applies at all.
#[must_use]
pub fn is_git_specifier(s: &str) -> bool {
    let s = s.trim();
    if s.is_empty() || is_local_path(s) {
        return false;
    }

    if URL_SCHEMES.iter().any(|scheme| s.starts_with(scheme))
        || PLATFORM_PREFIXES.iter().any(|(p, _)| s.starts_with(p))
        || s.starts_with("git@")
    {
        return true;
    }

    let path = s.rfind('@').map_or(s, |at| &s[..at]);
    let mut segments = path.split('/');
    let first = segments.next().unwrap_or_default();
    let second = segments.next().unwrap_or_default();
    if first.contains('.') {
        // `host/owner/repo`
        let third = segments.next().unwrap_or_default();
        return is_valid_name(second) && is_valid_name(strip_git_suffix(third));
    }
    is_valid_name(first) && is_valid_name(strip_git_suffix(second))
}

/// Returns true for strings that can only be filesystem paths.
pub(crate) fn is_local_path(s: &str) -> bool {
    if s.starts_with("./")
        || s.starts_with("../")
        || s.starts_with('/')
        || s.starts_with('~')
        || s.starts_with('\\')
        || s == "."
        || s == ".."
    {
        return true;
    }
    // Windows drive letters
    let bytes = s.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

const URL_SCHEMES: [&str; 4] = ["https://", "http://", "ssh://", "git://"];

const PLATFORM_PREFIXES: [(&str, &str); 3] = [
    ("github:", "github.com"),
    ("gitlab:", "gitlab.com"),
    ("bitbucket:", "bitbucket.org"),
];

/// Parse a specifier into its components.
///
/// # Errors
///
/// Returns [`SpecifierError::Invalid`] describing the first problem found.
pub fn parse_specifier(specifier: &str) -> Result<DependencyIdentifier, SpecifierError> {
    let trimmed = specifier.trim();
    if trimmed.is_empty() {
        return Err(SpecifierError::invalid(specifier, "specifier is empty"));
    }
    if !is_git_specifier(trimmed) {
        return Err(SpecifierError::invalid(
            specifier,
            "expected 'owner/repo[@ref]' or a git repository URL",
        ));
    }

    let (host, rest) = split_host(specifier, trimmed)?;

    let (path, git_ref) = match rest.rfind('@') {
        Some(at) => {
            let git_ref = &rest[at + 1..];
            if git_ref.is_empty() {
                return Err(SpecifierError::invalid(
                    specifier,
                    "ref after '@' cannot be empty",
                ));
            }
            (&rest[..at], git_ref.to_string())
        }
        None => (rest, DEFAULT_REF.to_string()),
    };

    let path = path.trim_end_matches('/');
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() < 2 {
        return Err(SpecifierError::invalid(
            specifier,
            "expected format 'owner/repo'",
        ));
    }
    if segments.iter().any(|s| s.is_empty()) {
        return Err(SpecifierError::invalid(specifier, "empty path segment"));
    }

    let owner = segments[0];
    let repo = strip_git_suffix(segments[1]);
    if !is_valid_name(owner) {
        return Err(SpecifierError::invalid(
            specifier,
            format!("invalid owner name '{owner}'"),
        ));
    }
    if !is_valid_name(repo) {
        return Err(SpecifierError::invalid(
            specifier,
            format!("invalid repository name '{repo}'"),
        ));
    }

    let subpath = if segments.len() > 2 {
        let sub = &segments[2..];
        if sub.iter().any(|s| *s == ".." || *s == ".") {
            return Err(SpecifierError::invalid(
                specifier,
                "subpath cannot contain '.' or '..' segments",
            ));
        }
        Some(sub.join("/"))
    } else {
        None
    };

    Ok(DependencyIdentifier {
        platform: Platform::from_host(&host),
        host,
        owner: owner.to_string(),
        repo: repo.to_string(),
        git_ref,
        subpath,
    })
}

/// Split a specifier into its host and the `owner/repo…` remainder.
fn split_host<'a>(
    original: &str,
    spec: &'a str,
) -> Result<(String, &'a str), SpecifierError> {
    for scheme in URL_SCHEMES {
        if let Some(rest) = spec.strip_prefix(scheme) {
            let slash = rest.find('/').ok_or_else(|| {
                SpecifierError::invalid(original, "URL is missing a repository path")
            })?;
            let authority = &rest[..slash];
            // Drop `user@` credentials and any port.
            let host = authority.rsplit('@').next().unwrap_or(authority);
            let host = host.split(':').next().unwrap_or(host);
            if host.is_empty() {
                return Err(SpecifierError::invalid(original, "URL has no host"));
            }
            return Ok((host.to_ascii_lowercase(), &rest[slash + 1..]));
        }
    }

    if let Some(rest) = spec.strip_prefix("git@") {
        let colon = rest.find(':').ok_or_else(|| {
            SpecifierError::invalid(original, "expected 'git@host:owner/repo'")
        })?;
        return Ok((rest[..colon].to_ascii_lowercase(), &rest[colon + 1..]));
    }

    for (prefix, host) in PLATFORM_PREFIXES {
        if let Some(rest) = spec.strip_prefix(prefix) {
            return Ok((host.to_string(), rest));
        }
    }

    let first = spec.split('/').next().unwrap_or_default();
    if first.contains('.') {
        let rest = &spec[first.len()..];
        return Ok((first.to_ascii_lowercase(), rest.trim_start_matches('/')));
    }

    Ok((Platform::GitHub.default_host().to_string(), spec))
}

/// Returns the ref written after `@` in a specifier, if there is one.
#[must_use]
pub fn explicit_ref(specifier: &str) -> Option<&str> {
    let trimmed = specifier.trim();
    let (_, rest) = split_host(specifier, trimmed).ok()?;
    rest.rfind('@')
        .map(|at| &rest[at + 1..])
        .filter(|r| !r.is_empty())
}

fn strip_git_suffix(name: &str) -> &str {
    name.strip_suffix(".git").unwrap_or(name)
}

/// Check if a string is a valid owner or repository name.
fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 100 {
        return false;
    }
    if name.starts_with('-') || name.starts_with('.') {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Classify a ref string.
///
/// A 7–40 character hex string is a commit, a ref starting with an
/// optionally `v`-prefixed `N.N.N` is a tag, anything else is a branch.
/// `1.0.0-beta` classifies as a tag even though strict version parsing may
/// treat it differently.
#[must_use]
pub fn detect_ref_type(git_ref: &str) -> RefType {
    if looks_like_commit(git_ref) {
        return RefType::Commit;
    }
    if starts_with_version_triple(git_ref.strip_prefix('v').unwrap_or(git_ref)) {
        return RefType::Tag;
    }
    RefType::Branch
}

/// Returns true for 7–40 character hex strings.
#[must_use]
pub fn looks_like_commit(s: &str) -> bool {
    (7..=40).contains(&s.len()) && s.bytes().all(|c| c.is_ascii_hexdigit())
}

/// Returns true for a complete 40 character commit hash.
#[must_use]
pub fn is_full_commit(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|c| c.is_ascii_hexdigit())
}

fn starts_with_version_triple(s: &str) -> bool {
    let mut rest = s;
    for i in 0..3 {
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return false;
        }
        rest = &rest[digits..];
        if i < 2 {
            match rest.strip_prefix('.') {
                Some(r) => rest = r,
                None => return false,
            }
        }
    }
    true
}
