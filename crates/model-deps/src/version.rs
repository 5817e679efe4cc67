//! Version handling for tag refs.
//!
//! Tags are compared as strict `major.minor.patch[-prerelease]` versions
//! with an optional leading `v`. Anything else (two-part versions, build
//! metadata, branch names) does not parse and never takes part in
//! automatic "latest wins" resolution.

use std::cmp::Ordering;

/// Pre-release marker tokens recognized even outside strict version syntax.
const PRE_RELEASE_MARKERS: [&str; 6] = ["alpha", "beta", "rc", "pre", "dev", "snapshot"];

/// A strictly parsed version tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Pre-release suffix after `-`, if any.
    pub pre_release: Option<String>,
    /// The ref exactly as written, including any `v` prefix.
    pub original: String,
}

impl ParsedVersion {
    /// Parse a ref as a strict version.
    ///
    /// Returns `None` for anything that is not `[v]N.N.N[-pre]`.
    #[must_use]
    pub fn parse(git_ref: &str) -> Option<Self> {
        let stripped = git_ref.strip_prefix('v').unwrap_or(git_ref);
        let version = semver::Version::parse(stripped).ok()?;
        if !version.build.is_empty() {
            return None;
        }

        Some(Self {
            major: version.major,
            minor: version.minor,
            patch: version.patch,
            pre_release: (!version.pre.is_empty()).then(|| version.pre.as_str().to_string()),
            original: git_ref.to_string(),
        })
    }

    /// Compare by version precedence, ignoring how the ref was written.
    #[must_use]
    pub fn precedence(&self, other: &Self) -> Ordering {
        compare(self, other)
    }
}

/// Compare two parsed versions.
///
/// Major, minor and patch compare numerically; a pre-release sorts before
/// the release; two pre-releases compare their suffixes as plain strings.
#[must_use]
pub fn compare(a: &ParsedVersion, b: &ParsedVersion) -> Ordering {
    a.major
        .cmp(&b.major)
        .then(a.minor.cmp(&b.minor))
        .then(a.patch.cmp(&b.patch))
        .then_with(|| match (&a.pre_release, &b.pre_release) {
            (None, None) => Ordering::Equal,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(y),
        })
}

/// Pick the highest version among `refs`, returning it as originally written.
///
/// Refs that do not parse are ignored; returns `None` if none parse.
#[must_use]
pub fn pick_latest<S: AsRef<str>>(refs: &[S]) -> Option<String> {
    refs.iter()
        .filter_map(|r| ParsedVersion::parse(r.as_ref()))
        .max_by(compare)
        .map(|v| v.original)
}

/// Sort refs newest first.
///
/// Parseable versions come first in descending order, followed by the
/// remaining refs in lexicographic order.
#[must_use]
pub fn sort_descending<S: AsRef<str>>(refs: &[S]) -> Vec<String> {
    let mut versions = Vec::new();
    let mut others = Vec::new();
    for r in refs {
        match ParsedVersion::parse(r.as_ref()) {
            Some(v) => versions.push(v),
            None => others.push(r.as_ref().to_string()),
        }
    }

    versions.sort_by(|a, b| compare(b, a));
    others.sort();

    versions
        .into_iter()
        .map(|v| v.original)
        .chain(others)
        .collect()
}

/// Returns true if the ref denotes a pre-release.
///
/// Strict versions with a `-suffix` are pre-releases. Refs that do not parse
/// are still treated as pre-releases when one of their tokens is a known
/// marker (`alpha`, `beta`, `rc`, `pre`, `dev`, `snapshot`), optionally
/// wrapped in digits, e.g. `v2.0-beta1`, `1.0rc1` or `nightly-dev`.
#[must_use]
pub fn is_pre_release(git_ref: &str) -> bool {
    if let Some(v) = ParsedVersion::parse(git_ref) {
        if v.pre_release.is_some() {
            return true;
        }
    }

    let lower = git_ref.to_ascii_lowercase();
    lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(is_marker_token)
}

/// `rc1`, `0rc1` and `0beta` are markers; `develop` is not.
fn is_marker_token(token: &str) -> bool {
    let token = token.trim_start_matches(|c: char| c.is_ascii_digit());
    PRE_RELEASE_MARKERS.iter().any(|marker| {
        token
            .strip_prefix(marker)
            .is_some_and(|rest| rest.bytes().all(|b| b.is_ascii_digit()))
    })
}

/// Keep only refs that are not pre-releases.
#[must_use]
pub fn filter_stable<S: AsRef<str>>(refs: &[S]) -> Vec<String> {
    refs.iter()
        .map(|r| r.as_ref())
        .filter(|r| !is_pre_release(r))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> ParsedVersion {
        ParsedVersion::parse(s).unwrap()
    }

    #[test]
    fn parses_strict_versions() {
        let parsed = v("v1.2.3");
        assert_eq!((parsed.major, parsed.minor, parsed.patch), (1, 2, 3));
        assert_eq!(parsed.pre_release, None);
        assert_eq!(parsed.original, "v1.2.3");

        let parsed = v("2.0.0-rc.1");
        assert_eq!(parsed.pre_release.as_deref(), Some("rc.1"));
        assert_eq!(parsed.original, "2.0.0-rc.1");
    }

    #[test]
    fn rejects_non_strict_versions() {
        for r in ["1.0", "v1", "main", "1.0.0+build.5", "1.0.0.0", "V1.0.0", ""] {
            assert!(ParsedVersion::parse(r).is_none(), "{r}");
        }
    }

    #[test]
    fn compare_orders_versions() {
        assert_eq!(compare(&v("v1.0.0"), &v("v2.0.0")), Ordering::Less);
        assert_eq!(compare(&v("1.10.0"), &v("1.9.0")), Ordering::Greater);
        assert_eq!(compare(&v("1.0.1"), &v("v1.0.0")), Ordering::Greater);
        assert_eq!(compare(&v("v1.0.0"), &v("1.0.0")), Ordering::Equal);
    }

    #[test]
    fn pre_release_sorts_before_release() {
        assert_eq!(compare(&v("1.0.0-alpha"), &v("1.0.0")), Ordering::Less);
        assert_eq!(compare(&v("1.0.0-alpha"), &v("1.0.0-beta")), Ordering::Less);
        // suffixes compare as plain strings
        assert_eq!(compare(&v("1.0.0-rc.10"), &v("1.0.0-rc.9")), Ordering::Less);
    }

    #[test]
    fn pick_latest_keeps_original_prefix() {
        assert_eq!(
            pick_latest(&["v1.0.0", "v1.5.0", "v1.2.0"]).as_deref(),
            Some("v1.5.0")
        );
        assert_eq!(
            pick_latest(&["main", "1.0.0", "v0.9.0"]).as_deref(),
            Some("1.0.0")
        );
        assert_eq!(pick_latest(&["main", "develop"]), None);
        assert_eq!(pick_latest::<&str>(&[]), None);
    }

    #[test]
    fn sort_descending_puts_versions_first() {
        let sorted = sort_descending(&["main", "v1.0.0", "develop", "v2.1.0", "v2.0.0-beta"]);
        assert_eq!(
            sorted,
            vec!["v2.1.0", "v2.0.0-beta", "v1.0.0", "develop", "main"]
        );
    }

    #[test]
    fn pre_release_detection() {
        assert!(is_pre_release("1.0.0-alpha"));
        assert!(is_pre_release("v2.0.0-rc.1"));
        assert!(is_pre_release("v2.0-beta1"));
        assert!(is_pre_release("nightly-dev"));
        assert!(is_pre_release("1.0-SNAPSHOT"));
        assert!(is_pre_release("1.0rc1"));
        assert!(is_pre_release("2.0.0beta"));
        assert!(!is_pre_release("2.0.0"));
        assert!(!is_pre_release("v1.0.0"));
        assert!(!is_pre_release("main"));
        assert!(!is_pre_release("develop"));
    }

    #[test]
    fn filter_stable_drops_pre_releases() {
        let stable = filter_stable(&["v1.0.0", "v1.1.0-rc.1", "v1.1.0", "v2.0-beta"]);
        assert_eq!(stable, vec!["v1.0.0", "v1.1.0"]);
    }
}
