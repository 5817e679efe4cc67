//! Resolver configuration.

use std::path::PathBuf;

/// Environment variable overriding the checkout cache directory.
pub const CACHE_DIR_ENV: &str = "MODEL_CACHE_DIR";

/// Environment variable that disables network access when set to a truthy value.
pub const OFFLINE_ENV: &str = "MODEL_OFFLINE";

/// Settings shared by the cache, the resolver and the workspace manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Root of the content-addressed checkout cache.
    pub cache_dir: PathBuf,
    /// Whether remote refs may be listed and repositories fetched.
    pub allow_network: bool,
    /// Treat same-major tag conflicts as errors instead of picking the latest.
    pub strict_versions: bool,
    /// The git executable used for remote operations.
    pub git_program: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        let cache_dir = std::env::var_os(CACHE_DIR_ENV)
            .filter(|v| !v.is_empty())
            .map_or_else(
                || dirs_cache_dir().join("model").join("repositories"),
                PathBuf::from,
            );
        let allow_network = !std::env::var(OFFLINE_ENV).is_ok_and(|v| is_truthy(&v));

        Self {
            cache_dir,
            allow_network,
            strict_versions: false,
            git_program: "git".to_string(),
        }
    }
}

impl ResolverConfig {
    /// Use a specific cache directory.
    #[must_use]
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    /// Enable or disable network access.
    #[must_use]
    pub fn with_network(mut self, allow_network: bool) -> Self {
        self.allow_network = allow_network;
        self
    }

    /// Enable or disable strict version conflict handling.
    #[must_use]
    pub fn with_strict_versions(mut self, strict: bool) -> Self {
        self.strict_versions = strict;
        self
    }

    /// Use a different git executable.
    #[must_use]
    pub fn with_git_program(mut self, program: impl Into<String>) -> Self {
        self.git_program = program.into();
        self
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Get the platform-appropriate cache directory.
fn dirs_cache_dir() -> PathBuf {
    if let Some(cache) = std::env::var_os("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(cache);
    }
    if let Some(home) = std::env::var("HOME").ok().or_else(|| std::env::var("USERPROFILE").ok()) {
        #[cfg(target_os = "macos")]
        {
            return PathBuf::from(&home).join("Library").join("Caches");
        }
        #[cfg(target_os = "windows")]
        {
            if let Ok(local_app_data) = std::env::var("LOCALAPPDATA") {
                return PathBuf::from(local_app_data);
            }
        }
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            return PathBuf::from(home).join(".cache");
        }
    }
    PathBuf::from(".cache")
}
