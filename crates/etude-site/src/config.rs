use serde::Deserialize;
use std::path::PathBuf;

/// Where the site keeps its pages, uploads and users.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Static pages: `login.html`, `filelist.html`, `error.html`, ...
    pub resources_dir: PathBuf,
    /// Uploaded files.
    pub files_dir: PathBuf,
    /// User table.
    pub users_file: PathBuf,
    /// Number of pooled user-store handles.
    pub store_pool_size: usize,
    /// Also log to daily files here when set.
    pub log_dir: Option<PathBuf>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            resources_dir: PathBuf::from("./resources"),
            files_dir: PathBuf::from("./filedir"),
            users_file: PathBuf::from("./users.db"),
            store_pool_size: 8,
            log_dir: None,
        }
    }
}

impl SiteConfig {
    /// Load from `ETUDE_SITE_*` variables (with .env support).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let d = Self::default();
        let path = |key: &str, fallback: PathBuf| {
            std::env::var(key).map(PathBuf::from).unwrap_or(fallback)
        };
        Self {
            resources_dir: path("ETUDE_SITE_RESOURCES", d.resources_dir),
            files_dir: path("ETUDE_SITE_FILES", d.files_dir),
            users_file: path("ETUDE_SITE_USERS", d.users_file),
            store_pool_size: std::env::var("ETUDE_SITE_POOL_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(d.store_pool_size),
            log_dir: std::env::var("ETUDE_SITE_LOG_DIR").ok().map(PathBuf::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_working_directory_layout() {
        let config = SiteConfig::default();
        assert_eq!(config.resources_dir, PathBuf::from("./resources"));
        assert_eq!(config.files_dir, PathBuf::from("./filedir"));
        assert_eq!(config.store_pool_size, 8);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn env_overrides_paths() {
        unsafe {
            std::env::set_var("ETUDE_SITE_FILES", "/tmp/etude-uploads");
            std::env::set_var("ETUDE_SITE_POOL_SIZE", "0");
        }
        let config = SiteConfig::from_env();
        unsafe {
            std::env::remove_var("ETUDE_SITE_FILES");
            std::env::remove_var("ETUDE_SITE_POOL_SIZE");
        }
        assert_eq!(config.files_dir, PathBuf::from("/tmp/etude-uploads"));
        // A zero pool could never hand out a handle.
        assert_eq!(config.store_pool_size, 8);
    }
}
