// casket-common/src/config.rs
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::UserDirs;
use tracing::debug;

use super::error::{CasketError, Result};

// Fallback root when CASKET_ROOT is not set or is empty.
const DEFAULT_CASKET_ROOT: &str = "/opt/casket";
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct Config {
    pub casket_root: PathBuf,
    pub applications_dir: PathBuf,
    pub home_dir: PathBuf,
    pub catalog_dir: PathBuf,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Refuse artifacts that carry no checksum instead of warning about them.
    pub require_checksum: bool,
    /// Permit plain `http://` download URLs.
    pub allow_http: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        debug!("Loading casket configuration");

        let casket_root = env::var("CASKET_ROOT")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                debug!(
                    "CASKET_ROOT not set or empty, falling back to default: {}",
                    DEFAULT_CASKET_ROOT
                );
                PathBuf::from(DEFAULT_CASKET_ROOT)
            });
        debug!("Effective CASKET_ROOT set to: {}", casket_root.display());

        let home_dir =
            UserDirs::new().map_or_else(|| PathBuf::from("/"), |ud| ud.home_dir().to_path_buf());

        let applications_dir = env::var("CASKET_APPDIR")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                if cfg!(target_os = "macos") {
                    PathBuf::from("/Applications")
                } else {
                    home_dir.join("Applications")
                }
            });

        let catalog_dir = env::var("CASKET_CATALOG")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| casket_root.join("catalog"));

        let max_retries = parse_env("CASKET_MAX_RETRIES", DEFAULT_MAX_RETRIES)?;
        let retry_base_ms = parse_env("CASKET_RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS)?;

        let config = Self {
            casket_root,
            applications_dir,
            home_dir,
            catalog_dir,
            max_retries,
            retry_base_delay: Duration::from_millis(retry_base_ms),
            require_checksum: env_flag("CASKET_REQUIRE_CHECKSUM"),
            allow_http: env_flag("CASKET_ALLOW_HTTP"),
        };
        debug!("Configuration loaded successfully.");
        Ok(config)
    }

    /// A configuration rooted entirely below `root`, with no environment lookups.
    pub fn for_root(root: &Path) -> Self {
        Self {
            casket_root: root.to_path_buf(),
            applications_dir: root.join("Applications"),
            home_dir: root.join("home"),
            catalog_dir: root.join("catalog"),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            require_checksum: false,
            allow_http: false,
        }
    }

    pub fn casket_root(&self) -> &Path {
        &self.casket_root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.casket_root.join("bin")
    }

    pub fn caskroom_dir(&self) -> PathBuf {
        self.casket_root.join("Caskroom")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.casket_root.join("cache")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_dir().join("downloads")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.casket_root.join("logs")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.casket_root.join("tmp")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.tmp_dir().join("stage")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.casket_root.join("state")
    }

    pub fn action_logs_dir(&self) -> PathBuf {
        self.state_dir().join("actions")
    }

    pub fn caskroom_token_path(&self, token: &str) -> PathBuf {
        self.caskroom_dir().join(token)
    }

    pub fn caskroom_version_path(&self, token: &str, version: &str) -> PathBuf {
        self.caskroom_token_path(token).join(version)
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn user_library_dir(&self) -> PathBuf {
        self.home_dir.join("Library")
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name).is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| CasketError::Config(format!("{name} has an invalid value: '{raw}'"))),
        _ => Ok(default),
    }
}

pub fn load_config() -> Result<Config> {
    Config::load()
}
