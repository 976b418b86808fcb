//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/fieldsync/config.toml)
//! 3. Environment variables (FIELDSYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sync::{BackoffPolicy, CoordinatorConfig};

/// Environment variable prefix
const ENV_PREFIX: &str = "FIELDSYNC";

/// Shortest retry delay a config can ask for
const MIN_BACKOFF_MS: u64 = 100;

/// Where queue and cache state is persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    File,
    /// Nothing survives the process; for trying things out
    Memory,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageBackend::Sqlite => "sqlite",
            StorageBackend::File => "file",
            StorageBackend::Memory => "memory",
        };
        f.write_str(name)
    }
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StorageBackend::Sqlite),
            "file" => Ok(StorageBackend::File),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(format!(
                "unknown storage backend '{}' (expected sqlite, file or memory)",
                other
            )),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for queue and cache storage
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Base URL of the remote API
    #[serde(default)]
    pub api_url: Option<String>,

    /// URL probed for connectivity; defaults to `api_url`
    #[serde(default)]
    pub health_url: Option<String>,

    /// Bearer token; its presence is what "authenticated" means to the engine
    #[serde(default)]
    pub auth_token: Option<String>,

    #[serde(default)]
    pub storage_backend: StorageBackend,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    /// Give up on a mutation after this many transient failures (unset: never)
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Log file path (logging is off unless FIELDSYNC_LOG is set)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            api_url: None,
            health_url: None,
            auth_token: None,
            storage_backend: StorageBackend::default(),
            cache_ttl_secs: default_cache_ttl_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            submit_timeout_secs: default_submit_timeout_secs(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_secs: default_backoff_max_secs(),
            max_attempts: None,
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (FIELDSYNC_DATA_DIR, FIELDSYNC_API_URL, ...)
    /// 2. Config file (~/.config/fieldsync/config.toml or FIELDSYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load from `--config` if given, otherwise the default location
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject retry settings that would spin or give up before trying
    pub fn validate(&self) -> Result<()> {
        if self.backoff_initial_ms == 0 {
            anyhow::bail!("backoff_initial_ms must be at least 1");
        }
        if self.backoff_max_secs == 0 {
            anyhow::bail!("backoff_max_secs must be at least 1");
        }
        if self.max_attempts == Some(0) {
            anyhow::bail!("max_attempts must be at least 1, or unset for no limit");
        }
        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(val) = env_var("DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }
        if let Some(val) = env_var("API_URL") {
            self.api_url = non_empty(val);
        }
        if let Some(val) = env_var("HEALTH_URL") {
            self.health_url = non_empty(val);
        }
        if let Some(val) = env_var("AUTH_TOKEN") {
            self.auth_token = non_empty(val);
        }
        if let Some(val) = env_var("STORAGE_BACKEND") {
            self.storage_backend = val
                .parse()
                .map_err(anyhow::Error::msg)
                .context("Invalid FIELDSYNC_STORAGE_BACKEND")?;
        }
        if let Some(val) = env_var("CACHE_TTL_SECS") {
            self.cache_ttl_secs = parse_env("CACHE_TTL_SECS", &val)?;
        }
        if let Some(val) = env_var("POLL_INTERVAL_SECS") {
            self.poll_interval_secs = parse_env("POLL_INTERVAL_SECS", &val)?;
        }
        if let Some(val) = env_var("SUBMIT_TIMEOUT_SECS") {
            self.submit_timeout_secs = parse_env("SUBMIT_TIMEOUT_SECS", &val)?;
        }
        if let Some(val) = env_var("BACKOFF_INITIAL_MS") {
            self.backoff_initial_ms = parse_env("BACKOFF_INITIAL_MS", &val)?;
        }
        if let Some(val) = env_var("BACKOFF_MAX_SECS") {
            self.backoff_max_secs = parse_env("BACKOFF_MAX_SECS", &val)?;
        }
        if let Some(val) = env_var("MAX_ATTEMPTS") {
            self.max_attempts = match non_empty(val) {
                Some(v) => Some(parse_env("MAX_ATTEMPTS", &v)?),
                None => None,
            };
        }
        if let Some(val) = env_var("LOG_FILE") {
            self.log_file = non_empty(val).map(PathBuf::from);
        }
        Ok(())
    }

    /// Ensure data directory exists
    pub fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default config file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with FIELDSYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fieldsync")
            .join("config.toml")
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("fieldsync.db")
    }

    /// Get the directory used by the file backend
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    /// URL the connectivity probe hits
    pub fn probe_url(&self) -> Option<&str> {
        self.health_url.as_deref().or(self.api_url.as_deref())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs.max(1))
    }

    /// Retry delays, with the initial delay floored and the cap never below it
    pub fn backoff_policy(&self) -> BackoffPolicy {
        let initial = Duration::from_millis(self.backoff_initial_ms.max(MIN_BACKOFF_MS));
        BackoffPolicy {
            initial,
            max: Duration::from_secs(self.backoff_max_secs).max(initial),
            ..BackoffPolicy::default()
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            backoff: self.backoff_policy(),
            submit_timeout: self.submit_timeout(),
            max_attempts: self.max_attempts.map(|n| n.max(1)),
        }
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, suffix)).ok()
}

fn non_empty(val: String) -> Option<String> {
    if val.is_empty() {
        None
    } else {
        Some(val)
    }
}

fn parse_env<T>(suffix: &str, val: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    val.trim()
        .parse()
        .with_context(|| format!("Invalid {}_{}: {:?}", ENV_PREFIX, suffix, val))
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fieldsync")
}

fn default_cache_ttl_secs() -> u64 {
    60 * 60
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_submit_timeout_secs() -> u64 {
    15
}

fn default_backoff_initial_ms() -> u64 {
    2_000
}

fn default_backoff_max_secs() -> u64 {
    120
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "FIELDSYNC_CONFIG",
        "FIELDSYNC_DATA_DIR",
        "FIELDSYNC_API_URL",
        "FIELDSYNC_HEALTH_URL",
        "FIELDSYNC_AUTH_TOKEN",
        "FIELDSYNC_STORAGE_BACKEND",
        "FIELDSYNC_CACHE_TTL_SECS",
        "FIELDSYNC_POLL_INTERVAL_SECS",
        "FIELDSYNC_SUBMIT_TIMEOUT_SECS",
        "FIELDSYNC_BACKOFF_INITIAL_MS",
        "FIELDSYNC_BACKOFF_MAX_SECS",
        "FIELDSYNC_MAX_ATTEMPTS",
        "FIELDSYNC_LOG_FILE",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.api_url.is_none());
        assert_eq!(config.storage_backend, StorageBackend::Sqlite);
        assert_eq!(config.cache_ttl(), Duration::from_secs(3600));
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.submit_timeout(), Duration::from_secs(15));
        assert_eq!(config.backoff_policy(), BackoffPolicy::default());
        assert!(config.max_attempts.is_none());
        assert!(config.data_dir.ends_with("fieldsync"));
    }

    #[test]
    fn test_file_paths() {
        let config = Config::default();
        assert!(config.sqlite_path().ends_with("fieldsync.db"));
        assert!(config.store_dir().ends_with("store"));
    }

    #[test]
    fn test_probe_url_falls_back_to_api_url() {
        let mut config = Config {
            api_url: Some("https://api.example.org".into()),
            ..Config::default()
        };
        assert_eq!(config.probe_url(), Some("https://api.example.org"));

        config.health_url = Some("https://api.example.org/health".into());
        assert_eq!(config.probe_url(), Some("https://api.example.org/health"));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("FIELDSYNC_DATA_DIR", "/tmp/fieldsync-test");
        config.apply_env_overrides().unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/fieldsync-test"));
    }

    #[test]
    fn test_env_override_api_url() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("FIELDSYNC_API_URL", "https://api.example.org");
        config.apply_env_overrides().unwrap();
        assert_eq!(config.api_url.as_deref(), Some("https://api.example.org"));

        // Empty string clears it
        env::set_var("FIELDSYNC_API_URL", "");
        config.apply_env_overrides().unwrap();
        assert!(config.api_url.is_none());
    }

    #[test]
    fn test_env_override_numbers_and_backend() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("FIELDSYNC_STORAGE_BACKEND", "File");
        env::set_var("FIELDSYNC_SUBMIT_TIMEOUT_SECS", "5");
        env::set_var("FIELDSYNC_MAX_ATTEMPTS", "8");
        config.apply_env_overrides().unwrap();

        assert_eq!(config.storage_backend, StorageBackend::File);
        assert_eq!(config.submit_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_attempts, Some(8));

        env::set_var("FIELDSYNC_MAX_ATTEMPTS", "");
        config.apply_env_overrides().unwrap();
        assert!(config.max_attempts.is_none());
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("FIELDSYNC_CACHE_TTL_SECS", "an hour");
        let err = config.apply_env_overrides().unwrap_err();
        assert!(err.to_string().contains("FIELDSYNC_CACHE_TTL_SECS"));

        env::remove_var("FIELDSYNC_CACHE_TTL_SECS");
        env::set_var("FIELDSYNC_STORAGE_BACKEND", "floppy");
        assert!(config.apply_env_overrides().is_err());
    }

    #[test]
    fn test_serialization() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config {
            data_dir: PathBuf::from("/data/fieldsync"),
            api_url: Some("https://api.example.org".to_string()),
            storage_backend: StorageBackend::File,
            max_attempts: Some(10),
            ..Config::default()
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("storage_backend = \"file\""));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.data_dir, config.data_dir);
        assert_eq!(parsed.api_url, config.api_url);
        assert_eq!(parsed.storage_backend, StorageBackend::File);
        assert_eq!(parsed.max_attempts, Some(10));
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            api_url = "https://api.example.org"
            storage_backend = "memory"
            backoff_initial_ms = 500
            backoff_max_secs = 10
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.storage_backend, StorageBackend::Memory);
        assert_eq!(
            config.backoff_policy(),
            BackoffPolicy {
                initial: Duration::from_millis(500),
                multiplier: 2,
                max: Duration::from_secs(10),
            }
        );
        // Unset keys keep their defaults
        assert_eq!(config.cache_ttl_secs, 3600);
    }

    #[test]
    fn test_zero_retry_settings_rejected() {
        let _guard = EnvGuard::new(ENV_VARS);

        for toml in [
            "backoff_initial_ms = 0",
            "backoff_max_secs = 0",
            "max_attempts = 0",
        ] {
            let err = Config::load_from_str(toml).unwrap_err();
            let key = toml.split(' ').next().unwrap();
            assert!(err.to_string().contains(key), "{}: {}", toml, err);
        }

        env::set_var("FIELDSYNC_MAX_ATTEMPTS", "0");
        assert!(Config::load_from_str("").is_err());
    }

    #[test]
    fn test_retry_settings_are_clamped() {
        let config = Config {
            backoff_initial_ms: 0,
            backoff_max_secs: 0,
            max_attempts: Some(0),
            ..Config::default()
        };

        let policy = config.backoff_policy();
        assert_eq!(policy.initial, Duration::from_millis(MIN_BACKOFF_MS));
        assert_eq!(policy.max, policy.initial);
        assert!(policy.delay(1) > Duration::ZERO);
        assert_eq!(config.coordinator_config().max_attempts, Some(1));

        // A cap below the initial delay is raised to it
        let config = Config {
            backoff_initial_ms: 5_000,
            backoff_max_secs: 1,
            ..Config::default()
        };
        assert_eq!(config.backoff_policy().max, Duration::from_secs(5));
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert!(config.api_url.is_none());
        assert_eq!(config.storage_backend, StorageBackend::Sqlite);
    }

    #[test]
    fn test_save_and_reload() {
        let _guard = EnvGuard::new(ENV_VARS);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config {
            api_url: Some("https://api.example.org".into()),
            auth_token: Some("secret".into()),
            ..Config::default()
        };
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_with_cli_override(Some(&path)).unwrap();
        assert_eq!(loaded.api_url, config.api_url);
        assert_eq!(loaded.auth_token.as_deref(), Some("secret"));
    }
}
