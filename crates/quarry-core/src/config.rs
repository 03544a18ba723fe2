//! Configuration management for Quarry.
//!
//! Provides TOML-based configuration with XDG-compliant paths and
//! environment variable overrides. Every section is `#[serde(default)]`, so
//! a partial file only overrides what it names.

use crate::error::{ConfigError, ConfigResult};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration.
///
/// This is loaded from `~/.config/quarry/config.toml` (or platform equivalent).
/// If the file doesn't exist, default values are used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// General application settings
    pub general: GeneralConfig,
    /// State database settings
    pub database: DatabaseConfig,
    /// Provider result cache settings
    pub cache: CacheConfig,
    /// Provider fan-out settings
    pub fetch: FetchConfig,
    /// Per-provider admission limits
    pub rate_limits: RateLimitsConfig,
    /// Circuit breaker thresholds
    pub circuit_breaker: CircuitBreakerConfig,
    /// Scheduler and retry policy
    pub scheduler: SchedulerConfig,
    /// Merge and confidence scoring inputs
    pub merge: MergeConfig,
    /// Configured HTTP providers
    pub providers: Vec<ProviderConfig>,
}

impl AppConfig {
    /// Load configuration from disk, falling back to defaults if not found.
    pub fn load() -> ConfigResult<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific file, falling back to defaults if
    /// the file doesn't exist.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        if path.exists() {
            tracing::debug!("Loading config from {}", path.display());
            let contents = fs::read_to_string(path)?;
            let config: Self = toml::from_str(&contents)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::debug!("Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Load configuration with environment variable overrides.
    ///
    /// Supports the following environment variables:
    /// - `QUARRY_DB_PATH`: Override the state database path
    /// - `QUARRY_WORKERS`: Override the scheduler worker count
    /// - `QUARRY_MAX_CONCURRENT_CALLS`: Override the global provider call limit
    pub fn load_with_env() -> ConfigResult<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `QUARRY_*` environment overrides in place.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("QUARRY_DB_PATH") {
            tracing::debug!("Override database.path from env: {}", val);
            self.database.path = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("QUARRY_WORKERS") {
            if let Ok(workers) = val.parse() {
                self.scheduler.workers = workers;
                tracing::debug!("Override scheduler.workers from env: {}", workers);
            }
        }

        if let Ok(val) = std::env::var("QUARRY_MAX_CONCURRENT_CALLS") {
            if let Ok(calls) = val.parse() {
                self.fetch.max_concurrent_calls = calls;
                tracing::debug!("Override fetch.max_concurrent_calls from env: {}", calls);
            }
        }
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        tracing::debug!("Saving config to {}", path.display());
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        fn invalid(field: &str, reason: &str) -> ConfigError {
            ConfigError::InvalidValue {
                field: field.to_string(),
                reason: reason.to_string(),
            }
        }

        if self.scheduler.workers == 0 {
            return Err(invalid("scheduler.workers", "must be at least 1"));
        }
        if self.scheduler.max_stage_attempts == 0 {
            return Err(invalid("scheduler.max_stage_attempts", "must be at least 1"));
        }
        if self.scheduler.lease_secs == 0 {
            return Err(invalid("scheduler.lease_secs", "must be at least 1"));
        }
        if self.fetch.max_concurrent_calls == 0 {
            return Err(invalid("fetch.max_concurrent_calls", "must be at least 1"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold", "must be at least 1"));
        }
        if self.cache.shards == 0 {
            return Err(invalid("cache.shards", "must be at least 1"));
        }
        for (name, limit) in std::iter::once(("default", &self.rate_limits.default))
            .chain(self.rate_limits.providers.iter().map(|(k, v)| (k.as_str(), v)))
        {
            if limit.limit == 0 || limit.window_secs == 0 {
                return Err(invalid(
                    &format!("rate_limits.{name}"),
                    "limit and window_secs must be positive",
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.merge.confidence_floor) {
            return Err(invalid("merge.confidence_floor", "must be within 0.0..=1.0"));
        }
        if self.merge.base_penalty <= 0.0 {
            return Err(invalid("merge.base_penalty", "must be positive"));
        }
        for provider in &self.providers {
            if !(0.0..=1.0).contains(&provider.weight) {
                return Err(invalid(
                    &format!("providers.{}.weight", provider.id),
                    "must be within 0.0..=1.0",
                ));
            }
        }
        Ok(())
    }

    /// Get the path to the configuration file.
    ///
    /// Uses XDG base directories: `~/.config/quarry/config.toml`
    pub fn config_path() -> ConfigResult<PathBuf> {
        let dirs = ProjectDirs::from("io", "quarry", "quarry").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Get the data directory path.
    ///
    /// `general.data_dir` wins; otherwise `~/.local/share/quarry`.
    pub fn data_dir(&self) -> ConfigResult<PathBuf> {
        if let Some(dir) = &self.general.data_dir {
            return Ok(dir.clone());
        }
        let dirs = ProjectDirs::from("io", "quarry", "quarry").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.data_dir().to_path_buf())
    }

    /// Resolve the state database path.
    pub fn database_path(&self) -> ConfigResult<PathBuf> {
        match &self.database.path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.data_dir()?.join("quarry.db")),
        }
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override for the data directory
    pub data_dir: Option<PathBuf>,
    /// Default `tracing` filter when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            log_filter: "info,quarry=debug".to_string(),
        }
    }
}

/// State database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file (defaults to `<data_dir>/quarry.db`; `:memory:` allowed)
    pub path: Option<PathBuf>,
    /// Maximum pooled connections for on-disk databases
    pub max_connections: u32,
    /// `SQLite` busy timeout in milliseconds
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 5,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Provider result cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether provider results are cached at all
    pub enabled: bool,
    /// TTL for the in-process tier
    pub memory_ttl_secs: u64,
    /// TTL for the persistent tier
    pub persistent_ttl_secs: u64,
    /// Entry cap for the in-process tier
    pub memory_max_entries: usize,
    /// Number of independently locked shards in the in-process tier
    pub shards: usize,
    /// Values larger than this are compressed
    pub compress_threshold_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_ttl_secs: 10 * 60,
            persistent_ttl_secs: 3 * 24 * 60 * 60,
            memory_max_entries: 10_000,
            shards: 16,
            compress_threshold_bytes: 4 * 1024,
        }
    }
}

impl CacheConfig {
    /// In-process TTL as a `Duration`.
    #[must_use]
    pub fn memory_ttl(&self) -> Duration {
        Duration::from_secs(self.memory_ttl_secs)
    }

    /// Persistent TTL as a `Duration`.
    #[must_use]
    pub fn persistent_ttl(&self) -> Duration {
        Duration::from_secs(self.persistent_ttl_secs)
    }
}

/// Provider fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Global cap on in-flight provider calls across all entities
    pub max_concurrent_calls: usize,
    /// Per-call timeout in seconds
    pub call_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 8,
            call_timeout_secs: 30,
        }
    }
}

impl FetchConfig {
    /// Per-call timeout as a `Duration`.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Admission limit for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests admitted per window
    pub limit: u32,
    /// Window length in seconds
    pub window_secs: u64,
}

impl RateLimitConfig {
    /// Window as a `Duration`.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Rate limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    /// Limit applied to providers without an explicit entry
    pub default: RateLimitConfig,
    /// Upper bound on the random delay added to each wait, in milliseconds
    pub max_jitter_ms: u64,
    /// Penalty duration at level 1, in seconds
    pub base_penalty_secs: u64,
    /// Cap on any penalty duration, in seconds
    pub max_penalty_secs: u64,
    /// Per-provider overrides keyed by provider id
    pub providers: BTreeMap<String, RateLimitConfig>,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            default: RateLimitConfig {
                limit: 60,
                window_secs: 60,
            },
            max_jitter_ms: 250,
            base_penalty_secs: 30,
            max_penalty_secs: 15 * 60,
            providers: BTreeMap::new(),
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient/rate-limited outcomes before opening
    pub failure_threshold: u32,
    /// Seconds to stay open before allowing a probe
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 120,
        }
    }
}

/// Scheduler and retry policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Entity-level worker count
    pub workers: usize,
    /// Attempts per stage before an entity is failed
    pub max_stage_attempts: u32,
    /// Attempts per provider before it is given up for an entity
    pub max_provider_attempts: u32,
    /// First retry delay in seconds
    pub retry_base_secs: u64,
    /// Cap on the retry delay in seconds
    pub retry_max_secs: u64,
    /// Upper bound on retry jitter in milliseconds
    pub retry_jitter_ms: u64,
    /// Lease duration for claimed entities in seconds; renewed every third
    /// of its length while the entity is being worked on
    pub lease_secs: u64,
    /// Entities claimed per scheduling round
    pub claim_batch_size: u32,
    /// Longest idle sleep between rounds in milliseconds
    pub idle_poll_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_stage_attempts: 5,
            max_provider_attempts: 4,
            retry_base_secs: 30,
            retry_max_secs: 60 * 60,
            retry_jitter_ms: 1_000,
            lease_secs: 5 * 60,
            claim_batch_size: 32,
            idle_poll_ms: 1_000,
        }
    }
}

/// Merge and confidence scoring inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Fields whose confidence falls below this are omitted
    pub confidence_floor: f64,
    /// Constant added to the unresolved penalty of every field
    pub base_penalty: f64,
    /// Provider ranking used to break score ties (highest priority first)
    pub provider_priority: Vec<String>,
    /// Weight overrides keyed by provider id
    pub provider_weights: BTreeMap<String, f64>,
    /// Fields a profile must carry to be qualified
    pub required_fields: Vec<String>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.3,
            base_penalty: 0.5,
            provider_priority: Vec::new(),
            provider_weights: BTreeMap::new(),
            required_fields: vec!["full_name".to_string()],
        }
    }
}

/// A JSON-over-HTTP provider declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider id
    pub id: String,
    /// Endpoint queried with `name`, `website`, `locale` query parameters
    pub endpoint: String,
    /// Provenance weight (0.0-1.0)
    pub weight: f64,
    /// Locales the provider covers (empty = all)
    #[serde(default)]
    pub locales: Vec<String>,
    /// Sectors the provider covers (empty = all)
    #[serde(default)]
    pub sectors: Vec<String>,
    /// Environment variable holding a bearer token, if any
    #[serde(default)]
    pub api_key_env: Option<String>,
}
