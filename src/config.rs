//! Configuration for Cachegate
//!
//! CLI arguments with environment variable fallbacks, using clap.

use clap::{ArgAction, Args as ClapArgs, Parser};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::{
    CacheConfig, CacheRule, EvictionPolicy, KeyConfig, RedisConfig, StorageKind,
};
use crate::types::GatewayError;

/// Cachegate - caching reverse proxy
#[derive(Parser, Debug, Clone)]
#[command(name = "cachegate")]
#[command(about = "Caching reverse proxy with memory, Redis and file tiers")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Origin base URL that cache misses are forwarded to
    #[arg(long, env = "UPSTREAM_URL", default_value = "http://localhost:3000")]
    pub upstream: String,

    /// Origin request timeout in seconds
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value = "30")]
    pub upstream_timeout_secs: u64,

    /// Memory tier capacity (entries)
    #[arg(long, env = "CACHE_MAX_ENTRIES", default_value = "1000")]
    pub memory_max_entries: usize,

    /// Memory tier eviction policy (lru, fifo)
    #[arg(long, env = "CACHE_EVICTION_POLICY", default_value = "lru")]
    pub eviction_policy: String,

    /// TTL applied when no rule sets one
    #[arg(long, env = "CACHE_DEFAULT_TTL", default_value = "300")]
    pub default_ttl_seconds: u64,

    /// Methods cacheable when no rule matches
    #[arg(long, env = "CACHE_METHODS", default_value = "GET,HEAD", value_delimiter = ',')]
    pub cacheable_methods: Vec<String>,

    /// JSON file holding an ordered list of cache rules
    #[arg(long, env = "CACHE_RULES_FILE")]
    pub rules_file: Option<PathBuf>,

    /// Without a rules file, also cache non-2xx responses
    #[arg(long, env = "CACHE_ERROR_RESPONSES", default_value = "false")]
    pub cache_error_responses: bool,

    /// Durable tier backend (file, mongo, s3, none)
    #[arg(long, env = "DURABLE_STORAGE", default_value = "file")]
    pub durable_storage: String,

    /// Directory for the file tier
    #[arg(long, env = "CACHE_DIR", default_value = "./cache-data")]
    pub cache_dir: PathBuf,

    /// Load durable entries into memory at startup
    #[arg(long, env = "CACHE_WARMUP", default_value = "false")]
    pub cache_warmup: bool,

    /// Maximum entries loaded by warmup
    #[arg(long, env = "CACHE_WARMUP_LIMIT", default_value = "500")]
    pub warmup_limit: usize,

    /// Background maintenance interval in seconds
    #[arg(long, env = "CLEANUP_INTERVAL_SECS", default_value = "600")]
    pub cleanup_interval_secs: u64,

    /// Memory keys purged per lock acquisition during maintenance
    #[arg(long, env = "CLEANUP_BATCH_SIZE", default_value = "256")]
    pub cleanup_batch_size: usize,

    /// Cache key derivation
    #[command(flatten)]
    pub keys: KeyArgs,

    /// Redis tier configuration
    #[command(flatten)]
    pub redis: RedisArgs,

    /// Snapshot ledger configuration
    #[command(flatten)]
    pub snapshots: SnapshotArgs,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,
}

/// Cache key derivation arguments
#[derive(ClapArgs, Debug, Clone)]
pub struct KeyArgs {
    /// Sort query parameters before keying
    #[arg(long, env = "CACHE_NORMALIZE_URLS", default_value_t = true, action = ArgAction::Set)]
    pub normalize_urls: bool,

    /// Only these request headers participate in the key
    #[arg(long, env = "CACHE_KEY_INCLUDE_HEADERS", value_delimiter = ',')]
    pub key_include_headers: Option<Vec<String>>,

    /// Request headers ignored when no include-list is set
    #[arg(long, env = "CACHE_KEY_EXCLUDE_HEADERS", value_delimiter = ',')]
    pub key_exclude_headers: Option<Vec<String>>,

    /// Keys longer than this are replaced by a SHA-256 digest
    #[arg(long, env = "CACHE_MAX_KEY_LENGTH", default_value = "250")]
    pub max_key_length: usize,

    #[arg(long, env = "CACHE_HASH_LONG_KEYS", default_value_t = true, action = ArgAction::Set)]
    pub hash_long_keys: bool,

    /// Readable characters kept in front of a hashed key
    #[arg(long, env = "CACHE_KEY_READABLE_PREFIX", default_value = "32")]
    pub key_readable_prefix: usize,
}

/// Redis tier arguments
#[derive(ClapArgs, Debug, Clone)]
pub struct RedisArgs {
    /// Redis URL; the tier is disabled when unset
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    #[arg(long, env = "REDIS_KEY_PREFIX", default_value = "cachegate:")]
    pub redis_key_prefix: String,

    #[arg(long, env = "REDIS_CONNECT_TIMEOUT_MS", default_value = "1000")]
    pub redis_connect_timeout_ms: u64,

    #[arg(long, env = "REDIS_COMMAND_TIMEOUT_MS", default_value = "500")]
    pub redis_command_timeout_ms: u64,

    /// Seconds the tier stays unavailable after a failure
    #[arg(long, env = "REDIS_RETRY_AFTER_SECS", default_value = "30")]
    pub redis_retry_after_secs: u64,
}

/// Snapshot ledger arguments
#[derive(ClapArgs, Debug, Clone)]
pub struct SnapshotArgs {
    #[arg(long, env = "SNAPSHOTS_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub snapshots_enabled: bool,

    /// Directory holding snapshots.db
    #[arg(long, env = "SNAPSHOT_DIR", default_value = "./cache-data/snapshots")]
    pub snapshot_dir: PathBuf,

    /// Attempts for a busy or locked database before giving up
    #[arg(long, env = "SNAPSHOT_MAX_RETRIES", default_value = "3")]
    pub snapshot_max_retries: u32,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.memory_max_entries == 0 {
            return Err("CACHE_MAX_ENTRIES must be greater than zero".to_string());
        }
        if self.upstream.trim().is_empty() {
            return Err("UPSTREAM_URL must not be empty".to_string());
        }
        url::Url::parse(&self.upstream)
            .map_err(|e| format!("UPSTREAM_URL is not a valid URL: {}", e))?;
        self.eviction_policy()?;
        self.durable_kind()?;
        if self.keys.hash_long_keys && self.keys.max_key_length < self.keys.key_readable_prefix {
            return Err(
                "CACHE_MAX_KEY_LENGTH must be at least CACHE_KEY_READABLE_PREFIX".to_string(),
            );
        }
        if self.cleanup_interval_secs == 0 {
            return Err("CLEANUP_INTERVAL_SECS must be greater than zero".to_string());
        }
        if !matches!(self.log_format.as_str(), "text" | "json") {
            return Err(format!("LOG_FORMAT must be text or json, got '{}'", self.log_format));
        }
        Ok(())
    }

    pub fn eviction_policy(&self) -> Result<EvictionPolicy, String> {
        self.eviction_policy.parse()
    }

    /// Durable tier kind; `None` when disabled
    pub fn durable_kind(&self) -> Result<Option<StorageKind>, String> {
        match self.durable_storage.to_ascii_lowercase().as_str() {
            "none" | "off" | "" => Ok(None),
            other => match other.parse::<StorageKind>()? {
                StorageKind::Redis => {
                    Err("DURABLE_STORAGE cannot be redis; use REDIS_URL for the shared tier".to_string())
                }
                kind => Ok(Some(kind)),
            },
        }
    }

    pub fn json_logs(&self) -> bool {
        self.log_format == "json"
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn redis_config(&self) -> Option<RedisConfig> {
        self.redis.redis_url.as_ref().map(|url| RedisConfig {
            url: url.clone(),
            key_prefix: self.redis.redis_key_prefix.clone(),
            connect_timeout: Duration::from_millis(self.redis.redis_connect_timeout_ms),
            command_timeout: Duration::from_millis(self.redis.redis_command_timeout_ms),
            retry_after: Duration::from_secs(self.redis.redis_retry_after_secs),
        })
    }

    pub fn key_config(&self) -> KeyConfig {
        let defaults = KeyConfig::default();
        KeyConfig {
            normalize_urls: self.keys.normalize_urls,
            include_headers: self.keys.key_include_headers.clone(),
            exclude_headers: self
                .keys
                .key_exclude_headers
                .clone()
                .unwrap_or(defaults.exclude_headers),
            max_key_length: self.keys.max_key_length,
            hash_long_keys: self.keys.hash_long_keys,
            readable_prefix_len: self.keys.key_readable_prefix,
            ..defaults
        }
    }

    /// Upper-cased default cacheable methods
    pub fn cacheable_methods(&self) -> Vec<String> {
        self.cacheable_methods
            .iter()
            .map(|m| m.trim().to_ascii_uppercase())
            .filter(|m| !m.is_empty())
            .collect()
    }

    /// Read the rules file. Without one, only 2xx responses are cached
    /// unless `cache_error_responses` is set.
    pub fn load_rules(&self) -> Result<Vec<CacheRule>, GatewayError> {
        let Some(path) = &self.rules_file else {
            if self.cache_error_responses {
                return Ok(Vec::new());
            }
            return Ok(CacheRule::success_only(&self.cacheable_methods()));
        };
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("cannot read rules file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            GatewayError::Config(format!("invalid rules file {}: {}", path.display(), e))
        })
    }

    /// Engine configuration. Call after `validate`.
    pub fn cache_config(&self) -> Result<CacheConfig, GatewayError> {
        Ok(CacheConfig {
            memory_max_entries: self.memory_max_entries,
            eviction_policy: self.eviction_policy().map_err(GatewayError::Config)?,
            default_ttl_seconds: self.default_ttl_seconds,
            cacheable_methods: self.cacheable_methods(),
            rules: self.load_rules()?,
            keys: self.key_config(),
            redis: self.redis_config(),
            durable: self.durable_kind().map_err(GatewayError::Config)?,
            file_dir: self.cache_dir.clone(),
            cleanup_batch_size: self.cleanup_batch_size,
        })
    }
}
