//! Tiered response cache
//!
//! # Architecture
//!
//! - `keys`: deterministic cache keys from method, URL, headers and body
//! - `rules`: ordered first-match-wins cacheability and TTL policy
//! - `memory`: bounded in-process tier with LRU/FIFO eviction
//! - `redis_tier`: optional shared tier behind an availability circuit
//! - `file_tier`: durable one-file-per-key tier
//! - `engine`: read/write/invalidate orchestration across the tiers
//! - `freeze`: maintenance switch that suspends refresh

pub mod backend;
pub mod engine;
pub mod entry;
pub mod error;
pub mod file_tier;
pub mod freeze;
pub mod keys;
pub mod memory;
pub mod redis_tier;
pub mod rules;
pub mod stats;

pub use backend::{build_backend, build_durable_tier, StorageConfig, StorageKind, TierBackend};
pub use engine::{
    CacheConfig, CacheEngine, CacheHit, CacheRequest, CacheSource, DeleteReport, EngineStats,
    PolicyRejection, SetOutcome, WriteReport,
};
pub use entry::{CacheEntry, Headers, Payload, PayloadEncoding};
pub use error::CacheError;
pub use file_tier::FileTier;
pub use freeze::{FreezeController, FreezeState};
pub use keys::{sha256_hex, KeyCodec, KeyConfig};
pub use memory::{EvictionPolicy, MemoryTier};
pub use redis_tier::{RedisConfig, RedisTier};
pub use rules::{CacheRule, RuleConditions, RuleDecision, RuleDefaults, RuleEngine};
pub use stats::{TierCounters, TierStats};
