//! Services layer for Cachegate
//!
//! Business logic that coordinates the cache engine, the snapshot ledger and
//! the origin forwarder on behalf of the HTTP routes.

pub mod cache_service;

pub use cache_service::{
    spawn_maintenance_task, CacheService, EntryDetail, EntryList, FreezeRequest,
    InvalidationReport, PurgeReport, RefreshOptions, RefreshOutcome, ServiceError, ServiceResult,
    ServiceStats,
};
