//! Cachegate - caching reverse proxy
//!
//! Cachegate sits in front of an HTTP origin and answers repeat requests
//! from a three-tier cache, keeping a durable ledger of what it cached.
//!
//! ## Components
//!
//! - **Cache**: key derivation, rules, memory/Redis/file tiers and the engine
//! - **Snapshot**: SQLite ledger of provenance, TTL windows, tags and access counts
//! - **Proxy**: origin forwarding for misses and refreshes
//! - **Services**: administration flows that keep tiers and ledger in step
//! - **Routes/Server**: hyper front end for proxying and `/admin/cache`

pub mod cache;
pub mod config;
pub mod logging;
pub mod proxy;
pub mod routes;
pub mod server;
pub mod services;
pub mod snapshot;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{GatewayError, Result};
