//! Logging infrastructure for Cachegate
//!
//! Request and tier events go through `tracing` directly. Failures nobody can
//! recover from (exhausted ledger retries, lost durable writes) are also
//! handed to an [`ErrorSink`] so deployments can forward them to an error
//! tracker.

pub mod sink;

pub use sink::{ErrorSink, TracingErrorSink};
