//! Error-tracking sink

use std::error::Error;
use tracing::error;

/// Destination for unrecoverable failures
pub trait ErrorSink: Send + Sync {
    /// Record a failure. `context` names the operation that failed.
    fn capture(&self, context: &str, err: &(dyn Error + 'static));
}

/// Default sink: logs at `error!` with the full source chain
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn capture(&self, context: &str, err: &(dyn Error + 'static)) {
        let mut chain = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push_str(": ");
            chain.push_str(&cause.to_string());
            source = cause.source();
        }
        error!(error_context = %context, error = %chain, "Unrecoverable failure");
    }
}
