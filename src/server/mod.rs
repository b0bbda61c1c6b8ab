//! HTTP server for Cachegate

pub mod http;

pub use http::{run, AppState};
