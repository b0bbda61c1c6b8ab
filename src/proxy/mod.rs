//! Upstream forwarding for cache misses and admin refreshes

pub mod forward;

pub use forward::{ForwardError, ForwardRequest, ForwardResponse, Forwarder, HttpForwarder};
