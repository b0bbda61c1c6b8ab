//! Maintenance freeze switch
//!
//! A frozen URL is still served from cache but is never refreshed from the
//! origin. Freezing globally supersedes (and clears) the endpoint list.

use glob::Pattern;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::RwLock;
use tracing::info;

/// Current freeze configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FreezeState {
    pub global_freeze: bool,
    pub frozen_endpoints: BTreeSet<String>,
}

/// Process-wide freeze state, shared by route handlers and the engine
#[derive(Debug, Default)]
pub struct FreezeController {
    state: RwLock<FreezeState>,
}

fn is_glob(endpoint: &str) -> bool {
    endpoint.contains(['*', '?', '['])
}

impl FreezeController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle global freeze. Enabling it clears the per-endpoint set.
    pub fn set_global(&self, enabled: bool) -> FreezeState {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.global_freeze = enabled;
        if enabled {
            state.frozen_endpoints.clear();
        }
        info!(global = enabled, "Cache global freeze updated");
        state.clone()
    }

    /// Add (`enabled`) or remove endpoint substrings/patterns
    pub fn set_endpoints<I, S>(&self, endpoints: I, enabled: bool) -> FreezeState
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        for endpoint in endpoints {
            let endpoint = endpoint.as_ref().trim();
            if endpoint.is_empty() {
                continue;
            }
            if enabled {
                state.frozen_endpoints.insert(endpoint.to_string());
            } else {
                state.frozen_endpoints.remove(endpoint);
            }
        }
        info!(
            enabled = enabled,
            frozen = state.frozen_endpoints.len(),
            "Cache endpoint freeze updated"
        );
        state.clone()
    }

    /// Global freeze, or `url` contains / matches a frozen endpoint
    pub fn is_frozen(&self, url: &str) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if state.global_freeze {
            return true;
        }
        state.frozen_endpoints.iter().any(|endpoint| {
            if url.contains(endpoint.as_str()) {
                return true;
            }
            is_glob(endpoint)
                && Pattern::new(endpoint)
                    .map(|p| p.matches(url))
                    .unwrap_or(false)
        })
    }

    pub fn status(&self) -> FreezeState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
