//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the storage engine.
///
/// Lock waits deliberately have no timeout knob: a waiting request ends
/// only by grant, deadlock, or its connection dropping. The no-wait lock
/// biases are the client's timeout mechanism.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Page cache capacity per open file, in pages.
    #[serde(default = "default_cache_pages")]
    pub cache_pages: usize,

    /// How often a blocked waiter re-probes the wait-for graph.
    #[serde(default = "default_deadlock_probe_ms")]
    pub deadlock_probe_ms: u64,
}

fn default_cache_pages() -> usize {
    1024
}

fn default_deadlock_probe_ms() -> u64 {
    50
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_pages: default_cache_pages(),
            deadlock_probe_ms: default_deadlock_probe_ms(),
        }
    }
}

impl EngineConfig {
    /// Deadlock probe interval as a `Duration`.
    #[must_use]
    pub fn deadlock_probe(&self) -> Duration {
        Duration::from_millis(self.deadlock_probe_ms)
    }
}
