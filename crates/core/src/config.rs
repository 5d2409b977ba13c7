//! # Engine Configuration
//!
//! Tunables for the poll loop, dispatch concurrency and retry defaults.
//! Every field has a default so partial JSON files deserialize cleanly.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::retry::{DefaultRetryPolicies, RetryPolicy};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database file
    pub database_path: PathBuf,
    /// Seconds between poll cycles
    pub poll_interval_secs: u64,
    /// Concurrent phase executions per poll cycle (1 = serial)
    pub max_concurrent_dispatch: usize,
    /// Policy used when neither the phase nor the kata names one
    pub default_retry: RetryPolicy,
    /// Broadcast channel capacity for the in-process event bus
    pub event_bus_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(".kata/kata.db"),
            poll_interval_secs: 30,
            max_concurrent_dispatch: 1,
            default_retry: DefaultRetryPolicies::no_retry(),
            event_bus_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn retry_policies(&self) -> DefaultRetryPolicies {
        DefaultRetryPolicies::new(self.default_retry.clone())
    }
}
