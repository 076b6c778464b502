//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AtelierError, Result};

const DEFAULT_DEBOUNCE_MS: u64 = 2_000;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 30_000;
const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_MAX_SEQUENCE_PROBES: u32 = 25;
const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 10 * 60 * 1_000;

/// Tunables for the scheduler, allocator and reconciler.
///
/// Every field has a default, so partial JSON documents are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period after the last mutation before a pass starts.
    pub debounce_ms: u64,
    /// Delay before the single retry that follows a failed pass.
    pub retry_backoff_ms: u64,
    /// Consecutive automatic retries before waiting for the next trigger.
    pub max_retry_attempts: u32,
    /// Remote probes allowed per sequence-number reservation.
    pub max_sequence_probes: u32,
    /// Interval of the background orphan/duplicate sweep (`0` disables it).
    pub reconcile_interval_ms: u64,
    /// Name given to customers synthesized for orphaned records.
    pub placeholder_customer_name: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            max_sequence_probes: DEFAULT_MAX_SEQUENCE_PROBES,
            reconcile_interval_ms: DEFAULT_RECONCILE_INTERVAL_MS,
            placeholder_customer_name: "Unknown customer".to_string(),
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(input: &str) -> Result<Self> {
        let config: SyncConfig =
            serde_json::from_str(input).map_err(|e| AtelierError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.debounce_ms == 0 {
            return Err(AtelierError::Config("debounce_ms must be positive".into()));
        }
        if self.max_sequence_probes == 0 {
            return Err(AtelierError::Config(
                "max_sequence_probes must be positive".into(),
            ));
        }
        if self.placeholder_customer_name.trim().is_empty() {
            return Err(AtelierError::Config(
                "placeholder_customer_name must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_ms > 0).then(|| Duration::from_millis(self.reconcile_interval_ms))
    }
}
