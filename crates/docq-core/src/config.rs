//! Queue configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config and
//! files only need to mention what they override.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::QueueError;
use crate::queue::GetOptions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long `get` keeps polling before returning an empty batch.
    pub wait_ms: u64,

    /// Sleep between claim attempts that found nothing.
    pub poll_ms: u64,

    /// Maximum messages claimed per `get`.
    pub limit: usize,

    /// Visibility timeout applied to claimed messages.
    pub running_reset_secs: u64,

    /// Attempts the index planner makes before giving up.
    pub index_attempts: u32,

    /// Delay before a message whose handler failed becomes visible again.
    pub retry_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            wait_ms: 3_000,
            poll_ms: 200,
            limit: 1,
            running_reset_secs: 30,
            index_attempts: 5,
            retry_delay_ms: 1_000,
        }
    }
}

impl QueueConfig {
    pub fn from_json_str(s: &str) -> Result<Self, QueueError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values every `get` would refuse.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.limit == 0 {
            return Err(QueueError::InvalidLimit);
        }
        Ok(())
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| QueueError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn get_options(&self) -> GetOptions {
        GetOptions::new(Duration::from_secs(self.running_reset_secs))
            .wait(Duration::from_millis(self.wait_ms))
            .poll(Duration::from_millis(self.poll_ms))
            .limit(self.limit)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
