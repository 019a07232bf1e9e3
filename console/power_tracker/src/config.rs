use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStrategy {
    // One status request at a time, in registration order
    #[default]
    Sequential,
    // All status requests of a cycle in flight together, joined before publishing
    Concurrent,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub poll_interval_ms: u64,
    pub removal_delay_ms: u64,
    pub safety_net_delay_ms: u64,
    pub strategy: PollStrategy,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            removal_delay_ms: 2000,
            safety_net_delay_ms: 5000,
            strategy: PollStrategy::Sequential,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(TrackerError::InvalidConfig("poll_interval_ms must be greater than zero".to_string()));
        }
        if self.removal_delay_ms == 0 {
            return Err(TrackerError::InvalidConfig("removal_delay_ms must be greater than zero".to_string()));
        }
        if self.safety_net_delay_ms == 0 {
            return Err(TrackerError::InvalidConfig("safety_net_delay_ms must be greater than zero".to_string()));
        }
        Ok(())
    }
    
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    
    pub fn removal_delay(&self) -> Duration {
        Duration::from_millis(self.removal_delay_ms)
    }
    
    pub fn safety_net_delay(&self) -> Duration {
        Duration::from_millis(self.safety_net_delay_ms)
    }
}
