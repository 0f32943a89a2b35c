use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Everything needed to open one broker session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// `scheme://host[:port]`, e.g. `tcp://192.168.4.1:1883`
    pub address: String,
    /// Generated when absent
    pub client_id: Option<String>,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            address: "tcp://127.0.0.1:1883".to_string(),
            client_id: None,
            clean_session: true,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Fixed-interval reconnect policy applied after a connection loss
///
/// A successful CONNACK resets the attempt counter. `max_attempts == 0` retries forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            max_attempts: 60,
        }
    }
}

impl ReconnectPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Delay before reconnect attempt `attempt` (1-based), or `None` once exhausted
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts != 0 && attempt > self.max_attempts {
            None
        } else {
            Some(self.interval())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_policy_runs_out() {
        let policy = ReconnectPolicy {
            interval_ms: 250,
            max_attempts: 2,
        };
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(250)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(250)));
        assert_eq!(policy.delay_for(3), None);
    }

    #[test]
    fn zero_means_unlimited() {
        let policy = ReconnectPolicy {
            interval_ms: 10,
            max_attempts: 0,
        };
        assert_eq!(policy.delay_for(10_000), Some(Duration::from_millis(10)));
    }
}
