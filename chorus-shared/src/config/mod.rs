//! Coordination timing configuration

pub mod defaults;

use crate::exception::{ChorusError, ChorusResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timings shared by election, ownership and failover
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// How often a machine touches its own row
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a machine counts as offline
    #[serde(with = "duration_ms")]
    pub staleness_threshold: Duration,
    #[serde(with = "duration_ms")]
    pub leader_tick_interval: Duration,
    /// Upper bound on how long a follower waits for a membership notification
    #[serde(with = "duration_ms")]
    pub follower_poll_interval: Duration,
    /// Renewal interval of the ownership lease; keys expire after 1.5x this
    #[serde(with = "duration_ms")]
    pub lease_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub claim_poll_interval: Duration,
    /// Per-call bound on store round trips issued from background loops
    #[serde(with = "duration_ms")]
    pub store_timeout: Duration,
    /// Leader ticks between orphaned-room sweeps
    pub orphan_sweep_ticks: u32,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: defaults::heartbeat_interval(),
            staleness_threshold: defaults::staleness_threshold(),
            leader_tick_interval: defaults::leader_tick_interval(),
            follower_poll_interval: defaults::follower_poll_interval(),
            lease_ttl: defaults::lease_ttl(),
            claim_poll_interval: defaults::claim_poll_interval(),
            store_timeout: defaults::store_timeout(),
            orphan_sweep_ticks: defaults::orphan_sweep_ticks(),
        }
    }
}

impl CoordinationConfig {
    /// Expiry applied to leased keys on every renewal
    pub fn lease_expiry(&self) -> Duration {
        lease_expiry(self.lease_ttl)
    }

    pub fn validate(&self) -> ChorusResult<()> {
        let intervals = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("staleness_threshold", self.staleness_threshold),
            ("leader_tick_interval", self.leader_tick_interval),
            ("follower_poll_interval", self.follower_poll_interval),
            ("lease_ttl", self.lease_ttl),
            ("claim_poll_interval", self.claim_poll_interval),
            ("store_timeout", self.store_timeout),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(ChorusError::configuration(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if self.staleness_threshold <= self.heartbeat_interval {
            return Err(ChorusError::configuration(
                "staleness_threshold must be greater than heartbeat_interval",
            ));
        }

        if self.orphan_sweep_ticks == 0 {
            return Err(ChorusError::configuration(
                "orphan_sweep_ticks must be greater than zero",
            ));
        }

        Ok(())
    }
}

/// 1.5x the renewal interval
pub fn lease_expiry(ttl: Duration) -> Duration {
    ttl + ttl / 2
}

/// Serialize durations as whole milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinationConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.staleness_threshold, Duration::from_secs(5));
        assert_eq!(config.follower_poll_interval, Duration::from_secs(5));
        assert_eq!(config.lease_ttl, Duration::from_secs(10));
        assert_eq!(config.lease_expiry(), Duration::from_secs(15));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = CoordinationConfig {
            lease_ttl: Duration::ZERO,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lease_ttl"));
    }

    #[test]
    fn test_validate_rejects_threshold_below_heartbeat() {
        let config = CoordinationConfig {
            heartbeat_interval: Duration::from_secs(5),
            staleness_threshold: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let json = serde_json::to_value(CoordinationConfig::default()).unwrap();
        assert_eq!(json["staleness_threshold"], 5000);

        let partial: CoordinationConfig =
            serde_json::from_str(r#"{"lease_ttl": 2500}"#).unwrap();
        assert_eq!(partial.lease_ttl, Duration::from_millis(2500));
        assert_eq!(partial.heartbeat_interval, Duration::from_secs(1));
    }
}
