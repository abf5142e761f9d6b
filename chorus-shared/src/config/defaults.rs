//! Default coordination timings

use std::time::Duration;

// ===== Membership =====

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_STALENESS_THRESHOLD_MS: u64 = 5_000;

// ===== Leader Election =====

pub const DEFAULT_LEADER_TICK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_FOLLOWER_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_ORPHAN_SWEEP_TICKS: u32 = 10;

// ===== Ownership =====

pub const DEFAULT_LEASE_TTL_MS: u64 = 10_000;
pub const DEFAULT_CLAIM_POLL_INTERVAL_MS: u64 = 1_000;
pub const OWNERSHIP_HASH: &str = "ownership";

// ===== Store =====

pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;

pub const fn heartbeat_interval() -> Duration {
    Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS)
}

pub const fn staleness_threshold() -> Duration {
    Duration::from_millis(DEFAULT_STALENESS_THRESHOLD_MS)
}

pub const fn leader_tick_interval() -> Duration {
    Duration::from_millis(DEFAULT_LEADER_TICK_INTERVAL_MS)
}

pub const fn follower_poll_interval() -> Duration {
    Duration::from_millis(DEFAULT_FOLLOWER_POLL_INTERVAL_MS)
}

pub const fn lease_ttl() -> Duration {
    Duration::from_millis(DEFAULT_LEASE_TTL_MS)
}

pub const fn claim_poll_interval() -> Duration {
    Duration::from_millis(DEFAULT_CLAIM_POLL_INTERVAL_MS)
}

pub const fn store_timeout() -> Duration {
    Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS)
}

pub const fn orphan_sweep_ticks() -> u32 {
    DEFAULT_ORPHAN_SWEEP_TICKS
}
