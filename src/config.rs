//! Engine configuration
//!
//! Plain-data configuration consumed by the protocol engine. Loading and
//! merging (files, environment, defaults) is owned by the host process.

use std::time::Duration;

use serde::Deserialize;

use crate::types::ServerAddr;

/// Top-level engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// RC tier endpoints tried round-robin for login/keepalive
    pub rc_servers: Vec<ServerAddr>,
    /// Local address reported to the RC tier on login
    pub local_addr: ServerAddr,
    /// Per-tier connect/read timeouts
    pub timeouts: TierTimeouts,
    /// Enable the content-deduplication path for write/remove
    pub enable_dedup: bool,
    /// Keepalive tick interval
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,
    /// Maximum number of cached route-info entries
    pub route_cache_capacity: usize,
    /// Maximum number of cached block locations (0 disables the cache)
    pub block_cache_capacity: usize,
    /// Recoverable-failure retries per NS/DS tier call
    pub retry_budget: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rc_servers: Vec::new(),
            local_addr: ServerAddr::new(std::net::Ipv4Addr::UNSPECIFIED, 0),
            timeouts: TierTimeouts::default(),
            enable_dedup: false,
            keepalive_interval: Duration::from_secs(10),
            route_cache_capacity: 512,
            block_cache_capacity: 1024,
            retry_budget: 2,
        }
    }
}

/// Connect/read timeouts, one pair per tier
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TierTimeouts {
    #[serde(with = "duration_millis")]
    pub connect: Duration,
    #[serde(with = "duration_millis")]
    pub read_rc: Duration,
    #[serde(with = "duration_millis")]
    pub read_ns: Duration,
    #[serde(with = "duration_millis")]
    pub read_ds: Duration,
    #[serde(with = "duration_millis")]
    pub read_meta: Duration,
}

impl Default for TierTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(3000),
            read_rc: Duration::from_millis(3000),
            read_ns: Duration::from_millis(3000),
            read_ds: Duration::from_millis(3000),
            read_meta: Duration::from_millis(3000),
        }
    }
}

mod duration_secs {
    use super::*;
    use serde::Deserializer;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

mod duration_millis {
    use super::*;
    use serde::Deserializer;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// =============================================================================
// Tests
// =============================================================================
