//! Background keepalive cycle
//!
//! A task scheduled at engine start refreshes one cached route entry per
//! tick, round-robin over the keepalive ring. It communicates with
//! per-operation work only through the shared route cache, so an in-flight
//! keepalive outlives any request that triggered cache population, and its
//! result is simply discarded if the entry has since been evicted.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::op::driver::Driver;
use crate::proto::rc::{self, KeepaliveReply};

/// Refresh the next ring entry. A tick over an empty cache is a no-op.
pub async fn tick_once(driver: &Driver) -> Result<()> {
    let Some(tick) = driver.routes().keepalive_next() else {
        debug!("keepalive ring empty");
        return Ok(());
    };
    debug!(app_key = %tick.app_key, "keepalive tick");

    let servers = if tick.rc_servers.is_empty() {
        driver.config.rc_servers.clone()
    } else {
        tick.rc_servers.clone()
    };
    if servers.is_empty() {
        return Err(Error::NoEndpoint { tier: "rc server" });
    }

    let mut last_err = None;
    for &peer in &servers {
        let frame = rc::build_keepalive(&tick);
        match driver.transport.call(peer, frame).await {
            Ok(resp) => {
                match rc::parse_keepalive(&tick, &resp)? {
                    KeepaliveReply::Unchanged => {}
                    KeepaliveReply::Updated(info) => {
                        let outcome = driver.routes().apply_refresh(&tick.app_key, info);
                        debug!(app_key = %tick.app_key, ?outcome, "route entry refreshed");
                    }
                    KeepaliveReply::SessionGone => {
                        driver.routes().remove(&tick.app_key);
                        info!(app_key = %tick.app_key, "rc session gone, entry dropped");
                        return Ok(());
                    }
                }
                return Ok(());
            }
            Err(err) if err.is_recoverable() => {
                warn!(%peer, error = %err, "keepalive endpoint unreachable");
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or(Error::NoEndpoint { tier: "rc server" }))
}

/// Schedule the keepalive cycle on the current runtime. Errors are logged
/// and the cycle continues; dropping the handle stops it.
pub fn spawn(driver: Arc<Driver>) -> JoinHandle<()> {
    let interval = driver.config.keepalive_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = tick_once(&driver).await {
                warn!(error = %err, "keepalive tick failed");
            }
        }
    })
}
