use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::scheduling::Scheduler;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites a school's WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// One compactor pass. Returns true when a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted after {appends} appends");
            true
        }
        Err(e) => {
            warn!("compaction failed: {e}");
            false
        }
    }
}

/// Background task that retries meeting-link provisioning for upcoming
/// bookings that were created while the provider was unreachable.
pub async fn run_link_backfill(scheduler: Arc<Scheduler>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let attached = scheduler.backfill_links().await;
        if attached > 0 {
            info!("backfilled {attached} meeting links");
        } else {
            debug!("link backfill: nothing to attach");
        }
    }
}
