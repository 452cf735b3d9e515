use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::Engine;

/// Background task that expires lapsed waitlist offers and cascades their
/// slots. Reads expire offers lazily as well; this keeps the queue moving
/// when nobody is reading.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        let expired = engine.sweep_expired_offers().await;
        if expired > 0 {
            info!(expired, "swept lapsed waitlist offers");
        }
    }
    debug!("offer sweeper stopped");
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            tracing::error!("WAL compaction failed after {appends} appends: {e}");
        }
    }
    debug!("compactor stopped");
}
