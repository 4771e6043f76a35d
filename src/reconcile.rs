use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::error::LocationError;
use crate::sync::CacheSyncEngine;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub repaired: usize,
    pub failed: usize,
}

/// Resyncs every queued connection once, oldest first. Failed connections
/// stay queued for the next pass; connections that no longer exist are
/// dropped from the queue.
pub async fn reconcile_pending(engine: &CacheSyncEngine) -> anyhow::Result<ReconcileSummary> {
    let pending = engine.store().pending_resyncs().await?;
    let mut summary = ReconcileSummary::default();

    for connection_id in pending {
        match engine.resync_connection(connection_id).await {
            Ok(_) => summary.repaired += 1,
            Err(LocationError::NotFound(_)) => {
                warn!("🧹 dropping queued resync for missing connection {}", connection_id);
                engine.store().clear_resync(connection_id).await?;
            }
            Err(err) => {
                warn!("⚠️ resync of {} failed, will retry: {}", connection_id, err);
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}

pub fn spawn_reconciler(engine: Arc<CacheSyncEngine>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("🔁 reconciler running every {:?}", period);

        loop {
            ticker.tick().await;
            match reconcile_pending(&engine).await {
                Ok(summary) if summary.repaired + summary.failed > 0 => {
                    info!(
                        "🔁 reconciled {} connections ({} still pending)",
                        summary.repaired, summary.failed
                    );
                }
                Ok(_) => {}
                Err(err) => error!("❌ could not read resync queue: {:#}", err),
            }
        }
    })
}
