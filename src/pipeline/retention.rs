//! Retention sweeper — clears stored bodies once their retention expires.
//!
//! Runs as an independent interval task and may interleave with the main
//! cycle: it only touches rows whose expiry has already passed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::store::Database;

/// Run a single sweep. Returns the number of bodies cleared.
pub async fn sweep_once(db: &Arc<dyn Database>) -> usize {
    match db.clear_expired_bodies(Utc::now()).await {
        Ok(0) => 0,
        Ok(cleared) => {
            info!(cleared, "Expired bodies cleared");
            cleared
        }
        Err(e) => {
            warn!(error = %e, "Retention sweep failed");
            0
        }
    }
}

/// Spawn the periodic retention task.
pub fn spawn_retention_task(
    db: Arc<dyn Database>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Retention sweeper started");
        let mut tick = tokio::time::interval(interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Retention sweeper shutting down");
                return;
            }

            sweep_once(&db).await;
        }
    });

    (handle, shutdown_flag)
}
