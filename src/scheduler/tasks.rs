use anyhow::Result;
use tracing::{debug, info};

use crate::scheduler::Scheduler;
use crate::storage::Storage;

const SESSION_CLEANUP_CRON: &str = "0 0 3 * * *";
const HOURLY_CRON: &str = "0 0 * * * *";

/// Register session cleanup, cache purge and the heartbeat
pub async fn register_maintenance_tasks(
    scheduler: &Scheduler,
    storage: Storage,
    session_retention_days: u32,
) -> Result<()> {
    let sessions = storage.clone();
    scheduler
        .add_cron_job(SESSION_CLEANUP_CRON, "session-cleanup", move || {
            let storage = sessions.clone();
            async move {
                let removed = storage.cleanup_old_sessions(session_retention_days).await?;
                let remaining = storage.session_count().await?;
                info!(
                    "Removed {} sessions inactive for over {} days ({} remain)",
                    removed, session_retention_days, remaining
                );
                Ok(())
            }
        })
        .await?;

    scheduler
        .add_cron_job(HOURLY_CRON, "cache-purge", move || {
            let storage = storage.clone();
            async move {
                let purged = storage.purge_expired_cache().await?;
                debug!("Purged {} expired cache entries", purged);
                info!("Heartbeat: relay is alive");
                Ok(())
            }
        })
        .await?;

    Ok(())
}
