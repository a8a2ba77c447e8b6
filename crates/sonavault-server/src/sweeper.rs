//! Background reclamation of upload workspaces.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::state::AppState;

/// How often the sweeper wakes up.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn the sweeper loop. Expires overdue upload sessions and deletes the
/// workspaces of aborted and expired ones.
pub fn spawn(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = state.uploads.sweep().await {
                warn!(error = %err, "Upload sweep failed");
            }
        }
    })
}
