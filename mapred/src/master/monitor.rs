//! Heartbeat monitor: declares slaves lost after missed deadlines.

use std::sync::Arc;
use std::time::Duration;

use super::SlaveRegistry;
use crate::config::MISSED_HEARTBEAT_LIMIT;
use crate::scheduler::SchedulerClient;

/// Scan the roster every heartbeat interval; a slave that has been silent
/// past the deadline gets one direct ping before it is declared lost.
pub(super) async fn run(
    registry: Arc<SlaveRegistry>,
    scheduler: SchedulerClient,
    interval: Duration,
) {
    let deadline = interval * MISSED_HEARTBEAT_LIMIT;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        for slave in registry.silent_longer_than(deadline) {
            let alive = match registry.client(slave) {
                Some(client) => client.ping(tarpc::context::current()).await.is_ok(),
                None => false,
            };
            if alive {
                registry.mark_seen(slave);
                continue;
            }
            warn!(%slave, ?deadline, "heartbeat deadline exceeded");
            registry.remove(slave);
            scheduler.slave_lost(slave);
        }
    }
}
