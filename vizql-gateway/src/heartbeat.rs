//! Heartbeat tracking: pings go out on a fixed interval, and a session
//! that goes unanswered for two consecutive intervals is terminated as
//! unclean.

use std::sync::Arc;
use std::time::Duration;

use crate::bus::BusSubscriber;
use crate::index::SessionIndex;

pub const MISSED_INTERVALS_BEFORE_UNCLEAN_TERMINATION: u32 = 2;

/// Runs forever: every `interval`, pings every live session and
/// disconnects (unclean) any session that missed
/// [`MISSED_INTERVALS_BEFORE_UNCLEAN_TERMINATION`] consecutive pings
/// in a row without a pong resetting its counter (reset happens out of
/// band, wherever the host reads pong frames off the socket). An unclean
/// termination unsubscribes the tenant's bus pattern the same way a clean
/// disconnect does, when it was the tenant's last local session.
pub async fn run_heartbeat_loop(
    index: Arc<SessionIndex>,
    subscriber: Arc<dyn BusSubscriber>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        for (tenant, was_last_for_tenant) in index.heartbeat_sweep() {
            if was_last_for_tenant {
                subscriber.unsubscribe_tenant(&tenant.0).await;
            }
        }
    }
}
