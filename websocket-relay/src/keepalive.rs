use std::sync::Arc;

use tokio::{
    select,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{debug, warn};

use crate::{
    connection::{Connection, DisconnectReason},
    hub::HubHandle,
};

/// Pings `conn` every ping period until the connection is torn down.
///
/// A failed probe is treated like a dead read path: the connection is
/// disconnected and the pump stops. When the ingress loop detects the death
/// first, the liveness signal stops the pump without another probe.
pub async fn run(hub: HubHandle, conn: Arc<Connection>) {
    let ping_period = hub.config().ping_period;
    let write_wait = hub.config().write_wait;

    let mut ticker = interval_at(Instant::now() + ping_period, ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            biased;
            _ = conn.terminated() => {
                debug!(conn = %conn.id(), "keepalive stopped");
                return;
            }
            _ = ticker.tick() => {
                if let Err(err) = conn.probe(write_wait).await {
                    warn!(conn = %conn.id(), error = %err, "liveness probe failed");
                    hub.disconnect(&conn, DisconnectReason::ProbeFailed).await;
                    return;
                }
            }
        }
    }
}
