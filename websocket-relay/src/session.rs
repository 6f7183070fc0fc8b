use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    connection::{Connection, DisconnectReason},
    hub::HubHandle,
    ingress, keepalive,
    transport::{FrameSink, FrameStream},
};

/// Drives one accepted connection from registration to teardown.
///
/// The connection is registered before anything is read from it, so a leave
/// can never overtake its join. The keepalive pump runs on its own task; the
/// read loop runs on the caller's.
pub async fn run(hub: HubHandle, sink: FrameSink, stream: FrameStream) {
    let id = hub.next_id();
    let conn = Arc::new(Connection::new(
        id,
        sink,
        stream,
        hub.config().max_message_size,
    ));

    if let Err(err) = hub.join(Arc::clone(&conn)).await {
        warn!(conn = %id, error = %err, "rejecting connection");
        let reason = DisconnectReason::Shutdown;
        conn.close(reason.close_code(), reason.as_str(), hub.config().write_wait)
            .await;
        return;
    }

    let pump = tokio::spawn(keepalive::run(hub.clone(), Arc::clone(&conn)));
    ingress::run(&hub, &conn).await;

    if let Err(err) = pump.await {
        warn!(conn = %id, error = ?err, "keepalive task failed");
    }
    debug!(conn = %id, "session finished");
}
