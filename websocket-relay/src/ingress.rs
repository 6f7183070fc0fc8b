use std::sync::Arc;

use tokio::{
    select,
    time::{Instant, timeout_at},
};
use tracing::debug;

use crate::{
    connection::{Connection, DisconnectReason},
    error::RelayError,
    frame::Frame,
    hub::HubHandle,
};

/// Reads frames from `conn` and forwards payloads to the hub until the read
/// side fails, then disconnects the connection.
///
/// Each pong from the peer pushes the read deadline out by one pong wait.
/// Forwarding waits while the hub's event channel is full.
pub async fn run(hub: &HubHandle, conn: &Arc<Connection>) {
    if let Some(reason) = read_loop(hub, conn).await {
        hub.disconnect(conn, reason).await;
    }
}

/// Returns `None` when the connection was torn down elsewhere.
async fn read_loop(hub: &HubHandle, conn: &Arc<Connection>) -> Option<DisconnectReason> {
    let pong_wait = hub.config().pong_wait;
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let read = select! {
            biased;
            _ = conn.terminated() => return None,
            read = timeout_at(deadline, conn.receive()) => read,
        };

        let frame = match read {
            Err(_) => {
                debug!(conn = %conn.id(), "read deadline exceeded");
                return Some(DisconnectReason::ReadTimeout);
            }
            Ok(Err(err)) => return Some(read_failure(conn, err)),
            Ok(Ok(None)) => return Some(DisconnectReason::PeerClosed),
            Ok(Ok(Some(frame))) => frame,
        };

        let payload = match frame {
            Frame::Pong(_) => {
                deadline = Instant::now() + pong_wait;
                continue;
            }
            // The transport answers pings on its own.
            Frame::Ping(_) => continue,
            Frame::Close(_) => return Some(DisconnectReason::PeerClosed),
            Frame::Text(text) => text.into_bytes(),
            Frame::Binary(bytes) => bytes,
        };
        if hub.broadcast(conn.id(), payload).await.is_err() {
            return Some(DisconnectReason::Shutdown);
        }
    }
}

fn read_failure(conn: &Connection, err: RelayError) -> DisconnectReason {
    debug!(conn = %conn.id(), error = %err, "read failed");
    if err.is_protocol_violation() {
        DisconnectReason::MessageTooLarge
    } else {
        DisconnectReason::ReadFailed
    }
}
