use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{sync::Mutex, time::timeout};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

use crate::{
    error::RelayError,
    frame::{CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CLOSE_TOO_LARGE, Frame},
    transport::{FrameSink, FrameStream},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Hands out connection identities to concurrent accept paths.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a connection was torn down. Ends up in the close frame and the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    PeerClosed,
    ReadFailed,
    ReadTimeout,
    MessageTooLarge,
    ProbeFailed,
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::PeerClosed => "peer_closed",
            DisconnectReason::ReadFailed => "read_failed",
            DisconnectReason::ReadTimeout => "read_timeout",
            DisconnectReason::MessageTooLarge => "message_too_large",
            DisconnectReason::ProbeFailed => "probe_failed",
            DisconnectReason::Shutdown => "relay shutting down",
        }
    }

    pub fn close_code(self) -> u16 {
        match self {
            DisconnectReason::PeerClosed => CLOSE_NORMAL,
            DisconnectReason::ReadFailed => CLOSE_INTERNAL_ERROR,
            DisconnectReason::MessageTooLarge => CLOSE_TOO_LARGE,
            DisconnectReason::ReadTimeout
            | DisconnectReason::ProbeFailed
            | DisconnectReason::Shutdown => CLOSE_GOING_AWAY,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One accepted client: an identity plus both halves of its stream.
///
/// Writes are serialized through a per-connection lock so the keepalive pump,
/// broadcast fan-out and error reports never interleave on the wire. Reads
/// are expected from the ingress loop only.
pub struct Connection {
    id: ConnectionId,
    sink: Mutex<FrameSink>,
    stream: Mutex<FrameStream>,
    max_message_size: usize,
    liveness: CancellationToken,
    retired: AtomicBool,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        sink: FrameSink,
        stream: FrameStream,
        max_message_size: usize,
    ) -> Self {
        Self {
            id,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            max_message_size,
            liveness: CancellationToken::new(),
            retired: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn send(&self, frame: Frame) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(frame).await
    }

    /// Sends a liveness probe, giving up after `deadline`.
    pub async fn probe(&self, deadline: Duration) -> Result<(), RelayError> {
        timeout(deadline, self.send(Frame::Ping(Vec::new())))
            .await
            .map_err(|_| RelayError::WriteTimeout(deadline))?
    }

    /// Next frame from the peer, `None` once the stream has ended.
    pub async fn receive(&self) -> Result<Option<Frame>, RelayError> {
        let mut stream = self.stream.lock().await;
        let frame = match stream.next().await {
            Some(frame) => frame?,
            None => return Ok(None),
        };

        let size = frame.payload_len();
        if size > self.max_message_size {
            return Err(RelayError::MessageTooLarge {
                size,
                limit: self.max_message_size,
            });
        }
        Ok(Some(frame))
    }

    /// Sends a close frame and closes the sink. Only the first call touches
    /// the transport.
    pub async fn close(&self, code: u16, reason: &str, deadline: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.liveness.cancel();

        let mut sink = self.sink.lock().await;
        match timeout(deadline, sink.send(Frame::close(code, reason))).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(conn = %self.id, error = %err, "failed to send close frame"),
            Err(_) => debug!(conn = %self.id, "timed out sending close frame"),
        }
        match timeout(deadline, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(conn = %self.id, error = %err, "failed to close stream"),
            Err(_) => debug!(conn = %self.id, "timed out closing stream"),
        }
    }

    /// Tells the peer what went wrong. Failures are swallowed.
    pub async fn report_error(&self, err: &RelayError, deadline: Duration) {
        let report = Frame::Text(err.to_string());
        match timeout(deadline, self.send(report)).await {
            Ok(Ok(())) => {}
            Ok(Err(report_err)) => {
                debug!(conn = %self.id, error = %report_err, "failed to report error to peer")
            }
            Err(_) => debug!(conn = %self.id, "timed out reporting error to peer"),
        }
    }

    /// Claims teardown of this connection. Returns `true` for the first
    /// caller only, and raises the liveness signal.
    pub fn retire(&self) -> bool {
        let first = !self.retired.swap(true, Ordering::AcqRel);
        if first {
            self.liveness.cancel();
        }
        first
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection is retired or closed.
    pub fn terminated(&self) -> WaitForCancellationFuture<'_> {
        self.liveness.cancelled()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("retired", &self.is_retired())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::transport::memory;

    fn connection(buffer: usize) -> (memory::MemoryPeer, Arc<Connection>) {
        let (peer, sink, stream) = memory::pair(buffer);
        let conn = Connection::new(ConnectionId::new(7), sink, stream, 8);
        (peer, Arc::new(conn))
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let ids = IdAllocator::new();
        let first = ids.next_id();
        let second = ids.next_id();
        assert!(second > first);
        assert_eq!(first.to_string(), "conn-1");
    }

    #[tokio::test]
    async fn concurrent_writes_arrive_whole() {
        let (mut peer, conn) = connection(64);
        let mut writers = Vec::new();
        for n in 0..16 {
            let conn = Arc::clone(&conn);
            writers.push(tokio::spawn(async move {
                conn.send(Frame::Text(format!("message-{n}"))).await
            }));
        }
        for writer in writers {
            writer.await.expect("join").expect("send");
        }

        let mut seen = Vec::new();
        for _ in 0..16 {
            match peer.recv().await {
                Some(Frame::Text(text)) => seen.push(text),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        seen.sort();
        let mut expected: Vec<_> = (0..16).map(|n| format!("message-{n}")).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn receive_rejects_oversized_payloads() {
        let (mut peer, conn) = connection(4);
        peer.send_text("tiny").await.expect("send");
        peer.send_text("far too long").await.expect("send");

        assert_eq!(
            conn.receive().await.expect("first read"),
            Some(Frame::Text("tiny".into()))
        );
        let err = conn.receive().await.expect_err("second read should fail");
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn close_touches_the_transport_once() {
        let (mut peer, conn) = connection(4);
        conn.close(CLOSE_NORMAL, "bye", Duration::from_secs(1)).await;
        conn.close(CLOSE_NORMAL, "bye", Duration::from_secs(1)).await;

        assert_eq!(peer.close_count(), 1);
        assert_eq!(peer.recv().await, Some(Frame::close(CLOSE_NORMAL, "bye")));
        assert_eq!(peer.recv().await, None);
        assert!(matches!(
            conn.send(Frame::Text("late".into())).await,
            Err(RelayError::Closed)
        ));
    }

    #[tokio::test]
    async fn retire_is_claimed_once_and_raises_liveness() {
        let (_peer, conn) = connection(4);
        assert!(conn.retire());
        assert!(!conn.retire());
        timeout(Duration::from_millis(100), conn.terminated())
            .await
            .expect("liveness signal should be raised");
    }

    #[tokio::test]
    async fn probe_fails_when_peer_stops_reading() {
        let (_peer, conn) = connection(0);
        let err = conn
            .probe(Duration::from_millis(50))
            .await
            .expect_err("probe to an unread peer");
        assert!(matches!(err, RelayError::WriteTimeout(_)));
    }

    #[tokio::test]
    async fn report_error_sends_the_error_text() {
        let (mut peer, conn) = connection(4);
        conn.report_error(&RelayError::Closed, Duration::from_secs(1))
            .await;
        assert_eq!(
            peer.recv().await,
            Some(Frame::Text("connection is closed".into()))
        );
    }
}
