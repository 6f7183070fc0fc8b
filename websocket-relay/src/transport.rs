//! Boxed frame halves that decouple connections from the wire.
//!
//! The relay never implements framing itself. An upgraded axum WebSocket is
//! adapted with [`websocket`]; [`memory`] provides an in-process pair with
//! the same surface.

use std::pin::Pin;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tokio_tungstenite::tungstenite::{self, error::CapacityError};

use crate::{error::RelayError, frame::Frame};

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = RelayError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, RelayError>> + Send>>;

/// Splits an upgraded socket into independently owned write and read halves.
pub fn websocket(socket: WebSocket) -> (FrameSink, FrameStream) {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(RelayError::transport)
        .with(|frame: Frame| future::ready(Ok::<_, RelayError>(Message::from(frame))));
    let stream = stream.map(|message| message.map(Frame::from).map_err(read_error));
    (Box::pin(sink), Box::pin(stream))
}

/// The socket enforces the size limit while decoding, so an oversized
/// message shows up as a capacity error rather than a frame.
fn read_error(err: axum::Error) -> RelayError {
    match err.into_inner().downcast::<tungstenite::Error>() {
        Ok(err) => match *err {
            tungstenite::Error::Capacity(CapacityError::MessageTooLong { size, max_size }) => {
                RelayError::MessageTooLarge {
                    size,
                    limit: max_size,
                }
            }
            other => RelayError::transport(other),
        },
        Err(err) => RelayError::transport(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_errors_become_protocol_violations() {
        let err = axum::Error::new(tungstenite::Error::Capacity(
            CapacityError::MessageTooLong {
                size: 600,
                max_size: 512,
            },
        ));
        let err = read_error(err);
        assert!(err.is_protocol_violation());
        assert_eq!(err.to_string(), "message of 600 bytes exceeds the 512 byte limit");

        let err = read_error(axum::Error::new(tungstenite::Error::ConnectionClosed));
        assert!(matches!(err, RelayError::Transport(_)));
    }
}

pub mod memory {
    //! In-process transport backed by futures channels.
    //!
    //! The relay side gets a [`FrameSink`]/[`FrameStream`] pair, the other
    //! side a [`MemoryPeer`] that plays the remote client. A peer that stops
    //! reading behaves like a slow consumer once the buffer is full, and a
    //! peer that drops its inbox makes every write fail.

    use std::{
        pin::Pin,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        task::{Context, Poll, ready},
    };

    use futures::{Sink, SinkExt, StreamExt, channel::mpsc};

    use super::{FrameSink, FrameStream};
    use crate::{error::RelayError, frame::Frame};

    /// Creates a connected pair. `buffer` is how many frames the relay may
    /// write ahead of the peer before writes start to wait.
    pub fn pair(buffer: usize) -> (MemoryPeer, FrameSink, FrameStream) {
        let (to_peer, inbox) = mpsc::channel(buffer);
        let (outbox, from_peer) = mpsc::channel(buffer.max(1));
        let closes = Arc::new(AtomicUsize::new(0));

        let sink = MemorySink {
            inner: to_peer,
            closes: Arc::clone(&closes),
        };
        let peer = MemoryPeer {
            inbox: Some(inbox),
            outbox: Some(outbox),
            closes,
        };
        (peer, Box::pin(sink), Box::pin(from_peer))
    }

    struct MemorySink {
        inner: mpsc::Sender<Frame>,
        closes: Arc<AtomicUsize>,
    }

    impl Sink<Frame> for MemorySink {
        type Error = RelayError;

        fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            let this = self.get_mut();
            Pin::new(&mut this.inner)
                .poll_ready(cx)
                .map_err(RelayError::transport)
        }

        fn start_send(self: Pin<&mut Self>, frame: Frame) -> Result<(), Self::Error> {
            let this = self.get_mut();
            Pin::new(&mut this.inner)
                .start_send(frame)
                .map_err(RelayError::transport)
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            let this = self.get_mut();
            Pin::new(&mut this.inner)
                .poll_flush(cx)
                .map_err(RelayError::transport)
        }

        fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            let this = self.get_mut();
            let result = ready!(Pin::new(&mut this.inner).poll_close(cx));
            this.closes.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(result.map_err(RelayError::transport))
        }
    }

    /// The remote end of a memory transport.
    pub struct MemoryPeer {
        inbox: Option<mpsc::Receiver<Frame>>,
        outbox: Option<mpsc::Sender<Result<Frame, RelayError>>>,
        closes: Arc<AtomicUsize>,
    }

    impl MemoryPeer {
        pub async fn send(&mut self, frame: Frame) -> Result<(), RelayError> {
            let outbox = self.outbox.as_mut().ok_or(RelayError::Closed)?;
            outbox.send(Ok(frame)).await.map_err(RelayError::transport)
        }

        pub async fn send_text(&mut self, text: &str) -> Result<(), RelayError> {
            self.send(Frame::Text(text.to_string())).await
        }

        /// Makes the relay's next read fail with `err`.
        pub async fn fail(&mut self, err: RelayError) -> Result<(), RelayError> {
            let outbox = self.outbox.as_mut().ok_or(RelayError::Closed)?;
            outbox.send(Err(err)).await.map_err(RelayError::transport)
        }

        /// Ends the relay's read stream without a close frame.
        pub fn hang_up(&mut self) {
            self.outbox = None;
        }

        /// Stops accepting frames; relay writes fail from now on.
        pub fn drop_inbox(&mut self) {
            self.inbox = None;
        }

        /// Next frame written by the relay, or `None` once the relay closed
        /// its sink (or the inbox was dropped).
        pub async fn recv(&mut self) -> Option<Frame> {
            match self.inbox.as_mut() {
                Some(inbox) => inbox.next().await,
                None => None,
            }
        }

        /// Next text or binary payload, skipping control frames. `None` once
        /// the relay closed its side.
        pub async fn recv_payload(&mut self) -> Option<Frame> {
            while let Some(frame) = self.recv().await {
                match frame {
                    Frame::Text(_) | Frame::Binary(_) => return Some(frame),
                    Frame::Ping(_) | Frame::Pong(_) | Frame::Close(_) => continue,
                }
            }
            None
        }

        /// How many times the relay closed its sink.
        pub fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    #[cfg(test)]
    mod tests {
        use std::time::Duration;

        use futures::SinkExt;
        use tokio::time::timeout;

        use super::*;

        #[tokio::test]
        async fn frames_flow_in_both_directions() {
            let (mut peer, mut sink, mut stream) = pair(4);

            sink.send(Frame::Text("down".into())).await.expect("write");
            assert_eq!(peer.recv().await, Some(Frame::Text("down".into())));

            peer.send_text("up").await.expect("peer write");
            let frame = stream.next().await.expect("frame").expect("ok frame");
            assert_eq!(frame, Frame::Text("up".into()));

            peer.hang_up();
            assert!(stream.next().await.is_none());
        }

        #[tokio::test]
        async fn unread_peer_blocks_writes() {
            let (_peer, mut sink, _stream) = pair(0);
            let write = timeout(
                Duration::from_millis(50),
                sink.send(Frame::Text("stuck".into())),
            )
            .await;
            assert!(write.is_err(), "write to an unread peer should wait");
        }

        #[tokio::test]
        async fn dropped_inbox_fails_writes_and_counts_closes() {
            let (mut peer, mut sink, _stream) = pair(4);
            peer.drop_inbox();
            assert!(sink.send(Frame::Text("lost".into())).await.is_err());

            sink.close().await.expect("close");
            assert_eq!(peer.close_count(), 1);
        }
    }
}
