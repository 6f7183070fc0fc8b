use axum::extract::ws::{self, Message};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_TOO_LARGE: u16 = 1009;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// A single frame as seen by the relay, independent of the transport that
/// carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseFrame>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl Frame {
    /// Wraps a relayed payload. Text frames must carry UTF-8, so anything
    /// else goes out as binary.
    pub fn outbound(payload: Vec<u8>) -> Self {
        match String::from_utf8(payload) {
            Ok(text) => Frame::Text(text),
            Err(err) => Frame::Binary(err.into_bytes()),
        }
    }

    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Frame::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        }))
    }

    /// Size of the application payload; control frames count as zero.
    pub fn payload_len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
            Frame::Ping(_) | Frame::Pong(_) | Frame::Close(_) => 0,
        }
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(bytes) => Frame::Binary(bytes),
            Message::Ping(bytes) => Frame::Ping(bytes),
            Message::Pong(bytes) => Frame::Pong(bytes),
            Message::Close(close) => Frame::Close(close.map(|close| CloseFrame {
                code: close.code,
                reason: close.reason.into_owned(),
            })),
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
            Frame::Ping(bytes) => Message::Ping(bytes),
            Frame::Pong(bytes) => Message::Pong(bytes),
            Frame::Close(close) => Message::Close(close.map(|close| ws::CloseFrame {
                code: close.code,
                reason: close.reason.into(),
            })),
        }
    }
}
