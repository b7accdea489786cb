//! Server side of one client socket, as seen by rooms and document sync.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::warn;

use crate::protocol::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outbound frame queued for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Cheap, clonable sender half of a socket.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl Connection {
    /// New connection plus the receiver the socket writer drains.
    pub fn open() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ConnectionId::next(),
                outbound,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send(&self, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(text) => self.send_text(text),
            Err(err) => warn!(conn = %self.id, %err, "failed to encode server message"),
        }
    }

    pub fn send_text(&self, text: String) {
        let _ = self.outbound.send(Frame::Text(text));
    }

    pub fn send_binary(&self, bytes: Vec<u8>) {
        let _ = self.outbound.send(Frame::Binary(bytes));
    }

    pub fn close(&self) {
        let _ = self.outbound.send(Frame::Close);
    }
}
