//! Document-sync transport seam and an in-process relay.
//!
//! Binary frames on the document socket are owned by the transport. The room
//! only learns about presence changes and about the document losing its last
//! subscriber.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionId};

/// Full document text, UTF-8.
pub const FRAME_TEXT: u8 = 0;
/// Presence diff, JSON.
pub const FRAME_PRESENCE: u8 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceDiff {
    #[serde(default)]
    pub added: Vec<u64>,
    #[serde(default)]
    pub updated: Vec<u64>,
    #[serde(default)]
    pub removed: Vec<u64>,
}

impl PresenceDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocEvent {
    /// Presence ids changed, attributed to the connection that sent the diff.
    Presence { conn: ConnectionId, diff: PresenceDiff },
    /// The document has no subscribers left.
    Destroyed,
}

pub trait DocumentSync: Send + Sync + 'static {
    fn attach(&self, doc: &str, conn: &Connection);
    fn receive(&self, doc: &str, conn: ConnectionId, frame: &[u8]);
    fn detach(&self, doc: &str, conn: ConnectionId);
    fn text(&self, doc: &str) -> String;
    fn subscribe(&self, doc: &str) -> broadcast::Receiver<DocEvent>;
    /// Drop state for `doc` once nobody is attached or subscribed.
    fn release(&self, doc: &str);
}

struct Doc {
    text: String,
    peers: HashMap<ConnectionId, Connection>,
    presence: HashMap<ConnectionId, BTreeSet<u64>>,
    events: broadcast::Sender<DocEvent>,
}

impl Doc {
    fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            text: String::new(),
            peers: HashMap::new(),
            presence: HashMap::new(),
            events,
        }
    }

    fn is_idle(&self) -> bool {
        self.peers.is_empty() && self.events.receiver_count() == 0
    }

    fn relay(&self, from: ConnectionId, frame: &[u8]) {
        for (id, peer) in &self.peers {
            if *id != from {
                peer.send_binary(frame.to_vec());
            }
        }
    }
}

/// Last-writer-wins relay. Good enough for one process; not a CRDT.
#[derive(Default)]
pub struct MemoryDocs {
    docs: Mutex<HashMap<String, Doc>>,
}

impl MemoryDocs {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_doc<R>(&self, doc: &str, f: impl FnOnce(&mut Doc) -> R) -> R {
        let mut docs = self.docs.lock();
        let entry = docs.entry(doc.to_string()).or_insert_with(Doc::new);
        f(entry)
    }

    fn with_existing(&self, doc: &str, f: impl FnOnce(&mut Doc)) {
        let mut docs = self.docs.lock();
        let Some(entry) = docs.get_mut(doc) else {
            debug!(doc, "no such document");
            return;
        };
        f(entry);
        if entry.is_idle() {
            docs.remove(doc);
        }
    }
}

impl DocumentSync for MemoryDocs {
    fn attach(&self, doc: &str, conn: &Connection) {
        self.with_doc(doc, |entry| {
            let mut frame = vec![FRAME_TEXT];
            frame.extend_from_slice(entry.text.as_bytes());
            conn.send_binary(frame);
            entry.peers.insert(conn.id(), conn.clone());
        });
    }

    fn receive(&self, doc: &str, conn: ConnectionId, frame: &[u8]) {
        let Some((&kind, body)) = frame.split_first() else {
            return;
        };
        self.with_existing(doc, |entry| {
            if !entry.peers.contains_key(&conn) {
                debug!(doc, %conn, "frame from detached connection");
                return;
            }
            match kind {
                FRAME_TEXT => match std::str::from_utf8(body) {
                    Ok(text) => {
                        entry.text = text.to_string();
                        entry.relay(conn, frame);
                    }
                    Err(err) => warn!(doc, %conn, %err, "document text is not UTF-8"),
                },
                FRAME_PRESENCE => match serde_json::from_slice::<PresenceDiff>(body) {
                    Ok(diff) => {
                        let owned = entry.presence.entry(conn).or_default();
                        owned.extend(diff.added.iter().chain(&diff.updated).copied());
                        for id in &diff.removed {
                            owned.remove(id);
                        }
                        entry.relay(conn, frame);
                        let _ = entry.events.send(DocEvent::Presence { conn, diff });
                    }
                    Err(err) => warn!(doc, %conn, %err, "bad presence diff"),
                },
                other => debug!(doc, %conn, kind = other, "unknown frame kind"),
            }
        });
    }

    fn detach(&self, doc: &str, conn: ConnectionId) {
        self.with_existing(doc, |entry| {
            if entry.peers.remove(&conn).is_none() {
                return;
            }
            let diff = PresenceDiff {
                removed: entry
                    .presence
                    .remove(&conn)
                    .unwrap_or_default()
                    .into_iter()
                    .collect(),
                ..PresenceDiff::default()
            };
            if !diff.is_empty() {
                if let Ok(body) = serde_json::to_vec(&diff) {
                    let mut frame = vec![FRAME_PRESENCE];
                    frame.extend(body);
                    entry.relay(conn, &frame);
                }
                let _ = entry.events.send(DocEvent::Presence { conn, diff });
            }
            if entry.peers.is_empty() {
                let _ = entry.events.send(DocEvent::Destroyed);
            }
        });
    }

    fn text(&self, doc: &str) -> String {
        self.docs
            .lock()
            .get(doc)
            .map(|entry| entry.text.clone())
            .unwrap_or_default()
    }

    fn subscribe(&self, doc: &str) -> broadcast::Receiver<DocEvent> {
        self.with_doc(doc, |entry| entry.events.subscribe())
    }

    fn release(&self, doc: &str) {
        self.with_existing(doc, |_| {});
    }
}
