//! One user inside a room, possibly connected from several sockets.

use std::collections::{BTreeSet, HashSet};

use crate::connection::ConnectionId;
use crate::names;

/// Number of distinct presence colors a room hands out.
pub const COLOR_SLOTS: usize = 8;

#[derive(Debug)]
pub struct Identity {
    id: String,
    username: String,
    color: usize,
    connections: HashSet<ConnectionId>,
    presence: BTreeSet<u64>,
}

impl Identity {
    pub fn new(id: impl Into<String>, color: usize) -> Self {
        Self {
            id: id.into(),
            username: names::username(),
            color,
            connections: HashSet::new(),
            presence: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn color(&self) -> usize {
        self.color
    }

    pub fn connect(&mut self, conn: ConnectionId) {
        self.connections.insert(conn);
    }

    /// Returns true when the identity has no connections left.
    pub fn disconnect(&mut self, conn: ConnectionId) -> bool {
        self.connections.remove(&conn);
        self.connections.is_empty()
    }

    pub fn is_orphaned(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn add_presence(&mut self, client: u64) {
        self.presence.insert(client);
    }

    pub fn remove_presence(&mut self, client: u64) -> bool {
        self.presence.remove(&client)
    }

    pub fn has_presence(&self, client: u64) -> bool {
        self.presence.contains(&client)
    }

    pub fn presence(&self) -> impl Iterator<Item = u64> + '_ {
        self.presence.iter().copied()
    }
}

/// Least-used of `slots` colors among `taken`; ties go to the lowest index.
pub fn propose_color(taken: impl IntoIterator<Item = usize>, slots: usize) -> usize {
    let mut usage = vec![0usize; slots.max(1)];
    for color in taken {
        if let Some(count) = usage.get_mut(color) {
            *count += 1;
        }
    }
    usage
        .iter()
        .enumerate()
        .min_by_key(|(index, count)| (**count, *index))
        .map(|(index, _)| index)
        .unwrap_or(0)
}
