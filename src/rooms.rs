//! Registry of live rooms, keyed by name.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::names;
use crate::room::{Room, RoomContext, RoomHandle, RoomId, Snapshot};

type Registry = Mutex<HashMap<String, RoomHandle>>;

#[derive(Clone)]
pub struct Rooms {
    ctx: Arc<RoomContext>,
    registry: Arc<Registry>,
}

impl Rooms {
    pub fn new(ctx: RoomContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn context(&self) -> &Arc<RoomContext> {
        &self.ctx
    }

    /// The live room called `name`, opening it if needed.
    ///
    /// Must be called inside a tokio runtime.
    pub fn by_name(&self, name: &str) -> RoomHandle {
        let mut registry = self.registry.lock();
        if let Some(room) = registry.get(name).filter(|room| !room.is_closed()) {
            return room.clone();
        }
        let release = Arc::downgrade(&self.registry);
        let key = name.to_string();
        let room = Room::spawn(name, Arc::clone(&self.ctx), move |id| {
            release_entry(&release, &key, id)
        });
        debug!(room = name, "opened room");
        registry.insert(name.to_string(), room.clone());
        room
    }

    /// Whether `name` is live or has been stored. Unreadable entries count as taken.
    pub async fn exists(&self, name: &str) -> bool {
        if self.registry.lock().contains_key(name) {
            return true;
        }
        match self.ctx.store.section("room").get::<Snapshot>(name).await {
            Ok(stored) => stored.is_some(),
            Err(err) => {
                warn!(room = name, %err, "unreadable room entry, treating as taken");
                true
            }
        }
    }

    /// Open a room under a freshly generated, unused name.
    pub async fn with_unique_name(&self) -> RoomHandle {
        loop {
            let name = names::room_name();
            if !self.exists(&name).await {
                return self.by_name(&name);
            }
            debug!(room = %name, "name taken, retrying");
        }
    }

    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registry.lock().contains_key(name)
    }
}

/// Drop `name` from the registry if it still points at room `id`.
fn release_entry(registry: &Weak<Registry>, name: &str, id: RoomId) {
    let Some(registry) = registry.upgrade() else {
        return;
    };
    let mut registry = registry.lock();
    if registry.get(name).is_some_and(|room| room.id() == id) {
        registry.remove(name);
    }
}
