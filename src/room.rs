//! Per-document orchestrator.
//!
//! A room runs as one tokio task that owns all of its state. Connections,
//! control messages, sandbox output, document presence, authorization changes
//! and compile completions all reach it as messages, so nothing inside needs a
//! lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::AuthLiveness;
use crate::connection::{Connection, ConnectionId};
use crate::docs::{DocEvent, DocumentSync, PresenceDiff};
use crate::identity::{propose_color, Identity, COLOR_SLOTS};
use crate::protocol::{
    ClientEntry, ClientMessage, CompilePhase, ErrorCode, ServerMessage, Visibility,
};
use crate::queue::{AdmissionQueue, QueueHandle};
use crate::sandbox::{RunOutcome, Sandbox, SandboxEvent, SandboxSettings, USER_KILL_REASON};
use crate::store::Store;
use crate::task::TaskError;
use crate::watchdog::WatchdogEvent;

const CLOSING_REASON: &str = "Room closed";

/// Everything rooms share with each other.
pub struct RoomContext {
    pub store: Store,
    pub queue: Arc<AdmissionQueue<RunOutcome>>,
    pub docs: Arc<dyn DocumentSync>,
    pub sandbox: Arc<SandboxSettings>,
    pub default_visibility: Visibility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomId(u64);

impl RoomId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("room {0} is closed")]
pub struct RoomClosed(pub String);

/// Persisted per-room state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub compile_output: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
}

/// Point-in-time view of a room, for introspection and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomView {
    pub name: String,
    pub visibility: Visibility,
    pub language: String,
    pub output: String,
    pub status: CompilePhase,
    pub connections: usize,
    pub identities: usize,
}

enum Command {
    Connect {
        conn: Connection,
        identity: String,
        auth: Arc<AuthLiveness>,
        reply: oneshot::Sender<bool>,
    },
    Disconnect(ConnectionId),
    Inbound {
        conn: ConnectionId,
        text: String,
    },
    SetVisibility(Visibility),
    SetLanguage(String),
    Compile,
    KillCompile,
    AuthChanged(ConnectionId),
    CompileSettled {
        generation: u64,
        result: Result<RunOutcome, TaskError>,
    },
    View(oneshot::Sender<RoomView>),
}

#[derive(Clone)]
pub struct RoomHandle {
    id: RoomId,
    name: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    ready: watch::Receiver<bool>,
}

impl RoomHandle {
    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Wait until the stored snapshot has been applied.
    pub async fn ready(&self) -> Result<(), RoomClosed> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|loaded| *loaded)
            .await
            .map(|_| ())
            .map_err(|_| self.closed())
    }

    /// Join the room. `Ok(false)` means the connection was turned away.
    pub async fn connect(
        &self,
        conn: Connection,
        identity: impl Into<String>,
        auth: Arc<AuthLiveness>,
    ) -> Result<bool, RoomClosed> {
        let (reply, joined) = oneshot::channel();
        self.send(Command::Connect {
            conn,
            identity: identity.into(),
            auth,
            reply,
        })?;
        joined.await.map_err(|_| self.closed())
    }

    pub fn disconnect(&self, conn: ConnectionId) {
        let _ = self.commands.send(Command::Disconnect(conn));
    }

    /// Hand over a text frame received on `conn`.
    pub fn inbound(&self, conn: ConnectionId, text: String) -> Result<(), RoomClosed> {
        self.send(Command::Inbound { conn, text })
    }

    pub fn compile(&self) -> Result<(), RoomClosed> {
        self.send(Command::Compile)
    }

    pub fn kill_compile(&self) -> Result<(), RoomClosed> {
        self.send(Command::KillCompile)
    }

    pub fn set_language(&self, language: impl Into<String>) -> Result<(), RoomClosed> {
        self.send(Command::SetLanguage(language.into()))
    }

    pub fn set_visibility(&self, visibility: Visibility) -> Result<(), RoomClosed> {
        self.send(Command::SetVisibility(visibility))
    }

    pub async fn view(&self) -> Result<RoomView, RoomClosed> {
        let (reply, view) = oneshot::channel();
        self.send(Command::View(reply))?;
        view.await.map_err(|_| self.closed())
    }

    fn send(&self, command: Command) -> Result<(), RoomClosed> {
        self.commands.send(command).map_err(|_| self.closed())
    }

    fn closed(&self) -> RoomClosed {
        RoomClosed(self.name.to_string())
    }
}

struct Member {
    identity: String,
    conn: Connection,
    auth: Arc<AuthLiveness>,
    watcher: JoinHandle<()>,
}

struct ActiveCompile {
    generation: u64,
    handle: QueueHandle<RunOutcome>,
    started: bool,
    kill_requested: bool,
}

pub struct Room {
    id: RoomId,
    name: String,
    ctx: Arc<RoomContext>,
    visibility: Visibility,
    sandbox: Sandbox,
    identities: BTreeMap<String, Identity>,
    members: HashMap<ConnectionId, Member>,
    compile: Option<ActiveCompile>,
    generation: u64,
    loopback: mpsc::WeakUnboundedSender<Command>,
}

impl Room {
    /// Start the room task. `on_shutdown` runs once when it stops.
    pub fn spawn(
        name: impl Into<String>,
        ctx: Arc<RoomContext>,
        on_shutdown: impl FnOnce(RoomId) + Send + 'static,
    ) -> RoomHandle {
        let name: String = name.into();
        let id = RoomId::next();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (ready_tx, ready) = watch::channel(false);
        let (sandbox_tx, sandbox_events) = mpsc::unbounded_channel();
        let doc_events = ctx.docs.subscribe(&name);

        let room = Room::new(id, name.clone(), ctx, sandbox_tx, commands_tx.downgrade());
        tokio::spawn(room.run(commands, sandbox_events, doc_events, ready_tx, on_shutdown));

        RoomHandle {
            id,
            name: name.into(),
            commands: commands_tx,
            ready,
        }
    }

    fn new(
        id: RoomId,
        name: String,
        ctx: Arc<RoomContext>,
        sandbox_events: mpsc::UnboundedSender<SandboxEvent>,
        loopback: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        Room {
            id,
            name,
            visibility: ctx.default_visibility,
            sandbox: Sandbox::new(Arc::clone(&ctx.sandbox), sandbox_events),
            ctx,
            identities: BTreeMap::new(),
            members: HashMap::new(),
            compile: None,
            generation: 0,
            loopback,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut sandbox_events: mpsc::UnboundedReceiver<SandboxEvent>,
        mut doc_events: broadcast::Receiver<DocEvent>,
        ready: watch::Sender<bool>,
        on_shutdown: impl FnOnce(RoomId),
    ) {
        self.load().await;
        let _ = ready.send(true);
        info!(room = %self.name, "room open");

        let mut docs_open = true;
        loop {
            tokio::select! {
                Some(event) = sandbox_events.recv() => self.on_sandbox_event(event).await,
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if let Command::CompileSettled { .. } = command {
                        // Output always precedes the completion it belongs to.
                        while let Ok(event) = sandbox_events.try_recv() {
                            self.on_sandbox_event(event).await;
                        }
                    }
                    self.handle(command).await;
                }
                event = doc_events.recv(), if docs_open => match event {
                    Ok(DocEvent::Presence { conn, diff }) => self.on_presence(conn, diff),
                    Ok(DocEvent::Destroyed) if self.members.is_empty() => break,
                    Ok(DocEvent::Destroyed) => debug!(room = %self.name, "document emptied while members remain"),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(room = %self.name, missed, "document events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => docs_open = false,
                },
            }
        }

        drop(doc_events);
        self.shutdown().await;
        on_shutdown(self.id);
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Connect {
                conn,
                identity,
                auth,
                reply,
            } => {
                let joined = self.connect(conn, identity, auth);
                let _ = reply.send(joined);
            }
            Command::Disconnect(conn) => self.disconnect(conn),
            Command::Inbound { conn, text } => self.inbound(conn, &text).await,
            Command::SetVisibility(visibility) => self.set_visibility(visibility).await,
            Command::SetLanguage(language) => self.set_language(&language).await,
            Command::Compile => self.compile().await,
            Command::KillCompile => self.kill_compile(),
            Command::AuthChanged(conn) => {
                self.check_auth(conn);
            }
            Command::CompileSettled { generation, result } => {
                self.on_compile_settled(generation, result).await
            }
            Command::View(reply) => {
                let _ = reply.send(self.view());
            }
        }
    }

    async fn load(&mut self) {
        let section = self.ctx.store.section("room");
        match section.get::<Snapshot>(&self.name).await {
            Ok(Some(snapshot)) => {
                if let Some(visibility) = snapshot.visibility {
                    self.visibility = visibility;
                }
                if let Some(language) = snapshot.language {
                    if let Err(err) = self.sandbox.set_language(&language) {
                        warn!(room = %self.name, %err, "stored language is not available");
                    }
                }
                if let Some(output) = snapshot.compile_output {
                    self.sandbox.set_output(output);
                }
                debug!(room = %self.name, "restored snapshot");
            }
            Ok(None) => {}
            Err(err) => warn!(room = %self.name, %err, "failed to load room, using defaults"),
        }
    }

    async fn save(&self) {
        let snapshot = Snapshot {
            compile_output: Some(self.sandbox.output()),
            language: Some(self.sandbox.language()),
            visibility: Some(self.visibility),
        };
        if let Err(err) = self.ctx.store.section("room").set(&self.name, &snapshot).await {
            warn!(room = %self.name, %err, "failed to save room");
        }
    }

    fn permits(&self, auth: &AuthLiveness) -> bool {
        self.visibility == Visibility::Public || auth.authorized()
    }

    fn connect(&mut self, conn: Connection, identity_id: String, auth: Arc<AuthLiveness>) -> bool {
        if !self.permits(&auth) {
            debug!(room = %self.name, conn = %conn.id(), "login required");
            conn.send(&ServerMessage::Error(ErrorCode::LoginRequired));
            conn.close();
            return false;
        }

        let color = propose_color(self.identities.values().map(Identity::color), COLOR_SLOTS);
        self.identities
            .entry(identity_id.clone())
            .or_insert_with(|| Identity::new(identity_id.clone(), color))
            .connect(conn.id());

        conn.send(&self.visibility_message());
        conn.send(&self.language_message());
        conn.send(&self.compiling_message(true, self.sandbox.output()));
        conn.send(&self.clients_message());
        self.ctx.docs.attach(&self.name, &conn);
        conn.send(&ServerMessage::Ready);

        let watcher = self.watch_auth(conn.id(), &auth);
        info!(room = %self.name, conn = %conn.id(), identity = %identity_id, "connected");
        self.members.insert(
            conn.id(),
            Member {
                identity: identity_id,
                conn,
                auth,
                watcher,
            },
        );
        true
    }

    /// Forward every stop or alert of `auth` as an [`Command::AuthChanged`].
    fn watch_auth(&self, conn: ConnectionId, auth: &AuthLiveness) -> JoinHandle<()> {
        let mut events = auth.subscribe();
        let loopback = self.loopback.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(WatchdogEvent::Tick) => continue,
                    Ok(WatchdogEvent::Stop | WatchdogEvent::Alert)
                    | Err(broadcast::error::RecvError::Lagged(_)) => {
                        let Some(room) = loopback.upgrade() else { break };
                        if room.send(Command::AuthChanged(conn)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn disconnect(&mut self, conn: ConnectionId) {
        let Some(member) = self.members.remove(&conn) else {
            return;
        };
        member.watcher.abort();
        self.ctx.docs.detach(&self.name, conn);
        let orphaned = self
            .identities
            .get_mut(&member.identity)
            .is_some_and(|identity| identity.disconnect(conn));
        if orphaned {
            self.identities.remove(&member.identity);
        }
        info!(room = %self.name, %conn, "disconnected");
        self.broadcast(&self.clients_message());
    }

    /// Turn `conn` away if it may no longer see the room.
    fn check_auth(&mut self, conn: ConnectionId) -> bool {
        let Some(member) = self.members.get(&conn) else {
            return false;
        };
        if self.permits(&member.auth) {
            return true;
        }
        info!(room = %self.name, %conn, "authorization lost");
        member
            .conn
            .send(&ServerMessage::Error(ErrorCode::LoginRequired));
        member.conn.close();
        self.disconnect(conn);
        false
    }

    async fn inbound(&mut self, conn: ConnectionId, text: &str) {
        let Some(auth) = self.members.get(&conn).map(|member| Arc::clone(&member.auth)) else {
            return;
        };
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(room = %self.name, %conn, %err, "ignoring client message");
                return;
            }
        };
        match message {
            ClientMessage::Compile => self.compile().await,
            ClientMessage::CancelCompile => self.kill_compile(),
            ClientMessage::Language(language) => self.set_language(&language).await,
            ClientMessage::Auth(token) => auth.heartbeat(&token),
            ClientMessage::Visibility(visibility) => {
                if auth.authorized() {
                    self.set_visibility(visibility).await;
                } else {
                    debug!(room = %self.name, %conn, "visibility change from unauthorized connection");
                }
            }
        }
    }

    async fn set_language(&mut self, language: &str) {
        if language == self.sandbox.language() {
            return;
        }
        if let Err(err) = self.sandbox.set_language(language) {
            debug!(room = %self.name, %err, "ignoring language change");
            return;
        }
        info!(room = %self.name, language, "language changed");
        self.save().await;
        self.broadcast(&self.language_message());
    }

    async fn set_visibility(&mut self, visibility: Visibility) {
        if visibility == self.visibility {
            return;
        }
        self.visibility = visibility;
        info!(room = %self.name, %visibility, "visibility changed");
        self.save().await;
        self.broadcast(&self.visibility_message());
        let conns: Vec<_> = self.members.keys().copied().collect();
        for conn in conns {
            self.check_auth(conn);
        }
    }

    async fn compile(&mut self) {
        if self.compile.is_some() {
            return;
        }
        self.generation += 1;
        let generation = self.generation;
        let source = self.ctx.docs.text(&self.name);
        let sandbox = self.sandbox.clone();
        let handle = self
            .ctx
            .queue
            .enqueue(move || async move { Ok(sandbox.compile(source).await) });

        let outcome = handle.outcome();
        let loopback = self.loopback.clone();
        tokio::spawn(async move {
            let result = outcome.await;
            if let Some(room) = loopback.upgrade() {
                let _ = room.send(Command::CompileSettled { generation, result });
            }
        });

        self.compile = Some(ActiveCompile {
            generation,
            handle,
            started: false,
            kill_requested: false,
        });
        info!(room = %self.name, generation, "compile queued");
        self.broadcast(&ServerMessage::compiling(CompilePhase::Queued, false, ""));
        self.save().await;
    }

    fn kill_compile(&mut self) {
        let Some(active) = self.compile.as_mut() else {
            return;
        };
        if active.handle.is_pending() && active.handle.cancel() {
            info!(room = %self.name, generation = active.generation, "queued compile canceled");
            self.compile = None;
            self.broadcast(&self.compiling_message(false, String::new()));
            return;
        }
        if active.started {
            self.sandbox.kill(USER_KILL_REASON);
        } else if !self.sandbox.kill(USER_KILL_REASON) {
            // Admitted but the sandbox has not reported in yet.
            active.kill_requested = true;
        }
    }

    async fn on_sandbox_event(&mut self, event: SandboxEvent) {
        match event {
            SandboxEvent::Started => {
                if let Some(active) = self.compile.as_mut() {
                    active.started = true;
                    if active.kill_requested {
                        self.sandbox.kill(USER_KILL_REASON);
                    }
                }
                self.broadcast(&self.compiling_message(true, String::new()));
                self.save().await;
            }
            SandboxEvent::Output(chunk) => {
                self.broadcast(&self.compiling_message(false, chunk));
            }
        }
    }

    async fn on_compile_settled(&mut self, generation: u64, result: Result<RunOutcome, TaskError>) {
        if self.compile.as_ref().map(|active| active.generation) != Some(generation) {
            debug!(room = %self.name, generation, "stale compile completion");
            return;
        }
        self.compile = None;
        match result {
            Ok(outcome) => info!(room = %self.name, generation, ?outcome, "compile finished"),
            Err(err) if err.is_canceled() => debug!(room = %self.name, generation, "compile canceled"),
            Err(err) => warn!(room = %self.name, generation, %err, "compile failed"),
        }
        self.broadcast(&self.compiling_message(false, String::new()));
        self.save().await;
    }

    fn on_presence(&mut self, conn: ConnectionId, diff: PresenceDiff) {
        let holder = self.members.get(&conn).map(|member| member.identity.clone());
        if let Some(identity) = holder.as_ref().and_then(|id| self.identities.get_mut(id)) {
            for client in diff.added.iter().chain(&diff.updated) {
                identity.add_presence(*client);
            }
        }
        for client in &diff.removed {
            let owner = holder
                .as_ref()
                .filter(|id| {
                    self.identities
                        .get(*id)
                        .is_some_and(|identity| identity.has_presence(*client))
                })
                .cloned()
                .or_else(|| {
                    self.identities
                        .values()
                        .find(|identity| identity.has_presence(*client))
                        .map(|identity| identity.id().to_string())
                });
            if let Some(identity) = owner.and_then(|id| self.identities.get_mut(&id)) {
                identity.remove_presence(*client);
            }
        }
        self.broadcast(&self.clients_message());
    }

    async fn shutdown(&mut self) {
        if let Some(active) = self.compile.take() {
            if active.handle.cancel() {
                debug!(room = %self.name, generation = active.generation, "queued compile dropped");
            }
        }
        // Covers a job admitted but not yet started.
        self.sandbox.close(CLOSING_REASON);
        for (_, member) in self.members.drain() {
            member.watcher.abort();
        }
        self.save().await;
        self.ctx.docs.release(&self.name);
        info!(room = %self.name, "room closed");
    }

    fn compile_phase(&self) -> CompilePhase {
        match &self.compile {
            None => CompilePhase::Done,
            Some(active) if active.handle.is_pending() => CompilePhase::Queued,
            Some(_) => CompilePhase::Compiling,
        }
    }

    fn view(&self) -> RoomView {
        RoomView {
            name: self.name.clone(),
            visibility: self.visibility,
            language: self.sandbox.language(),
            output: self.sandbox.output(),
            status: self.compile_phase(),
            connections: self.members.len(),
            identities: self.identities.len(),
        }
    }

    fn broadcast(&self, message: &ServerMessage) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(err) => {
                warn!(room = %self.name, %err, "failed to encode broadcast");
                return;
            }
        };
        for member in self.members.values() {
            member.conn.send_text(text.clone());
        }
    }

    fn visibility_message(&self) -> ServerMessage {
        ServerMessage::Visibility(self.visibility)
    }

    fn language_message(&self) -> ServerMessage {
        ServerMessage::Language(self.sandbox.language())
    }

    fn compiling_message(&self, clear: bool, data: String) -> ServerMessage {
        ServerMessage::compiling(self.compile_phase(), clear, data)
    }

    fn clients_message(&self) -> ServerMessage {
        ServerMessage::Clients(
            self.identities
                .values()
                .map(|identity| ClientEntry {
                    username: identity.username().to_string(),
                    color: identity.color(),
                    clients: identity.presence().map(|id| id.to_string()).collect(),
                })
                .collect(),
        )
    }
}
