use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use codeshare::auth::AuthLiveness;
use codeshare::connection::{Connection, Frame};
use codeshare::docs::{DocumentSync, MemoryDocs, FRAME_TEXT};
use codeshare::protocol::{CompilePhase, ErrorCode, ServerMessage, Visibility};
use codeshare::queue::AdmissionQueue;
use codeshare::room::{RoomContext, RoomHandle, RoomView};
use codeshare::rooms::Rooms;
use codeshare::sandbox::{Isolation, LanguageProfile, SandboxSettings, USER_KILL_REASON};
use codeshare::store::Store;

const WAIT: Duration = Duration::from_secs(10);

fn languages() -> Vec<LanguageProfile> {
    vec![
        LanguageProfile::new("text", "txt", &["cat main.txt"]),
        LanguageProfile::new("slow", "txt", &["sleep 1", "cat main.txt"]),
        LanguageProfile::new("stuck", "txt", &["sleep 30"]),
        LanguageProfile::new("rust", "rs", &["cat main.rs"]),
        LanguageProfile::new("marker", "txt", &["touch ../ran-marker"]),
    ]
}

fn context(
    workspace: &Path,
    store: Store,
    docs: Arc<MemoryDocs>,
    capacity: usize,
    visibility: Visibility,
) -> RoomContext {
    RoomContext {
        store,
        queue: Arc::new(AdmissionQueue::new(capacity).unwrap()),
        docs,
        sandbox: Arc::new(SandboxSettings {
            workspace_root: workspace.to_path_buf(),
            timeout: Duration::from_secs(20),
            isolation: Isolation::Unconfined,
            languages: languages(),
        }),
        default_visibility: visibility,
    }
}

fn liveness(accept: &'static str) -> Arc<AuthLiveness> {
    let authorizer = Arc::new(move |token: &str| token == accept);
    Arc::new(AuthLiveness::new(authorizer, Duration::from_secs(30)))
}

async fn next_frame(frames: &mut UnboundedReceiver<Frame>) -> Frame {
    timeout(WAIT, frames.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection dropped")
}

async fn next_message(frames: &mut UnboundedReceiver<Frame>) -> ServerMessage {
    loop {
        match next_frame(frames).await {
            Frame::Text(text) => return serde_json::from_str(&text).unwrap(),
            Frame::Binary(_) => continue,
            Frame::Close => panic!("connection closed"),
        }
    }
}

/// Skip the greeting sent on join.
async fn skip_greeting(frames: &mut UnboundedReceiver<Frame>) {
    while next_message(frames).await != ServerMessage::Ready {}
}

/// Poll `room` until `check` accepts its view. A closed room is passed as `None`.
async fn wait_for(room: &RoomHandle, check: impl Fn(Option<&RoomView>) -> bool) {
    timeout(WAIT, async {
        loop {
            let view = room.view().await.ok();
            if check(view.as_ref()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("room never reached the expected state");
}

async fn wait_for_status(room: &RoomHandle, phase: CompilePhase) {
    wait_for(room, |view| view.is_some_and(|view| view.status == phase)).await;
}

fn write_source(docs: &MemoryDocs, room: &str, conn: &Connection, text: &str) {
    let mut frame = vec![FRAME_TEXT];
    frame.extend_from_slice(text.as_bytes());
    docs.receive(room, conn.id(), &frame);
}

#[tokio::test]
async fn greeting_lists_state_then_ready() {
    let workspace = tempfile::tempdir().unwrap();
    let docs = Arc::new(MemoryDocs::new());
    let rooms = Rooms::new(context(
        workspace.path(),
        Store::in_memory(),
        docs,
        1,
        Visibility::Public,
    ));
    let room = rooms.by_name("greeting");

    let (conn, mut frames) = Connection::open();
    assert!(room.connect(conn, "alice", liveness("")).await.unwrap());

    assert_eq!(
        next_message(&mut frames).await,
        ServerMessage::Visibility(Visibility::Public)
    );
    assert_eq!(
        next_message(&mut frames).await,
        ServerMessage::Language("text".into())
    );
    assert_eq!(
        next_message(&mut frames).await,
        ServerMessage::compiling(CompilePhase::Done, true, "")
    );
    let ServerMessage::Clients(clients) = next_message(&mut frames).await else {
        panic!("expected clients");
    };
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].color, 0);
    assert!(matches!(next_frame(&mut frames).await, Frame::Binary(bytes) if bytes == [FRAME_TEXT]));
    assert_eq!(next_message(&mut frames).await, ServerMessage::Ready);
}

#[tokio::test]
async fn second_room_waits_for_a_free_slot() {
    let workspace = tempfile::tempdir().unwrap();
    let docs = Arc::new(MemoryDocs::new());
    let rooms = Rooms::new(context(
        workspace.path(),
        Store::in_memory(),
        docs,
        1,
        Visibility::Public,
    ));
    let busy = rooms.by_name("busy-room");
    let waiting = rooms.by_name("waiting-room");

    let (conn, mut frames) = Connection::open();
    assert!(waiting.connect(conn, "bob", liveness("")).await.unwrap());
    skip_greeting(&mut frames).await;

    busy.set_language("slow").unwrap();
    busy.compile().unwrap();
    wait_for_status(&busy, CompilePhase::Compiling).await;

    waiting.compile().unwrap();

    let mut phases = Vec::new();
    loop {
        if let ServerMessage::Compiling(update) = next_message(&mut frames).await {
            if phases.last() != Some(&update.status) {
                phases.push(update.status);
            }
            if update.status == CompilePhase::Done {
                break;
            }
        }
    }
    assert_eq!(
        phases,
        [CompilePhase::Queued, CompilePhase::Compiling, CompilePhase::Done]
    );
    wait_for_status(&busy, CompilePhase::Done).await;
}

#[tokio::test]
async fn queued_is_announced_before_the_run_starts() {
    let workspace = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    let docs = Arc::new(MemoryDocs::new());
    let rooms = Rooms::new(context(
        workspace.path(),
        Store::open(db.path()),
        docs.clone(),
        4,
        Visibility::Public,
    ));
    let room = rooms.by_name("prompt-room");
    let (conn, mut frames) = Connection::open();
    assert!(room.connect(conn.clone(), "hana", liveness("")).await.unwrap());
    skip_greeting(&mut frames).await;
    write_source(&docs, "prompt-room", &conn, "straight through");

    room.compile().unwrap();
    let mut updates = Vec::new();
    loop {
        if let ServerMessage::Compiling(update) = next_message(&mut frames).await {
            let done = update.status == CompilePhase::Done;
            updates.push(update);
            if done {
                break;
            }
        }
    }

    assert_eq!(
        (updates[0].status, updates[0].clear),
        (CompilePhase::Queued, false)
    );
    assert_eq!(
        (updates[1].status, updates[1].clear),
        (CompilePhase::Compiling, true)
    );
    let running = &updates[1..updates.len() - 1];
    assert!(running.iter().all(|update| update.status == CompilePhase::Compiling));
    assert!(running.iter().skip(1).all(|update| !update.clear));
    assert!(running.iter().any(|update| update.data.contains("straight through")));
}

#[tokio::test]
async fn repeated_compile_requests_queue_once() {
    let workspace = tempfile::tempdir().unwrap();
    let rooms = Rooms::new(context(
        workspace.path(),
        Store::in_memory(),
        Arc::new(MemoryDocs::new()),
        1,
        Visibility::Public,
    ));
    let busy = rooms.by_name("slot-holder");
    let eager = rooms.by_name("eager-room");

    busy.set_language("stuck").unwrap();
    busy.compile().unwrap();
    wait_for_status(&busy, CompilePhase::Compiling).await;

    let (conn, mut frames) = Connection::open();
    assert!(eager.connect(conn, "ivan", liveness("")).await.unwrap());
    skip_greeting(&mut frames).await;
    for _ in 0..3 {
        eager.compile().unwrap();
    }
    assert_eq!(eager.view().await.unwrap().status, CompilePhase::Queued);
    assert_eq!(rooms.context().queue.waiting(), 1);

    let mut queued = 0;
    while let Ok(frame) = frames.try_recv() {
        if let Frame::Text(text) = frame {
            if let ServerMessage::Compiling(update) = serde_json::from_str(&text).unwrap() {
                assert_eq!(update.status, CompilePhase::Queued);
                queued += 1;
            }
        }
    }
    assert_eq!(queued, 1);

    eager.kill_compile().unwrap();
    wait_for_status(&eager, CompilePhase::Done).await;
    busy.kill_compile().unwrap();
    wait_for_status(&busy, CompilePhase::Done).await;
}

#[tokio::test]
async fn closing_rooms_drop_queued_and_kill_running_compiles() {
    let workspace = tempfile::tempdir().unwrap();
    let rooms = Rooms::new(context(
        workspace.path(),
        Store::in_memory(),
        Arc::new(MemoryDocs::new()),
        1,
        Visibility::Public,
    ));
    let queue = Arc::clone(&rooms.context().queue);
    let running = rooms.by_name("running-room");
    let waiting = rooms.by_name("waiting-room");

    let (running_conn, mut running_frames) = Connection::open();
    assert!(running.connect(running_conn.clone(), "jack", liveness("")).await.unwrap());
    skip_greeting(&mut running_frames).await;
    let (waiting_conn, mut waiting_frames) = Connection::open();
    assert!(waiting.connect(waiting_conn.clone(), "kate", liveness("")).await.unwrap());
    skip_greeting(&mut waiting_frames).await;

    running.set_language("stuck").unwrap();
    running.compile().unwrap();
    wait_for_status(&running, CompilePhase::Compiling).await;
    waiting.set_language("marker").unwrap();
    waiting.compile().unwrap();
    wait_for_status(&waiting, CompilePhase::Queued).await;

    waiting.disconnect(waiting_conn.id());
    wait_for(&waiting, |view| view.is_none()).await;
    assert_eq!(queue.waiting(), 0);

    running.disconnect(running_conn.id());
    wait_for(&running, |view| view.is_none()).await;
    timeout(WAIT, async {
        while queue.running() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("the running compile was never killed");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(queue.waiting(), 0);
    assert!(!workspace.path().join("ran-marker").exists());
}

#[tokio::test]
async fn canceling_a_queued_compile_keeps_previous_output() {
    let workspace = tempfile::tempdir().unwrap();
    let docs = Arc::new(MemoryDocs::new());
    let rooms = Rooms::new(context(
        workspace.path(),
        Store::in_memory(),
        docs.clone(),
        1,
        Visibility::Public,
    ));
    let busy = rooms.by_name("hogging-room");
    let queued = rooms.by_name("patient-room");

    let (conn, mut frames) = Connection::open();
    assert!(queued.connect(conn.clone(), "carol", liveness("")).await.unwrap());
    skip_greeting(&mut frames).await;
    write_source(&docs, "patient-room", &conn, "first run");
    queued.compile().unwrap();
    wait_for_status(&queued, CompilePhase::Done).await;
    let before = queued.view().await.unwrap().output;
    assert!(before.contains("first run"));

    busy.set_language("stuck").unwrap();
    busy.compile().unwrap();
    wait_for_status(&busy, CompilePhase::Compiling).await;

    queued.compile().unwrap();
    wait_for_status(&queued, CompilePhase::Queued).await;
    queued.kill_compile().unwrap();
    wait_for_status(&queued, CompilePhase::Done).await;
    assert_eq!(queued.view().await.unwrap().output, before);

    busy.kill_compile().unwrap();
    wait_for_status(&busy, CompilePhase::Done).await;
    assert!(busy.view().await.unwrap().output.contains(USER_KILL_REASON));
}

#[tokio::test]
async fn private_room_turns_away_unauthorized_connections() {
    let workspace = tempfile::tempdir().unwrap();
    let docs = Arc::new(MemoryDocs::new());
    let rooms = Rooms::new(context(
        workspace.path(),
        Store::in_memory(),
        docs,
        1,
        Visibility::Private,
    ));
    let room = rooms.by_name("members-only");

    let (stranger, mut frames) = Connection::open();
    assert!(!room.connect(stranger, "stranger", liveness("")).await.unwrap());
    assert_eq!(
        next_message(&mut frames).await,
        ServerMessage::Error(ErrorCode::LoginRequired)
    );
    assert!(matches!(next_frame(&mut frames).await, Frame::Close));
    assert_eq!(room.view().await.unwrap().connections, 0);

    let auth = liveness("good-token");
    auth.heartbeat("good-token");
    let (member, mut frames) = Connection::open();
    assert!(room.connect(member, "dana", Arc::clone(&auth)).await.unwrap());
    skip_greeting(&mut frames).await;

    room.set_visibility(Visibility::Public).unwrap();
    assert_eq!(
        next_message(&mut frames).await,
        ServerMessage::Visibility(Visibility::Public)
    );
    room.set_visibility(Visibility::Private).unwrap();
    assert_eq!(
        next_message(&mut frames).await,
        ServerMessage::Visibility(Visibility::Private)
    );
    assert_eq!(room.view().await.unwrap().connections, 1);

    // An unknown token ends authorization.
    auth.heartbeat("forged");
    loop {
        match next_frame(&mut frames).await {
            Frame::Text(text) => {
                let message: ServerMessage = serde_json::from_str(&text).unwrap();
                if message == ServerMessage::Error(ErrorCode::LoginRequired) {
                    break;
                }
            }
            Frame::Binary(_) => {}
            Frame::Close => panic!("closed before the error was sent"),
        }
    }
    assert!(matches!(next_frame(&mut frames).await, Frame::Close));
    // Losing its last member also closes the room.
    wait_for(&room, |view| view.map_or(true, |view| view.connections == 0)).await;
}

#[tokio::test]
async fn identities_share_colors_by_slot() {
    let workspace = tempfile::tempdir().unwrap();
    let docs = Arc::new(MemoryDocs::new());
    let rooms = Rooms::new(context(
        workspace.path(),
        Store::in_memory(),
        docs,
        1,
        Visibility::Public,
    ));
    let room = rooms.by_name("palette");

    let mut held = Vec::new();
    for (identity, tabs) in [("erin", 2), ("frank", 1)] {
        for _ in 0..tabs {
            let (conn, frames) = Connection::open();
            assert!(room.connect(conn.clone(), identity, liveness("")).await.unwrap());
            held.push((conn, frames));
        }
    }
    let view = room.view().await.unwrap();
    assert_eq!(view.connections, 3);
    assert_eq!(view.identities, 2);

    let (_, frames) = held.last_mut().unwrap();
    let mut colors = None;
    while let Ok(frame) = frames.try_recv() {
        if let Frame::Text(text) = frame {
            if let ServerMessage::Clients(clients) = serde_json::from_str(&text).unwrap() {
                colors = Some(clients.iter().map(|client| client.color).collect::<Vec<_>>());
            }
        }
    }
    let mut colors = colors.expect("clients message");
    colors.sort_unstable();
    assert_eq!(colors, [0, 1]);

    let (conn, _) = held.remove(0);
    room.disconnect(conn.id());
    assert_eq!(room.view().await.unwrap().identities, 2);
}

#[tokio::test]
async fn room_state_survives_reconstruction() {
    let workspace = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();

    let output = {
        let docs = Arc::new(MemoryDocs::new());
        let rooms = Rooms::new(context(
            workspace.path(),
            Store::open(db.path()),
            docs.clone(),
            1,
            Visibility::Public,
        ));
        let room = rooms.by_name("keepsake");
        let (conn, mut frames) = Connection::open();
        assert!(room.connect(conn.clone(), "gina", liveness("")).await.unwrap());
        skip_greeting(&mut frames).await;

        write_source(&docs, "keepsake", &conn, "fn main() {}");
        room.set_language("rust").unwrap();
        room.compile().unwrap();
        wait_for_status(&room, CompilePhase::Done).await;
        let output = room.view().await.unwrap().output;
        assert!(output.contains("fn main() {}"));

        room.disconnect(conn.id());
        wait_for(&room, |view| view.is_none()).await;
        assert!(!rooms.contains("keepsake"));
        output
    };

    let rooms = Rooms::new(context(
        workspace.path(),
        Store::open(db.path()),
        Arc::new(MemoryDocs::new()),
        1,
        Visibility::Private,
    ));
    let room = rooms.by_name("keepsake");
    room.ready().await.unwrap();
    let view = room.view().await.unwrap();
    assert_eq!(view.language, "rust");
    assert_eq!(view.output, output);
    assert_eq!(view.visibility, Visibility::Public);
}
