use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use reqwest::header::{COOKIE, SET_COOKIE};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use codeshare::docs::MemoryDocs;
use codeshare::http_server;
use codeshare::protocol::Visibility;
use codeshare::queue::AdmissionQueue;
use codeshare::room::RoomContext;
use codeshare::rooms::Rooms;
use codeshare::sandbox::{Isolation, LanguageProfile, SandboxSettings};
use codeshare::state::AppState;
use codeshare::store::Store;
use codeshare::users::{CredentialVerifier, Profile, Users};

const WAIT: Duration = Duration::from_secs(10);

/// Accepts `valid:<id>` tokens.
struct StaticVerifier;

impl CredentialVerifier for StaticVerifier {
    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Option<Profile>> {
        let profile = token.strip_prefix("valid:").map(|id| Profile {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            name: id.to_string(),
            domain: Some("example.com".into()),
            photo: None,
        });
        async move { profile }.boxed()
    }
}

struct Server {
    addr: SocketAddr,
    _workspace: tempfile::TempDir,
}

impl Server {
    async fn start() -> Self {
        let workspace = tempfile::tempdir().unwrap();
        let store = Store::in_memory();
        let users = Users::load(&store).await.unwrap();
        let rooms = Rooms::new(RoomContext {
            store,
            queue: Arc::new(AdmissionQueue::new(2).unwrap()),
            docs: Arc::new(MemoryDocs::new()),
            sandbox: Arc::new(SandboxSettings {
                workspace_root: workspace.path().to_path_buf(),
                timeout: Duration::from_secs(20),
                isolation: Isolation::Unconfined,
                languages: vec![
                    LanguageProfile::new("text", "txt", &["cat main.txt"]),
                    LanguageProfile::new("rust", "rs", &["cat main.rs"]),
                ],
            }),
            default_visibility: Visibility::Public,
        });
        let state = AppState {
            rooms,
            users,
            verifier: Arc::new(StaticVerifier),
            client_id: "test-client".into(),
            auth_timeout: Duration::from_secs(30),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(http_server::serve(listener, state));
        Self {
            addr,
            _workspace: workspace,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

fn cookies(response: &reqwest::Response) -> Vec<String> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .collect()
}

fn cookie_value(cookies: &[String], name: &str) -> Option<String> {
    cookies.iter().find_map(|cookie| {
        let pair = cookie.split(';').next()?;
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

#[tokio::test]
async fn health_reports_ok() {
    let server = Server::start().await;
    let body = reqwest::get(server.url("/health"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn new_room_hands_out_name_and_cookies() {
    let server = Server::start().await;
    let response = reqwest::get(server.url("/room/new")).await.unwrap();
    assert!(response.status().is_success());
    let cookies = cookies(&response);
    let name = response.text().await.unwrap();

    assert_eq!(name.split('-').count(), 5, "unexpected room name {name}");
    assert_eq!(name.split('-').nth(1), Some("the"));
    assert_eq!(cookie_value(&cookies, "gcid").as_deref(), Some("test-client"));
    assert!(cookie_value(&cookies, "session").is_some_and(|session| !session.is_empty()));
}

#[tokio::test]
async fn login_query_and_logout() {
    let server = Server::start().await;
    let client = reqwest::Client::new();

    let rejected = client
        .post(server.url("/auth/login"))
        .json(&serde_json::json!({"token": "nope"}))
        .send()
        .await
        .unwrap();
    assert!(cookie_value(&cookies(&rejected), "identity").is_some_and(|v| v == "FALSE"));
    assert_eq!(rejected.json::<serde_json::Value>().await.unwrap(), serde_json::Value::Null);

    let accepted = client
        .post(server.url("/auth/login"))
        .json(&serde_json::json!({"token": "valid:ada"}))
        .send()
        .await
        .unwrap();
    let identity = cookie_value(&cookies(&accepted), "identity").unwrap();
    let profile: serde_json::Value = accepted.json().await.unwrap();
    assert_eq!(
        profile,
        serde_json::json!({"email": "ada@example.com", "name": "ada", "domain": "example.com"})
    );

    let queried: serde_json::Value = client
        .get(server.url("/auth/query"))
        .header(COOKIE, format!("identity={identity}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(queried, profile);

    let anonymous: serde_json::Value = client
        .get(server.url("/auth/query"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(anonymous, serde_json::Value::Null);

    let logout = client.get(server.url("/auth/logout")).send().await.unwrap();
    assert_eq!(
        cookie_value(&cookies(&logout), "identity").as_deref(),
        Some("FALSE")
    );
}

#[tokio::test]
async fn socket_requires_a_session() {
    let server = Server::start().await;
    let url = format!("ws://{}/doc/some-room", server.addr);
    assert!(tokio_tungstenite::connect_async(url).await.is_err());
}

#[tokio::test]
async fn socket_joins_room_and_changes_language() {
    let server = Server::start().await;
    let mut request = format!("ws://{}/doc/shared-notes", server.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(COOKIE, "session=tab-1".parse().unwrap());
    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let mut kinds = Vec::new();
    loop {
        let message = timeout(WAIT, socket.next()).await.unwrap().unwrap().unwrap();
        match message {
            Message::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                let kind = value["type"].as_str().unwrap().to_string();
                if kind == "language" {
                    assert_eq!(value["payload"], "text");
                }
                kinds.push(kind);
                if kinds.last().map(String::as_str) == Some("ready") {
                    break;
                }
            }
            Message::Binary(bytes) => {
                assert_eq!(bytes.first(), Some(&0));
                kinds.push("document".into());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
    assert_eq!(
        kinds,
        ["visibility", "language", "compiling", "clients", "document", "ready"]
    );

    socket
        .send(Message::Text(
            r#"{"type":"language","payload":"rust"}"#.into(),
        ))
        .await
        .unwrap();
    loop {
        let message = timeout(WAIT, socket.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = message {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if value["type"] == "language" {
                assert_eq!(value["payload"], "rust");
                break;
            }
        }
    }
}
