//! JSON control protocol carried in text frames: `{"type": ..., "payload": ...}`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Visibility {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            other => Err(ProtocolError::InvalidPayload {
                kind: "visibility",
                detail: format!("{other:?} is not public or private"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilePhase {
    Done,
    Queued,
    Compiling,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileStatus {
    pub status: CompilePhase,
    /// Receivers drop their buffered output before appending `data`.
    pub clear: bool,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEntry {
    pub username: String,
    pub color: usize,
    pub clients: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    LoginRequired,
}

/// Messages sent from the server to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerMessage {
    Visibility(Visibility),
    Language(String),
    Compiling(CompileStatus),
    Clients(Vec<ClientEntry>),
    Ready,
    Error(ErrorCode),
}

impl ServerMessage {
    pub fn compiling(status: CompilePhase, clear: bool, data: impl Into<String>) -> Self {
        ServerMessage::Compiling(CompileStatus {
            status,
            clear,
            data: data.into(),
        })
    }
}

/// Messages accepted from clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Compile,
    CancelCompile,
    Language(String),
    Auth(String),
    Visibility(Visibility),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {detail}")]
    InvalidPayload { kind: &'static str, detail: String },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let Envelope { kind, payload } = serde_json::from_str(text)?;
        match kind.as_str() {
            "compile" => Ok(ClientMessage::Compile),
            "cancel-compile" => Ok(ClientMessage::CancelCompile),
            "language" => string_payload("language", payload).map(ClientMessage::Language),
            "auth" => string_payload("auth", payload).map(ClientMessage::Auth),
            "visibility" => string_payload("visibility", payload)?
                .parse()
                .map(ClientMessage::Visibility),
            _ => Err(ProtocolError::UnknownType(kind)),
        }
    }
}

fn string_payload(kind: &'static str, payload: Value) -> Result<String, ProtocolError> {
    match payload {
        Value::String(s) => Ok(s),
        other => Err(ProtocolError::InvalidPayload {
            kind,
            detail: format!("expected a string, got {other}"),
        }),
    }
}
