//! Wire protocol for the panecast WebSocket endpoint.
//!
//! Both directions carry JSON text frames. The first client frame must be a
//! `hello`; everything after that is `input` or `resize`. The server sends
//! `output` frames (base64 pane bytes), `status` frames on pane lifecycle
//! changes, and a terminal `error` frame before closing on protocol
//! violations.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Replay payloads are split into output frames of at most this many raw
/// bytes before base64 encoding.
pub const REPLAY_CHUNK_BYTES: usize = 64 * 1024;

/// How a newly connected client wants its initial screen built.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplayMode {
    /// Entire retained ring buffer, oldest byte first.
    Full,
    /// Rendered snapshot of the visible pane.
    #[default]
    Tail,
}

// Anything other than "full" means tail, including modes this server has
// never heard of. Old clients send arbitrary strings here.
impl<'de> Deserialize<'de> for ReplayMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "full" => ReplayMode::Full,
            _ => ReplayMode::Tail,
        })
    }
}

/// Client-to-server messages.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Required first frame.
    #[serde(rename_all = "camelCase")]
    Hello {
        #[serde(default)]
        replay_mode: ReplayMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tail_size: Option<usize>,
    },
    /// Raw bytes for the pane, base64-encoded.
    Input { data: String },
    /// Accepted but never applied; the pane's dimensions are authoritative.
    Resize { cols: u16, rows: u16 },
}

/// Whether the pane behind a session currently exists.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaneState {
    Connected,
    Missing,
}

/// Server-to-client messages.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// A chunk of pane output, base64-encoded.
    Output { data: String },
    /// Pane lifecycle update. `epoch` increases on every reattach so clients
    /// can detect pane recreation and invalidate stale render state.
    #[serde(rename_all = "camelCase")]
    Status {
        pane_state: PaneState,
        epoch: u64,
        cols: u16,
        rows: u16,
    },
    /// Terminal error; the channel is closed after this frame.
    Error { message: String },
}

impl ServerMessage {
    /// Build an `output` frame from raw pane bytes.
    pub fn output(data: &[u8]) -> Self {
        ServerMessage::Output {
            data: BASE64.encode(data),
        }
    }

    pub fn status(pane_state: PaneState, epoch: u64, cols: u16, rows: u16) -> Self {
        ServerMessage::Status {
            pane_state,
            epoch,
            cols,
            rows,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

/// One pane as reported by the switcher API.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PaneInfo {
    pub index: String,
    pub current_command: String,
    /// `session:window.pane`, usable directly as a WebSocket target.
    pub target: String,
}

/// One multiplexer window and its panes.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WindowGroup {
    pub index: String,
    pub name: String,
    pub panes: Vec<PaneInfo>,
}

/// One multiplexer session and its windows, in display order.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionGroup {
    pub name: String,
    pub windows: Vec<WindowGroup>,
}
