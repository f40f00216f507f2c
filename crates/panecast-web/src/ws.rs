//! The per-connection subscriber: hello handshake, replay, then live
//! fan-out from the hub plus input decoding back to the bridge.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use libpanecast::{tmux, Session};
use panecast_protocol::{
    ClientMessage, PaneState, ReplayMode, ServerMessage, REPLAY_CHUNK_BYTES,
};

use crate::AppState;

/// Scrollback lines included in a rendered tail snapshot.
const CAPTURE_SCROLLBACK_LINES: u32 = 2000;
/// Empirical delay before the repaint nudge; long enough for the snapshot to
/// land in the browser's renderer.
const REPAINT_NUDGE_DELAY: Duration = Duration::from_millis(200);

pub async fn ws_handler(
    Path(target): Path<String>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let session = state.registry.get(&target);
    ws.on_upgrade(move |socket| handle_socket(socket, session, state))
}

async fn handle_socket(socket: WebSocket, session: Arc<Session>, state: Arc<AppState>) {
    let subscriber_id = Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();

    // The first frame must be a well-formed hello.
    let (replay_mode, tail_size) = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Hello {
                    replay_mode,
                    tail_size,
                }) => break (replay_mode, tail_size),
                Ok(_) => {
                    send_error(&mut sink, "first message must be hello").await;
                    return;
                }
                Err(err) => {
                    send_error(&mut sink, &format!("invalid hello: {err}")).await;
                    return;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {
                send_error(&mut sink, "first message must be hello").await;
                return;
            }
            Some(Err(err)) => {
                debug!(subscriber_id = %subscriber_id, error = %err, "read hello failed");
                return;
            }
        }
    };

    info!(
        subscriber_id = %subscriber_id,
        target = %session.target,
        mode = ?replay_mode,
        "subscriber connected"
    );

    // A freshly created or recently recreated pane may not have been polled
    // yet; check now rather than waiting out the monitor interval.
    session.monitor.force_check().await;

    if let Err(err) = replay(replay_mode, tail_size, &session, &state, &mut sink).await {
        debug!(subscriber_id = %subscriber_id, error = %err, "replay aborted");
        return;
    }

    // Live mode: register for fan-out, then report the current pane state so
    // the client can size its renderer and track the epoch.
    let (tx, rx) = mpsc::channel::<String>(state.client_queue_size);
    let cancel = CancellationToken::new();
    session.hub.register(&subscriber_id, tx.clone(), cancel.clone());

    let pane_state = if session.monitor.is_connected() {
        PaneState::Connected
    } else {
        PaneState::Missing
    };
    let (cols, rows) = match pane_state {
        PaneState::Connected => tmux::pane_dimensions(&session.target)
            .await
            .unwrap_or((0, 0)),
        PaneState::Missing => (0, 0),
    };
    if let Some(frame) = encode(&ServerMessage::status(
        pane_state,
        session.bridge.epoch(),
        cols,
        rows,
    )) {
        let _ = tx.try_send(frame);
    }

    // The snapshot painted the right cells but carries no terminal state
    // (scroll regions, alternate screen, bracketed paste). A form feed makes
    // the pane's program repaint itself through the capture path, which does
    // carry that state.
    if replay_mode == ReplayMode::Tail {
        let bridge = Arc::clone(&session.bridge);
        tokio::spawn(async move {
            tokio::time::sleep(REPAINT_NUDGE_DELAY).await;
            bridge.write_input(vec![0x0c]);
        });
    }

    let write_task = tokio::spawn(write_pump(sink, rx, cancel.clone()));
    read_loop(&mut stream, &session, &cancel).await;

    session.hub.unregister(&subscriber_id);
    cancel.cancel();
    let _ = write_task.await;
    info!(subscriber_id = %subscriber_id, "subscriber disconnected");
}

async fn replay(
    mode: ReplayMode,
    tail_size: Option<usize>,
    session: &Session,
    state: &AppState,
    sink: &mut SplitSink<WebSocket, Message>,
) -> Result<(), axum::Error> {
    match mode {
        ReplayMode::Full => {
            let (data, _) = {
                let ring = session.ring.lock().expect("ring lock poisoned");
                ring.snapshot()
            };
            send_output_chunks(sink, &data).await?;
            if !data.is_empty() {
                info!(target = %session.target, bytes = data.len(), "full replay sent");
            }
        }
        ReplayMode::Tail => {
            // A raw ring tail starts mid-escape-sequence and cannot be
            // parsed back into terminal state; a rendered capture paints the
            // current screen from a neutral state instead.
            let cap = tail_size
                .unwrap_or(state.tail_replay_size)
                .min(state.tail_replay_size);
            match tmux::capture_pane(&session.target, CAPTURE_SCROLLBACK_LINES).await {
                Ok(snapshot) if !snapshot.is_empty() => {
                    let cursor = tmux::cursor_position(&session.target).await.ok();
                    let payload = render_snapshot(&snapshot, cursor, cap);
                    send_output_chunks(sink, &payload).await?;
                    info!(target = %session.target, bytes = payload.len(), "snapshot sent");
                }
                Ok(_) => {}
                // Pane may simply be absent; the subscriber starts from the
                // status frame and live output instead.
                Err(err) => debug!(target = %session.target, error = %err, "snapshot unavailable"),
            }
        }
    }
    Ok(())
}

/// Turn a capture-pane snapshot into a paintable byte sequence: CRLF line
/// endings, cursor homed before the paint, and the live cursor position
/// restored afterwards so incremental updates land in the right cells.
fn render_snapshot(snapshot: &[u8], cursor: Option<(u16, u16)>, cap: usize) -> Vec<u8> {
    // capture-pane separates lines with bare \n; renderers fed raw bytes
    // need \r\n.
    let mut fixed = Vec::with_capacity(snapshot.len() + snapshot.len() / 16);
    let mut prev = 0u8;
    for &b in snapshot {
        if b == b'\n' && prev != b'\r' {
            fixed.push(b'\r');
        }
        fixed.push(b);
        prev = b;
    }

    if fixed.len() > cap {
        let start = fixed.len() - cap;
        fixed.drain(..start);
    }

    let mut out = Vec::with_capacity(fixed.len() + 16);
    out.extend_from_slice(b"\x1b[H");
    out.extend_from_slice(&fixed);
    if let Some((col, row)) = cursor {
        // ANSI cursor position is 1-indexed.
        out.extend_from_slice(
            format!("\x1b[{};{}H", u32::from(row) + 1, u32::from(col) + 1).as_bytes(),
        );
    }
    out
}

async fn send_output_chunks(
    sink: &mut SplitSink<WebSocket, Message>,
    data: &[u8],
) -> Result<(), axum::Error> {
    for chunk in data.chunks(REPLAY_CHUNK_BYTES) {
        if let Some(frame) = encode(&ServerMessage::output(chunk)) {
            sink.send(Message::text(frame)).await?;
        }
    }
    Ok(())
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if sink.send(Message::text(frame)).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    stream: &mut SplitStream<WebSocket>,
    session: &Session,
    cancel: &CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = stream.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Input { data }) => match BASE64.decode(data.as_bytes()) {
                    Ok(bytes) => session.bridge.write_input(bytes),
                    Err(err) => warn!(error = %err, "invalid base64 input"),
                },
                // Accepted and drained, never applied to the pane.
                Ok(ClientMessage::Resize { cols, rows }) => session.bridge.resize(cols, rows),
                Ok(ClientMessage::Hello { .. }) => warn!("unexpected hello after handshake"),
                Err(err) => warn!(error = %err, "invalid message"),
            },
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                debug!(error = %err, "socket read error");
                return;
            }
        }
    }
}

async fn send_error(sink: &mut SplitSink<WebSocket, Message>, message: &str) {
    if let Some(frame) = encode(&ServerMessage::error(message)) {
        let _ = sink.send(Message::text(frame)).await;
    }
}

fn encode(msg: &ServerMessage) -> Option<String> {
    serde_json::to_string(msg).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_normalises_line_endings() {
        let out = render_snapshot(b"one\ntwo\n", None, 1024);
        assert!(out.starts_with(b"\x1b[H"));
        assert_eq!(&out[3..], b"one\r\ntwo\r\n");
    }

    #[test]
    fn snapshot_does_not_double_existing_crlf() {
        let out = render_snapshot(b"one\r\ntwo\n", None, 1024);
        assert_eq!(&out[3..], b"one\r\ntwo\r\n");
    }

    #[test]
    fn snapshot_restores_cursor_one_indexed() {
        let out = render_snapshot(b"x", Some((4, 2)), 1024);
        assert!(out.ends_with(b"\x1b[3;5H"), "{:?}", out);
    }

    #[test]
    fn snapshot_truncates_from_the_front() {
        let out = render_snapshot(b"aaaaabbbbb", None, 4);
        assert_eq!(&out[3..], b"bbbb");
    }

    #[test]
    fn snapshot_preserves_escape_sequences() {
        let out = render_snapshot(b"\x1b[31mRED\x1b[0m\n", None, 1024);
        let body = &out[3..];
        assert_eq!(body, b"\x1b[31mRED\x1b[0m\r\n");
    }
}
