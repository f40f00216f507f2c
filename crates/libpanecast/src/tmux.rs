//! Shell-outs to the tmux command interface.
//!
//! Everything the server needs from the multiplexer goes through these
//! helpers: device-path and geometry queries, pipe-pane capture control,
//! rendered snapshots, literal key injection, and the pane listing behind
//! the switcher API.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tokio::process::Command;

use panecast_protocol::{PaneInfo, SessionGroup, WindowGroup};

use crate::error::PanecastError;

async fn run(args: &[&OsStr]) -> Result<Vec<u8>, PanecastError> {
    let output = Command::new("tmux").args(args).output().await?;
    if !output.status.success() {
        return Err(PanecastError::TmuxCommand {
            command: args
                .first()
                .map(|a| a.to_string_lossy().into_owned())
                .unwrap_or_default(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

async fn run_str(args: &[&str]) -> Result<Vec<u8>, PanecastError> {
    let os_args: Vec<&OsStr> = args.iter().map(OsStr::new).collect();
    run(&os_args).await
}

/// Query the PTY device path backing a pane. Values not under `/dev/` are
/// rejected as suspicious rather than handed to the bridge.
pub async fn resolve_pane_tty(target: &str) -> Result<String, PanecastError> {
    let out = run_str(&["display-message", "-p", "-t", target, "#{pane_tty}"]).await?;
    let tty = String::from_utf8_lossy(&out).trim().to_string();
    if tty.is_empty() {
        return Err(PanecastError::EmptyPaneTty(target.to_string()));
    }
    if !tty.starts_with("/dev/") {
        return Err(PanecastError::SuspiciousTty(tty));
    }
    Ok(tty)
}

/// Current pane size as (cols, rows).
pub async fn pane_dimensions(target: &str) -> Result<(u16, u16), PanecastError> {
    let out = run_str(&[
        "display-message",
        "-p",
        "-t",
        target,
        "#{pane_width} #{pane_height}",
    ])
    .await?;
    parse_pair(&out, "pane dimensions")
}

/// Current cursor position as 0-indexed (col, row).
pub async fn cursor_position(target: &str) -> Result<(u16, u16), PanecastError> {
    let out = run_str(&[
        "display-message",
        "-p",
        "-t",
        target,
        "#{cursor_x} #{cursor_y}",
    ])
    .await?;
    parse_pair(&out, "cursor position")
}

fn parse_pair(out: &[u8], what: &'static str) -> Result<(u16, u16), PanecastError> {
    let text = String::from_utf8_lossy(out);
    let mut fields = text.split_whitespace();
    let parse = |field: Option<&str>| field.and_then(|f| f.parse::<u16>().ok());
    match (parse(fields.next()), parse(fields.next())) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(PanecastError::MalformedTmuxOutput {
            what,
            output: text.trim().to_string(),
        }),
    }
}

/// Start duplicating the pane's output stream into `fifo`.
pub async fn pipe_pane_start(target: &str, fifo: &Path) -> Result<(), PanecastError> {
    let pipe_cmd = format!("cat > {}", fifo.display());
    run_str(&["pipe-pane", "-t", target, &pipe_cmd]).await?;
    Ok(())
}

/// Stop any active output duplication for the pane.
pub async fn pipe_pane_stop(target: &str) -> Result<(), PanecastError> {
    run_str(&["pipe-pane", "-t", target]).await?;
    Ok(())
}

/// Rendered snapshot of the visible pane plus `scrollback_lines` of history,
/// escape sequences preserved.
pub async fn capture_pane(target: &str, scrollback_lines: u32) -> Result<Vec<u8>, PanecastError> {
    let start_line = format!("-{scrollback_lines}");
    run_str(&["capture-pane", "-e", "-p", "-t", target, "-S", &start_line]).await
}

/// Inject raw bytes into the pane as literal keystrokes.
///
/// Writing to the PTY slave would land on the output side, invisible to the
/// pane's program; send-keys writes to the master side the program reads
/// from, exactly as if a user typed into the multiplexer.
pub async fn send_keys_literal(target: &str, data: &[u8]) -> Result<(), PanecastError> {
    run(&[
        OsStr::new("send-keys"),
        OsStr::new("-t"),
        OsStr::new(target),
        OsStr::new("-l"),
        OsStr::new("--"),
        OsStr::from_bytes(data),
    ])
    .await?;
    Ok(())
}

pub async fn rename_window(target: &str, name: &str) -> Result<(), PanecastError> {
    run_str(&["rename-window", "-t", target, name]).await?;
    Ok(())
}

/// Create a new detached tmux session.
pub async fn new_session(name: &str) -> Result<(), PanecastError> {
    run_str(&["new-session", "-d", "-s", name]).await?;
    Ok(())
}

/// All panes visible to the multiplexer, grouped by session and window in
/// the order tmux reports them.
pub async fn list_panes() -> Result<Vec<SessionGroup>, PanecastError> {
    let out = run_str(&[
        "list-panes",
        "-a",
        "-F",
        "#{session_name}\t#{window_index}\t#{window_name}\t#{pane_index}\t#{pane_current_command}",
    ])
    .await?;
    Ok(group_pane_listing(&String::from_utf8_lossy(&out)))
}

fn group_pane_listing(listing: &str) -> Vec<SessionGroup> {
    let mut sessions: Vec<SessionGroup> = Vec::new();

    for line in listing.lines() {
        let mut fields = line.splitn(5, '\t');
        let (Some(session), Some(win_idx), Some(win_name), Some(pane_idx), Some(pane_cmd)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            continue;
        };

        let group = match sessions.iter_mut().find(|s| s.name == session) {
            Some(g) => g,
            None => {
                sessions.push(SessionGroup {
                    name: session.to_string(),
                    windows: Vec::new(),
                });
                sessions.last_mut().unwrap()
            }
        };

        let window = match group.windows.iter_mut().find(|w| w.index == win_idx) {
            Some(w) => w,
            None => {
                group.windows.push(WindowGroup {
                    index: win_idx.to_string(),
                    name: win_name.to_string(),
                    panes: Vec::new(),
                });
                group.windows.last_mut().unwrap()
            }
        };

        window.panes.push(PaneInfo {
            index: pane_idx.to_string(),
            current_command: pane_cmd.to_string(),
            target: format!("{session}:{win_idx}.{pane_idx}"),
        });
    }

    sessions
}
