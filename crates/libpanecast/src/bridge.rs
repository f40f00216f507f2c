//! Pane I/O bridge: capture plumbing in, injected input out.
//!
//! Reading the pane's PTY master directly would race with tmux itself, so
//! output capture goes through `tmux pipe-pane` duplicating the stream into
//! a named pipe this bridge owns and reads. Input does not touch the PTY
//! slave either (bytes written there land on the output side, invisible to
//! the pane's program); it is injected with `tmux send-keys -l`.

use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::stat::Mode;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::PanecastError;
use crate::tmux;

const READ_CHUNK_BYTES: usize = 32 * 1024;
const INPUT_CHANNEL_CAPACITY: usize = 64;
const RESIZE_CHANNEL_CAPACITY: usize = 8;

/// Invoked with every chunk read from the capture pipe, on the reader's
/// blocking thread. Must not block; the session wires this to ring append
/// plus hub broadcast, both non-blocking.
pub type OutputCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

struct Attachment {
    tty: String,
    fifo_path: PathBuf,
    input_tx: mpsc::Sender<Vec<u8>>,
    resize_tx: mpsc::Sender<(u16, u16)>,
    stop: CancellationToken,
    reader: JoinHandle<()>,
    input_writer: JoinHandle<()>,
    resize_drainer: JoinHandle<()>,
}

pub struct IOBridge {
    target: String,
    on_output: OutputCallback,
    /// Incremented on every successful attach, before the reader starts.
    /// Published with every status frame so clients can detect pane
    /// recreation.
    epoch: AtomicU64,
    attachment: Mutex<Option<Attachment>>,
}

impl IOBridge {
    pub fn new(target: impl Into<String>, on_output: OutputCallback) -> Self {
        Self {
            target: target.into(),
            on_output,
            epoch: AtomicU64::new(0),
            attachment: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn is_attached(&self) -> bool {
        self.attachment
            .lock()
            .expect("attachment lock poisoned")
            .is_some()
    }

    /// Attach to a discovered pane device: create the capture pipe, tell
    /// tmux to feed it, and start the reader, input-writer, and
    /// resize-drainer tasks.
    pub async fn open(&self, tty: &str) -> Result<(), PanecastError> {
        if !tty.starts_with("/dev/") {
            return Err(PanecastError::SuspiciousTty(tty.to_string()));
        }
        if self.is_attached() {
            warn!(target = %self.target, "open while attached, closing previous attachment");
            self.close().await;
        }

        let fifo_path = std::env::temp_dir().join(format!(
            "panecast-{}-{}",
            std::process::id(),
            Uuid::new_v4()
        ));
        // Owner-only: the pipe carries everything the pane prints.
        nix::unistd::mkfifo(&fifo_path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|err| {
            PanecastError::PipeSetup {
                path: fifo_path.clone(),
                source: std::io::Error::from(err),
            }
        })?;

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        if let Err(err) = tmux::pipe_pane_start(&self.target, &fifo_path).await {
            let _ = std::fs::remove_file(&fifo_path);
            return Err(err);
        }

        info!(
            target = %self.target,
            tty = %tty,
            fifo = %fifo_path.display(),
            epoch,
            "pane attached"
        );

        let stop = CancellationToken::new();

        let reader = {
            let fifo_path = fifo_path.clone();
            let stop = stop.clone();
            let on_output = Arc::clone(&self.on_output);
            let target = self.target.clone();
            tokio::task::spawn_blocking(move || read_pipe(fifo_path, stop, on_output, target))
        };

        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(INPUT_CHANNEL_CAPACITY);
        let input_writer = {
            let target = self.target.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        data = input_rx.recv() => {
                            let Some(data) = data else { return };
                            // A transient tmux error must not tear down the
                            // bridge; log and keep draining.
                            if let Err(err) = tmux::send_keys_literal(&target, &data).await {
                                error!(target = %target, error = %err, "input inject failed");
                            }
                        }
                    }
                }
            })
        };

        let (resize_tx, mut resize_rx) = mpsc::channel::<(u16, u16)>(RESIZE_CHANNEL_CAPACITY);
        let resize_drainer = {
            let stop = stop.clone();
            let target = self.target.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        dims = resize_rx.recv() => {
                            let Some((cols, rows)) = dims else { return };
                            // Accepted, never applied: the pane's dimensions
                            // are authoritative and the client adapts.
                            debug!(target = %target, cols, rows, "resize request ignored");
                        }
                    }
                }
            })
        };

        *self.attachment.lock().expect("attachment lock poisoned") = Some(Attachment {
            tty: tty.to_string(),
            fifo_path,
            input_tx,
            resize_tx,
            stop,
            reader,
            input_writer,
            resize_drainer,
        });

        Ok(())
    }

    /// Detach: stop the pipe, unwind all three tasks, remove the pipe file.
    /// No-op when not attached.
    pub async fn close(&self) {
        let attachment = self
            .attachment
            .lock()
            .expect("attachment lock poisoned")
            .take();
        let Some(att) = attachment else { return };

        att.stop.cancel();

        if let Err(err) = tmux::pipe_pane_stop(&self.target).await {
            debug!(target = %self.target, error = %err, "pipe-pane stop failed");
        }

        // A reader that never saw a writer is still parked inside the FIFO
        // open; opening the write side non-blocking releases it.
        let _ = std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(&att.fifo_path);
        let _ = std::fs::remove_file(&att.fifo_path);

        let _ = att.reader.await;
        let _ = att.input_writer.await;
        let _ = att.resize_drainer.await;

        info!(target = %self.target, tty = %att.tty, "pane detached");
    }

    pub async fn reattach(&self, tty: &str) -> Result<(), PanecastError> {
        self.close().await;
        self.open(tty).await
    }

    /// Queue raw bytes for injection into the pane. Non-blocking: a full
    /// queue or a detached bridge drops the message with a log line.
    pub fn write_input(&self, data: Vec<u8>) {
        let sender = {
            let attachment = self.attachment.lock().expect("attachment lock poisoned");
            attachment.as_ref().map(|a| a.input_tx.clone())
        };
        match sender {
            Some(tx) => {
                if tx.try_send(data).is_err() {
                    warn!(target = %self.target, "input channel full, dropping input");
                }
            }
            None => warn!(target = %self.target, "input while detached, dropping"),
        }
    }

    /// Queue a resize request. The drainer discards it; see `open`.
    pub fn resize(&self, cols: u16, rows: u16) {
        let sender = {
            let attachment = self.attachment.lock().expect("attachment lock poisoned");
            attachment.as_ref().map(|a| a.resize_tx.clone())
        };
        if let Some(tx) = sender {
            let _ = tx.try_send((cols, rows));
        }
    }
}

/// Blocking capture loop. The read-only open parks until tmux's `cat` opens
/// the write side, which is the POSIX rendezvous for named pipes; that is
/// why this runs on a dedicated blocking thread and never on the async
/// runtime.
fn read_pipe(fifo_path: PathBuf, stop: CancellationToken, on_output: OutputCallback, target: String) {
    let mut file = match std::fs::File::open(&fifo_path) {
        Ok(f) => f,
        Err(err) => {
            if !stop.is_cancelled() {
                error!(
                    target = %target,
                    fifo = %fifo_path.display(),
                    error = %err,
                    "failed to open capture pipe"
                );
            }
            return;
        }
    };

    if stop.is_cancelled() {
        return;
    }
    debug!(target = %target, fifo = %fifo_path.display(), "capture pipe connected");

    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match file.read(&mut buf) {
            Ok(0) => {
                // Writer side closed: pipe-pane was stopped or the pane died.
                // The monitor will mark the pane absent and drive a reattach.
                debug!(target = %target, "capture pipe closed");
                return;
            }
            Ok(n) => on_output(&buf[..n]),
            Err(err) => {
                if !stop.is_cancelled() {
                    warn!(target = %target, error = %err, "capture read ended");
                }
                return;
            }
        }
    }
}
