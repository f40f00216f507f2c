//! Periodic pane discovery.
//!
//! The monitor polls tmux for the configured pane's device path and publishes
//! transitions on a bounded channel. Attachment is driven entirely off these
//! events: a `Connected` event with `new_tty` set means the bridge must
//! (re)attach, `Missing` means it must let go.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::tmux;

const EVENT_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaneEvent {
    /// The pane exists. `new_tty` is set on first discovery and whenever the
    /// device path differs from the last known one.
    Connected { tty: String, new_tty: bool },
    /// The pane no longer resolves.
    Missing,
}

#[derive(Debug, Default)]
struct MonitorState {
    connected: bool,
    last_tty: String,
}

/// Pure transition step, separated from the tmux query so the state machine
/// tests without a live server.
fn transition(state: &mut MonitorState, resolved: Option<String>) -> Option<PaneEvent> {
    match resolved {
        None => {
            if state.connected {
                state.connected = false;
                state.last_tty.clear();
                return Some(PaneEvent::Missing);
            }
            None
        }
        Some(tty) => {
            if !state.connected {
                // First sighting after an absence always reattaches: the pane
                // was destroyed and recreated, and the kernel may have handed
                // the new pane the same PTY number.
                state.connected = true;
                state.last_tty = tty.clone();
                return Some(PaneEvent::Connected { tty, new_tty: true });
            }
            if tty != state.last_tty {
                state.last_tty = tty.clone();
                return Some(PaneEvent::Connected { tty, new_tty: true });
            }
            None
        }
    }
}

pub struct PaneMonitor {
    target: String,
    interval: Duration,
    state: Mutex<MonitorState>,
    events_tx: mpsc::Sender<PaneEvent>,
}

impl PaneMonitor {
    pub fn new(target: impl Into<String>, interval: Duration) -> (Self, mpsc::Receiver<PaneEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Self {
                target: target.into(),
                interval,
                state: Mutex::new(MonitorState::default()),
                events_tx,
            },
            events_rx,
        )
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether the last poll saw the pane.
    pub fn is_connected(&self) -> bool {
        self.state.lock().expect("monitor state poisoned").connected
    }

    /// Trigger an immediate poll outside the tick schedule.
    pub async fn force_check(&self) {
        self.check().await;
    }

    /// Forget the current state so the next poll re-emits it. Used after a
    /// failed attach: without this the monitor would stay silent while the
    /// pane's path is unchanged, and the bridge would never retry.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("monitor state poisoned");
        state.connected = false;
        state.last_tty.clear();
    }

    /// Poll until cancelled. Performs one immediate check before entering
    /// the tick loop so startup does not wait a full interval.
    pub async fn run(&self, cancel: CancellationToken) {
        self.check().await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the immediate first tick; the check above covered it

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.check().await,
            }
        }
    }

    async fn check(&self) {
        let resolved = match tmux::resolve_pane_tty(&self.target).await {
            Ok(tty) => Some(tty),
            Err(err) => {
                // Logged only on the transition below; resolution failures
                // while already absent are the steady state.
                if self.is_connected() {
                    warn!(target = %self.target, error = %err, "pane lost");
                }
                None
            }
        };

        let event = {
            let mut state = self.state.lock().expect("monitor state poisoned");
            transition(&mut state, resolved)
        };

        if let Some(event) = event {
            if let PaneEvent::Connected { tty, .. } = &event {
                info!(target = %self.target, tty = %tty, "pane found");
            }
            self.emit(event);
        }
    }

    fn emit(&self, event: PaneEvent) {
        // Bounded channel; a full queue drops the newest event. The next
        // successful poll re-emits current state, so no transition is
        // permanently lost.
        if self.events_tx.try_send(event).is_err() {
            warn!(target = %self.target, "pane event channel full, dropping event");
        }
    }
}
