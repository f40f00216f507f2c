//! Per-pane session wiring and the registry that owns it.
//!
//! A session bundles the ring buffer, hub, bridge, and monitor for one tmux
//! pane target. The registry creates sessions lazily on first use and keeps
//! them until shutdown; subscribers come and go underneath.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use panecast_protocol::PaneState;

use crate::bridge::{IOBridge, OutputCallback};
use crate::hub::Hub;
use crate::monitor::{PaneEvent, PaneMonitor};
use crate::ring::RingBuffer;
use crate::tmux;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Ring buffer capacity in bytes.
    pub ring_capacity: usize,
    /// Pane monitor poll interval.
    pub monitor_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 16 * 1024 * 1024,
            monitor_interval: Duration::from_secs(5),
        }
    }
}

pub struct Session {
    pub target: String,
    pub ring: Arc<Mutex<RingBuffer>>,
    pub hub: Arc<Hub>,
    pub bridge: Arc<IOBridge>,
    pub monitor: Arc<PaneMonitor>,
    cancel: CancellationToken,
}

impl Session {
    fn create(target: &str, cfg: &SessionConfig) -> Arc<Self> {
        let ring = Arc::new(Mutex::new(RingBuffer::new(cfg.ring_capacity)));
        let hub = Arc::new(Hub::new());

        // Append and broadcast happen in one call on the capture reader's
        // thread, so a subscriber that has seen a frame at offset K can rely
        // on the ring containing everything up to K.
        let on_output: OutputCallback = {
            let ring = Arc::clone(&ring);
            let hub = Arc::clone(&hub);
            Arc::new(move |chunk: &[u8]| {
                ring.lock().expect("ring lock poisoned").append(chunk);
                hub.broadcast(chunk);
            })
        };

        let bridge = Arc::new(IOBridge::new(target, on_output));
        let (monitor, events) = PaneMonitor::new(target, cfg.monitor_interval);
        let monitor = Arc::new(monitor);
        let cancel = CancellationToken::new();

        {
            let monitor = Arc::clone(&monitor);
            let token = cancel.clone();
            tokio::spawn(async move { monitor.run(token).await });
        }
        tokio::spawn(supervise(
            events,
            Arc::clone(&bridge),
            Arc::clone(&hub),
            Arc::clone(&monitor),
            cancel.clone(),
        ));

        info!(target = %target, "session created");

        Arc::new(Self {
            target: target.to_string(),
            ring,
            hub,
            bridge,
            monitor,
            cancel,
        })
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        self.bridge.close().await;
    }
}

/// Consume monitor events and drive the bridge: reattach on a new device
/// path, detach when the pane disappears, and tell subscribers either way.
async fn supervise(
    mut events: mpsc::Receiver<PaneEvent>,
    bridge: Arc<IOBridge>,
    hub: Arc<Hub>,
    monitor: Arc<PaneMonitor>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        match event {
            PaneEvent::Connected { tty, new_tty } => {
                if !new_tty {
                    continue;
                }
                info!(target = %bridge.target(), tty = %tty, "attaching to pane");
                if let Err(err) = bridge.reattach(&tty).await {
                    error!(target = %bridge.target(), tty = %tty, error = %err, "pane attach failed");
                    // Forget the sighting so the next poll re-emits it and
                    // the attach is retried.
                    monitor.reset();
                    continue;
                }
                let (cols, rows) = tmux::pane_dimensions(bridge.target())
                    .await
                    .unwrap_or((0, 0));
                hub.broadcast_status(PaneState::Connected, bridge.epoch(), cols, rows);
            }
            PaneEvent::Missing => {
                warn!(target = %bridge.target(), "pane missing, detaching");
                bridge.close().await;
                hub.broadcast_status(PaneState::Missing, bridge.epoch(), 0, 0);
            }
        }
    }
}

/// Lazily creates and caches sessions keyed by pane target.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    cfg: SessionConfig,
}

impl SessionRegistry {
    pub fn new(cfg: SessionConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            cfg,
        }
    }

    /// Return the session for `target`, creating it on first use.
    pub fn get(&self, target: &str) -> Arc<Session> {
        let mut sessions = self.sessions.lock().expect("sessions lock poisoned");
        if let Some(session) = sessions.get(target) {
            return Arc::clone(session);
        }
        let session = Session::create(target, &self.cfg);
        sessions.insert(target.to_string(), Arc::clone(&session));
        session
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("sessions lock poisoned").len()
    }

    /// Shut down every session and drop the map.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut map = self.sessions.lock().expect("sessions lock poisoned");
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close().await;
        }
    }
}
