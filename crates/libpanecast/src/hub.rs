//! Subscriber registry and broadcast fan-out.
//!
//! Broadcast never blocks: every subscriber has a bounded queue and a
//! non-blocking enqueue. A subscriber that keeps missing frames is evicted
//! by cancelling its token, so a slow browser can never stall the capture
//! read path or its peers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use panecast_protocol::{PaneState, ServerMessage};

/// Consecutive missed frames before a subscriber is force-disconnected.
const DROP_EVICT_THRESHOLD: usize = 10;

struct SubscriberHandle {
    /// Pre-serialized JSON frames; the subscriber's outbound pump drains
    /// this into its WebSocket.
    sender: mpsc::Sender<String>,
    cancel: CancellationToken,
    dropped: AtomicUsize,
}

#[derive(Default)]
pub struct Hub {
    subscribers: RwLock<HashMap<String, SubscriberHandle>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str, sender: mpsc::Sender<String>, cancel: CancellationToken) {
        let mut subs = self.subscribers.write().expect("subscribers lock poisoned");
        subs.insert(
            id.to_string(),
            SubscriberHandle {
                sender,
                cancel,
                dropped: AtomicUsize::new(0),
            },
        );
        info!(subscriber_id = %id, total = subs.len(), "subscriber registered");
    }

    pub fn unregister(&self, id: &str) {
        let mut subs = self.subscribers.write().expect("subscribers lock poisoned");
        if subs.remove(id).is_some() {
            info!(subscriber_id = %id, total = subs.len(), "subscriber unregistered");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .expect("subscribers lock poisoned")
            .len()
    }

    /// Fan a chunk of pane output to every subscriber.
    pub fn broadcast(&self, data: &[u8]) {
        let frame = match serde_json::to_string(&ServerMessage::output(data)) {
            Ok(frame) => frame,
            Err(err) => {
                error!(error = %err, "failed to encode output frame");
                return;
            }
        };

        let subs = self.subscribers.read().expect("subscribers lock poisoned");
        for (id, sub) in subs.iter() {
            match sub.sender.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let dropped = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped >= DROP_EVICT_THRESHOLD {
                        warn!(
                            subscriber_id = %id,
                            dropped,
                            "subscriber too slow, disconnecting"
                        );
                        sub.cancel.cancel();
                    }
                }
                // Pump already gone; the subscriber will unregister itself.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Fan a pane lifecycle update to every subscriber. Status frames do not
    /// count toward eviction.
    pub fn broadcast_status(&self, pane_state: PaneState, epoch: u64, cols: u16, rows: u16) {
        let frame =
            match serde_json::to_string(&ServerMessage::status(pane_state, epoch, cols, rows)) {
                Ok(frame) => frame,
                Err(_) => return,
            };

        let subs = self.subscribers.read().expect("subscribers lock poisoned");
        for sub in subs.values() {
            let _ = sub.sender.try_send(frame.clone());
        }
    }
}
