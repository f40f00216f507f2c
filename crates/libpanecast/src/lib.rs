//! Streaming core for exposing tmux panes to browsers.
//!
//! One [`session::Session`] per pane target ties together the pieces:
//! the [`monitor::PaneMonitor`] discovers the pane's device path and emits
//! lifecycle transitions, the [`bridge::IOBridge`] captures the raw byte
//! stream through a pipe-pane FIFO and injects input via send-keys, the
//! [`ring::RingBuffer`] retains recent output for replay, and the
//! [`hub::Hub`] fans live output to subscribers without letting any of them
//! stall the capture path.

pub mod bridge;
pub mod error;
pub mod hub;
pub mod monitor;
pub mod ring;
pub mod session;
pub mod tmux;

pub use error::PanecastError;
pub use session::{Session, SessionConfig, SessionRegistry};
