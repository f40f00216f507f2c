use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PanecastError {
    #[error("tmux {command} failed: {stderr}")]
    TmuxCommand { command: String, stderr: String },

    #[error("empty pane_tty for target {0:?}")]
    EmptyPaneTty(String),

    #[error("unexpected pane_tty value: {0:?}")]
    SuspiciousTty(String),

    #[error("unparseable tmux output for {what}: {output:?}")]
    MalformedTmuxOutput { what: &'static str, output: String },

    #[error("pipe setup failed at {path:?}: {source}")]
    PipeSetup {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
