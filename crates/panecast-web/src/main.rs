mod api;
mod files;
mod indexer;
mod upload;
mod ws;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::info;
use tracing_subscriber::EnvFilter;

use libpanecast::{SessionConfig, SessionRegistry};

use indexer::FileIndexer;

#[derive(Parser, Debug)]
#[command(
    name = "panecast-web",
    about = "Stream tmux panes to browsers over WebSockets"
)]
struct Args {
    /// HTTP listen address.
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: String,

    /// Ring buffer capacity in bytes.
    #[arg(long, env = "RING_BUFFER_SIZE", default_value_t = 16 * 1024 * 1024)]
    ring_buffer_size: usize,

    /// Upper bound on a tail-mode replay payload in bytes.
    #[arg(long, env = "TAIL_REPLAY_SIZE", default_value_t = 256 * 1024)]
    tail_replay_size: usize,

    /// Outbound queue depth per subscriber.
    #[arg(long, env = "CLIENT_QUEUE_SIZE", default_value_t = 256)]
    client_queue_size: usize,

    /// tmux pane target (e.g. "main:0.0") to pre-create a session for.
    #[arg(long, env = "TMUX_TARGET")]
    tmux_target: Option<String>,

    /// Directory for uploaded images.
    #[arg(long, env = "UPLOAD_DIR", default_value = "./uploads")]
    upload_dir: PathBuf,

    /// Maximum upload size in bytes.
    #[arg(long, env = "MAX_UPLOAD_SIZE", default_value_t = 20 * 1024 * 1024)]
    max_upload_size: usize,

    /// Root directory for the filename index. Defaults to $HOME.
    #[arg(long, env = "INDEX_ROOT")]
    index_root: Option<PathBuf>,

    /// Directory of prebuilt frontend assets to serve at the root.
    #[arg(long, env = "STATIC_DIR")]
    static_dir: Option<PathBuf>,
}

pub struct AppState {
    pub registry: SessionRegistry,
    pub indexer: Arc<FileIndexer>,
    pub client_queue_size: usize,
    pub tail_replay_size: usize,
    pub upload_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "panecast=info".into()),
        )
        .init();

    let args = Args::parse();

    info!(
        listen_addr = %args.listen_addr,
        ring_buffer_size = args.ring_buffer_size,
        "starting panecast"
    );

    let registry = SessionRegistry::new(SessionConfig {
        ring_capacity: args.ring_buffer_size,
        monitor_interval: Duration::from_secs(5),
    });

    // A pre-configured target gets its session (and pane monitor) up before
    // the first browser arrives.
    if let Some(target) = &args.tmux_target {
        registry.get(target);
        info!(target = %target, "default session created");
    }

    let index_root = args
        .index_root
        .clone()
        .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("/"));
    let indexer = Arc::new(FileIndexer::new(
        vec![index_root],
        Duration::from_secs(30),
    ));
    let background = CancellationToken::new();
    tokio::spawn({
        let indexer = Arc::clone(&indexer);
        let token = background.clone();
        async move { indexer.run(token).await }
    });

    let state = Arc::new(AppState {
        registry,
        indexer,
        client_queue_size: args.client_queue_size,
        tail_replay_size: args.tail_replay_size,
        upload_dir: args.upload_dir.clone(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .route("/api/panes", get(api::list_panes))
        .route("/api/search", get(api::search_files))
        .route("/api/files", get(files::list_dir))
        .route(
            "/api/file",
            get(files::file_content)
                .post(files::save_file)
                .layer(DefaultBodyLimit::max(files::MAX_SAVE_BYTES)),
        )
        .route("/s/{target}/ws", get(ws::ws_handler))
        .route(
            "/s/{target}/upload",
            post(upload::upload_image).layer(DefaultBodyLimit::max(args.max_upload_size)),
        )
        .layer(cors)
        .with_state(Arc::clone(&state));

    if let Some(static_dir) = &args.static_dir {
        app = app.fallback_service(
            ServeDir::new(static_dir).append_index_html_on_directories(true),
        );
    }

    let listener = tokio::net::TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.listen_addr))?;
    info!(addr = %args.listen_addr, "listening");

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutting down");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;

    background.cancel();
    state.registry.close_all().await;

    Ok(())
}
