use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use simsync::config::{self, SyncConfig};
use simsync::session::Session;
use simsync::store::StoreUpdate;

#[derive(Parser)]
#[command(name = "simsync", about = "Live sync client for the agent simulation backend")]
struct Cli {
    /// HTTP base URL of the simulation backend
    #[arg(long, default_value = config::DEFAULT_API_URL, env = "SIMSYNC_API_URL")]
    api_url: String,

    /// Streaming base URL (defaults to the API URL with a ws scheme)
    #[arg(long, env = "SIMSYNC_STREAM_URL")]
    stream_url: Option<String>,

    /// Host used for the streaming URL when the API URL is not absolute
    #[arg(long, env = "SIMSYNC_HOST")]
    host: Option<String>,

    /// Bearer token for authenticated endpoints
    #[arg(long, env = "SIMSYNC_TOKEN")]
    token: Option<String>,

    /// Events kept in the session log
    #[arg(long, default_value_t = config::DEFAULT_EVENT_CAPACITY, env = "SIMSYNC_EVENT_CAPACITY")]
    event_capacity: usize,

    /// Reconciliation poll interval in milliseconds
    #[arg(
        long,
        default_value_t = 2000,
        env = "SIMSYNC_POLL_INTERVAL_MS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    poll_interval_ms: u64,

    /// Delay before reconnecting the push channel, in milliseconds
    #[arg(
        long,
        default_value_t = 2000,
        env = "SIMSYNC_RECONNECT_DELAY_MS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    reconnect_delay_ms: u64,

    /// Events revealed per "load more" page
    #[arg(long, default_value_t = config::DEFAULT_PAGE_SIZE, env = "SIMSYNC_PAGE_SIZE")]
    page_size: usize,

    /// Conversation (group chat) id to follow
    #[arg(long, env = "SIMSYNC_CONVERSATION")]
    conversation: Option<String>,

    /// Also poll the global event feed
    #[arg(long, env = "SIMSYNC_FEED_POLL")]
    feed_poll: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "simsync=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = SyncConfig {
        api_url: cli.api_url,
        stream_url: cli.stream_url,
        host: cli.host,
        token: cli.token,
        event_capacity: cli.event_capacity,
        page_size: cli.page_size,
        poll_interval: Duration::from_millis(cli.poll_interval_ms),
        reconnect_delay: Duration::from_millis(cli.reconnect_delay_ms),
        ..Default::default()
    };

    info!(
        api_url = %config.api_url,
        stream_url = %config.stream_endpoint(),
        "Starting simsync"
    );

    let mut session = Session::new(config);
    if let Err(e) = session.refetch_all().await {
        warn!(error = %e, "Initial fetch incomplete, continuing with partial state");
    }

    if let Some(ref id) = cli.conversation {
        session
            .select_conversation_by_id(id)
            .await
            .context("Failed to select conversation")?;
    }
    if cli.feed_poll {
        session.start_feed_poll();
    }

    let mut updates = session.store().subscribe();
    session.connect();

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(StoreUpdate::EventAppended(event)) => {
                    info!(
                        id = %event.id,
                        kind = event.kind.as_deref().unwrap_or("-"),
                        "{}",
                        event.description
                    );
                    if cli.conversation.is_some() {
                        let view = session.projection();
                        info!(shown = view.displayed_count, total = view.total, "Conversation view");
                    }
                }
                Ok(StoreUpdate::Status(status)) => info!(status = %status, "Push connection"),
                Ok(StoreUpdate::RelationsReplaced { count }) => info!(count, "Relations updated"),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "Update log lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    session.shutdown();
    let diagnostics = session.store().diagnostics().len();
    if diagnostics > 0 {
        info!(count = diagnostics, "Diagnostics recorded this session");
    }
    Ok(())
}
