//! Boardwatch Server - Main entry point.
//!
//! This binary starts the Boardwatch notification relay with:
//! - Structured JSON logging for production
//! - Replay of persisted watches at startup
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//!
//! # Configuration
//!
//! See [`boardwatch_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! BOARDWATCH_JIRA_URL="https://example.atlassian.net" \
//! BOARDWATCH_JIRA_EMAIL="bot@example.com" \
//! BOARDWATCH_JIRA_API_TOKEN="api-token" \
//! BOARDWATCH_WEBHOOK_TOKEN="shared-secret" \
//! PORT=8080 \
//! cargo run --release --bin boardwatch-server
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use boardwatch_server::config::Config;
use boardwatch_server::delivery::WebhookDelivery;
use boardwatch_server::error::{Result, ServerError};
use boardwatch_server::event::EventContext;
use boardwatch_server::routes::{create_router, AppState};
use boardwatch_server::service::{ServiceOptions, WatchService};
use boardwatch_server::store::{JsonFileStore, SpaceStore};
use boardwatch_server::tracker::JiraClient;

/// File name of the space store inside the data directory.
const SPACE_STORE_FILE: &str = "spaces.json";

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize structured logging
    init_logging();

    // Load configuration
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  BOARDWATCH_JIRA_URL            - Base URL of the Jira site");
            eprintln!("  BOARDWATCH_JIRA_EMAIL          - Jira API user");
            eprintln!("  BOARDWATCH_JIRA_API_TOKEN      - Jira API token");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  BOARDWATCH_WEBHOOK_TOKEN       - Shared secret for /webhook?token=");
            eprintln!("  BOARDWATCH_CACHE_DURATION_SECS - Refresh interval (default: 21600)");
            eprintln!("  BOARDWATCH_DATA_DIR            - Space store directory (default: ./data)");
            eprintln!("  BOARDWATCH_CUSTOM_FIELDS       - Format: customfield_1:Label,...");
            eprintln!("  PORT                           - HTTP server port (default: 8080)");
            eprintln!("  RUST_LOG                       - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    if let Err(err) = run(config).await {
        error!(error = %err, "Server failed");
        return ExitCode::from(1);
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

async fn run(config: Config) -> Result<()> {
    let webhook_auth = if config.webhook_token.is_some() {
        "token"
    } else {
        "disabled"
    };
    info!(
        port = config.port,
        jira_url = %config.jira_url,
        webhook_auth = webhook_auth,
        cache_duration_secs = config.cache_duration.as_secs(),
        custom_fields = config.custom_fields.len(),
        "Boardwatch server starting"
    );

    let jira = JiraClient::new(&config.jira_url, &config.jira_email, &config.jira_api_token)
        .map_err(|e| ServerError::HttpClient(e.to_string()))?;

    let store: Arc<dyn SpaceStore> =
        Arc::new(JsonFileStore::open(config.data_dir.join(SPACE_STORE_FILE)).await?);

    let delivery = WebhookDelivery::new(Arc::clone(&store))
        .map_err(|e| ServerError::HttpClient(e.to_string()))?;

    let service = WatchService::new(
        Arc::new(jira),
        Arc::new(delivery),
        ServiceOptions {
            cache_duration: config.cache_duration,
            event_context: EventContext {
                jira_url: config.jira_url.clone(),
                custom_fields: config.custom_fields.clone(),
            },
            ..ServiceOptions::default()
        },
    );

    // Replay persisted watches without holding up the listener
    let replay = tokio::spawn(replay_spaces(service.clone(), Arc::clone(&store)));

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr).await.map_err(|err| {
        ServerError::internal(format!("failed to bind to {bind_addr}: {err}"))
    })?;
    info!(port = config.port, address = %bind_addr, "Server listening");

    let app = create_router(AppState::new(config, service.clone(), store));

    info!("Server ready to accept connections");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Server shutting down gracefully");

    replay.abort();
    service.shutdown();

    served.map_err(|err| ServerError::internal(format!("server error: {err}")))
}

/// Re-watches every list persisted for every known space.
async fn replay_spaces(service: WatchService, store: Arc<dyn SpaceStore>) {
    let spaces = match store.spaces().await {
        Ok(spaces) => spaces,
        Err(err) => {
            error!(error = %err, "Failed to list spaces for replay");
            return;
        }
    };

    info!(spaces = spaces.len(), "Replaying persisted watches");

    for (space, config) in spaces {
        if config.watched.is_empty() {
            continue;
        }
        let report = service.restore_space(&space, &config.watched).await;
        if !report.failed.is_empty() {
            warn!(
                space = %space,
                failed = report.failed.len(),
                "Some watches could not be restored"
            );
        }
    }

    info!(lists = service.watched_count(), "Replay complete");
}

/// Initialize structured logging with tracing.
///
/// Configures JSON-formatted output with:
/// - Environment-based log level filtering via RUST_LOG
/// - Default log level of `info`
/// - Target and level information
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Creates a future that resolves when a shutdown signal is received.
///
/// Listens for:
/// - SIGTERM (container orchestrator shutdown)
/// - SIGINT (Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
