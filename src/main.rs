use anyhow::Result;
use axum::{routing::get, Router};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod models;
mod services;

use config::AppConfig;
use services::classifier::ImageClassifier;
use services::http::HttpSession;
use services::metadata::{build_adapters, MetadataService};
use services::persistence::{image_proxy_from_template, LocalStore, PersistenceGateway};
use services::sites::{NoopTranslator, SiteContext};

/// Tracks all background task handles for graceful shutdown
struct BackgroundTasks {
    handles: Vec<(&'static str, JoinHandle<()>)>,
    shutdown: CancellationToken,
}

impl BackgroundTasks {
    fn new() -> Self {
        Self {
            handles: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn spawn<F>(&mut self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.handles.push((name, handle));
    }

    async fn shutdown(self) {
        tracing::info!("Initiating graceful shutdown...");

        // Signal all tasks to stop
        self.shutdown.cancel();

        // Wait for all tasks with a timeout
        for (name, handle) in self.handles {
            tracing::debug!("Waiting for {} to finish...", name);
            match tokio::time::timeout(Duration::from_secs(10), handle).await {
                Ok(Ok(())) => tracing::debug!("{} finished cleanly", name),
                Ok(Err(e)) => tracing::warn!("{} panicked: {}", name, e),
                Err(_) => tracing::warn!("{} timed out during shutdown", name),
            }
        }

        tracing::info!("All background tasks stopped");
    }
}

pub struct AppState {
    pub config: AppConfig,
    pub metadata: Arc<MetadataService>,
    pub context: Arc<SiteContext>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "avmeta=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load .env file if present
    dotenvy::dotenv().ok();

    let config = AppConfig::load();

    config.paths.ensure_dirs().await?;

    config.log_config();

    let session = Arc::new(HttpSession::new(config.session_options()));

    let placeholders = services::image_ops::load_placeholders(&config.images.placeholders).await;
    if placeholders.len() < config.images.placeholders.len() {
        tracing::warn!(
            "Loaded {} of {} placeholder images",
            placeholders.len(),
            config.images.placeholders.len()
        );
    }
    let classifier = Arc::new(ImageClassifier::new(placeholders));

    let gateway = Arc::new(PersistenceGateway::new(
        LocalStore::new(
            config.paths.image_store_dir(),
            config.images.segment.clone(),
            config.images.force_refresh,
        ),
        image_proxy_from_template(config.images.proxy_template.as_deref()),
    ));

    let context = Arc::new(SiteContext {
        session: session.clone(),
        classifier,
        gateway,
        translator: Arc::new(NoopTranslator),
        labels: config.label_policy(),
    });

    let adapters = build_adapters(context.clone(), &config.sites.enabled, &config.sites.base_urls);
    if adapters.is_empty() {
        tracing::warn!("No sites enabled; every search will come back empty");
    }
    let metadata = Arc::new(MetadataService::new(adapters));

    let state = Arc::new(AppState {
        config: config.clone(),
        metadata,
        context,
    });

    // Initialize background task manager with graceful shutdown support
    let mut bg_tasks = BackgroundTasks::new();
    let shutdown_token = bg_tasks.token();

    // Spawn page cache sweeper with cancellation
    {
        let sweep_session = session.clone();
        let cancel = shutdown_token.clone();
        let interval = config.session_options().cache_ttl.clamp(
            Duration::from_secs(60),
            Duration::from_secs(3600),
        );
        bg_tasks.spawn("http-cache-sweeper", async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Cache sweeper received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let removed = sweep_session.sweep_expired().await;
                        if removed > 0 {
                            tracing::debug!("Swept {} expired page(s) from cache", removed);
                        }
                    }
                }
            }
        });
    }

    // Root handler
    async fn root_handler() -> &'static str {
        "avmeta metadata server"
    }

    // Build router
    let app = Router::new()
        .route("/", get(root_handler).head(root_handler))
        .route("/health", get(|| async { "OK" }))
        .merge(api::routes())
        .nest_service("/images", ServeDir::new(config.paths.image_store_dir()))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let ip = config.bind_address.parse::<IpAddr>().unwrap_or_else(|_| {
        tracing::warn!(
            "Invalid bind address '{}', falling back to 0.0.0.0",
            config.bind_address
        );
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    });
    let addr = SocketAddr::new(ip, config.port);
    tracing::info!("Starting server on {}", addr);

    // Create shutdown signal listener
    let shutdown_signal = async {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
            _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
        }
    };

    // Start server with graceful shutdown
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    // After server stops, gracefully shutdown background tasks
    bg_tasks.shutdown().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}
