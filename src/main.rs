mod config;
mod error;
mod middleware;
mod models;
mod pipeline;
mod providers;
mod routes;
mod services;
mod state;

use std::sync::Arc;

use axum::{http::HeaderValue, middleware as axum_mw, Router};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use config::Config;
use providers::ProviderRegistry;
use services::settlement::{self, UsageQueue};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file (ignore if missing)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load config
    let config = Config::from_env()?;
    tracing::info!("Starting LLM edge gateway on {}", config.listen_addr);

    // Create Redis connection manager
    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis = redis_client.get_connection_manager().await?;
    tracing::info!("Connected to Redis");

    // One HTTP client shared by providers, key verification and settlement
    let http_client = reqwest::Client::new();

    let providers = ProviderRegistry::from_config(&config, &http_client);
    if providers.is_empty() {
        tracing::warn!("No providers configured; chat requests will be rejected");
    } else {
        tracing::info!("Registered {} provider(s)", providers.len());
    }

    // Usage queue + settlement consumer
    let (usage_queue, usage_rx) = UsageQueue::new();
    tokio::spawn(settlement::run_consumer(
        usage_rx,
        usage_queue.clone(),
        http_client.clone(),
        config.backend_url.clone(),
        config.internal_secret.clone(),
    ));

    // Build shared state
    let state = Arc::new(AppState {
        redis,
        config: config.clone(),
        http_client,
        providers,
        usage_queue,
    });

    // Build routes
    let v1_routes = routes::chat::router()
        .merge(routes::models::router())
        .route_layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::auth::api_key_auth,
        ));

    let internal_routes = routes::internal::protected_router()
        .route_layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::auth::internal_auth,
        ))
        .merge(routes::internal::public_router());

    let allow_origin = if config.cors_origin == "*" {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origin
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        AllowOrigin::list(origins)
    };

    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ]);

    let app = Router::new()
        .nest("/v1", v1_routes)
        .nest("/internal", internal_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let listener = TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("Listening on {}", config.listen_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
