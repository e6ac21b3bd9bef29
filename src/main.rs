use anyhow::Result;
use axum::{middleware, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use quote_cache::api;
use quote_cache::config::EngineConfig;
use quote_cache::engine::Engine;
use quote_cache::logging;
use quote_cache::request_id::request_id_middleware;
use quote_cache::state::AppState;
use quote_cache::store::RedisQuoteStore;
use quote_cache::upstream::HttpQuoteSource;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init();

    let config = EngineConfig::from_env()?;
    config.log();

    let source = HttpQuoteSource::new(
        config.upstream_base_url.clone(),
        config.upstream_call_timeout,
        config.upstream_api_key.clone(),
    );
    let store = RedisQuoteStore::connect(&config.redis_url).await;

    let engine = Engine::new(config.clone(), source, store);
    engine.warm_up(&config.warmup_pairs).await;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let state = AppState::new(engine.clone());

    let app = Router::new()
        .route("/health", axum::routing::get(api::health::health_check))
        .merge(api::price::routes())
        .merge(api::metrics::routes())
        .merge(api::admin::routes())
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", config.server_host, config.server_port);
    tracing::info!("server starting on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let grace = config.shutdown_grace;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("draining background workers");
    engine.shutdown(grace).await;
    tracing::info!("clean shutdown complete");

    Ok(())
}

/// Waits for either ctrl-c or SIGTERM, extending the teacher's single-signal
/// handling to also cover orchestrator-issued termination (spec §6
/// "Shutdown").
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
