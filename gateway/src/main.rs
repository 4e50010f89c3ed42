use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderName, HeaderValue, Method,
};
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use common_http_errors::http_error_metrics_layer;
use regex::Regex;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

use gateway::accounting::AccountingSink;
use gateway::app_state::AppState;
use gateway::config::GatewayConfig;
use gateway::credential::CredentialStore;
use gateway::dispatcher::Dispatcher;
use gateway::handlers::{chat_completions, healthz, list_models, metrics_endpoint};
use gateway::metrics::GatewayMetrics;
use gateway::queue::JobQueue;
use gateway::quota::QuotaGuard;
use gateway::rate_limiter::RateLimiter;
use gateway::upstream::UpstreamClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = Arc::new(GatewayConfig::from_env()?);

    let db = PgPool::connect(&config.database_url).await?;
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator.run(&db).await?;

    let metrics = Arc::new(GatewayMetrics::new()?);
    metrics.set_queue_capacity(config.queue_max_size);
    metrics.set_dispatcher_capacity(config.vllm_max_concurrency);

    let credential_store = CredentialStore::new(db.clone(), config.admin_bootstrap_key.clone());
    let quota_guard = QuotaGuard::new(db.clone());
    let accounting = AccountingSink::new(db.clone());
    let rate_limiter = Arc::new(RateLimiter::redis(&config.redis_url, "gateway:rl".into()).await?);

    let (queue, receiver) = JobQueue::bounded(config.queue_max_size, metrics.clone());
    let upstream = UpstreamClient::new(config.vllm_url.clone(), config.vllm_timeout);
    let dispatcher = Dispatcher::new(receiver, upstream, config.vllm_max_concurrency, metrics.clone());
    let dispatcher_handle = dispatcher.spawn();

    let state = AppState {
        db,
        config: config.clone(),
        credential_store,
        rate_limiter,
        quota_guard,
        accounting,
        queue,
        metrics: metrics.clone(),
    };

    let cors = build_cors_layer(&config);

    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
        .layer(middleware::from_fn(http_error_metrics_layer("gateway")))
        .layer(cors);

    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8000);
    let ip: std::net::IpAddr = host.parse()?;
    let addr = SocketAddr::from((ip, port));
    info!(%addr, "starting gateway");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    dispatcher_handle.shutdown().await;
    Ok(())
}

fn build_cors_layer(config: &GatewayConfig) -> CorsLayer {
    let cors = if let Some(pattern) = &config.allow_origin_regex {
        let re = Regex::new(pattern).expect("ALLOW_ORIGIN_REGEX must be a valid regex");
        CorsLayer::new().allow_origin(AllowOrigin::predicate(move |origin, _| {
            origin.to_str().map(|s| re.is_match(s)).unwrap_or(false)
        }))
    } else {
        let origins = config
            .admin_origins
            .iter()
            .filter_map(|origin| origin.parse::<HeaderValue>().ok())
            .collect::<Vec<_>>();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    cors.allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS].into_iter().collect::<Vec<_>>())
        .allow_headers(
            [
                ACCEPT,
                CONTENT_TYPE,
                HeaderName::from_static("authorization"),
                HeaderName::from_static("x-api-key"),
            ]
            .into_iter()
            .collect::<Vec<_>>(),
        )
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, draining dispatcher");
}
