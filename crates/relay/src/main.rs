mod api;
mod auth;
mod broker;
mod cache;
mod config;
mod cors;
mod db;
mod error;
mod forceout;
mod upstream;
mod ws;

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::{sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    auth::jwt::JwtTokenService,
    broker::Broker,
    cache::Caches,
    config::{LogFormat, RelayConfig},
    db::pool::{check_pool_health, Database, PoolConfig},
    error::{ErrorCode, RelayError},
    forceout::ForceoutRegistry,
    upstream::resolver::UpstreamResolver,
};

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("JWT_SECRET is not set; using the local development secret");
    }
    let jwt_service =
        Arc::new(JwtTokenService::new(&config.jwt_secret).context("invalid relay JWT secret")?);

    let database = match config.database_url.as_deref() {
        Some(url) => {
            let database = Database::connect(url, PoolConfig::from_env()).await?;
            check_pool_health(database.pool()).await?;
            info!(dialect = database.dialect().name(), "database pool ready");
            Some(database)
        }
        None => None,
    };

    let caches = Caches::from_config(&config.cache).await.context("failed to build caches")?;
    let resolver = UpstreamResolver::new(config.resolver.clone())
        .context("failed to build upstream resolver")?;
    let forceout = Arc::new(ForceoutRegistry::new(config.forceout_ban));
    let broker = Broker::new(config.broker.clone(), resolver, forceout, caches.clone());

    let app = build_router(Arc::clone(&jwt_service), Arc::clone(&broker), config.cors_origins.clone());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        max_identities = config.broker.max_identities,
        "starting relay server"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")?;

    broker.close_all_connections().await;
    caches.close().await;
    if let Some(database) = database {
        database.close().await;
    }
    info!("relay server stopped");

    Ok(())
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn build_router(
    jwt_service: Arc<JwtTokenService>,
    broker: Arc<Broker>,
    cors_origins: Option<String>,
) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(ws::router(Arc::clone(&jwt_service), Arc::clone(&broker)))
            .merge(api::router(jwt_service, Some(broker)))
            .fallback(error::not_found),
    )
    .layer(cors::cors_layer(cors_origins))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(?error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(?error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            RelayError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = error::request_id_from_headers_or_generate(request.headers());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = error::with_request_id_scope(request_id.clone(), next.run(request)).await;
    error::attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
