//! Prop trading engine — process entry point.
//!
//! Boots configuration, the core `Engine` (price feed, account/position/order
//! managers, trigger engines, persistence), the JWT-backed auth REST surface,
//! and the WebSocket gateway, then serves all of it behind one Axum router
//! until a shutdown signal arrives.

use anyhow::{Context, Result};
use axum::{middleware as axum_mw, routing::{get, post}, Router};
use prop_engine::auth::{api as auth_api, auth_middleware, AuthState, JwtHandler, UserStore};
use prop_engine::config::Config;
use prop_engine::engine::Engine;
use prop_engine::execution::PlanLimits;
use prop_engine::middleware::rate_limit::rate_limit_middleware;
use prop_engine::middleware::{RateLimitConfig, RateLimitLayer};
use prop_engine::{gateway, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;
    info!(port = config.ws_port, node_env = %config.node_env, "starting prop trading engine");

    let plan = PlanLimits::default();
    let engine = Engine::start(&config, plan).await.context("engine failed to start")?;

    // Separate database file from the trading store: the two schemas both
    // define a `users` table with different columns, so they can't share one.
    let auth_db_path = format!("{}-auth", config.database_url);
    let user_store = Arc::new(UserStore::new(&auth_db_path).context("failed to open user store")?);
    let jwt_handler = Arc::new(JwtHandler::new(config.jwt_secret.clone()));
    let auth_state = AuthState::new(user_store, jwt_handler.clone());

    let gateway_state = engine.gateway_state(jwt_handler.clone(), plan);

    let login_limiter = RateLimitLayer::new(RateLimitConfig::default());
    let auth_router = Router::new()
        .route("/api/auth/login", post(auth_api::login))
        .route_layer(axum_mw::from_fn_with_state(login_limiter, rate_limit_middleware))
        .with_state(auth_state.clone());

    let protected_routes = Router::new()
        .route("/api/auth/me", get(auth_api::get_current_user))
        .route("/api/admin/users", get(auth_api::list_users).post(auth_api::create_user))
        .route("/api/admin/users/:id", axum::routing::delete(auth_api::delete_user))
        .route_layer(axum_mw::from_fn_with_state(jwt_handler.clone(), auth_middleware))
        .with_state(auth_state);

    let public_routes = Router::new().route("/health", get(health_check));

    let ws_router = Router::new()
        .route("/ws", get(gateway::ws_upgrade))
        .with_state(gateway_state);

    let app = Router::new()
        .merge(public_routes)
        .merge(auth_router)
        .merge(protected_routes)
        .merge(ws_router)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(middleware::request_logging_simple));

    let addr = format!("0.0.0.0:{}", config.ws_port);
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(engine.shutdown.clone()))
        .await
        .context("server error")?;

    Ok(())
}

/// Waits for Ctrl-C (or SIGTERM on Unix), then broadcasts shutdown to every
/// background task before letting the Axum listener drain in-flight requests.
async fn shutdown_signal(shutdown: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl-C handler");
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, draining connections");
    let _ = shutdown.send(());
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prop_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn health_check() -> &'static str {
    "ok"
}
