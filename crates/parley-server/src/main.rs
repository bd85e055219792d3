mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_gateway::auth::{ConnectionGate, JwtVerifier, bearer_token};
use parley_gateway::connection;
use parley_gateway::store::Store;
use parley_gateway::{Hub, HubError};
use parley_types::api::{GatewayQuery, HealthResponse};

use crate::config::Config;

#[derive(Clone)]
struct ServerState {
    hub: Hub,
    gate: ConnectionGate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,parley_gateway=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = parley_db::Database::open(&config.db_path)?;
    let store: Arc<dyn Store> = Arc::new(db);

    // Shared state
    let hub = Hub::new(store, config.hub.clone());
    let gate = ConnectionGate::new(Arc::new(JwtVerifier::new(&config.jwt_secret)));
    let state = ServerState { hub, gate };

    let app = Router::new()
        .route("/gateway", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!(
        "Parley gateway listening on {} (typing expiry {:?})",
        addr, config.hub.typing_expiry
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Authenticate at the HTTP upgrade: a rejected token never reaches the hub.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<GatewayQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query.token.as_deref().or_else(|| bearer_token(&headers));

    match state.gate.admit(token) {
        Ok(identity) => ws
            .on_upgrade(move |socket| connection::handle_connection(socket, state.hub, identity))
            .into_response(),
        Err(e @ HubError::Auth(_)) => (StatusCode::UNAUTHORIZED, e.to_string()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        online: state.hub.presence().online_count().await,
    })
}
