//! HTTP surface: health, metrics, ICE configuration and the signaling socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::{FromRef, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::gateway::Gateway;
use crate::registry::RegistrySnapshot;
use crate::signal::{self, ConnectionCounter};

#[derive(Clone)]
pub struct AppState {
    gateway: Gateway,
    connections: ConnectionCounter,
}

impl AppState {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl FromRef<AppState> for Gateway {
    fn from_ref(state: &AppState) -> Self {
        state.gateway.clone()
    }
}

impl FromRef<AppState> for ConnectionCounter {
    fn from_ref(state: &AppState) -> Self {
        state.connections.clone()
    }
}

#[derive(Serialize)]
struct RuntimeMetrics {
    active_ws_connections: usize,
    max_sessions: usize,
    #[serde(flatten)]
    sessions: RegistrySnapshot,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IceServer {
    urls: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IceConfig {
    ice_servers: Vec<IceServer>,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.gateway.registry().snapshot().await;
    (
        StatusCode::OK,
        Json(RuntimeMetrics {
            active_ws_connections: state.connections.load(Ordering::Relaxed),
            max_sessions: state.gateway.registry().max_sessions(),
            sessions,
        }),
    )
}

async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let active_ws_connections = state.connections.load(Ordering::Relaxed);
    let s = state.gateway.registry().snapshot().await;

    let prometheus_text = format!(
        r#"# HELP rendezvous_websocket_connections Active WebSocket connections
# TYPE rendezvous_websocket_connections gauge
rendezvous_websocket_connections {active_ws_connections}
# HELP rendezvous_sessions Live sessions by state
# TYPE rendezvous_sessions gauge
rendezvous_sessions{{state="awaiting_offer"}} {awaiting_offer}
rendezvous_sessions{{state="awaiting_answer"}} {awaiting_answer}
rendezvous_sessions{{state="connected"}} {connected}
# HELP rendezvous_sessions_total Session outcomes since start
# TYPE rendezvous_sessions_total counter
rendezvous_sessions_total{{outcome="created"}} {created}
rendezvous_sessions_total{{outcome="connected"}} {connected_total}
rendezvous_sessions_total{{outcome="failed"}} {failed}
rendezvous_sessions_total{{outcome="expired"}} {expired}
rendezvous_sessions_total{{outcome="rejected"}} {rejected}
"#,
        active_ws_connections = active_ws_connections,
        awaiting_offer = s.awaiting_offer,
        awaiting_answer = s.awaiting_answer,
        connected = s.connected,
        created = s.sessions_created_total,
        connected_total = s.sessions_connected_total,
        failed = s.sessions_failed_total,
        expired = s.sessions_expired_total,
        rejected = s.sessions_rejected_total,
    );

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        prometheus_text,
    )
}

async fn ice_config(State(gateway): State<Gateway>) -> impl IntoResponse {
    let servers = &gateway.config().ice_servers;
    let ice_servers = if servers.is_empty() {
        Vec::new()
    } else {
        vec![IceServer {
            urls: servers.clone(),
        }]
    };
    Json(IceConfig { ice_servers })
}

fn build_cors_layer(config: &GatewayConfig) -> CorsLayer {
    let allow_origin = if config.cors_allow_any {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin.trim_end_matches('/')).ok())
            .collect();
        if origins.is_empty() {
            tracing::warn!(
                "no valid CORS origins configured; cross-origin browser access will be blocked"
            );
            return CorsLayer::new()
                .allow_methods([Method::GET, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]);
        }
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

pub fn router(gateway: Gateway) -> Router {
    let cors = build_cors_layer(gateway.config());
    Router::new()
        .route("/", get(|| async { "Rendezvous Gateway Online" }))
        .route("/health", get(health))
        .route("/metrics/runtime", get(health))
        .route("/metrics/prometheus", get(prometheus_metrics))
        .route("/ice-config", get(ice_config))
        .route("/ws", get(signal::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState::new(gateway))
}

/// Serve the gateway on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, gateway: Gateway, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = router(gateway);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}
