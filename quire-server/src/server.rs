use crate::config::Config;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use quire_core::transport::HttpEnvelope;
use quire_core::{HttpTransport, Node, NodeBuilder, Result, Service, Transport};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub node: Node,
    pub service: Arc<dyn Service>,
    pub transport: Arc<HttpTransport>,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

pub async fn run_server(config: Config) -> Result<()> {
    let keys = Arc::new(config.load_keys()?);
    let node_config = config.node.clone();

    let transport = Arc::new(HttpTransport::new(
        node_config.advertised_endpoints(),
        node_config.dock.rpc_timeout(),
    )?);
    let node = NodeBuilder::new(node_config.clone())
        .keys(keys)
        .transport(transport.clone() as Arc<dyn Transport>)
        .build()
        .await?;

    tracing::info!(
        "Node {} with key {}",
        node.id(),
        node.doughnut().keys().public()
    );

    let state = Arc::new(ServerState {
        service: node.service(),
        node,
        transport,
    });

    let app = Router::new()
        .route("/rpc", post(rpc_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&node_config.listen).await?;
    tracing::info!("Server listening on {}", node_config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.node.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", error);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

async fn rpc_handler(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<HttpEnvelope>,
) -> impl IntoResponse {
    tracing::trace!("rpc {} from {:?}", body.envelope.request.method(), body.envelope.sender);
    Json(state.transport.serve(&state.service, body).await)
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(ApiResponse {
        success: true,
        data: Some(state.node.id()),
        error: None,
    })
}

async fn stats_handler(State(state): State<Arc<ServerState>>) -> Response {
    match state.node.stats().await {
        Ok(stats) => Json(ApiResponse {
            success: true,
            data: Some(stats),
            error: None,
        })
        .into_response(),
        Err(e) => {
            tracing::error!("Failed to collect stats: {}", e);
            let resp: ApiResponse<()> = ApiResponse {
                success: false,
                data: None,
                error: Some(e.to_string()),
            };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(resp)).into_response()
        }
    }
}
