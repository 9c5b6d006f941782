//! metal-agent - bare-metal compute agent
//!
//! Runs the driver for one agent host: builds the hash ring and node cache,
//! keeps them fresh in the background and exposes health endpoints.
//!
//! # HTTP Endpoints
//!
//! ## Health & Readiness
//! - `GET /health` - Health check
//! - `GET /ready` - Ready once the first cache refresh has been published
//!
//! ## Nodes
//! - `GET /v1/nodes` - Nodes this host manages
//! - `GET /v1/nodes/:node_id` - Resources of one node
//! - `GET /v1/nodes/:node_id/inventory` - Schedulable inventory of one node

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metal_agent_client::HttpControlClient;
use metal_agent_core::NodeId;
use metal_agent_driver::{
    AgentConfig, BareMetalDriver, ComputeDriver, DriverError, InMemoryServiceRegistry,
    InMemoryWorkloadRegistry, InventoryMapper, RefreshTask,
};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    driver: Arc<BareMetalDriver>,
}

// ============================================================================
// Health Endpoints
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "metal-agent",
    })
}

async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.driver.cache().is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "node cache not yet populated")
    }
}

// ============================================================================
// Node Endpoints
// ============================================================================

/// Error response format.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

impl ErrorResponse {
    fn new(error: impl Into<String>, code: u16) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }
}

fn error_response(e: &DriverError) -> axum::response::Response {
    let code = e.http_status_code();
    (
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(ErrorResponse::new(e.to_string(), code)),
    )
        .into_response()
}

fn parse_node_id(raw: &str) -> Result<NodeId, axum::response::Response> {
    NodeId::new(raw).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(format!("Invalid node ID: {e}"), 400)),
        )
            .into_response()
    })
}

/// Response for the managed node list.
#[derive(Debug, Serialize)]
struct NodeListResponse {
    generation: u64,
    nodes: Vec<NodeId>,
}

/// List managed nodes.
///
/// GET /v1/nodes
async fn list_nodes_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.driver.cache().snapshot();
    Json(NodeListResponse {
        generation: snapshot.generation(),
        nodes: snapshot.node_ids(),
    })
}

/// Describe one node's resources.
///
/// GET /v1/nodes/:node_id
async fn node_handler(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    let node_id = match parse_node_id(&node_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.driver.get_available_resource(&node_id).await {
        Ok(resource) => Json(resource).into_response(),
        Err(e) => {
            tracing::warn!(node_id = %node_id, error = %e, "Failed to describe node");
            error_response(&e)
        }
    }
}

/// Show one node's schedulable inventory.
///
/// GET /v1/nodes/:node_id/inventory
async fn inventory_handler(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    let node_id = match parse_node_id(&node_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.driver.cache().get_or_fetch(&node_id).await {
        Ok(node) => {
            let mapper = InventoryMapper::new(state.driver.config().skip_reserve_in_use_nodes);
            Json(mapper.map(&node)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

// ============================================================================
// Router
// ============================================================================

fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & readiness
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        // Nodes
        .route("/v1/nodes", get(list_nodes_handler))
        .route("/v1/nodes/:node_id", get(node_handler))
        .route("/v1/nodes/:node_id/inventory", get(inventory_handler))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,metal_agent=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting metal-agent");

    let config = AgentConfig::from_env();
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }

    tracing::info!(
        host = %config.host,
        hypervisor_type = %config.hypervisor_type,
        shard = ?config.shard,
        conductor_group = ?config.conductor_group,
        control_plane_url = %config.control_plane_url,
        "Loaded agent configuration"
    );

    let config = Arc::new(config);
    let client = Arc::new(HttpControlClient::new(config.client_config())?);

    // Every host in SERVICE_HOSTS is registered alive; this host always is.
    let services = Arc::new(InMemoryServiceRegistry::with_hosts(
        &config.hypervisor_type,
        config.service_hosts.iter().chain([&config.host]),
    ));
    let workloads = Arc::new(InMemoryWorkloadRegistry::new());

    let driver = Arc::new(BareMetalDriver::new(
        Arc::clone(&config),
        client,
        services,
        workloads,
    ));

    if let Err(e) = driver.init_host().await {
        // Not fatal: the refresh loop retries and /ready reports it.
        tracing::error!(error = %e, "Initial node cache refresh failed");
        if matches!(e, DriverError::InvalidPeerList(_)) {
            return Err(e.into());
        }
    }

    let refresher = RefreshTask::spawn(Arc::clone(driver.cache()), config.refresh_interval);

    let app = create_router(AppState { driver });

    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    refresher.shutdown().await;
    Ok(())
}
