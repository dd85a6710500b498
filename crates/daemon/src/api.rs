//! HTTP transport for the lease engine.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use portlease_common::{
    primary_port, AllocateRequest, AllocateResponse, HeartbeatRequest, PortsResponse,
    ReleaseRequest, ReservationEntry, RECORD_VERSION,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::engine::{Allocation, LeaseEngine, PortRequest, ReservationInfo};
use crate::error::{ApiError, ApiResult, EngineError};

#[derive(Clone)]
pub struct AppState {
    engine: Arc<LeaseEngine>,
}

pub fn router(engine: Arc<LeaseEngine>) -> Router {
    Router::new()
        .route("/reserve", post(reserve))
        .route("/release", post(release))
        .route("/heartbeat", post(heartbeat))
        .route("/list", get(list))
        .route("/ports/{name}", get(ports))
        .layer(CorsLayer::permissive())
        .with_state(AppState { engine })
}

fn require_name(name: Option<String>) -> Result<String, ApiError> {
    match name {
        Some(name) if !name.trim().is_empty() => Ok(name),
        _ => Err(EngineError::InvalidRequest("name is required".to_string()).into()),
    }
}

/// `ports` wins over `count`, which wins over the single-port form.
fn port_request(payload: &AllocateRequest) -> PortRequest {
    if let Some(ports) = &payload.ports {
        PortRequest::Named(
            ports
                .iter()
                .map(|(label, hint)| (label.clone(), hint.port()))
                .collect(),
        )
    } else if let Some(count) = payload.count {
        PortRequest::Count(count)
    } else {
        PortRequest::Single {
            hint: payload.hint.filter(|port| *port != 0),
        }
    }
}

async fn reserve(
    State(state): State<AppState>,
    Json(payload): Json<AllocateRequest>,
) -> ApiResult<Json<AllocateResponse>> {
    let request = port_request(&payload);
    let name = require_name(payload.name)?;
    let pid = payload.pid.filter(|pid| *pid != 0);
    let lease = payload
        .lease
        .unwrap_or(state.engine.settings().default_lease_secs);

    // Probing binds sockets, keep it off the async workers.
    let engine = state.engine.clone();
    let allocation =
        tokio::task::spawn_blocking(move || engine.allocate(&name, &request, pid, Some(lease)))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))??;

    let port = allocation.primary_port().unwrap_or_default();
    let ports = match allocation {
        Allocation::SinglePort(_) => None,
        Allocation::NamedPorts(ports) => Some(ports),
    };
    Ok(Json(AllocateResponse { port, ports, lease }))
}

async fn release(
    State(state): State<AppState>,
    Json(payload): Json<ReleaseRequest>,
) -> ApiResult<StatusCode> {
    let name = require_name(payload.name)?;
    state.engine.release(&name, payload.label.as_deref());
    Ok(StatusCode::NO_CONTENT)
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(payload): Json<HeartbeatRequest>,
) -> ApiResult<StatusCode> {
    let name = require_name(payload.name)?;
    state.engine.renew(&name);
    Ok(StatusCode::NO_CONTENT)
}

async fn list(State(state): State<AppState>) -> Json<Vec<ReservationEntry>> {
    Json(state.engine.list_all().into_iter().map(entry).collect())
}

async fn ports(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<PortsResponse>> {
    let info = state
        .engine
        .query(&name)
        .ok_or_else(|| ApiError::NotFound(format!("service '{}'", name)))?;
    Ok(Json(PortsResponse {
        name: info.name,
        ports: info.ports,
        expires_at: info.expires_at,
        alive: info.alive,
    }))
}

fn entry(info: ReservationInfo) -> ReservationEntry {
    ReservationEntry {
        port: primary_port(&info.ports).unwrap_or_default(),
        name: info.name,
        ports: info.ports,
        expires_at: info.expires_at,
        pid: info.owner_pid,
        alive: info.alive,
        version: RECORD_VERSION.to_string(),
    }
}
