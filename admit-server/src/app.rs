use std::sync::Arc;

use admit_limit::AdmissionGate;
use axum::Json;
use axum::Router;
use axum::error_handling::HandleErrorLayer;
use axum::extract::State;
use axum::middleware;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use serde_json::json;
use tower::BoxError;
use tower::ServiceBuilder;

use crate::AdmissionLayer;
use crate::BackgroundTasks;
use crate::GateError;
use crate::RealIp;
use crate::middleware::MetricsSnapshot;
use crate::middleware::RequestMetrics;
use crate::middleware::record_metrics;
use crate::middleware::recover_panic;
use crate::middleware::server_error_response;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Facts about the running process reported by the healthcheck.
#[derive(Debug, Clone)]
pub struct AppInfo {
    pub env: String,
}

/// Shared with every handler.
///
/// Deferred work goes through `tasks`, so graceful shutdown waits for it.
#[derive(Debug, Clone)]
pub struct AppState {
    pub info: Arc<AppInfo>,
    pub tasks: BackgroundTasks,
    pub metrics: Arc<RequestMetrics>,
}

impl AppState {
    pub fn new(info: AppInfo, tasks: BackgroundTasks) -> Self {
        Self {
            info: Arc::new(info),
            tasks,
            metrics: Arc::new(RequestMetrics::new()),
        }
    }
}

/// The server's routes behind the full middleware stack.
pub fn router(gate: Arc<AdmissionGate>, state: AppState) -> Router {
    let routes = Router::new()
        .route("/v1/healthcheck", get(healthcheck))
        .route("/debug/vars", get(debug_vars));
    with_middleware(routes, gate, state)
}

/// Binds `routes` to `state` and wraps them, outermost first, in request
/// metrics, panic recovery and admission control keyed by the caller's real IP.
pub fn with_middleware(
    routes: Router<AppState>,
    gate: Arc<AdmissionGate>,
    state: AppState,
) -> Router {
    let metrics = Arc::clone(&state.metrics);
    routes.with_state(state).layer(
        ServiceBuilder::new()
            .layer(middleware::from_fn_with_state(metrics, record_metrics))
            .layer(middleware::from_fn(recover_panic))
            // Turns rejections back into responses
            .layer(HandleErrorLayer::new(handle_gate_error))
            .layer(AdmissionLayer::new(gate, RealIp))
            // Route is Infallible; the admission layer speaks BoxError
            .map_err(BoxError::from),
    )
}

async fn healthcheck(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "available",
        "system_info": {
            "environment": state.info.env,
            "version": VERSION,
        }
    }))
}

async fn debug_vars(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

async fn handle_gate_error(err: BoxError) -> Response {
    match err.downcast::<GateError>() {
        Ok(gate_err) => (*gate_err).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "unhandled service error");
            server_error_response()
        }
    }
}
