use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::Json;
use axum::extract::Request;
use axum::extract::State;
use axum::http::HeaderValue;
use axum::http::StatusCode;
use axum::http::header;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::response::Response;
use futures::FutureExt;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::tasks::panic_message;

#[derive(Clone, Debug)]
struct HttpMetrics {
    requests_received: Counter<u64>,
    responses_sent: Counter<u64>,
    processing_time: Counter<u64>,
}

/// Request and response counters for the whole server.
///
/// Every update is recorded twice: on OpenTelemetry instruments from the
/// global meter, and on in-process totals that [`RequestMetrics::snapshot`]
/// reads back for `/debug/vars`.
#[derive(Debug)]
pub struct RequestMetrics {
    requests_received: AtomicU64,
    responses_sent: AtomicU64,
    processing_time_us: AtomicU64,
    by_status: Mutex<BTreeMap<u16, u64>>,
    instruments: HttpMetrics,
}

/// Point-in-time copy of [`RequestMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests_received: u64,
    pub total_responses_sent: u64,
    #[serde(rename = "total_processing_time_μs")]
    pub total_processing_time_us: u64,
    pub total_responses_sent_by_status: BTreeMap<u16, u64>,
}

impl Default for RequestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestMetrics {
    pub fn new() -> Self {
        let meter = global::meter("admit_server");
        let instruments = HttpMetrics {
            requests_received: meter.u64_counter("http_requests_received").build(),
            responses_sent: meter.u64_counter("http_responses_sent").build(),
            processing_time: meter
                .u64_counter("http_processing_time")
                .with_unit("us")
                .build(),
        };

        Self {
            requests_received: AtomicU64::new(0),
            responses_sent: AtomicU64::new(0),
            processing_time_us: AtomicU64::new(0),
            by_status: Mutex::new(BTreeMap::new()),
            instruments,
        }
    }

    pub fn request_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
        self.instruments.requests_received.add(1, &[]);
    }

    pub fn response_sent(&self, status: StatusCode, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.responses_sent.fetch_add(1, Ordering::Relaxed);
        self.processing_time_us.fetch_add(micros, Ordering::Relaxed);
        *self.by_status.lock().entry(status.as_u16()).or_default() += 1;

        let status = [KeyValue::new("status", i64::from(status.as_u16()))];
        self.instruments.responses_sent.add(1, &status);
        self.instruments.processing_time.add(micros, &status);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests_received: self.requests_received.load(Ordering::Relaxed),
            total_responses_sent: self.responses_sent.load(Ordering::Relaxed),
            total_processing_time_us: self.processing_time_us.load(Ordering::Relaxed),
            total_responses_sent_by_status: self.by_status.lock().clone(),
        }
    }
}

/// Counts the request on the way in and its response on the way out.
pub async fn record_metrics(
    State(metrics): State<Arc<RequestMetrics>>,
    req: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    metrics.request_received();
    let response = next.run(req).await;
    metrics.response_sent(response.status(), start.elapsed());
    response
}

/// Turns a panicking handler into a 500 and closes the connection after it.
pub async fn recover_panic(req: Request, next: Next) -> Response {
    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(panic = %message, "request handler panicked");
            let mut response = server_error_response();
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            response
        }
    }
}

pub(crate) fn server_error_response() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "error": "the server encountered a problem and could not process your request"
        })),
    )
        .into_response()
}
