use std::time::Duration;

use admit_limit::Admission;

/// Errors produced by the admission middleware.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GateError {
    /// The process-wide limit is exhausted.
    ///
    /// When the `axum` feature is enabled, this converts to `429 Too Many Requests`
    /// with a `Retry-After` header.
    #[error("our servers are currently handling a lot of requests - try again shortly")]
    GlobalOverload {
        /// The duration to wait before retrying.
        retry_after: Duration,
    },

    /// This client has exceeded its own limit.
    ///
    /// When the `axum` feature is enabled, this converts to `429 Too Many Requests`
    /// with a `Retry-After` header.
    #[error("too many requests - try again later")]
    ClientOverload {
        /// The duration to wait before retrying.
        retry_after: Duration,
    },

    /// An unexpected error occurred in the inner service.
    ///
    /// The string contains the `Display` representation of the inner error.
    /// When the `axum` feature is enabled, this converts to `500 Internal Server Error`.
    #[error("the server encountered a problem and could not process your request: {0}")]
    Inner(String),
}

impl GateError {
    /// Maps a rejected admission to an error. `Allowed` has no error.
    pub fn from_admission(admission: Admission) -> Option<Self> {
        match admission {
            Admission::Allowed => None,
            Admission::RejectedGlobal { retry_after } => Some(Self::GlobalOverload { retry_after }),
            Admission::RejectedClient { retry_after } => Some(Self::ClientOverload { retry_after }),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::GlobalOverload { retry_after } | Self::ClientOverload { retry_after } => {
                Some(*retry_after)
            }
            Self::Inner(_) => None,
        }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for GateError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match self {
            Self::GlobalOverload { .. } | Self::ClientOverload { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::Inner(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let headers = self.retry_after().map(|retry_after| {
            // Round up so a client that waits this long finds a token; cap at a day
            let secs = retry_after.as_secs_f64().ceil().clamp(1.0, 86_400.0) as u64;
            (
                axum::http::header::RETRY_AFTER,
                axum::http::HeaderValue::from(secs),
            )
        });

        let body = axum::Json(serde_json::json!({ "error": self.to_string() }));
        let mut response = (status, body).into_response();
        if let Some((name, value)) = headers {
            response.headers_mut().insert(name, value);
        }
        response
    }
}

/// Why an [`Endpoint`](crate::Endpoint) stopped serving.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// Serving stopped because a drain was requested. This is the expected
    /// outcome of a graceful shutdown.
    #[error("server closed")]
    Closed,

    /// The accept loop returned without a drain having been requested.
    #[error("server stopped unexpectedly")]
    Stopped,

    /// `serve` was called more than once.
    #[error("server already started")]
    AlreadyStarted,

    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the drain sequence.
#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    /// Active connections did not finish before the deadline.
    #[error("drain deadline exceeded with connections still active")]
    DeadlineExceeded,

    /// Background tasks were still running when the deadline passed.
    #[error("drain deadline exceeded with {remaining} background task(s) outstanding")]
    TasksOutstanding { remaining: usize },

    #[error("error closing listener: {0}")]
    Io(#[from] std::io::Error),
}

/// The single outcome of a [`Shutdown::run`](crate::Shutdown::run).
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error(transparent)]
    Serve(#[from] ServeError),

    #[error(transparent)]
    Drain(#[from] DrainError),

    /// The supervising task went away without reporting a drain outcome.
    #[error("shutdown supervisor exited without reporting")]
    SupervisorLost,
}
