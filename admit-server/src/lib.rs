//! # Admit Server
//!
//! Serving-side plumbing around an [`admit_limit::AdmissionGate`]: the pieces
//! that let an HTTP service shed load early and exit without dropping work.
//!
//! ## Admission middleware
//! [`AdmissionLayer`] wraps any tower service whose error type is
//! [`tower::BoxError`]. Each request is mapped to a client by an [`Identify`]
//! implementation and checked against the gate before the inner service sees
//! it. Rejections resolve immediately to a [`GateError`].
//!
//! ## Background tasks
//! [`BackgroundTasks`] launches fire-and-forget work, contains panics, and
//! keeps count of what is still running.
//!
//! ## Graceful shutdown
//! [`Shutdown`] serves an [`Endpoint`] until SIGINT/SIGTERM, then drains
//! connections and waits for background tasks, bounded by one deadline.
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`GateError`] (429 with `Retry-After`,
//!   or 500), the [`RealIp`] identifier, [`HttpEndpoint`], the request
//!   [`middleware`] (panic recovery, request metrics) and the [`app`] router.

#[cfg(feature = "axum")]
pub mod app;
pub mod config;
#[cfg(feature = "axum")]
mod endpoint;
mod error;
mod identity;
mod layer;
#[cfg(feature = "axum")]
pub mod middleware;
mod service;
mod shutdown;
mod tasks;

#[cfg(test)]
mod tests;

pub use config::Config;
pub use config::ConfigError;
#[cfg(feature = "axum")]
pub use endpoint::HttpEndpoint;
pub use error::DrainError;
pub use error::GateError;
pub use error::ServeError;
pub use error::ShutdownError;
pub use identity::Identify;
#[cfg(feature = "axum")]
pub use identity::RealIp;
pub use layer::AdmissionLayer;
pub use service::AdmissionService;
pub use service::ResponseFuture;
pub use shutdown::Endpoint;
pub use shutdown::Shutdown;
pub use shutdown::ShutdownState;
pub use shutdown::Signal;
pub use shutdown::TerminationSignals;
pub use tasks::BackgroundTasks;
