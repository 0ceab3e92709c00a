use std::sync::Arc;

use admit_limit::AdmissionGate;
use tower::Layer;

use crate::service::AdmissionService;

/// Applies admission control to requests.
///
/// Clones share one [`AdmissionGate`], so every service produced by the same
/// layer draws from the same global and per-client buckets.
#[derive(Debug)]
pub struct AdmissionLayer<I> {
    gate: Arc<AdmissionGate>,
    identify: I,
}

impl<I: Clone> Clone for AdmissionLayer<I> {
    fn clone(&self) -> Self {
        Self {
            gate: Arc::clone(&self.gate),
            identify: self.identify.clone(),
        }
    }
}

impl<I> AdmissionLayer<I> {
    /// Create an AdmissionLayer that identifies callers with `identify`.
    pub fn new(gate: Arc<AdmissionGate>, identify: I) -> Self {
        AdmissionLayer { gate, identify }
    }
}

impl<I, S> Layer<S> for AdmissionLayer<I>
where
    I: Clone,
{
    type Service = AdmissionService<S, I>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService::new(service, Arc::clone(&self.gate), self.identify.clone())
    }
}
