use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use admit_limit::AdmissionGate;
use pin_project_lite::pin_project;
use tower::BoxError;
use tower::Service;

use crate::error::GateError;
use crate::identity::Identify;

/// Consults an [`AdmissionGate`] before forwarding each request.
///
/// Rejected requests never reach the inner service; their future resolves
/// immediately with a [`GateError`].
#[derive(Debug)]
pub struct AdmissionService<S, I> {
    inner: S,
    gate: Arc<AdmissionGate>,
    identify: I,
}

pin_project! {
    /// Response future of [`AdmissionService`].
    #[project = ResponseFutureProj]
    pub enum ResponseFuture<F> {
        Admitted {
            #[pin]
            inner: F,
        },
        Rejected {
            error: Option<GateError>,
        },
    }
}

impl<F, T> Future for ResponseFuture<F>
where
    F: Future<Output = Result<T, BoxError>>,
{
    type Output = Result<T, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            ResponseFutureProj::Admitted { inner } => inner.poll(cx),
            ResponseFutureProj::Rejected { error } => {
                let error = error
                    .take()
                    .unwrap_or_else(|| GateError::Inner("response polled after completion".into()));
                Poll::Ready(Err(Box::new(error)))
            }
        }
    }
}

impl<S: Clone, I: Clone> Clone for AdmissionService<S, I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            gate: Arc::clone(&self.gate),
            identify: self.identify.clone(),
        }
    }
}

impl<S, I, Req> Service<Req> for AdmissionService<S, I>
where
    S: Service<Req, Error = BoxError>,
    I: Identify<Req>,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Tokens are only spent in call(), once the inner service can take the request
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let client = self.identify.identify(&req);
        match GateError::from_admission(self.gate.admit(&client)) {
            None => ResponseFuture::Admitted {
                inner: self.inner.call(req),
            },
            Some(error) => {
                tracing::debug!(%client, %error, "request rejected");
                ResponseFuture::Rejected { error: Some(error) }
            }
        }
    }
}

impl<S, I> AdmissionService<S, I> {
    pub fn new(inner: S, gate: Arc<AdmissionGate>, identify: I) -> Self {
        Self {
            inner,
            gate,
            identify,
        }
    }

    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }
}
