use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;

use admit_limit::AdmissionGate;
use admit_limit::BucketConfig;
use admit_limit::ClientIdentity;
use admit_limit::GateConfig;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;

use super::*;

use futures::future::Ready;
use futures::future::ready;

#[derive(Debug, Clone, Copy)]
struct Call {
    client: &'static str,
}

fn by_client(req: &Call) -> ClientIdentity {
    ClientIdentity::from(req.client)
}

#[derive(Clone)]
struct MockService {
    pub count: Arc<AtomicUsize>,
    pub ready: Arc<AtomicBool>,
}

impl MockService {
    fn new() -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
            ready: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl Service<Call> for MockService {
    type Response = &'static str;
    type Error = BoxError;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.ready.load(Ordering::SeqCst) {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }

    fn call(&mut self, req: Call) -> Self::Future {
        self.count.fetch_add(1, Ordering::SeqCst);
        ready(Ok(req.client))
    }
}

fn gate(global: usize, client: usize) -> Arc<AdmissionGate> {
    Arc::new(AdmissionGate::new(GateConfig {
        global: BucketConfig::new(NonZeroUsize::new(global).unwrap(), 0.0),
        client: BucketConfig::new(NonZeroUsize::new(client).unwrap(), 0.0),
        ..GateConfig::default()
    }))
}

fn gate_error(err: BoxError) -> GateError {
    *err.downcast::<GateError>().expect("expected a GateError")
}

#[tokio::test]
async fn test_layer_integration() {
    let mock = MockService::new();
    let mut service = ServiceBuilder::new()
        .layer(AdmissionLayer::new(gate(10, 10), by_client))
        .service(mock.clone());

    let res = service
        .ready()
        .await
        .unwrap()
        .call(Call { client: "alice" })
        .await
        .unwrap();
    assert_eq!(res, "alice");
    assert_eq!(mock.count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejected_requests_skip_inner_service() {
    let mock = MockService::new();
    let mut service = AdmissionService::new(mock.clone(), gate(10, 2), by_client);

    for _ in 0..2 {
        service
            .ready()
            .await
            .unwrap()
            .call(Call { client: "alice" })
            .await
            .unwrap();
    }

    let err = service
        .ready()
        .await
        .unwrap()
        .call(Call { client: "alice" })
        .await
        .unwrap_err();
    let err = gate_error(err);
    assert!(matches!(err, GateError::ClientOverload { .. }));
    assert!(err.retry_after().is_some());
    assert_eq!(mock.count.load(Ordering::SeqCst), 2);

    // Bob has his own bucket
    service
        .ready()
        .await
        .unwrap()
        .call(Call { client: "bob" })
        .await
        .unwrap();
    assert_eq!(mock.count.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_global_rejection() {
    let mock = MockService::new();
    let gate = gate(3, 10);
    let mut service = AdmissionService::new(mock.clone(), Arc::clone(&gate), by_client);

    for client in ["a", "b", "c"] {
        service.ready().await.unwrap().call(Call { client }).await.unwrap();
    }

    let err = service
        .ready()
        .await
        .unwrap()
        .call(Call { client: "d" })
        .await
        .unwrap_err();
    assert!(matches!(gate_error(err), GateError::GlobalOverload { .. }));
    assert!(!gate.clients().contains(&ClientIdentity::from("d")));
    assert_eq!(mock.count.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_shared_state_across_clones() {
    let layer = AdmissionLayer::new(gate(10, 1), by_client);

    let mut svc1 = layer.layer(MockService::new());
    let mut svc2 = layer.layer(MockService::new());

    svc1.ready()
        .await
        .unwrap()
        .call(Call { client: "alice" })
        .await
        .unwrap();

    // svc2 sees the token alice spent through svc1
    let err = svc2
        .ready()
        .await
        .unwrap()
        .call(Call { client: "alice" })
        .await
        .unwrap_err();
    assert!(matches!(gate_error(err), GateError::ClientOverload { .. }));
}

#[tokio::test]
async fn test_disabled_gate_admits_everything() {
    let mock = MockService::new();
    let gate = Arc::new(AdmissionGate::new(GateConfig {
        enabled: false,
        global: BucketConfig::new(NonZeroUsize::new(1).unwrap(), 0.0),
        client: BucketConfig::new(NonZeroUsize::new(1).unwrap(), 0.0),
        ..GateConfig::default()
    }));
    let mut service = AdmissionService::new(mock.clone(), Arc::clone(&gate), by_client);

    for _ in 0..50 {
        service
            .ready()
            .await
            .unwrap()
            .call(Call { client: "alice" })
            .await
            .unwrap();
    }
    assert_eq!(mock.count.load(Ordering::SeqCst), 50);
    assert!(gate.clients().is_empty());
}

#[tokio::test]
async fn test_poll_ready_spends_no_tokens() {
    let mock = MockService::new();
    mock.ready.store(false, Ordering::SeqCst);
    let gate = gate(1, 1);
    let mut service = AdmissionService::new(mock.clone(), Arc::clone(&gate), by_client);

    assert!(futures::poll!(service.ready()).is_pending());
    assert!(gate.clients().is_empty());

    mock.ready.store(true, Ordering::SeqCst);
    service
        .ready()
        .await
        .unwrap()
        .call(Call { client: "alice" })
        .await
        .unwrap();
    assert_eq!(mock.count.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_hammer() {
    let capacity = 50;
    const CLIENTS: [&str; 4] = ["a", "b", "c", "d"];

    let mock = MockService::new();
    let service = AdmissionService::new(mock.clone(), gate(capacity, 1_000), by_client);

    let mut handles = vec![];
    for i in 0..200 {
        let mut svc = service.clone();
        handles.push(tokio::spawn(async move {
            let client = CLIENTS[i % CLIENTS.len()];
            svc.ready().await?.call(Call { client }).await
        }));
    }

    let mut admitted = 0;
    let mut rejected = 0;
    for h in handles {
        match h.await.expect("Task panicked") {
            Ok(_) => admitted += 1,
            Err(err) => {
                assert!(matches!(gate_error(err), GateError::GlobalOverload { .. }));
                rejected += 1;
            }
        }
    }

    assert_eq!(admitted, capacity);
    assert_eq!(rejected, 200 - capacity);
    assert_eq!(mock.count.load(Ordering::SeqCst), capacity);
}
