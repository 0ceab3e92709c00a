use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use quanta::Clock;
use tokio::task::JoinHandle;

use crate::BucketConfig;
use crate::ClientIdentity;
use crate::ClientRegistry;
use crate::Reason;
use crate::Strategy;
use crate::TokenBucket;

const DEFAULT_GLOBAL_CAPACITY: NonZeroUsize = NonZeroUsize::new(100).unwrap();
const DEFAULT_CLIENT_CAPACITY: NonZeroUsize = NonZeroUsize::new(4).unwrap();

/// Settings for an [`AdmissionGate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateConfig {
    /// When `false` every request is admitted and no state is kept.
    pub enabled: bool,
    pub global: BucketConfig,
    pub client: BucketConfig,
    /// Clients unseen for longer than this are evicted by the sweeper.
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global: BucketConfig::new(DEFAULT_GLOBAL_CAPACITY, 25.0),
            client: BucketConfig::new(DEFAULT_CLIENT_CAPACITY, 2.0),
            idle_timeout: Duration::from_secs(180),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Outcome of [`AdmissionGate::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The process-wide ceiling is exhausted.
    RejectedGlobal { retry_after: Duration },
    /// This client has used up its own allowance.
    RejectedClient { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

#[derive(Clone, Debug)]
struct GateMetrics {
    rejected: Counter<u64>,
}

/// Global ceiling plus per-client limits.
///
/// The global bucket is always consulted first. Under global overload the
/// client registry is left untouched, so a flood of distinct identities
/// cannot grow it.
#[derive(Debug)]
pub struct AdmissionGate {
    config: GateConfig,
    global: TokenBucket,
    clients: Arc<ClientRegistry>,
    instruments: GateMetrics,
}

impl AdmissionGate {
    pub fn new(config: GateConfig) -> Self {
        Self::with_clock(config, Clock::new())
    }

    pub fn with_clock(config: GateConfig, clock: Clock) -> Self {
        let meter = global::meter("admission_gate");
        let instruments = GateMetrics {
            rejected: meter.u64_counter("admission_rejected").build(),
        };

        Self {
            config,
            global: TokenBucket::with_clock(config.global, clock.clone()),
            clients: Arc::new(ClientRegistry::with_clock(config.client, clock)),
            instruments,
        }
    }

    /// Decide whether a request from `client` may proceed.
    pub fn admit(&self, client: &ClientIdentity) -> Admission {
        if !self.config.enabled {
            return Admission::Allowed;
        }

        if let ControlFlow::Break(Reason::Overloaded { retry_after }) = self.global.process() {
            self.record_rejection("global");
            return Admission::RejectedGlobal { retry_after };
        }

        match self.clients.get_or_create(client, |entry| entry.try_consume()) {
            ControlFlow::Continue(()) => Admission::Allowed,
            ControlFlow::Break(Reason::Overloaded { retry_after }) => {
                self.record_rejection("client");
                tracing::trace!(%client, "client rate limit exceeded");
                Admission::RejectedClient { retry_after }
            }
        }
    }

    fn record_rejection(&self, reason: &'static str) {
        self.instruments
            .rejected
            .add(1, &[KeyValue::new("reason", reason)]);
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    /// Starts the idle-client sweeper, if limiting is enabled.
    pub fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        self.config.enabled.then(|| {
            self.clients
                .spawn_sweeper(self.config.sweep_interval, self.config.idle_timeout)
        })
    }
}
