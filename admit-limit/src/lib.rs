//! # admit-limit
//!
//! `admit-limit` decides, per inbound request, whether to admit it, reject it
//! because the whole process is overloaded, or reject it because one client
//! is sending too much.
//!
//! ## Key Concepts
//!
//! * **Token Buckets**: Every limiter is a bucket of `capacity` tokens refilled
//!   continuously at a fractional rate. A request needs one whole token.
//! * **Lazy Evaluation**: Tokens are recalculated at the moment of the request,
//!   so buckets need no background timers.
//! * **Global First**: The [`AdmissionGate`] consults a single global bucket
//!   before any per-client state is created or touched.
//! * **Bounded Memory**: Per-client buckets live in a [`ClientRegistry`] that is
//!   swept of idle clients on a fixed interval.
//!
//! ## Example
//!
//! ```rust
//! use admit_limit::Admission;
//! use admit_limit::AdmissionGate;
//! use admit_limit::ClientIdentity;
//! use admit_limit::GateConfig;
//!
//! let gate = AdmissionGate::new(GateConfig::default());
//! let client = ClientIdentity::from("192.0.2.7");
//!
//! if gate.admit(&client) == Admission::Allowed {
//!     // Request allowed
//! }
//! ```

use std::fmt::Debug;
use std::ops::ControlFlow;
use std::time::Duration;

mod gate;
mod registry;
mod token_bucket;

pub use gate::Admission;
pub use gate::AdmissionGate;
pub use gate::GateConfig;
pub use registry::ClientEntry;
pub use registry::ClientIdentity;
pub use registry::ClientRegistry;
pub use token_bucket::BucketConfig;
pub use token_bucket::BucketState;
pub use token_bucket::TokenBucket;

/// Reasons why a request might be rejected by a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Overloaded { retry_after: Duration },
}

/// The core trait for rate-limiting algorithms.
///
/// Strategies are internally synchronised so they can be shared across
/// threads via `Arc` without an external lock.
pub trait Strategy: Debug {
    /// Attempts to process a single request.
    ///
    /// # Errors
    ///
    /// Returns `Reason` if the rate limit has been reached.
    fn process(&self) -> ControlFlow<Reason>;
}
