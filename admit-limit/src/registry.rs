use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use quanta::Clock;
use quanta::Instant;
use tokio::task::JoinHandle;

use crate::BucketConfig;
use crate::BucketState;
use crate::Reason;

/// Opaque caller identity, usually derived from the remote address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientIdentity {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ClientIdentity {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<IpAddr> for ClientIdentity {
    fn from(ip: IpAddr) -> Self {
        Self(ip.to_string())
    }
}

/// Per-client limiter state.
#[derive(Debug)]
pub struct ClientEntry {
    bucket: BucketState,
    last_seen: Instant,
    now: Instant,
}

impl ClientEntry {
    /// Take one token from this client's bucket.
    pub fn try_consume(&mut self) -> ControlFlow<Reason> {
        self.bucket.try_consume(self.now)
    }

    pub fn available(&mut self) -> f64 {
        self.bucket.available(self.now)
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }
}

/// Map of client identity to token bucket, guarded by a single lock.
///
/// Entries are created lazily on first sight and only destroyed by
/// [`ClientRegistry::sweep`]. The map itself is never handed out.
#[derive(Debug)]
pub struct ClientRegistry {
    entries: Mutex<HashMap<ClientIdentity, ClientEntry>>,
    config: BucketConfig,
    clock: Clock,
}

impl ClientRegistry {
    pub fn new(config: BucketConfig) -> Self {
        Self::with_clock(config, Clock::new())
    }

    pub fn with_clock(config: BucketConfig, clock: Clock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
            clock,
        }
    }

    /// Runs `f` against the entry for `id`, creating a full bucket if the
    /// client is new. `last_seen` is refreshed before `f` runs.
    ///
    /// The lock is held for the whole lookup-and-update, so `f` must not
    /// block.
    pub fn get_or_create<R>(
        &self,
        id: &ClientIdentity,
        f: impl FnOnce(&mut ClientEntry) -> R,
    ) -> R {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(id.clone()).or_insert_with(|| ClientEntry {
            bucket: BucketState::new(self.config, now),
            last_seen: now,
            now,
        });
        entry.last_seen = now;
        entry.now = now;
        f(entry)
    }

    /// Removes every entry idle for longer than `idle`. Returns how many
    /// were evicted.
    pub fn sweep(&self, idle: Duration) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.last_seen) <= idle);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, id: &ClientIdentity) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Sweeps every `interval` until the registry is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, idle: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    tracing::debug!("client registry dropped, sweeper exiting");
                    return;
                };
                let evicted = registry.sweep(idle);
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = registry.len(), "swept idle clients");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;

    fn registry() -> (Arc<ClientRegistry>, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        let config = BucketConfig::new(NonZeroUsize::new(2).unwrap(), 1.0);
        (Arc::new(ClientRegistry::with_clock(config, clock)), mock)
    }

    #[test]
    fn it_creates_entries_lazily_and_reuses_them() {
        let (reg, _mock) = registry();
        let alice = ClientIdentity::from("10.0.0.1");
        assert!(reg.is_empty());

        assert!(reg.get_or_create(&alice, |e| e.try_consume()).is_continue());
        assert!(reg.get_or_create(&alice, |e| e.try_consume()).is_continue());
        // Same bucket, so the third request is refused
        assert!(reg.get_or_create(&alice, |e| e.try_consume()).is_break());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_last_seen_is_refreshed() {
        let (reg, mock) = registry();
        let id = ClientIdentity::from("a");
        let first = reg.get_or_create(&id, |e| e.last_seen());
        mock.increment(Duration::from_secs(5));
        let second = reg.get_or_create(&id, |e| e.last_seen());
        assert_eq!(second.duration_since(first), Duration::from_secs(5));
    }

    #[test]
    fn test_sweep_evicts_only_idle_entries() {
        let (reg, mock) = registry();
        let idle = ClientIdentity::from("idle");
        let busy = ClientIdentity::from("busy");
        reg.get_or_create(&idle, |_| ());
        reg.get_or_create(&busy, |_| ());

        mock.increment(Duration::from_secs(120));
        reg.get_or_create(&busy, |_| ());
        mock.increment(Duration::from_secs(61));

        assert_eq!(reg.sweep(Duration::from_secs(180)), 1);
        assert!(!reg.contains(&idle));
        assert!(reg.contains(&busy));
    }

    #[test]
    fn test_eviction_resets_bucket() {
        let (reg, mock) = registry();
        let id = ClientIdentity::from("returning");
        for _ in 0..2 {
            let _ = reg.get_or_create(&id, |e| e.try_consume());
        }
        mock.increment(Duration::from_secs(10));
        assert_eq!(reg.sweep(Duration::from_secs(5)), 1);
        assert!(!reg.contains(&id));

        // A fresh entry starts full again
        let available = reg.get_or_create(&id, |e| e.available());
        assert_eq!(available, 2.0);
    }

    #[test]
    fn test_concurrent_distinct_identities() {
        let (reg, _mock) = registry();
        let workers = 64;

        let barrier = Arc::new(std::sync::Barrier::new(workers));
        let handles: Vec<_> = (0..workers)
            .map(|i| {
                let reg = Arc::clone(&reg);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let id = ClientIdentity::new(format!("client-{i}"));
                    for _ in 0..10 {
                        let _ = reg.get_or_create(&id, |e| e.try_consume());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(reg.len(), workers);
        for i in 0..workers {
            let id = ClientIdentity::new(format!("client-{i}"));
            // Exactly one bucket per client: two tokens spent, no refill
            assert_eq!(reg.get_or_create(&id, |e| e.available()), 0.0);
        }
    }

    #[tokio::test]
    async fn test_sweeper_runs_on_interval() {
        tokio::time::pause();
        let (reg, mock) = registry();
        reg.get_or_create(&ClientIdentity::from("stale"), |_| ());
        mock.increment(Duration::from_secs(600));

        let handle = reg.spawn_sweeper(Duration::from_secs(60), Duration::from_secs(180));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(reg.is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn test_sweeper_exits_when_registry_dropped() {
        tokio::time::pause();
        let (reg, _mock) = registry();
        let handle = reg.spawn_sweeper(Duration::from_secs(1), Duration::from_secs(1));
        drop(reg);
        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.await.unwrap();
    }
}
