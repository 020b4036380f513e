//! Concurrency guard: at most one in-flight execution per logical key.
//!
//! A caller that finds its key already in flight does not start a second
//! call. It waits (up to a bound) for the in-flight call to finish and then
//! receives the operation's neutral value (`T::default()`).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// Operation domain plus normalized argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GuardKey {
    domain: String,
    argument: String,
}

impl GuardKey {
    pub fn new(domain: impl Into<String>, argument: impl AsRef<str>) -> Self {
        Self {
            domain: domain.into(),
            argument: Self::normalize(argument.as_ref()),
        }
    }

    /// Trims, lowercases and collapses inner whitespace.
    pub fn normalize(argument: &str) -> String {
        argument
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn argument(&self) -> &str {
        &self.argument
    }
}

impl fmt::Display for GuardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.domain, self.argument)
    }
}

/// Outcome of a guarded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guarded<T> {
    /// This caller ran the operation.
    Executed(T),
    /// Another caller held the key; this is the neutral value.
    Deduplicated(T),
}

impl<T> Guarded<T> {
    pub fn into_inner(self) -> T {
        match self {
            Guarded::Executed(v) | Guarded::Deduplicated(v) => v,
        }
    }

    pub fn is_deduplicated(&self) -> bool {
        matches!(self, Guarded::Deduplicated(_))
    }
}

type InFlight = Arc<Mutex<HashMap<GuardKey, watch::Receiver<()>>>>;

/// Held by the caller executing a key. Dropping it frees the key and wakes
/// every waiter, whichever way the operation ended.
struct Permit {
    key: GuardKey,
    in_flight: InFlight,
    _done: watch::Sender<()>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

enum Acquired {
    Leader(Permit),
    Follower(watch::Receiver<()>),
}

pub struct ConcurrencyGuard {
    in_flight: InFlight,
    wait_bound_ms: AtomicU64,
    deduplicated: AtomicU64,
}

impl ConcurrencyGuard {
    /// `wait_bound` caps how long a duplicate caller waits for the in-flight
    /// call before taking the neutral value. Zero returns at once.
    pub fn new(wait_bound: Duration) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            wait_bound_ms: AtomicU64::new(duration_ms(wait_bound)),
            deduplicated: AtomicU64::new(0),
        }
    }

    pub fn wait_bound(&self) -> Duration {
        Duration::from_millis(self.wait_bound_ms.load(Ordering::Relaxed))
    }

    /// Applies to callers arriving after the change.
    pub fn set_wait_bound(&self, wait_bound: Duration) {
        self.wait_bound_ms.store(duration_ms(wait_bound), Ordering::Relaxed);
    }

    fn acquire(&self, key: &GuardKey) -> Acquired {
        let mut map = self.in_flight.lock();
        if let Some(rx) = map.get(key) {
            return Acquired::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(());
        map.insert(key.clone(), rx);
        Acquired::Leader(Permit {
            key: key.clone(),
            in_flight: Arc::clone(&self.in_flight),
            _done: tx,
        })
    }

    /// Runs `operation` unless `key` is already in flight.
    pub async fn execute_guarded<T, E, F, Fut>(
        &self,
        key: GuardKey,
        operation: F,
    ) -> Result<Guarded<T>, E>
    where
        T: Default,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.acquire(&key) {
            Acquired::Leader(permit) => {
                let result = operation().await;
                drop(permit);
                result.map(Guarded::Executed)
            }
            Acquired::Follower(mut done) => {
                self.deduplicated.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("outreach.guard.deduplicated", "domain" => key.domain().to_string())
                    .increment(1);
                debug!(key = %key, "Guarded call already in flight, returning neutral result");
                let wait_bound = self.wait_bound();
                if !wait_bound.is_zero() {
                    // The sender never sends; `changed` resolves with an
                    // error once the permit is dropped.
                    let _ = tokio::time::timeout(wait_bound, async {
                        while done.changed().await.is_ok() {}
                    })
                    .await;
                }
                Ok(Guarded::Deduplicated(T::default()))
            }
        }
    }

    pub fn is_active(&self, key: &GuardKey) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    pub fn active_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.in_flight.lock().keys().map(|k| k.to_string()).collect();
        keys.sort();
        keys
    }

    /// Total duplicate calls answered with the neutral value.
    pub fn deduplicated_total(&self) -> u64 {
        self.deduplicated.load(Ordering::Relaxed)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Default for ConcurrencyGuard {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl fmt::Debug for ConcurrencyGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyGuard")
            .field("active", &self.active_count())
            .field("wait_bound", &self.wait_bound())
            .finish()
    }
}
