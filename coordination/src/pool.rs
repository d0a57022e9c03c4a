//! Rate-limited admission pool.
//!
//! A [`RateLimitedPool`] enforces two independent limits from a
//! [`PermitBudget`]: a fixed-window quota (`max_per_window` grants per
//! `window`) and an optional ceiling on simultaneously held permits.
//!
//! ```text
//! acquire()
//!   ├─ join FIFO turnstile (tokio::sync::Mutex, fair)
//!   └─ loop as head of line:
//!        ├─ window exhausted   → sleep until window end, re-check
//!        ├─ concurrency full   → wait for one release signal, re-check
//!        └─ both satisfied     → grant, leave turnstile
//! ```
//!
//! The window resets lazily the first time it is checked after expiry; no
//! timer runs in the background. Releasing a permit frees a concurrency slot
//! and wakes a single waiter, but never gives back window quota.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::{PermitBudget, ProviderQuota};
use crate::errors::{CoordinationError, CoordinationResult};

#[derive(Debug)]
struct PoolState {
    /// Set by the first grant after a reset.
    window_start: Option<Instant>,
    granted_in_window: u32,
    in_flight: u32,
}

enum Admission {
    Granted,
    WaitWindow(Duration),
    WaitRelease,
}

/// Point-in-time view of a pool's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub name: String,
    pub granted_in_window: u32,
    pub in_flight: u32,
    pub waiting: usize,
}

/// Admission-control primitive shared by every caller of one provider.
pub struct RateLimitedPool {
    name: String,
    budget: PermitBudget,
    state: Mutex<PoolState>,
    turnstile: tokio::sync::Mutex<()>,
    released: Notify,
    waiting: AtomicUsize,
}

impl std::fmt::Debug for RateLimitedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedPool")
            .field("name", &self.name)
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

impl RateLimitedPool {
    /// Create a pool; fails if the budget is invalid.
    pub fn new(name: impl Into<String>, budget: PermitBudget) -> CoordinationResult<Self> {
        budget.validate()?;
        Ok(Self {
            name: name.into(),
            budget,
            state: Mutex::new(PoolState {
                window_start: None,
                granted_in_window: 0,
                in_flight: 0,
            }),
            turnstile: tokio::sync::Mutex::new(()),
            released: Notify::new(),
            waiting: AtomicUsize::new(0),
        })
    }

    /// Wrap in an `Arc` for sharing across tasks.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn budget(&self) -> PermitBudget {
        self.budget
    }

    /// Suspend until a permit is granted. Never fails and has no deadline.
    pub async fn acquire(&self) -> PoolPermit<'_> {
        let _waiting = WaitingGuard::enter(&self.waiting);
        let _turn = self.turnstile.lock().await;
        loop {
            match self.try_admit() {
                Admission::Granted => break,
                Admission::WaitWindow(remaining) => {
                    trace!(pool = %self.name, wait_ms = remaining.as_millis() as u64, "window exhausted");
                    tokio::time::sleep(remaining).await;
                }
                Admission::WaitRelease => {
                    trace!(pool = %self.name, "concurrency ceiling reached");
                    self.released.notified().await;
                }
            }
        }
        debug!(pool = %self.name, "permit granted");
        PoolPermit { pool: self }
    }

    /// Like [`acquire`](Self::acquire), but gives up with
    /// [`CoordinationError::Cancelled`] once `cancel` fires. A grant never
    /// leaks: admission and permit construction happen in the same poll.
    pub async fn acquire_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> CoordinationResult<PoolPermit<'_>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CoordinationError::Cancelled(format!(
                "acquire on pool {} cancelled",
                self.name
            ))),
            permit = self.acquire() => Ok(permit),
        }
    }

    /// Grant a permit only if one is available right now and nobody is
    /// queued ahead of the caller.
    pub fn try_acquire(&self) -> Option<PoolPermit<'_>> {
        let _turn = self.turnstile.try_lock().ok()?;
        match self.try_admit() {
            Admission::Granted => Some(PoolPermit { pool: self }),
            Admission::WaitWindow(_) | Admission::WaitRelease => None,
        }
    }

    /// Whether an `acquire` issued now would be granted without suspending.
    pub fn is_available(&self) -> bool {
        if self.waiting.load(Ordering::SeqCst) > 0 {
            return false;
        }
        let mut state = self.lock_state();
        self.reset_if_expired(&mut state, Instant::now());
        state.granted_in_window < self.budget.max_per_window
            && (!self.budget.is_concurrency_bounded()
                || state.in_flight < self.budget.max_concurrent)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let mut state = self.lock_state();
        self.reset_if_expired(&mut state, Instant::now());
        PoolSnapshot {
            name: self.name.clone(),
            granted_in_window: state.granted_in_window,
            in_flight: state.in_flight,
            waiting: self.waiting.load(Ordering::SeqCst),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reset_if_expired(&self, state: &mut PoolState, now: Instant) {
        if let Some(start) = state.window_start {
            if now.duration_since(start) >= self.budget.window {
                state.window_start = None;
                state.granted_in_window = 0;
            }
        }
    }

    fn try_admit(&self) -> Admission {
        let now = Instant::now();
        let mut state = self.lock_state();
        self.reset_if_expired(&mut state, now);

        if state.granted_in_window >= self.budget.max_per_window {
            let start = state.window_start.unwrap_or(now);
            let remaining = self.budget.window.saturating_sub(now.duration_since(start));
            return Admission::WaitWindow(remaining);
        }
        if self.budget.is_concurrency_bounded() && state.in_flight >= self.budget.max_concurrent {
            return Admission::WaitRelease;
        }

        state.granted_in_window += 1;
        state.in_flight += 1;
        state.window_start.get_or_insert(now);
        Admission::Granted
    }

    fn release(&self) {
        {
            let mut state = self.lock_state();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.released.notify_one();
        trace!(pool = %self.name, "permit released");
    }
}

/// A granted permit. Dropping it (or calling [`release`](Self::release))
/// returns the concurrency slot; window quota stays consumed.
#[must_use = "dropping the permit releases it immediately"]
pub struct PoolPermit<'a> {
    pool: &'a RateLimitedPool,
}

impl PoolPermit<'_> {
    pub fn release(self) {
        drop(self);
    }

    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }
}

impl Drop for PoolPermit<'_> {
    fn drop(&mut self) {
        self.pool.release();
    }
}

/// Keeps the waiting counter honest when an `acquire` future is dropped.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Independently configured pools keyed by provider name.
#[derive(Debug, Default, Clone)]
pub struct PoolRegistry {
    pools: HashMap<String, Arc<RateLimitedPool>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one pool per quota entry.
    pub fn from_quotas(quotas: &[ProviderQuota]) -> CoordinationResult<Self> {
        let mut registry = Self::new();
        for quota in quotas {
            let pool = RateLimitedPool::new(quota.name.clone(), quota.budget()?)?;
            registry.insert(pool.shared());
        }
        Ok(registry)
    }

    pub fn insert(&mut self, pool: Arc<RateLimitedPool>) {
        self.pools.insert(pool.name().to_string(), pool);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<RateLimitedPool>> {
        self.pools.get(provider).cloned()
    }

    pub fn snapshots(&self) -> Vec<PoolSnapshot> {
        let mut snaps: Vec<PoolSnapshot> = self.pools.values().map(|p| p.snapshot()).collect();
        snaps.sort_by(|a, b| a.name.cmp(&b.name));
        snaps
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
