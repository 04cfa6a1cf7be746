//! Bounded pool of reusable sandboxes.
//!
//! Provisioning a sandbox is slow and metered, so sandboxes are kept warm
//! between commands and handed out one caller at a time:
//!
//! ```text
//! Provisioned ──► Leased ⇄ Idle ──► Removed
//! ```
//!
//! The entry table sits behind a single async mutex. `acquire` scans for an
//! idle entry and, when none exists, reserves a capacity slot in the same
//! critical section; provisioning itself runs outside the lock against that
//! reservation. Above capacity an overflow sandbox is provisioned for a
//! single use and never enters the table.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::error::SandboxError;
use super::handle::SandboxHandle;
use super::provider::SandboxProvider;
use super::types::SandboxSpec;

/// Maximum number of pooled sandboxes.
pub const MAX_POOL_SIZE: usize = 5;
/// Idle sandboxes older than this are stopped by the reaper.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// How often the reaper sweeps.
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub capacity: usize,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: MAX_POOL_SIZE,
            idle_timeout: IDLE_TIMEOUT,
            reap_interval: REAP_INTERVAL,
        }
    }
}

struct PooledEntry {
    handle: Arc<dyn SandboxHandle>,
    last_used_at: Instant,
    in_use: bool,
}

#[derive(Default)]
struct PoolState {
    entries: Vec<PooledEntry>,
    /// Slots claimed by acquires that are still provisioning.
    reserved: usize,
    closed: bool,
}

/// A sandbox handed out by [`SandboxPool::acquire`].
pub struct SandboxLease {
    handle: Arc<dyn SandboxHandle>,
    pooled: bool,
}

impl SandboxLease {
    pub fn handle(&self) -> &Arc<dyn SandboxHandle> {
        &self.handle
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    /// False for overflow sandboxes, which the holder must stop after use.
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub in_use: usize,
    pub available: usize,
}

/// One pool member as reported by the pool endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PooledSandbox {
    pub id: String,
    pub runtime: String,
    pub in_use: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct SandboxPool {
    provider: Arc<dyn SandboxProvider>,
    config: PoolConfig,
    state: Arc<Mutex<PoolState>>,
    reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SandboxPool {
    /// Build the pool and start its idle reaper. Must be called inside a
    /// tokio runtime.
    pub fn open(provider: Arc<dyn SandboxProvider>, config: PoolConfig) -> Arc<Self> {
        let state = Arc::new(Mutex::new(PoolState::default()));
        let reaper = tokio::spawn(reap_loop(
            Arc::downgrade(&state),
            config.idle_timeout,
            config.reap_interval,
        ));

        tracing::info!(
            capacity = config.capacity,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "sandbox pool opened"
        );

        Arc::new(Self {
            provider,
            config,
            state,
            reaper: std::sync::Mutex::new(Some(reaper)),
        })
    }

    pub fn provider(&self) -> &Arc<dyn SandboxProvider> {
        &self.provider
    }

    /// Lease a sandbox: an idle pooled one if any, else a newly provisioned
    /// one (pooled while below capacity, overflow otherwise).
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self, runtime: &str, timeout: Duration) -> Result<SandboxLease, SandboxError> {
        let reserved = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(SandboxError::Provision("sandbox pool is shut down".into()));
            }
            if let Some(entry) = state.entries.iter_mut().find(|e| !e.in_use) {
                entry.in_use = true;
                entry.last_used_at = Instant::now();
                tracing::debug!(sandbox_id = %entry.handle.id(), "reusing pooled sandbox");
                return Ok(SandboxLease {
                    handle: entry.handle.clone(),
                    pooled: true,
                });
            }
            if state.entries.len() + state.reserved < self.config.capacity {
                state.reserved += 1;
                true
            } else {
                false
            }
        };

        let provisioned = self.provider.provision(SandboxSpec::new(runtime, timeout)).await;

        if !reserved {
            let handle = provisioned?;
            tracing::warn!(
                sandbox_id = %handle.id(),
                capacity = self.config.capacity,
                "sandbox pool at capacity, using overflow sandbox"
            );
            return Ok(SandboxLease {
                handle,
                pooled: false,
            });
        }

        let mut state = self.state.lock().await;
        state.reserved -= 1;
        let handle = provisioned?;

        if state.closed {
            // Pool was destroyed while we were provisioning; hand the sandbox
            // out for one use instead of resurrecting the table.
            return Ok(SandboxLease {
                handle,
                pooled: false,
            });
        }

        state.entries.push(PooledEntry {
            handle: handle.clone(),
            last_used_at: Instant::now(),
            in_use: true,
        });
        tracing::info!(
            sandbox_id = %handle.id(),
            pool_size = state.entries.len(),
            "provisioned pooled sandbox"
        );
        Ok(SandboxLease {
            handle,
            pooled: true,
        })
    }

    /// Return a leased sandbox to the idle set. Returns false when `id` is
    /// not a pool member.
    pub async fn release(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.entries.iter_mut().find(|e| e.handle.id() == id) {
            Some(entry) => {
                entry.in_use = false;
                entry.last_used_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Drop an entry without stopping its sandbox (used for dead sandboxes).
    pub async fn remove(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        state.entries.retain(|e| e.handle.id() != id);
        let removed = state.entries.len() != before;
        if removed {
            tracing::info!(sandbox_id = %id, "removed sandbox from pool");
        }
        removed
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let in_use = state.entries.iter().filter(|e| e.in_use).count();
        PoolStats {
            total: state.entries.len(),
            in_use,
            available: state.entries.len() - in_use,
        }
    }

    /// Pool members in insertion order. Overflow sandboxes are not listed.
    pub async fn sandboxes(&self) -> Vec<PooledSandbox> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .map(|entry| {
                let metadata = entry.handle.metadata();
                PooledSandbox {
                    id: entry.handle.id().to_string(),
                    runtime: metadata.runtime.clone(),
                    in_use: entry.in_use,
                    created_at: metadata.created_at,
                    expires_at: metadata.expires_at(),
                }
            })
            .collect()
    }

    /// One reaper sweep evaluated at `now`. Returns how many sandboxes were
    /// reclaimed.
    pub async fn reap_expired(&self, now: Instant) -> usize {
        reap(&self.state, self.config.idle_timeout, now).await
    }

    /// Stop every pooled sandbox, clear the table, and cancel the reaper.
    /// Failures are logged, never returned. Safe to call more than once.
    pub async fn destroy(&self) {
        let reaper = self.reaper.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(reaper) = reaper {
            reaper.abort();
        }

        let handles: Vec<Arc<dyn SandboxHandle>> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.entries.drain(..).map(|e| e.handle).collect()
        };
        if handles.is_empty() {
            return;
        }

        let results = join_all(handles.iter().map(|h| h.stop())).await;
        let mut failures = 0usize;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                failures += 1;
                tracing::warn!(sandbox_id = %handle.id(), error = %e, "failed to stop sandbox during shutdown");
            }
        }
        tracing::info!(stopped = handles.len() - failures, failures, "sandbox pool destroyed");
    }
}

async fn reap_loop(state: Weak<Mutex<PoolState>>, idle_timeout: Duration, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(state) = state.upgrade() else {
            break;
        };
        reap(&state, idle_timeout, Instant::now()).await;
    }
}

async fn reap(state: &Mutex<PoolState>, idle_timeout: Duration, now: Instant) -> usize {
    let expired: Vec<Arc<dyn SandboxHandle>> = {
        let mut state = state.lock().await;
        let mut expired = Vec::new();
        state.entries.retain(|entry| {
            let stale = !entry.in_use && now.saturating_duration_since(entry.last_used_at) > idle_timeout;
            if stale {
                expired.push(entry.handle.clone());
            }
            !stale
        });
        expired
    };

    for handle in &expired {
        match handle.stop().await {
            Ok(()) => tracing::info!(sandbox_id = %handle.id(), "reaped idle sandbox"),
            Err(e) => tracing::warn!(sandbox_id = %handle.id(), error = %e, "failed to stop idle sandbox"),
        }
    }
    expired.len()
}
