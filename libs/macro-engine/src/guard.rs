//! Execution guard
//!
//! Pre-execution admission: permission resolution for user-originated
//! events, token-bucket rate limiting keyed by (macro, origin), and a
//! per-macro concurrency gate. A denial becomes a CANCELLED execution
//! record with a reason; it is never a silent drop.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::effects::PermissionSource;
use crate::error::Result;
use crate::types::{CancelReason, EventEnvelope, EventOrigin, MacroDefinition, OverflowPolicy, RateLimit};

/// Outcome of the admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Allow,
    Deny(CancelReason),
}

/// Token bucket state for one (macro, origin) pair
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter. Buckets start full; one token per
/// instantiated execution.
pub struct RateLimiter {
    buckets: DashMap<(Uuid, String), Bucket>,
    default_limit: RateLimit,
}

impl RateLimiter {
    pub fn new(default_limit: RateLimit) -> Self {
        Self { buckets: DashMap::new(), default_limit }
    }

    /// Take one token, refilling by elapsed time first. False means the
    /// bucket is empty and the execution must be cancelled.
    pub fn try_acquire(&self, macro_id: Uuid, origin_key: &str, limit: Option<RateLimit>) -> bool {
        self.try_acquire_at(macro_id, origin_key, limit, Instant::now())
    }

    fn try_acquire_at(
        &self,
        macro_id: Uuid,
        origin_key: &str,
        limit: Option<RateLimit>,
        now: Instant,
    ) -> bool {
        let limit = limit.unwrap_or(self.default_limit);
        let capacity = f64::from(limit.capacity);
        let mut bucket = self
            .buckets
            .entry((macro_id, origin_key.to_string()))
            .or_insert_with(|| Bucket { tokens: capacity, last_refill: now });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * limit.refill_per_sec).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-macro concurrency gate backed by semaphores
#[derive(Default)]
pub struct ConcurrencyGuard {
    semaphores: DashMap<Uuid, (u32, Arc<Semaphore>)>,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a run slot. Queue policy waits for a slot; Reject returns
    /// None immediately when the macro is at its limit.
    pub async fn acquire(
        &self,
        macro_id: Uuid,
        limit: u32,
        policy: OverflowPolicy,
    ) -> Option<OwnedSemaphorePermit> {
        let semaphore = {
            let mut entry = self
                .semaphores
                .entry(macro_id)
                .or_insert_with(|| (limit, Arc::new(Semaphore::new(limit as usize))));
            // An edited limit replaces the gate. Outstanding permits keep
            // the old semaphore alive until they drop.
            if entry.0 != limit {
                *entry = (limit, Arc::new(Semaphore::new(limit as usize)));
            }
            entry.1.clone()
        };

        match policy {
            OverflowPolicy::Queue => semaphore.acquire_owned().await.ok(),
            OverflowPolicy::Reject => semaphore.try_acquire_owned().ok(),
        }
    }
}

/// Admission facade combining permissions and rate limiting.
/// Concurrency is gated separately because its permit must be held for
/// the execution's whole lifetime.
pub struct ExecutionGuard {
    permissions: Arc<dyn PermissionSource>,
    rate_limiter: RateLimiter,
    concurrency: ConcurrencyGuard,
}

impl ExecutionGuard {
    pub fn new(permissions: Arc<dyn PermissionSource>, default_limit: RateLimit) -> Self {
        Self {
            permissions,
            rate_limiter: RateLimiter::new(default_limit),
            concurrency: ConcurrencyGuard::new(),
        }
    }

    /// Permission + rate-limit check for one matched (macro, event) pair
    pub async fn admit(
        &self,
        def: &MacroDefinition,
        event: &EventEnvelope,
    ) -> Result<GuardDecision> {
        // Scheduler and internal system events act with the macro owner's
        // authority; only user-originated events are permission checked.
        if let EventOrigin::User { name } = &event.origin {
            let perms = self.permissions.resolve(name, def.id).await?;
            if !perms.allows_execute() {
                tracing::warn!(macro_id = %def.id, user = %name, "execution denied by permissions");
                return Ok(GuardDecision::Deny(CancelReason::PermissionDenied));
            }
        }

        if !self
            .rate_limiter
            .try_acquire(def.id, &event.origin.key(), def.rate_limit)
        {
            tracing::warn!(macro_id = %def.id, origin = %event.origin.key(), "execution rate limited");
            return Ok(GuardDecision::Deny(CancelReason::RateLimited));
        }

        Ok(GuardDecision::Allow)
    }

    pub fn concurrency(&self) -> &ConcurrencyGuard {
        &self.concurrency
    }
}
