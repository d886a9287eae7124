//! Sliding-window admission control with a one-second burst cap.

use crate::config::RateLimitConfig;
use crate::error::{SecurityError, StoreError};
use crate::security::store::{
    BURST_WINDOW, LocalStore, RateLimitStore, StoreKind, WindowCounts, WindowPolicy,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one admission check.
#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    pub allowed: bool,
    /// Rejected because the identity is blocked; no counter was charged.
    pub blocked: bool,
    pub count: u32,
    pub burst_count: u32,
    pub limit: u32,
    pub burst_limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Set on rejection.
    pub retry_after: Option<Duration>,
    /// Rejected by the burst cap while sustained quota remained.
    pub is_burst: bool,
    pub store: StoreKind,
}

impl AdmissionDecision {
    /// The error to report for a rejected decision.
    pub fn rejection(&self) -> Option<SecurityError> {
        if self.allowed {
            return None;
        }
        if self.blocked {
            return Some(SecurityError::Blocked);
        }
        Some(SecurityError::RateLimited {
            limit: if self.is_burst { self.burst_limit } else { self.limit },
            count: if self.is_burst { self.burst_count } else { self.count },
            retry_after: self.retry_after.unwrap_or(BURST_WINDOW),
            burst: self.is_burst,
        })
    }

    /// Standard rate-limit response headers.
    pub fn rate_limit_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.timestamp().to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            headers.push(("Retry-After", ceil_secs(retry_after).to_string()));
        }
        headers
    }
}

fn ceil_secs(d: Duration) -> u64 {
    (d.as_millis() as u64).div_ceil(1000).max(1)
}

/// Per-identity admission controller.
///
/// Counters live in the shared store when one is configured and reachable,
/// otherwise in the in-process store. A failing shared store never fails a
/// request; the call is answered from the local store instead.
pub struct AdmissionController {
    shared: Option<Arc<dyn RateLimitStore>>,
    local: Arc<LocalStore>,
    policy: WindowPolicy,
    abuse_threshold: u32,
    abuse_block: Duration,
    sweep_interval: Duration,
    degraded: AtomicBool,
    violations: DashMap<String, (u32, Instant)>,
}

impl AdmissionController {
    pub fn new(config: &RateLimitConfig, shared: Option<Arc<dyn RateLimitStore>>) -> Self {
        Self {
            shared,
            local: Arc::new(LocalStore::new()),
            policy: WindowPolicy {
                window: config.window,
                max_requests: config.max_requests,
                burst_max: config.burst_max,
            },
            abuse_threshold: config.abuse_threshold,
            abuse_block: config.abuse_block_duration,
            sweep_interval: config.sweep_interval,
            degraded: AtomicBool::new(false),
            violations: DashMap::new(),
        }
    }

    /// Whether the last shared-store call failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// `local`, `shared` or `shared-degraded`.
    pub fn store_status(&self) -> &'static str {
        match (&self.shared, self.is_degraded()) {
            (None, _) => "local",
            (Some(_), false) => "shared",
            (Some(_), true) => "shared-degraded",
        }
    }

    /// Identities tracked by the local store.
    pub fn tracked_identities(&self) -> usize {
        self.local.len()
    }

    /// Full admission: blocked identities are rejected before any counter is
    /// charged; repeated rejections escalate into a block.
    pub async fn admit(&self, identity: &str) -> AdmissionDecision {
        if let Some(remaining) = self.blocked_for(identity).await {
            debug!(identity, "Rejected blocked identity");
            return self.blocked_decision(remaining);
        }

        let decision = self.check(identity).await;
        if decision.allowed {
            self.violations.remove(identity);
        } else {
            self.record_violation(identity).await;
        }
        decision
    }

    /// Charge one hit against both windows and decide.
    pub async fn check(&self, identity: &str) -> AdmissionDecision {
        let (counts, store) = self.record_hit(identity).await;
        let decision = self.decide(counts, store);
        if !decision.allowed {
            warn!(
                identity,
                count = decision.count,
                burst_count = decision.burst_count,
                burst = decision.is_burst,
                "Rate limit exceeded"
            );
        }
        decision
    }

    /// Block an identity. Always recorded locally, and in the shared store
    /// when reachable.
    pub async fn block(&self, identity: &str, duration: Duration) {
        self.local.set_block(identity, duration);
        if let Some(shared) = &self.shared {
            match shared.block(identity, duration).await {
                Ok(()) => self.mark_healthy(),
                Err(e) => self.mark_degraded("block", &e),
            }
        }
        info!(
            identity,
            duration_ms = duration.as_millis() as u64,
            "Identity blocked"
        );
    }

    pub async fn is_blocked(&self, identity: &str) -> bool {
        self.blocked_for(identity).await.is_some()
    }

    /// Purge expired blocks, stale windows and old violation streaks.
    pub fn sweep(&self) -> (usize, usize) {
        let removed = self.local.sweep();
        let now = Instant::now();
        let window = self.policy.window;
        self.violations
            .retain(|_, (_, last)| now.duration_since(*last) <= window);
        removed
    }

    /// Run [`AdmissionController::sweep`] every `sweep_interval` until the
    /// controller is dropped or the handle aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let controller: Weak<Self> = Arc::downgrade(self);
        let period = self.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.sweep();
            }
        })
    }

    async fn record_hit(&self, identity: &str) -> (WindowCounts, StoreKind) {
        if let Some(shared) = &self.shared {
            match shared.record_hit(identity, &self.policy).await {
                Ok(counts) => {
                    self.mark_healthy();
                    return (counts, shared.kind());
                }
                Err(e) => self.mark_degraded("record_hit", &e),
            }
        }
        (self.local.hit(identity, &self.policy), StoreKind::Local)
    }

    async fn blocked_for(&self, identity: &str) -> Option<Duration> {
        if let Some(remaining) = self.local.block_remaining(identity) {
            return Some(remaining);
        }
        let shared = self.shared.as_ref()?;
        match shared.blocked_for(identity).await {
            Ok(remaining) => {
                self.mark_healthy();
                remaining
            }
            Err(e) => {
                self.mark_degraded("blocked_for", &e);
                None
            }
        }
    }

    async fn record_violation(&self, identity: &str) {
        if self.abuse_threshold == 0 {
            return;
        }
        let streak = {
            let mut entry = self
                .violations
                .entry(identity.to_string())
                .or_insert((0, Instant::now()));
            let (count, last) = entry.value_mut();
            *count += 1;
            *last = Instant::now();
            *count
        };

        if streak >= self.abuse_threshold {
            self.violations.remove(identity);
            warn!(
                identity,
                violations = streak,
                "Repeated rate-limit violations; blocking identity"
            );
            self.block(identity, self.abuse_block).await;
        }
    }

    fn decide(&self, counts: WindowCounts, store: StoreKind) -> AdmissionDecision {
        let policy = &self.policy;
        let allowed = counts.allowed(policy);
        let sustained_exceeded = counts.count > policy.max_requests;
        let is_burst = !allowed && !sustained_exceeded;
        let retry_after = (!allowed).then(|| {
            if is_burst {
                BURST_WINDOW
            } else {
                counts.window_remaining
            }
        });

        AdmissionDecision {
            allowed,
            blocked: false,
            count: counts.count,
            burst_count: counts.burst_count,
            limit: policy.max_requests,
            burst_limit: policy.burst_max,
            remaining: policy.max_requests.saturating_sub(counts.count),
            reset_at: reset_at(counts.window_remaining),
            retry_after,
            is_burst,
            store,
        }
    }

    fn blocked_decision(&self, remaining: Duration) -> AdmissionDecision {
        AdmissionDecision {
            allowed: false,
            blocked: true,
            count: 0,
            burst_count: 0,
            limit: self.policy.max_requests,
            burst_limit: self.policy.burst_max,
            remaining: 0,
            reset_at: reset_at(remaining),
            retry_after: Some(remaining),
            is_burst: false,
            store: if self.shared.is_some() && !self.is_degraded() {
                StoreKind::Shared
            } else {
                StoreKind::Local
            },
        }
    }

    fn mark_degraded(&self, op: &'static str, err: &StoreError) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(op, error = %err, "Shared rate-limit store unavailable; using local fallback");
        } else {
            debug!(op, error = %err, "Shared rate-limit store still unavailable");
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            info!("Shared rate-limit store recovered");
        }
    }
}

fn reset_at(after: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(after).unwrap_or_else(|_| chrono::Duration::zero())
}
