//! Backing stores for admission counters and block entries.
//!
//! [`RedisStore`] shares state across gateway instances. [`LocalStore`] keeps
//! it in process and serves as the fallback whenever the shared store fails.

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Span of the burst window.
pub const BURST_WINDOW: Duration = Duration::from_secs(1);

/// Limits evaluated on every hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    pub window: Duration,
    pub max_requests: u32,
    pub burst_max: u32,
}

/// Counts after recording one hit, including that hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounts {
    pub count: u32,
    pub burst_count: u32,
    /// Time until the sustained window frees up.
    pub window_remaining: Duration,
}

impl WindowCounts {
    pub fn allowed(&self, policy: &WindowPolicy) -> bool {
        self.count <= policy.max_requests && self.burst_count <= policy.burst_max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Local,
    Shared,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Shared => "shared",
        }
    }
}

/// Storage strategy for the admission controller.
///
/// Checking and recording a hit is one operation: two concurrent hits for the
/// same identity must never both observe the pre-hit count.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    /// Record one hit against both windows and return the resulting counts.
    async fn record_hit(&self, identity: &str, policy: &WindowPolicy) -> StoreResult<WindowCounts>;

    async fn block(&self, identity: &str, duration: Duration) -> StoreResult<()>;

    /// Remaining block time, if the identity is blocked.
    async fn blocked_for(&self, identity: &str) -> StoreResult<Option<Duration>>;
}

/// Per-identity counters for the in-process store.
#[derive(Debug, Clone, Copy)]
struct RateWindowRecord {
    window_start: Instant,
    count: u32,
    burst_window_start: Instant,
    burst_count: u32,
    window: Duration,
}

impl RateWindowRecord {
    fn new(now: Instant, window: Duration) -> Self {
        Self {
            window_start: now,
            count: 0,
            burst_window_start: now,
            burst_count: 0,
            window,
        }
    }

    fn is_active(&self, now: Instant) -> bool {
        now.duration_since(self.window_start) <= self.window
            || now.duration_since(self.burst_window_start) <= BURST_WINDOW
    }
}

/// In-process store. Each identity's record is updated under its map shard
/// lock, so concurrent hits for one identity are serialized.
#[derive(Debug, Default)]
pub struct LocalStore {
    records: DashMap<String, RateWindowRecord>,
    blocks: DashMap<String, Instant>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hit(&self, identity: &str, policy: &WindowPolicy) -> WindowCounts {
        let now = Instant::now();
        let mut entry = self
            .records
            .entry(identity.to_string())
            .or_insert_with(|| RateWindowRecord::new(now, policy.window));
        let record = entry.value_mut();
        record.window = policy.window;

        if now.duration_since(record.window_start) > policy.window {
            record.window_start = now;
            record.count = 0;
        }
        if now.duration_since(record.burst_window_start) > BURST_WINDOW {
            record.burst_window_start = now;
            record.burst_count = 0;
        }
        record.count = record.count.saturating_add(1);
        record.burst_count = record.burst_count.saturating_add(1);

        WindowCounts {
            count: record.count,
            burst_count: record.burst_count,
            window_remaining: policy
                .window
                .saturating_sub(now.duration_since(record.window_start)),
        }
    }

    pub fn set_block(&self, identity: &str, duration: Duration) {
        self.blocks
            .insert(identity.to_string(), Instant::now() + duration);
    }

    pub fn block_remaining(&self, identity: &str) -> Option<Duration> {
        let now = Instant::now();
        let expiry = self.blocks.get(identity).map(|e| *e.value())?;
        if expiry > now {
            return Some(expiry - now);
        }
        self.blocks.remove_if(identity, |_, expiry| *expiry <= now);
        None
    }

    /// Drop expired blocks and records whose windows have both elapsed.
    /// Returns `(records, blocks)` removed.
    pub fn sweep(&self) -> (usize, usize) {
        let now = Instant::now();
        let records_before = self.records.len();
        self.records.retain(|_, record| record.is_active(now));
        let blocks_before = self.blocks.len();
        self.blocks.retain(|_, expiry| *expiry > now);

        let removed = (
            records_before.saturating_sub(self.records.len()),
            blocks_before.saturating_sub(self.blocks.len()),
        );
        if removed != (0, 0) {
            debug!(
                records = removed.0,
                blocks = removed.1,
                "Swept stale admission state"
            );
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RateLimitStore for LocalStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Local
    }

    async fn record_hit(&self, identity: &str, policy: &WindowPolicy) -> StoreResult<WindowCounts> {
        Ok(self.hit(identity, policy))
    }

    async fn block(&self, identity: &str, duration: Duration) -> StoreResult<()> {
        self.set_block(identity, duration);
        Ok(())
    }

    async fn blocked_for(&self, identity: &str) -> StoreResult<Option<Duration>> {
        Ok(self.block_remaining(identity))
    }
}

/// Redis-backed store.
///
/// Each window is a sorted set of hit timestamps under `<prefix><identity>`
/// and `<prefix>burst:<identity>`; trimming, counting, inserting and refreshing
/// the TTL run in one `MULTI`/`EXEC` round trip.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    op_timeout: Duration,
    /// Distinguishes this instance's members from other gateways sharing the keys.
    nonce: String,
    seq: std::sync::Arc<AtomicU64>,
}

impl RedisStore {
    pub async fn connect(url: &str, prefix: impl Into<String>, op_timeout: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(op_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(op_timeout.as_millis() as u64))??;
        info!("Connected to shared rate-limit store");
        Ok(Self {
            conn,
            prefix: prefix.into(),
            op_timeout,
            nonce: Uuid::new_v4().simple().to_string(),
            seq: Default::default(),
        })
    }

    fn key(&self, identity: &str) -> String {
        format!("{}{}", self.prefix, identity)
    }

    fn burst_key(&self, identity: &str) -> String {
        format!("{}burst:{}", self.prefix, identity)
    }

    fn block_key(&self, identity: &str) -> String {
        format!("{}block:{}", self.prefix, identity)
    }

    async fn bounded<T>(
        &self,
        op: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> StoreResult<T> {
        tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| StoreError::Timeout(self.op_timeout.as_millis() as u64))?
            .map_err(StoreError::from)
    }
}

/// Sorted-set member for one hit. Unique across instances and within a millisecond.
fn hit_member(now_ms: i64, nonce: &str, seq: u64) -> String {
    format!("{}-{}-{}", now_ms, nonce, seq)
}

/// Map the pipeline reply to window counts.
///
/// `count` and `burst_count` were taken before this hit was added; `oldest`
/// is the lowest-scored entry of the sustained window after the insert.
fn counts_from_reply(
    count: u32,
    oldest: &[(String, f64)],
    burst_count: u32,
    now_ms: i64,
    policy: &WindowPolicy,
) -> WindowCounts {
    let window_ms = policy.window.as_millis() as i64;
    let oldest_ms = oldest
        .first()
        .map(|(_, score)| *score as i64)
        .unwrap_or(now_ms);
    let remaining_ms = (oldest_ms + window_ms - now_ms).clamp(0, window_ms);

    WindowCounts {
        count: count.saturating_add(1),
        burst_count: burst_count.saturating_add(1),
        window_remaining: Duration::from_millis(remaining_ms as u64),
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Shared
    }

    async fn record_hit(&self, identity: &str, policy: &WindowPolicy) -> StoreResult<WindowCounts> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let window_ms = policy.window.as_millis() as i64;
        let burst_ms = BURST_WINDOW.as_millis() as i64;
        let member = hit_member(now_ms, &self.nonce, self.seq.fetch_add(1, Ordering::Relaxed));
        let key = self.key(identity);
        let burst_key = self.burst_key(identity);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrembyscore(&key, "-inf", now_ms - window_ms)
            .ignore()
            .zcard(&key)
            .zadd(&key, &member, now_ms)
            .ignore()
            .pexpire(&key, window_ms)
            .ignore()
            .zrange_withscores(&key, 0, 0)
            .zrembyscore(&burst_key, "-inf", now_ms - burst_ms)
            .ignore()
            .zcard(&burst_key)
            .zadd(&burst_key, &member, now_ms)
            .ignore()
            .pexpire(&burst_key, burst_ms)
            .ignore();

        let mut conn = self.conn.clone();
        let (count, oldest, burst_count): (u32, Vec<(String, f64)>, u32) =
            self.bounded(pipe.query_async(&mut conn)).await?;

        Ok(counts_from_reply(count, &oldest, burst_count, now_ms, policy))
    }

    async fn block(&self, identity: &str, duration: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.block_key(identity))
            .arg(1)
            .arg("PX")
            .arg(duration.as_millis().max(1) as u64);
        let _: () = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn blocked_for(&self, identity: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(self.block_key(identity));
        let ttl: i64 = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok((ttl > 0).then(|| Duration::from_millis(ttl as u64)))
    }
}
