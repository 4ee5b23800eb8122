//! Resilient store client (§4.A).
//!
//! Exposes the narrow command set the broker, queue metrics, and DLQ admin
//! surface need against a log-structured key/stream store: `set`/`get`,
//! hash ops, stream ops (`append`, `read_group`, `ack`, `len`,
//! `pending_summary`, `pending_range`, `group_info`, `trim`, `claim`), and
//! pub/sub. [`RedisStoreClient`] implements it directly against Redis
//! (grounded on the raw `XADD`/`XREADGROUP`/`XACK`/`XAUTOCLAIM` command
//! style this codebase already used in its stream consumer). [`FallbackStoreClient`]
//! wraps a primary and secondary backend behind the same trait, adding
//! rate-limit failover, a circuit breaker, and a background health probe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

/// One raw stream entry: its ID and its field map flattened to strings.
pub type RawEntry = (String, HashMap<String, String>);

/// Summary of a consumer group's pending entries, from `XPENDING <stream> <group>`.
#[derive(Debug, Clone, Default)]
pub struct PendingSummary {
    pub count: u64,
    pub lowest_id: Option<String>,
    pub highest_id: Option<String>,
}

/// One entry from the extended `XPENDING` form, carrying idle time.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub entry_id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u64,
}

/// Summary of a stream's consumer groups, from `XINFO GROUPS`.
#[derive(Debug, Clone, Default)]
pub struct GroupInfo {
    pub group_count: usize,
    pub consumer_count: usize,
    pub lag: Option<u64>,
}

/// Structured events the resilient composite emits on backend state
/// transitions (§4.A "Observable").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Activated { backend: &'static str },
    Switched { from: &'static str, to: &'static str, reason: String },
    Restored { backend: &'static str },
    CircuitOpen { backend: &'static str },
    CircuitClosed { backend: &'static str },
}

/// The narrow command surface every backend and the fallback composite
/// implement. Mirrors §4.A's listed operations plus the primitives the
/// broker, queue metrics, and DLQ admin surface build on top of.
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn set(&self, key: &str, value: &str) -> BrokerResult<()>;
    async fn get(&self, key: &str) -> BrokerResult<Option<String>>;
    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> BrokerResult<()>;
    async fn hgetall(&self, key: &str) -> BrokerResult<HashMap<String, String>>;
    async fn expire(&self, key: &str, ttl_secs: i64) -> BrokerResult<()>;

    async fn ensure_group(&self, stream: &str, group: &str) -> BrokerResult<()>;
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
        maxlen: Option<i64>,
    ) -> BrokerResult<String>;
    /// Read one batch of new entries via the consumer group (`>`), blocking
    /// for up to `block_ms` if given.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: Option<u64>,
    ) -> BrokerResult<Vec<RawEntry>>;
    /// Read this consumer's already-delivered-but-unacked entries (`0`).
    async fn read_pending_own(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> BrokerResult<Vec<RawEntry>>;
    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> BrokerResult<()>;
    async fn len(&self, stream: &str) -> BrokerResult<u64>;
    async fn pending_summary(&self, stream: &str, group: &str) -> BrokerResult<PendingSummary>;
    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> BrokerResult<Vec<PendingEntry>>;
    /// `XAUTOCLAIM`: reassigns idle pending entries to `consumer`, returning
    /// the claimed entries and the cursor for the next call.
    async fn autoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        start: &str,
        count: usize,
    ) -> BrokerResult<(String, Vec<RawEntry>)>;
    async fn trim(&self, stream: &str, maxlen: i64) -> BrokerResult<()>;
    async fn group_info(&self, stream: &str, group: &str) -> BrokerResult<GroupInfo>;
    async fn range(&self, stream: &str, start: &str, end: &str, count: usize) -> BrokerResult<Vec<RawEntry>>;
    async fn revrange(&self, stream: &str, start: &str, end: &str, count: usize) -> BrokerResult<Vec<RawEntry>>;
    async fn delete_entries(&self, stream: &str, entry_ids: &[String]) -> BrokerResult<u64>;
    async fn publish(&self, channel: &str, message: &str) -> BrokerResult<()>;
    async fn ping(&self) -> BrokerResult<()>;
}

fn flatten(map: &HashMap<String, redis::Value>) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| {
            let s = match v {
                redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
                redis::Value::SimpleString(s) => s.clone(),
                other => format!("{other:?}"),
            };
            (k.clone(), s)
        })
        .collect()
}

fn parse_reply(reply: StreamReadReply) -> Vec<RawEntry> {
    reply
        .keys
        .into_iter()
        .flat_map(|key| key.ids)
        .map(|id| (id.id, flatten(&id.map)))
        .collect()
}

/// Redis-backed implementation of [`StoreClient`].
pub struct RedisStoreClient {
    conn: ConnectionManager,
}

impl RedisStoreClient {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl StoreClient for RedisStoreClient {
    async fn set(&self, key: &str, value: &str) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> BrokerResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let items: Vec<(&str, &str)> = fields.to_vec();
        let _: () = conn.hset_multiple(key, &items).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> BrokerResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map)
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.expire(key, ttl_secs).await?;
        Ok(())
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => {
                info!(stream, group, "created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream, group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(BrokerError::ConsumerGroup(e.to_string())),
        }
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
        maxlen: Option<i64>,
    ) -> BrokerResult<String> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(maxlen) = maxlen {
            cmd.arg("MAXLEN").arg("~").arg(maxlen);
        }
        cmd.arg("*");
        for (field, value) in fields {
            cmd.arg(*field).arg(*value);
        }
        let id: String = cmd.query_async(&mut conn).await?;
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: Option<u64>,
    ) -> BrokerResult<Vec<RawEntry>> {
        let mut conn = self.conn.clone();
        let mut opts = StreamReadOptions::default().group(group, consumer).count(count);
        if let Some(block_ms) = block_ms {
            opts = opts.block(block_ms as usize);
        }

        let result: Result<StreamReadReply, _> = conn.xread_options(&[stream], &[">"], &opts).await;
        match result {
            Ok(reply) => Ok(parse_reply(reply)),
            Err(e) => {
                let text = e.to_string().to_lowercase();
                if text.contains("timeout") || text.contains("timed out") || text.contains("response was nil") {
                    Ok(vec![])
                } else {
                    Err(BrokerError::Redis(e))
                }
            }
        }
    }

    async fn read_pending_own(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> BrokerResult<Vec<RawEntry>> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default().group(group, consumer).count(count);
        let result: Result<StreamReadReply, _> = conn.xread_options(&[stream], &["0"], &opts).await;
        match result {
            Ok(reply) => Ok(parse_reply(reply)),
            Err(e) if e.to_string().to_lowercase().contains("timeout") => Ok(vec![]),
            Err(e) => Err(BrokerError::Redis(e)),
        }
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.xack(stream, group, &[entry_id]).await?;
        Ok(())
    }

    async fn len(&self, stream: &str) -> BrokerResult<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(stream).await.unwrap_or(0);
        Ok(len)
    }

    async fn pending_summary(&self, stream: &str, group: &str) -> BrokerResult<PendingSummary> {
        let mut conn = self.conn.clone();
        let result: Result<redis::Value, redis::RedisError> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await;

        let value = match result {
            Ok(v) => v,
            Err(e) if e.to_string().to_lowercase().contains("nogroup") => {
                return Ok(PendingSummary::default())
            }
            Err(e) => return Err(BrokerError::Redis(e)),
        };

        let redis::Value::Array(arr) = value else {
            return Ok(PendingSummary::default());
        };
        if arr.len() < 2 {
            return Ok(PendingSummary::default());
        }

        let count = match &arr[0] {
            redis::Value::Int(n) => *n as u64,
            _ => 0,
        };
        let bulk_string = |v: &redis::Value| match v {
            redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
            _ => None,
        };

        Ok(PendingSummary {
            count,
            lowest_id: arr.get(1).and_then(bulk_string),
            highest_id: arr.get(2).and_then(bulk_string),
        })
    }

    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> BrokerResult<Vec<PendingEntry>> {
        let mut conn = self.conn.clone();
        let result: Result<redis::Value, redis::RedisError> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await;

        let value = match result {
            Ok(v) => v,
            Err(e) if e.to_string().to_lowercase().contains("nogroup") => return Ok(vec![]),
            Err(e) => return Err(BrokerError::Redis(e)),
        };

        let redis::Value::Array(entries) = value else {
            return Ok(vec![]);
        };

        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let redis::Value::Array(fields) = entry else { continue };
            if fields.len() < 4 {
                continue;
            }
            let bulk_string = |v: &redis::Value| match v {
                redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
                redis::Value::SimpleString(s) => s.clone(),
                _ => String::new(),
            };
            let as_i64 = |v: &redis::Value| match v {
                redis::Value::Int(n) => *n,
                _ => 0,
            };
            out.push(PendingEntry {
                entry_id: bulk_string(&fields[0]),
                consumer: bulk_string(&fields[1]),
                idle_ms: as_i64(&fields[2]) as u64,
                delivery_count: as_i64(&fields[3]) as u64,
            });
        }
        Ok(out)
    }

    async fn autoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        start: &str,
        count: usize,
    ) -> BrokerResult<(String, Vec<RawEntry>)> {
        let mut conn = self.conn.clone();
        let value: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(start)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .unwrap_or(redis::Value::Nil);

        let redis::Value::Array(arr) = value else {
            return Ok(("0-0".to_string(), vec![]));
        };
        if arr.len() < 2 {
            return Ok(("0-0".to_string(), vec![]));
        }

        let next_cursor = match &arr[0] {
            redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
            redis::Value::SimpleString(s) => s.clone(),
            _ => "0-0".to_string(),
        };

        let mut claimed = Vec::new();
        if let redis::Value::Array(messages) = &arr[1] {
            for message in messages {
                let redis::Value::Array(pair) = message else { continue };
                if pair.len() < 2 {
                    continue;
                }
                let id = match &pair[0] {
                    redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
                    redis::Value::SimpleString(s) => s.clone(),
                    _ => continue,
                };
                let redis::Value::Array(field_pairs) = &pair[1] else {
                    continue;
                };
                let mut map = HashMap::new();
                let mut it = field_pairs.iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    let key = match k {
                        redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
                        redis::Value::SimpleString(s) => s.clone(),
                        _ => continue,
                    };
                    let val = match v {
                        redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
                        redis::Value::SimpleString(s) => s.clone(),
                        _ => continue,
                    };
                    map.insert(key, val);
                }
                claimed.push((id, map));
            }
        }

        Ok((next_cursor, claimed))
    }

    async fn trim(&self, stream: &str, maxlen: i64) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("XTRIM")
            .arg(stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(maxlen)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn group_info(&self, stream: &str, group: &str) -> BrokerResult<GroupInfo> {
        let mut conn = self.conn.clone();
        let result: Result<redis::Value, redis::RedisError> = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(stream)
            .query_async(&mut conn)
            .await;

        let value = match result {
            Ok(v) => v,
            Err(_) => return Ok(GroupInfo::default()),
        };
        let redis::Value::Array(groups) = value else {
            return Ok(GroupInfo::default());
        };

        let mut info = GroupInfo { group_count: groups.len(), ..Default::default() };
        for entry in groups {
            let redis::Value::Array(fields) = entry else { continue };
            // XINFO GROUPS fields are positional (name, consumers, pending, last-delivered-id, ...);
            // only the named group's consumers/lag are relevant to the caller.
            let mut field_map = HashMap::new();
            let mut it = fields.iter();
            while let (Some(k), Some(v)) = (it.next(), it.next()) {
                let key = match k {
                    redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
                    _ => continue,
                };
                field_map.insert(key, v.clone());
            }
            if field_map
                .get("name")
                .map(|v| matches!(v, redis::Value::BulkString(b) if b == group.as_bytes()))
                .unwrap_or(false)
            {
                if let Some(redis::Value::Int(consumers)) = field_map.get("consumers") {
                    info.consumer_count = *consumers as usize;
                }
                if let Some(redis::Value::Int(lag)) = field_map.get("lag") {
                    info.lag = Some(*lag as u64);
                }
            }
        }
        Ok(info)
    }

    async fn range(&self, stream: &str, start: &str, end: &str, count: usize) -> BrokerResult<Vec<RawEntry>> {
        let mut conn = self.conn.clone();
        let result: Vec<(String, HashMap<String, redis::Value>)> =
            conn.xrange_count(stream, start, end, count).await?;
        Ok(result.into_iter().map(|(id, map)| (id, flatten(&map))).collect())
    }

    async fn revrange(&self, stream: &str, start: &str, end: &str, count: usize) -> BrokerResult<Vec<RawEntry>> {
        let mut conn = self.conn.clone();
        let result: Vec<(String, HashMap<String, redis::Value>)> =
            conn.xrevrange_count(stream, end, start, count).await?;
        Ok(result.into_iter().map(|(id, map)| (id, flatten(&map))).collect())
    }

    async fn delete_entries(&self, stream: &str, entry_ids: &[String]) -> BrokerResult<u64> {
        let mut conn = self.conn.clone();
        let deleted: u64 = conn.xdel(stream, entry_ids).await?;
        Ok(deleted)
    }

    async fn publish(&self, channel: &str, message: &str) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(channel, message).await?;
        Ok(())
    }

    async fn ping(&self) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let response: String = redis::cmd("PING").query_async(&mut conn).await?;
        if response != "PONG" {
            return Err(BrokerError::HealthCheck(format!("unexpected PING reply: {response}")));
        }
        Ok(())
    }
}

/// Configuration for the [`FallbackStoreClient`]'s failover behaviour.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    pub rate_limit_cooldown_secs: u64,
    pub circuit_breaker: CircuitBreakerConfig,
    pub health_probe_interval_secs: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            rate_limit_cooldown_secs: 300,
            circuit_breaker: CircuitBreakerConfig::default()
                .with_failure_threshold(5)
                .with_timeout_secs(60),
            health_probe_interval_secs: 30,
        }
    }
}

/// Composite client wrapping a primary and secondary backend behind the
/// same [`StoreClient`] surface (§4.A). Detects rate-limiting on the
/// primary and switches to the secondary for a cooldown; trips a circuit
/// breaker on consecutive failures of whichever backend is active; probes
/// health in the background and restores the primary when it recovers.
pub struct FallbackStoreClient {
    primary: Arc<dyn StoreClient>,
    secondary: Option<Arc<dyn StoreClient>>,
    breaker: CircuitBreaker,
    config: FallbackConfig,
    on_secondary: AtomicBool,
    cooldown_until_unix_secs: AtomicU64,
    events: broadcast::Sender<StoreEvent>,
}

impl FallbackStoreClient {
    pub fn new(primary: Arc<dyn StoreClient>, secondary: Option<Arc<dyn StoreClient>>) -> Self {
        Self::with_config(primary, secondary, FallbackConfig::default())
    }

    pub fn with_config(
        primary: Arc<dyn StoreClient>,
        secondary: Option<Arc<dyn StoreClient>>,
        config: FallbackConfig,
    ) -> Self {
        let (tx, _rx) = broadcast::channel(64);
        Self {
            primary,
            secondary,
            breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            config,
            on_secondary: AtomicBool::new(false),
            cooldown_until_unix_secs: AtomicU64::new(0),
            events: tx,
        }
    }

    /// Subscribe to structured state-transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }

    fn now_secs() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn cooldown_active(&self) -> bool {
        Self::now_secs() < self.cooldown_until_unix_secs.load(Ordering::SeqCst)
    }

    fn active_backend(&self) -> &Arc<dyn StoreClient> {
        if self.on_secondary.load(Ordering::SeqCst) {
            self.secondary.as_ref().unwrap_or(&self.primary)
        } else {
            &self.primary
        }
    }

    fn switch_to_secondary(&self, reason: impl Into<String>) {
        if self.secondary.is_none() {
            return;
        }
        let already_on_secondary = self.on_secondary.swap(true, Ordering::SeqCst);
        self.cooldown_until_unix_secs.store(
            Self::now_secs() + self.config.rate_limit_cooldown_secs,
            Ordering::SeqCst,
        );
        if !already_on_secondary {
            warn!(reason = %reason.into(), "store client switching to secondary backend");
            self.emit(StoreEvent::Switched { from: "primary", to: "secondary", reason: "rate_limited".to_string() });
        }
    }

    /// Runs the 30 s (default) background health probe against the active
    /// backend, restoring the primary once it is healthy again and the
    /// cooldown has elapsed. Intended to be spawned once at startup.
    pub async fn run_health_probe(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.health_probe_interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }

            if self.on_secondary.load(Ordering::SeqCst) && !self.cooldown_active() {
                if self.primary.ping().await.is_ok() {
                    self.on_secondary.store(false, Ordering::SeqCst);
                    info!("store client restored to primary backend");
                    self.emit(StoreEvent::Restored { backend: "primary" });
                }
            }

            let backend = self.active_backend();
            match backend.ping().await {
                Ok(()) => self.breaker.record_success(),
                Err(e) => {
                    warn!(error = %e, "store health probe failed");
                    self.breaker.record_failure();
                }
            }
        }
    }

    /// Runs one command against the active backend, applying circuit
    /// breaker gating and rate-limit failover uniformly.
    async fn run<'a, T, F, Fut>(&'a self, op: F) -> BrokerResult<T>
    where
        F: Fn(&'a Arc<dyn StoreClient>) -> Fut,
        Fut: std::future::Future<Output = BrokerResult<T>>,
    {
        if !self.breaker.can_execute() {
            return Err(BrokerError::TransientStore("circuit breaker open".to_string()));
        }
        let was_open = matches!(self.breaker.state(), CircuitState::Open);

        let backend = self.active_backend();
        let result = op(backend).await;

        match &result {
            Ok(_) => {
                self.breaker.record_success();
                if was_open {
                    self.emit(StoreEvent::CircuitClosed {
                        backend: if self.on_secondary.load(Ordering::SeqCst) { "secondary" } else { "primary" },
                    });
                }
            }
            Err(e) if e.is_rate_limited() => {
                self.switch_to_secondary(e.to_string());
            }
            Err(e) => {
                self.breaker.record_failure();
                if matches!(self.breaker.state(), CircuitState::Open) {
                    self.emit(StoreEvent::CircuitOpen {
                        backend: if self.on_secondary.load(Ordering::SeqCst) { "secondary" } else { "primary" },
                    });
                }
                let _ = e;
            }
        }

        result
    }
}

#[async_trait]
impl StoreClient for FallbackStoreClient {
    async fn set(&self, key: &str, value: &str) -> BrokerResult<()> {
        self.run(|b| b.set(key, value)).await
    }

    async fn get(&self, key: &str) -> BrokerResult<Option<String>> {
        self.run(|b| b.get(key)).await
    }

    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> BrokerResult<()> {
        self.run(|b| b.hset(key, fields)).await
    }

    async fn hgetall(&self, key: &str) -> BrokerResult<HashMap<String, String>> {
        self.run(|b| b.hgetall(key)).await
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> BrokerResult<()> {
        self.run(|b| b.expire(key, ttl_secs)).await
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> BrokerResult<()> {
        self.run(|b| b.ensure_group(stream, group)).await
    }

    async fn append(&self, stream: &str, fields: &[(&str, &str)], maxlen: Option<i64>) -> BrokerResult<String> {
        self.run(|b| b.append(stream, fields, maxlen)).await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: Option<u64>,
    ) -> BrokerResult<Vec<RawEntry>> {
        self.run(|b| b.read_group(stream, group, consumer, count, block_ms)).await
    }

    async fn read_pending_own(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> BrokerResult<Vec<RawEntry>> {
        self.run(|b| b.read_pending_own(stream, group, consumer, count)).await
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> BrokerResult<()> {
        self.run(|b| b.ack(stream, group, entry_id)).await
    }

    async fn len(&self, stream: &str) -> BrokerResult<u64> {
        self.run(|b| b.len(stream)).await
    }

    async fn pending_summary(&self, stream: &str, group: &str) -> BrokerResult<PendingSummary> {
        self.run(|b| b.pending_summary(stream, group)).await
    }

    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> BrokerResult<Vec<PendingEntry>> {
        self.run(|b| b.pending_range(stream, group, min_idle_ms, count)).await
    }

    async fn autoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        start: &str,
        count: usize,
    ) -> BrokerResult<(String, Vec<RawEntry>)> {
        self.run(|b| b.autoclaim(stream, group, consumer, min_idle_ms, start, count)).await
    }

    async fn trim(&self, stream: &str, maxlen: i64) -> BrokerResult<()> {
        self.run(|b| b.trim(stream, maxlen)).await
    }

    async fn group_info(&self, stream: &str, group: &str) -> BrokerResult<GroupInfo> {
        self.run(|b| b.group_info(stream, group)).await
    }

    async fn range(&self, stream: &str, start: &str, end: &str, count: usize) -> BrokerResult<Vec<RawEntry>> {
        self.run(|b| b.range(stream, start, end, count)).await
    }

    async fn revrange(&self, stream: &str, start: &str, end: &str, count: usize) -> BrokerResult<Vec<RawEntry>> {
        self.run(|b| b.revrange(stream, start, end, count)).await
    }

    async fn delete_entries(&self, stream: &str, entry_ids: &[String]) -> BrokerResult<u64> {
        self.run(|b| b.delete_entries(stream, entry_ids)).await
    }

    async fn publish(&self, channel: &str, message: &str) -> BrokerResult<()> {
        self.run(|b| b.publish(channel, message)).await
    }

    async fn ping(&self) -> BrokerResult<()> {
        self.run(|b| b.ping()).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory fake implementing the narrow command surface, per the
    /// design notes' "injected client interface" guidance (§9). Used by the
    /// broker and worker runtime's unit tests; `mockall` covers the
    /// interaction-style tests where call counts/arguments matter.
    #[derive(Default)]
    pub struct FakeStoreClient {
        pub streams: Mutex<HashMap<String, Vec<RawEntry>>>,
        pub kv: Mutex<HashMap<String, String>>,
        pub fail_with_rate_limit: AtomicBool,
        /// Entries `autoclaim` hands back exactly once, then reports the
        /// cursor exhausted.
        pub autoclaim_entries: Mutex<Vec<RawEntry>>,
        /// Canned response for `pending_range`, keyed by entry ID.
        pub pending: Mutex<Vec<PendingEntry>>,
    }

    #[async_trait]
    impl StoreClient for FakeStoreClient {
        async fn set(&self, key: &str, value: &str) -> BrokerResult<()> {
            self.kv.lock().unwrap().insert(key.to_string(), value.to_string());
            Ok(())
        }
        async fn get(&self, key: &str) -> BrokerResult<Option<String>> {
            Ok(self.kv.lock().unwrap().get(key).cloned())
        }
        async fn hset(&self, _key: &str, _fields: &[(&str, &str)]) -> BrokerResult<()> {
            Ok(())
        }
        async fn hgetall(&self, _key: &str) -> BrokerResult<HashMap<String, String>> {
            Ok(HashMap::new())
        }
        async fn expire(&self, _key: &str, _ttl_secs: i64) -> BrokerResult<()> {
            Ok(())
        }
        async fn ensure_group(&self, _stream: &str, _group: &str) -> BrokerResult<()> {
            Ok(())
        }
        async fn append(&self, stream: &str, fields: &[(&str, &str)], _maxlen: Option<i64>) -> BrokerResult<String> {
            if self.fail_with_rate_limit.load(Ordering::SeqCst) {
                return Err(BrokerError::TransientStore("rate limited (429)".to_string()));
            }
            let id = format!("{}-0", self.streams.lock().unwrap().get(stream).map(|v| v.len()).unwrap_or(0) + 1);
            let map: HashMap<String, String> = fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
            self.streams
                .lock()
                .unwrap()
                .entry(stream.to_string())
                .or_default()
                .push((id.clone(), map));
            Ok(id)
        }
        async fn read_group(&self, stream: &str, _group: &str, _consumer: &str, count: usize, _block_ms: Option<u64>) -> BrokerResult<Vec<RawEntry>> {
            let entries = self.streams.lock().unwrap().get(stream).cloned().unwrap_or_default();
            Ok(entries.into_iter().take(count).collect())
        }
        async fn read_pending_own(&self, _stream: &str, _group: &str, _consumer: &str, _count: usize) -> BrokerResult<Vec<RawEntry>> {
            Ok(vec![])
        }
        async fn ack(&self, _stream: &str, _group: &str, _entry_id: &str) -> BrokerResult<()> {
            Ok(())
        }
        async fn len(&self, stream: &str) -> BrokerResult<u64> {
            Ok(self.streams.lock().unwrap().get(stream).map(|v| v.len() as u64).unwrap_or(0))
        }
        async fn pending_summary(&self, _stream: &str, _group: &str) -> BrokerResult<PendingSummary> {
            Ok(PendingSummary::default())
        }
        async fn pending_range(&self, _stream: &str, _group: &str, _min_idle_ms: u64, count: usize) -> BrokerResult<Vec<PendingEntry>> {
            Ok(self.pending.lock().unwrap().iter().take(count).cloned().collect())
        }
        async fn autoclaim(&self, _stream: &str, _group: &str, _consumer: &str, _min_idle_ms: u64, _start: &str, _count: usize) -> BrokerResult<(String, Vec<RawEntry>)> {
            let entries = std::mem::take(&mut *self.autoclaim_entries.lock().unwrap());
            Ok(("0-0".to_string(), entries))
        }
        async fn trim(&self, _stream: &str, _maxlen: i64) -> BrokerResult<()> {
            Ok(())
        }
        async fn group_info(&self, _stream: &str, _group: &str) -> BrokerResult<GroupInfo> {
            Ok(GroupInfo::default())
        }
        async fn range(&self, _stream: &str, _start: &str, _end: &str, _count: usize) -> BrokerResult<Vec<RawEntry>> {
            Ok(vec![])
        }
        async fn revrange(&self, _stream: &str, _start: &str, _end: &str, _count: usize) -> BrokerResult<Vec<RawEntry>> {
            Ok(vec![])
        }
        async fn delete_entries(&self, _stream: &str, _entry_ids: &[String]) -> BrokerResult<u64> {
            Ok(0)
        }
        async fn publish(&self, _channel: &str, _message: &str) -> BrokerResult<()> {
            Ok(())
        }
        async fn ping(&self) -> BrokerResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn fallback_switches_to_secondary_on_rate_limit() {
        let primary = Arc::new(FakeStoreClient::default());
        primary.fail_with_rate_limit.store(true, Ordering::SeqCst);
        let secondary = Arc::new(FakeStoreClient::default());

        let fallback = FallbackStoreClient::new(primary, Some(secondary));
        let mut events = fallback.subscribe();

        let result = fallback.append("jobs", &[("job", "{}")], None).await;
        assert!(result.is_err());

        let event = events.try_recv().unwrap();
        assert!(matches!(event, StoreEvent::Switched { .. }));
        assert!(fallback.on_secondary.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn fallback_opens_circuit_after_consecutive_failures() {
        struct AlwaysFails;
        #[async_trait]
        impl StoreClient for AlwaysFails {
            async fn set(&self, _k: &str, _v: &str) -> BrokerResult<()> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
            async fn get(&self, _k: &str) -> BrokerResult<Option<String>> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
            async fn hset(&self, _k: &str, _f: &[(&str, &str)]) -> BrokerResult<()> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
            async fn hgetall(&self, _k: &str) -> BrokerResult<HashMap<String, String>> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
            async fn expire(&self, _k: &str, _t: i64) -> BrokerResult<()> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
            async fn ensure_group(&self, _s: &str, _g: &str) -> BrokerResult<()> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
            async fn append(&self, _s: &str, _f: &[(&str, &str)], _m: Option<i64>) -> BrokerResult<String> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
            async fn read_group(&self, _s: &str, _g: &str, _c: &str, _n: usize, _b: Option<u64>) -> BrokerResult<Vec<RawEntry>> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
            async fn read_pending_own(&self, _s: &str, _g: &str, _c: &str, _n: usize) -> BrokerResult<Vec<RawEntry>> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
            async fn ack(&self, _s: &str, _g: &str, _e: &str) -> BrokerResult<()> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
            async fn len(&self, _s: &str) -> BrokerResult<u64> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
            async fn pending_summary(&self, _s: &str, _g: &str) -> BrokerResult<PendingSummary> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
            async fn pending_range(&self, _s: &str, _g: &str, _m: u64, _c: usize) -> BrokerResult<Vec<PendingEntry>> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
            async fn autoclaim(&self, _s: &str, _g: &str, _c: &str, _m: u64, _st: &str, _cnt: usize) -> BrokerResult<(String, Vec<RawEntry>)> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
            async fn trim(&self, _s: &str, _m: i64) -> BrokerResult<()> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
            async fn group_info(&self, _s: &str, _g: &str) -> BrokerResult<GroupInfo> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
            async fn range(&self, _s: &str, _a: &str, _b: &str, _c: usize) -> BrokerResult<Vec<RawEntry>> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
            async fn revrange(&self, _s: &str, _a: &str, _b: &str, _c: usize) -> BrokerResult<Vec<RawEntry>> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
            async fn delete_entries(&self, _s: &str, _e: &[String]) -> BrokerResult<u64> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
            async fn publish(&self, _c: &str, _m: &str) -> BrokerResult<()> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
            async fn ping(&self) -> BrokerResult<()> {
                Err(BrokerError::TransientStore("down".to_string()))
            }
        }

        let config = FallbackConfig {
            circuit_breaker: CircuitBreakerConfig::default().with_failure_threshold(2),
            ..Default::default()
        };
        let fallback = FallbackStoreClient::with_config(Arc::new(AlwaysFails), None, config);

        let _ = fallback.get("k").await;
        let _ = fallback.get("k").await;
        let result = fallback.get("k").await;

        assert!(matches!(result, Err(BrokerError::TransientStore(msg)) if msg.contains("circuit")));
    }
}
