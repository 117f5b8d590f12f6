//! Cross-process record of in-flight requests.
//!
//! Each entry is owned by exactly one process and carries enough to re-push
//! the originating job if that process dies: the serialized job envelope and
//! a retry counter. A sorted set scored by heartbeat epoch makes orphan
//! scans a single range query.
//!
//! Key layout (redis implementation):
//!
//! ```text
//! {prefix}:inflight             sorted set  member=request_id, score=heartbeat epoch
//! {prefix}:inflight:<id>        hash        job_envelope, enqueued_at, owner_pid, retry_count
//! {prefix}:inflight:gc_lock     string      value=owner, TTL=gc_lock_ttl
//! ```

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::Result;
use crate::queue::{JobEnvelope, JobQueue};

/// One in-flight request as the shared registry sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct InflightEntry {
    pub request_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
    pub owner_pid: String,
    pub job_envelope: Option<JobEnvelope>,
    pub retry_count: u32,
}

/// Shared-KV operations backing the registry.
///
/// Correctness across processes comes from the atomicity of each operation
/// plus the GC lock; no caller-side coordination is required.
#[async_trait]
pub trait InflightStore: Send + Sync {
    /// Writes the entry and stamps its heartbeat with the current time.
    async fn register(&self, entry: &InflightEntry) -> Result<()>;

    /// Refreshes heartbeats for `ids`. Only existing members are touched,
    /// and scores never move backwards.
    async fn heartbeat(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<()>;

    async fn remove(&self, id: Uuid) -> Result<()>;

    /// Entries whose heartbeat is older than `now - threshold`.
    async fn orphans(&self, threshold: Duration, now: DateTime<Utc>) -> Result<Vec<InflightEntry>>;

    /// Removes every entry owned by `owner_pid`.
    async fn drain_owner(&self, owner_pid: &str) -> Result<()>;

    /// SET-NX style lock acquisition; returns whether this owner now holds
    /// the lock.
    async fn acquire_gc_lock(&self, owner: &str, ttl: Duration) -> Result<bool>;

    /// Releases the lock only if `owner` still holds it.
    async fn release_gc_lock(&self, owner: &str) -> Result<()>;
}

/// Re-enqueues every orphaned entry's job envelope (bumping its retry count)
/// and removes the entry. The caller must hold the GC lock.
pub async fn cleanup_orphaned(
    store: &dyn InflightStore,
    queue: &dyn JobQueue,
    threshold: Duration,
) -> Result<usize> {
    let orphans = store.orphans(threshold, Utc::now()).await?;
    let mut recovered = 0usize;

    for entry in orphans {
        match entry.job_envelope {
            Some(mut envelope) => {
                envelope.retry_count = entry.retry_count.saturating_add(1);
                if let Err(err) = queue.push(envelope).await {
                    // Leave the entry in place; the next sweep retries it.
                    warn!(
                        request_id = %entry.request_id,
                        error = %err,
                        "failed to re-enqueue orphaned request"
                    );
                    continue;
                }
                info!(
                    request_id = %entry.request_id,
                    owner = %entry.owner_pid,
                    retry_count = entry.retry_count + 1,
                    "re-enqueued orphaned request"
                );
            }
            None => {
                warn!(
                    request_id = %entry.request_id,
                    owner = %entry.owner_pid,
                    "orphaned entry has no job envelope; discarding"
                );
            }
        }
        store.remove(entry.request_id).await?;
        recovered += 1;
    }

    if recovered > 0 {
        debug!(recovered, "orphan sweep finished");
    }
    Ok(recovered)
}

fn epoch_secs(when: DateTime<Utc>) -> f64 {
    when.timestamp_millis() as f64 / 1000.0
}

/// Process-local store used in tests and in deployments without a shared KV.
#[derive(Debug, Default)]
pub struct MemoryInflightStore {
    entries: Mutex<HashMap<Uuid, (InflightEntry, DateTime<Utc>)>>,
    lock: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl MemoryInflightStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .contains_key(&id)
    }

    pub fn heartbeat_of(&self, id: Uuid) -> Option<DateTime<Utc>> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .get(&id)
            .map(|(_, heartbeat)| *heartbeat)
    }

    pub fn entry(&self, id: Uuid) -> Option<InflightEntry> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .get(&id)
            .map(|(entry, _)| entry.clone())
    }

    /// Test helper: backdate an entry's heartbeat.
    pub fn set_heartbeat(&self, id: Uuid, when: DateTime<Utc>) {
        if let Some((_, heartbeat)) = self
            .entries
            .lock()
            .expect("registry lock poisoned")
            .get_mut(&id)
        {
            *heartbeat = when;
        }
    }
}

#[async_trait]
impl InflightStore for MemoryInflightStore {
    async fn register(&self, entry: &InflightEntry) -> Result<()> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .insert(entry.request_id, (entry.clone(), Utc::now()));
        Ok(())
    }

    async fn heartbeat(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<()> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        for id in ids {
            if let Some((_, heartbeat)) = entries.get_mut(id) {
                if now > *heartbeat {
                    *heartbeat = now;
                }
            }
        }
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .remove(&id);
        Ok(())
    }

    async fn orphans(&self, threshold: Duration, now: DateTime<Utc>) -> Result<Vec<InflightEntry>> {
        let cutoff = now - chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        Ok(self
            .entries
            .lock()
            .expect("registry lock poisoned")
            .values()
            .filter(|(_, heartbeat)| *heartbeat < cutoff)
            .map(|(entry, _)| entry.clone())
            .collect())
    }

    async fn drain_owner(&self, owner_pid: &str) -> Result<()> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .retain(|_, (entry, _)| entry.owner_pid != owner_pid);
        Ok(())
    }

    async fn acquire_gc_lock(&self, owner: &str, ttl: Duration) -> Result<bool> {
        let mut lock = self.lock.lock().expect("gc lock poisoned");
        let now = Utc::now();
        match &*lock {
            Some((holder, expires)) if *expires > now && holder != owner => Ok(false),
            _ => {
                *lock = Some((
                    owner.to_string(),
                    now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
                ));
                Ok(true)
            }
        }
    }

    async fn release_gc_lock(&self, owner: &str) -> Result<()> {
        let mut lock = self.lock.lock().expect("gc lock poisoned");
        if matches!(&*lock, Some((holder, _)) if holder == owner) {
            *lock = None;
        }
        Ok(())
    }
}

/// Shared registry over redis.
#[derive(Clone)]
pub struct RedisInflightStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisInflightStore {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
        })
    }

    pub fn with_connection(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    fn set_key(&self) -> String {
        format!("{}:inflight", self.prefix)
    }

    fn entry_key(&self, id: Uuid) -> String {
        format!("{}:inflight:{}", self.prefix, id)
    }

    fn lock_key(&self) -> String {
        format!("{}:inflight:gc_lock", self.prefix)
    }

    async fn load_entry(&self, id: Uuid) -> Result<Option<InflightEntry>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.entry_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let enqueued_at = fields
            .get("enqueued_at")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let owner_pid = fields.get("owner_pid").cloned().unwrap_or_default();
        let retry_count = fields
            .get("retry_count")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        let job_envelope = fields
            .get("job_envelope")
            .filter(|raw| !raw.is_empty())
            .and_then(|raw| serde_json::from_str(raw).ok());

        Ok(Some(InflightEntry {
            request_id: id,
            enqueued_at,
            owner_pid,
            job_envelope,
            retry_count,
        }))
    }
}

#[async_trait]
impl InflightStore for RedisInflightStore {
    async fn register(&self, entry: &InflightEntry) -> Result<()> {
        let mut conn = self.conn.clone();
        let envelope_json = match &entry.job_envelope {
            Some(envelope) => serde_json::to_string(envelope)?,
            None => String::new(),
        };
        let fields: Vec<(&str, String)> = vec![
            ("job_envelope", envelope_json),
            ("enqueued_at", entry.enqueued_at.to_rfc3339()),
            ("owner_pid", entry.owner_pid.clone()),
            ("retry_count", entry.retry_count.to_string()),
        ];

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(self.entry_key(entry.request_id), &fields)
            .ignore()
            .zadd(
                self.set_key(),
                entry.request_id.to_string(),
                epoch_secs(Utc::now()),
            )
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn heartbeat(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        // XX: only refresh members that still exist; GT keeps scores monotone.
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(self.set_key()).arg("XX").arg("GT");
        for id in ids {
            cmd.arg(epoch_secs(now)).arg(id.to_string());
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(self.entry_key(id))
            .ignore()
            .zrem(self.set_key(), id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn orphans(&self, threshold: Duration, now: DateTime<Utc>) -> Result<Vec<InflightEntry>> {
        let mut conn = self.conn.clone();
        let cutoff = epoch_secs(now) - threshold.as_secs_f64();
        let ids: Vec<String> = conn
            .zrangebyscore(self.set_key(), "-inf", cutoff)
            .await?;

        let mut entries = Vec::with_capacity(ids.len());
        for raw in ids {
            let Ok(id) = Uuid::parse_str(&raw) else {
                let _: () = conn.zrem(self.set_key(), &raw).await?;
                continue;
            };
            match self.load_entry(id).await? {
                Some(entry) => entries.push(entry),
                None => {
                    // Sorted-set member without a hash violates the layout
                    // invariant; drop the stray member.
                    let _: () = conn.zrem(self.set_key(), &raw).await?;
                }
            }
        }
        Ok(entries)
    }

    async fn drain_owner(&self, owner_pid: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrange(self.set_key(), 0, -1).await?;
        for raw in ids {
            let Ok(id) = Uuid::parse_str(&raw) else {
                continue;
            };
            let owner: Option<String> = conn.hget(self.entry_key(id), "owner_pid").await?;
            if owner.as_deref() == Some(owner_pid) {
                self.remove(id).await?;
            }
        }
        Ok(())
    }

    async fn acquire_gc_lock(&self, owner: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.lock_key())
            .arg(owner)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn release_gc_lock(&self, owner: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
            "#,
        );
        let _: i32 = script
            .key(self.lock_key())
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::queue::InMemoryQueue;

    fn entry(owner: &str) -> InflightEntry {
        InflightEntry {
            request_id: Uuid::new_v4(),
            enqueued_at: Utc::now(),
            owner_pid: owner.to_string(),
            job_envelope: Some(JobEnvelope::new("jobs::Fetch", vec![json!("arg")])),
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn memory_store_registers_and_removes() {
        let store = MemoryInflightStore::new();
        let entry = entry("host:1");
        store.register(&entry).await.unwrap();
        assert!(store.contains(entry.request_id));

        store.remove(entry.request_id).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_touches_only_existing_ids_and_never_regresses() {
        let store = MemoryInflightStore::new();
        let entry = entry("host:1");
        store.register(&entry).await.unwrap();

        let before = store.heartbeat_of(entry.request_id).unwrap();
        let future = Utc::now() + chrono::Duration::seconds(5);
        store.heartbeat(&[entry.request_id], future).await.unwrap();
        let after = store.heartbeat_of(entry.request_id).unwrap();
        assert!(after >= before);
        assert_eq!(after, future);

        // A write with an older timestamp is ignored.
        store
            .heartbeat(&[entry.request_id], future - chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(store.heartbeat_of(entry.request_id).unwrap(), future);

        // Unknown ids are not created.
        store.heartbeat(&[Uuid::new_v4()], Utc::now()).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn gc_lock_is_mutually_exclusive() {
        let store = MemoryInflightStore::new();
        let ttl = Duration::from_secs(30);

        assert!(store.acquire_gc_lock("a", ttl).await.unwrap());
        assert!(!store.acquire_gc_lock("b", ttl).await.unwrap());

        // Releasing under the wrong owner is a no-op.
        store.release_gc_lock("b").await.unwrap();
        assert!(!store.acquire_gc_lock("b", ttl).await.unwrap());

        store.release_gc_lock("a").await.unwrap();
        assert!(store.acquire_gc_lock("b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_re_enqueues_each_orphan_exactly_once() {
        let store = MemoryInflightStore::new();
        let queue = InMemoryQueue::new();
        let threshold = Duration::from_secs(300);

        let stale = entry("dead-host:9");
        store.register(&stale).await.unwrap();
        store.set_heartbeat(
            stale.request_id,
            Utc::now() - chrono::Duration::seconds(3000),
        );

        let fresh = entry("live-host:1");
        store.register(&fresh).await.unwrap();

        let recovered = cleanup_orphaned(&store, &queue, threshold).await.unwrap();
        assert_eq!(recovered, 1);
        assert!(!store.contains(stale.request_id));
        assert!(store.contains(fresh.request_id));

        let pushed = queue.pushed();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].class, "jobs::Fetch");
        assert_eq!(pushed[0].retry_count, 1);

        // A second sweep finds nothing.
        let recovered = cleanup_orphaned(&store, &queue, threshold).await.unwrap();
        assert_eq!(recovered, 0);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn drain_owner_removes_only_that_owner() {
        let store = MemoryInflightStore::new();
        let mine = entry("host:1");
        let theirs = entry("host:2");
        store.register(&mine).await.unwrap();
        store.register(&theirs).await.unwrap();

        store.drain_owner("host:1").await.unwrap();
        assert!(!store.contains(mine.request_id));
        assert!(store.contains(theirs.request_id));
    }

    // Redis-backed coverage requires a running server:
    // docker run -d -p 6379:6379 redis:7-alpine
    #[tokio::test]
    #[ignore]
    async fn redis_store_register_heartbeat_remove() {
        let store = RedisInflightStore::connect("redis://127.0.0.1:6379", "offramp_test")
            .await
            .unwrap();
        let entry = entry("host:redis");

        store.register(&entry).await.unwrap();
        store
            .heartbeat(&[entry.request_id], Utc::now())
            .await
            .unwrap();

        let orphans = store
            .orphans(Duration::from_secs(0), Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(orphans.iter().any(|o| o.request_id == entry.request_id));

        store.remove(entry.request_id).await.unwrap();
        let orphans = store
            .orphans(Duration::from_secs(0), Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(!orphans.iter().any(|o| o.request_id == entry.request_id));
    }

    #[tokio::test]
    #[ignore]
    async fn redis_gc_lock_round_trip() {
        let store = RedisInflightStore::connect("redis://127.0.0.1:6379", "offramp_test_lock")
            .await
            .unwrap();
        let ttl = Duration::from_secs(5);

        assert!(store.acquire_gc_lock("a", ttl).await.unwrap());
        assert!(!store.acquire_gc_lock("b", ttl).await.unwrap());
        store.release_gc_lock("a").await.unwrap();
        assert!(store.acquire_gc_lock("b", ttl).await.unwrap());
        store.release_gc_lock("b").await.unwrap();
    }
}
