use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::limits::MAX_CACHE_KEY_LEN;
use crate::model::{Ms, now_ms};
use crate::singleflight::SingleFlight;
use crate::wal::{CacheRecord, Wal};

/// Lifetime of a cached value in milliseconds, either fixed up front or
/// computed from the produced value (server-supplied expiry).
pub enum Ttl<T> {
    Fixed(Ms),
    FromValue(Arc<dyn Fn(&T) -> Ms + Send + Sync>),
}

impl<T> Ttl<T> {
    pub fn from_value(f: impl Fn(&T) -> Ms + Send + Sync + 'static) -> Self {
        Ttl::FromValue(Arc::new(f))
    }

    fn resolve(&self, value: &T) -> Ms {
        match self {
            Ttl::Fixed(ms) => *ms,
            Ttl::FromValue(f) => f(value),
        }
    }
}

impl<T> Clone for Ttl<T> {
    fn clone(&self) -> Self {
        match self {
            Ttl::Fixed(ms) => Ttl::Fixed(*ms),
            Ttl::FromValue(f) => Ttl::FromValue(f.clone()),
        }
    }
}

impl<T> From<Ms> for Ttl<T> {
    fn from(ms: Ms) -> Self {
        Ttl::Fixed(ms)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Ms,
}

impl CacheEntry {
    fn is_live(&self, now: Ms) -> bool {
        self.expires_at > now
    }
}

// ── Group-commit journal channel ─────────────────────────

enum JournalCommand {
    Append {
        record: CacheRecord,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<CacheRecord>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Batch = Vec<(CacheRecord, oneshot::Sender<io::Result<()>>)>;

/// Background task that owns the journal and batches appends:
/// block for the first append, drain whatever else is queued, then one
/// flush+fsync for the whole batch and answer every sender.
async fn journal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            JournalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(JournalCommand::Append { record, response }) => {
                            batch.push((record, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Batch) {
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut append_err: Option<io::Error> = None;
    for (record, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    let failure = append_err.or(flush_err);
    for (_, tx) in batch.drain(..) {
        let r = match &failure {
            None => Ok(()),
            Some(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { records, response } => {
            let _ = response.send(wal.compact(&records));
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        JournalCommand::Append { record, response } => {
            let mut batch = vec![(record, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// TTL key/value cache with request coalescing.
///
/// Shared by every venue context in the process; keys are namespaced by the
/// caller. When opened on a path, every mutation is journaled so entries
/// survive a restart.
pub struct Cache {
    entries: DashMap<String, CacheEntry>,
    flights: SingleFlight<String, Value>,
    journal_tx: Option<mpsc::Sender<JournalCommand>>,
}

impl Cache {
    /// Cache without persistence.
    pub fn in_memory() -> Self {
        Self {
            entries: DashMap::new(),
            flights: SingleFlight::new(),
            journal_tx: None,
        }
    }

    /// Open a journaled cache, restoring every entry that has not expired.
    /// Must be called from within a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let records = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (journal_tx, journal_rx) = mpsc::channel(4096);
        tokio::spawn(journal_writer_loop(wal, journal_rx));

        let entries = DashMap::new();
        let now = now_ms();
        let replayed = records.len();
        for record in records {
            match record {
                CacheRecord::Set {
                    key,
                    value_json,
                    expires_at,
                } => {
                    if expires_at <= now {
                        entries.remove(&key);
                        continue;
                    }
                    match serde_json::from_str::<Value>(&value_json) {
                        Ok(value) => {
                            entries.insert(key, CacheEntry { value, expires_at });
                        }
                        Err(e) => warn!(key = %key, "skipping undecodable cache record: {e}"),
                    }
                }
                CacheRecord::Removed { key } => {
                    entries.remove(&key);
                }
            }
        }
        info!(
            path = %path.display(),
            replayed,
            live = entries.len(),
            "cache journal replayed"
        );

        Ok(Self {
            entries,
            flights: SingleFlight::new(),
            journal_tx: Some(journal_tx),
        })
    }

    async fn journal(&self, record: CacheRecord) -> Result<(), SyncError> {
        let Some(tx) = &self.journal_tx else {
            return Ok(());
        };
        let (response, rx) = oneshot::channel();
        tx.send(JournalCommand::Append { record, response })
            .await
            .map_err(|_| SyncError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| SyncError::Journal("journal writer dropped response".into()))?
            .map_err(|e| SyncError::Journal(e.to_string()))
    }

    fn live_value(&self, key: &str, now: Ms) -> Option<Value> {
        {
            let entry = self.entries.get(key)?;
            if entry.is_live(now) {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, e| !e.is_live(now));
        None
    }

    /// Live value for `key`, if any. Expired entries are dropped on read.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.live_value(key, now_ms())?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(key, "cached value has unexpected shape: {e}");
                None
            }
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.live_value(key, now_ms()).is_some()
    }

    /// Store `value` for `ttl_ms`. A non-positive TTL deletes the key.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl_ms: Ms) -> Result<(), SyncError> {
        let value = serde_json::to_value(value)?;
        self.set_value(key, value, ttl_ms).await
    }

    async fn set_value(&self, key: &str, value: Value, ttl_ms: Ms) -> Result<(), SyncError> {
        if key.len() > MAX_CACHE_KEY_LEN {
            return Err(SyncError::LimitExceeded("cache key too long"));
        }
        let now = now_ms();
        let expires_at = now.saturating_add(ttl_ms);
        if ttl_ms <= 0 || expires_at <= now {
            return self.remove(key).await;
        }
        self.journal(CacheRecord::Set {
            key: key.to_string(),
            value_json: value.to_string(),
            expires_at,
        })
        .await?;
        self.entries
            .insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), SyncError> {
        if self.entries.remove(key).is_some() {
            self.journal(CacheRecord::Removed {
                key: key.to_string(),
            })
            .await?;
        }
        Ok(())
    }

    /// Return the live value for `key`, or run `producer` to compute it.
    ///
    /// Concurrent callers on the same missing key share one producer run. The
    /// value is stored before the in-flight marker clears. A producer error
    /// reaches every coalesced caller and nothing is cached.
    pub async fn wrap<T, F, Fut>(
        self: &Arc<Self>,
        key: &str,
        ttl: Ttl<T>,
        producer: F,
    ) -> Result<T, SyncError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        if let Some(value) = self.live_value(key, now_ms()) {
            match serde_json::from_value(value) {
                Ok(v) => {
                    metrics::counter!(crate::observability::CACHE_HITS_TOTAL).increment(1);
                    return Ok(v);
                }
                Err(e) => debug!(key, "recomputing cached value with unexpected shape: {e}"),
            }
        }

        let cache = self.clone();
        let owned_key = key.to_string();
        let value = self
            .flights
            .run(key.to_string(), move || cache.fill(owned_key, ttl, producer))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Body of a `wrap` flight. A flight that landed between the caller's
    /// lookup and this run has already stored the value.
    async fn fill<T, F, Fut>(self: Arc<Self>, key: String, ttl: Ttl<T>, producer: F) -> Result<Value, SyncError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        if let Some(value) = self.live_value(&key, now_ms())
            && serde_json::from_value::<T>(value.clone()).is_ok()
        {
            metrics::counter!(crate::observability::CACHE_HITS_TOTAL).increment(1);
            return Ok(value);
        }
        metrics::counter!(crate::observability::CACHE_MISSES_TOTAL).increment(1);
        let produced = producer().await?;
        let ttl_ms = ttl.resolve(&produced);
        let value = serde_json::to_value(&produced)?;
        if let Err(e) = self.set_value(&key, value.clone(), ttl_ms).await {
            warn!(key = %key, "failed to store produced value: {e}");
        }
        Ok(value)
    }

    /// Drop every entry expired at `now`. Returns how many were removed.
    pub fn purge_expired(&self, now: Ms) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_live(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            metrics::counter!(crate::observability::CACHE_EXPIRED_TOTAL).increment(removed as u64);
        }
        removed
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_persistent(&self) -> bool {
        self.journal_tx.is_some()
    }

    /// Rewrite the journal with only the live entries.
    pub async fn compact(&self) -> Result<(), SyncError> {
        let Some(tx) = &self.journal_tx else {
            return Ok(());
        };
        let now = now_ms();
        let records: Vec<CacheRecord> = self
            .entries
            .iter()
            .filter(|e| e.value().is_live(now))
            .map(|e| CacheRecord::Set {
                key: e.key().clone(),
                value_json: e.value().value.to_string(),
                expires_at: e.value().expires_at,
            })
            .collect();

        let (response, rx) = oneshot::channel();
        tx.send(JournalCommand::Compact { records, response })
            .await
            .map_err(|_| SyncError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| SyncError::Journal("journal writer dropped response".into()))?
            .map_err(|e| SyncError::Journal(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let Some(tx) = &self.journal_tx else {
            return 0;
        };
        let (response, rx) = oneshot::channel();
        if tx
            .send(JournalCommand::AppendsSinceCompact { response })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio_test::{assert_err, assert_ok};

    fn test_journal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("parksync_test_cache");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn set_get_and_overwrite() {
        let cache = Cache::in_memory();
        assert_ok!(cache.set("a", &1u32, 60_000).await);
        assert_eq!(cache.get::<u32>("a"), Some(1));
        assert_ok!(cache.set("a", &2u32, 60_000).await);
        assert_eq!(cache.get::<u32>("a"), Some(2));
        assert_eq!(cache.get::<u32>("missing"), None);
    }

    #[tokio::test]
    async fn non_positive_ttl_deletes() {
        let cache = Cache::in_memory();
        cache.set("a", &"x", 60_000).await.unwrap();
        cache.set("a", &"y", 0).await.unwrap();
        assert_eq!(cache.get::<String>("a"), None);
        cache.set("b", &"x", 60_000).await.unwrap();
        cache.set("b", &"y", -5).await.unwrap();
        assert!(!cache.contains_key("b"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn expired_entry_is_dropped_on_read() {
        let cache = Cache::in_memory();
        cache.set("a", &1u32, 20).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get::<u32>("a"), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn purge_expired_counts() {
        let cache = Cache::in_memory();
        cache.set("short", &1u32, 10).await.unwrap();
        cache.set("long", &2u32, 60_000).await.unwrap();
        assert_eq!(cache.purge_expired(now_ms() + 1_000), 1);
        assert_eq!(cache.get::<u32>("long"), Some(2));
    }

    #[tokio::test]
    async fn key_length_limited() {
        let cache = Cache::in_memory();
        let key = "k".repeat(MAX_CACHE_KEY_LEN + 1);
        let result = cache.set(&key, &1u32, 1_000).await;
        assert_eq!(result, Err(SyncError::LimitExceeded("cache key too long")));
    }

    #[tokio::test]
    async fn wrap_coalesces_concurrent_misses() {
        let cache = Arc::new(Cache::in_memory());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .wrap("wdw:parks", Ttl::Fixed(60_000), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(vec!["mk".to_string(), "epcot".to_string()])
                    })
                    .await
            }));
        }
        for h in handles {
            let parks = h.await.unwrap().unwrap();
            assert_eq!(parks, vec!["mk".to_string(), "epcot".to_string()]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Served from cache afterwards
        let again: Vec<String> = cache
            .wrap("wdw:parks", Ttl::Fixed(60_000), || async { Ok(Vec::<String>::new()) })
            .await
            .unwrap();
        assert_eq!(again.len(), 2);
    }

    #[tokio::test]
    async fn wrap_failure_is_shared_and_not_cached() {
        let cache = Arc::new(Cache::in_memory());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .wrap("token", Ttl::Fixed(60_000), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err::<String, _>(SyncError::Adapter("401".into()))
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Err(SyncError::Adapter("401".into())));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.contains_key("token"));

        let ok = cache
            .wrap("token", Ttl::Fixed(60_000), || async { Ok("abc".to_string()) })
            .await;
        assert_eq!(ok, Ok("abc".to_string()));
    }

    #[tokio::test]
    async fn wrap_ttl_from_value() {
        #[derive(Serialize, serde::Deserialize)]
        struct Token {
            token: String,
            expires_in_ms: Ms,
        }

        let cache = Arc::new(Cache::in_memory());
        let ttl = Ttl::from_value(|t: &Token| t.expires_in_ms);
        let token = cache
            .wrap("auth", ttl.clone(), || async {
                Ok(Token {
                    token: "t1".into(),
                    expires_in_ms: 20,
                })
            })
            .await
            .unwrap();
        assert_eq!(token.token, "t1");
        assert!(cache.contains_key("auth"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        let refreshed = cache
            .wrap("auth", ttl, || async {
                Ok(Token {
                    token: "t2".into(),
                    expires_in_ms: 60_000,
                })
            })
            .await
            .unwrap();
        assert_eq!(refreshed.token, "t2");
    }

    #[tokio::test]
    async fn late_flight_reuses_value_stored_by_earlier_flight() {
        let cache = Arc::new(Cache::in_memory());
        let calls = Arc::new(AtomicUsize::new(0));
        // A caller that missed before the earlier flight stored its value
        // still starts a flight of its own.
        cache.set("wdw:token", &"abc".to_string(), 60_000).await.unwrap();

        let counted = calls.clone();
        let value = cache
            .clone()
            .fill("wdw:token".to_string(), Ttl::Fixed(60_000), move || async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok("def".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!("abc"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.get::<String>("wdw:token"), Some("abc".to_string()));

        // A stored value of the wrong shape is recomputed
        let count = cache
            .clone()
            .fill("wdw:token".to_string(), Ttl::Fixed(60_000), || async { Ok(3u32) })
            .await
            .unwrap();
        assert_eq!(count, serde_json::json!(3));
    }

    #[tokio::test]
    async fn wrap_with_non_positive_ttl_does_not_store() {
        let cache = Arc::new(Cache::in_memory());
        let v = cache.wrap("k", Ttl::Fixed(0), || async { Ok(5u8) }).await.unwrap();
        assert_eq!(v, 5);
        assert!(!cache.contains_key("k"));
    }

    #[tokio::test]
    async fn journal_survives_reopen() {
        let path = test_journal_path("reopen.journal");
        {
            let cache = Cache::open(&path).unwrap();
            assert!(cache.is_persistent());
            cache.set("keep", &serde_json::json!({"a": 1}), 60_000).await.unwrap();
            cache.set("drop", &1u32, 60_000).await.unwrap();
            cache.remove("drop").await.unwrap();
            cache.set("short", &1u32, 10).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        let reopened = Cache::open(&path).unwrap();
        assert_eq!(
            reopened.get::<serde_json::Value>("keep"),
            Some(serde_json::json!({"a": 1}))
        );
        assert!(!reopened.contains_key("drop"));
        assert!(!reopened.contains_key("short"));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn compact_keeps_live_entries() {
        let path = test_journal_path("compact.journal");
        {
            let cache = Cache::open(&path).unwrap();
            for i in 0..50u32 {
                cache.set("counter", &i, 60_000).await.unwrap();
            }
            assert_eq!(cache.appends_since_compact().await, 50);
            let before = std::fs::metadata(&path).unwrap().len();
            assert_ok!(cache.compact().await);
            assert_eq!(cache.appends_since_compact().await, 0);
            let after = std::fs::metadata(&path).unwrap().len();
            assert!(after < before);
            cache.set("other", &true, 60_000).await.unwrap();
        }
        let reopened = Cache::open(&path).unwrap();
        assert_eq!(reopened.get::<u32>("counter"), Some(49));
        assert_eq!(reopened.get::<bool>("other"), Some(true));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn in_memory_compact_is_noop() {
        let cache = Cache::in_memory();
        assert_ok!(cache.compact().await);
        assert_eq!(cache.appends_since_compact().await, 0);
        assert_err!(cache.set(&"x".repeat(2_000), &1u8, 10).await);
    }
}
