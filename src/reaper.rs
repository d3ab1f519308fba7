use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::model::now_ms;

/// Background task that periodically drops expired cache entries.
/// Reads already ignore them; this only bounds memory.
pub async fn run_sweeper(cache: Arc<Cache>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let removed = cache.purge_expired(now_ms());
        if removed > 0 {
            debug!(removed, "swept expired cache entries");
        }
    }
}

/// Background task that rewrites the cache journal once enough appends have
/// piled up since the last compaction.
pub async fn run_compactor(cache: Arc<Cache>, threshold: u64, period: Duration) {
    if !cache.is_persistent() {
        return;
    }
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let appends = cache.appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match cache.compact().await {
            Ok(()) => info!(appends, live = cache.len(), "compacted cache journal"),
            Err(e) => warn!(error = %e, "cache journal compaction failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_journal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("parksync_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn sweeper_purges_expired_entries() {
        let cache = Arc::new(Cache::in_memory());
        cache.set("short", &1u32, 10).await.unwrap();
        cache.set("long", &2u32, 60_000).await.unwrap();
        assert_eq!(cache.len(), 2);

        let task = tokio::spawn(run_sweeper(cache.clone(), Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(60)).await;
        task.abort();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get::<u32>("long"), Some(2));
    }

    #[tokio::test]
    async fn compactor_rewrites_after_threshold() {
        let path = test_journal_path("compactor.journal");
        let cache = Arc::new(Cache::open(&path).unwrap());
        for i in 0..20u32 {
            cache.set("wait", &i, 60_000).await.unwrap();
        }
        assert_eq!(cache.appends_since_compact().await, 20);

        let task = tokio::spawn(run_compactor(cache.clone(), 10, Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(60)).await;
        task.abort();

        assert_eq!(cache.appends_since_compact().await, 0);
        assert_eq!(cache.get::<u32>("wait"), Some(19));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn compactor_exits_for_in_memory_cache() {
        let cache = Arc::new(Cache::in_memory());
        tokio::time::timeout(
            Duration::from_millis(100),
            run_compactor(cache, 1, Duration::from_millis(10)),
        )
        .await
        .unwrap();
    }
}
