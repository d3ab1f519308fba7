use std::future::Future;
use std::hash::Hash;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::SyncError;

type Flight<T> = Shared<BoxFuture<'static, Result<T, SyncError>>>;

/// Coalescing map: key → in-flight shared future.
///
/// Concurrent `run` calls for the same key await one underlying future. The
/// marker is cleared once that future resolves, whether it succeeded or not,
/// so the next call starts a fresh computation.
pub struct SingleFlight<K, T> {
    calls: DashMap<K, Flight<T>>,
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the marker when the leading caller is done, even if it was dropped
/// mid-flight. Followers keep driving their own clone of the future.
struct Landing<'a, K: Eq + Hash, T> {
    calls: &'a DashMap<K, Flight<T>>,
    key: K,
    flight: Flight<T>,
}

impl<K: Eq + Hash, T> Drop for Landing<'_, K, T> {
    fn drop(&mut self) {
        self.calls
            .remove_if(&self.key, |_, current| current.ptr_eq(&self.flight));
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }

    /// Run `make()` for `key` unless a run is already in flight, in which case
    /// its result is shared. `make` must only build the future: it is called
    /// while the map entry is locked.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        let (flight, leader) = match self.calls.entry(key.clone()) {
            Entry::Occupied(e) => (e.get().clone(), false),
            Entry::Vacant(e) => {
                let flight = make().boxed().shared();
                e.insert(flight.clone());
                (flight, true)
            }
        };
        if !leader {
            metrics::counter!(crate::observability::COALESCED_CALLS_TOTAL).increment(1);
        }
        let _landing = leader.then(|| Landing {
            calls: &self.calls,
            key,
            flight: flight.clone(),
        });
        flight.await
    }

    pub fn in_flight(&self, key: &K) -> bool {
        self.calls.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_runs_share_one_call() {
        let flights: Arc<SingleFlight<String, u32>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let flights = flights.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .run("k".to_string(), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(7)
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Ok(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn failure_reaches_every_waiter_and_clears_marker() {
        let flights: Arc<SingleFlight<&'static str, u32>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let flights = flights.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .run("k", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err(SyncError::Adapter("upstream 503".into()))
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Err(SyncError::Adapter("upstream 503".into())));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!flights.in_flight(&"k"));

        // Next call runs again
        let result = flights.run("k", || async { Ok(1) }).await;
        assert_eq!(result, Ok(1));
    }

    #[tokio::test]
    async fn different_keys_do_not_coalesce() {
        let flights: SingleFlight<u8, u8> = SingleFlight::new();
        let (a, b) = tokio::join!(
            flights.run(1, || async { Ok(1) }),
            flights.run(2, || async { Ok(2) })
        );
        assert_eq!((a, b), (Ok(1), Ok(2)));
    }

    #[tokio::test]
    async fn dropped_leader_clears_marker() {
        let flights: Arc<SingleFlight<&'static str, u32>> = Arc::new(SingleFlight::new());
        let f = flights.clone();
        let leader = tokio::spawn(async move {
            f.run("k", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(1)
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(flights.in_flight(&"k"));
        leader.abort();
        let _ = leader.await;
        assert!(!flights.in_flight(&"k"));
    }
}
