use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use chrono_tz::America::Los_Angeles;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;

use parksync::model::*;
use parksync::tags::TagKind;
use parksync::venue::VenueSettings;
use parksync::{Adapter, AdapterResult, AttractionTemplate, Cache, SyncError, Ttl, Venue, VenueManager};

// ── Test infrastructure ──────────────────────────────────────

#[derive(Clone)]
struct FeedRow {
    status: StatusValue,
    wait: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct Session {
    token: String,
    ttl_ms: Ms,
}

/// Stands in for a destination integration: a mutable upstream feed behind
/// a session token that the adapter caches through the venue cache.
#[derive(Default)]
struct FeedAdapter {
    feed: Mutex<HashMap<String, FeedRow>>,
    logins: Arc<AtomicUsize>,
}

impl FeedAdapter {
    fn set(&self, id: &str, status: StatusValue, wait: serde_json::Value) {
        self.feed
            .lock()
            .unwrap()
            .insert(id.to_string(), FeedRow { status, wait });
    }

    async fn session(&self, venue: &Venue) -> Result<Session, SyncError> {
        let logins = self.logins.clone();
        venue
            .cache()
            .wrap(
                &format!("{}:session", venue.id()),
                Ttl::from_value(|s: &Session| s.ttl_ms),
                move || async move {
                    let n = logins.fetch_add(1, Ordering::SeqCst) + 1;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(Session {
                        token: format!("token-{n}"),
                        ttl_ms: 60_000,
                    })
                },
            )
            .await
    }
}

#[async_trait]
impl Adapter for FeedAdapter {
    async fn init(&self, venue: &Venue) -> AdapterResult<()> {
        self.session(venue).await?;
        Ok(())
    }

    async fn update(&self, venue: &Venue) -> AdapterResult<()> {
        let session = self.session(venue).await?;
        if session.token.is_empty() {
            return Err("empty session".into());
        }
        let rows: Vec<(String, FeedRow)> = self
            .feed
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (id, row) in rows {
            venue.update_status(&id, row.status).await;
            venue.update_queue(&id, QueueKind::Standby, Some(row.wait)).await;
        }
        Ok(())
    }

    async fn build_attraction(&self, local_id: &str) -> AdapterResult<Option<AttractionTemplate>> {
        let template = match local_id {
            "matterhorn" => AttractionTemplate::new("Matterhorn Bobsleds", AttractionKind::Ride),
            "tiki" => AttractionTemplate::new("Enchanted Tiki Room", AttractionKind::Show),
            _ => return Ok(None),
        };
        Ok(Some(template))
    }

    async fn operating_hours(&self, _date: NaiveDate) -> AdapterResult<Option<Vec<CalendarWindow>>> {
        Ok(None)
    }
}

fn fast_settings() -> VenueSettings {
    VenueSettings {
        update_interval: Duration::from_millis(25),
        max_update_attempts: 2,
        retry_delay: Duration::from_millis(1),
        calendar_days: 7,
    }
}

async fn next_event(rx: &mut broadcast::Receiver<VenueEvent>) -> VenueEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .unwrap()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn subscriber_sees_changes_across_ticks() {
    let adapter = Arc::new(FeedAdapter::default());
    adapter.set("matterhorn", StatusValue::Operating, json!(40));

    let manager = VenueManager::new(Arc::new(Cache::in_memory()), fast_settings());
    let venue = manager
        .register_with("dlr", Los_Angeles, fast_settings(), adapter.clone())
        .unwrap();
    let mut rx = venue.notify.subscribe("dlr_matterhorn");

    match next_event(&mut rx).await {
        VenueEvent::AttractionCreated { attraction_id, .. } => assert_eq!(attraction_id, "dlr_matterhorn"),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(
        next_event(&mut rx).await,
        VenueEvent::StatusChanged { previous: None, .. }
    ));
    assert!(matches!(
        next_event(&mut rx).await,
        VenueEvent::QueueChanged { previous: None, .. }
    ));

    adapter.set("matterhorn", StatusValue::Down, json!(null));
    match next_event(&mut rx).await {
        VenueEvent::StatusChanged { attraction, previous } => {
            assert_eq!(previous, Some(StatusValue::Operating));
            assert_eq!(attraction.status_value(), Some(StatusValue::Down));
        }
        other => panic!("unexpected event {other:?}"),
    }
    match next_event(&mut rx).await {
        VenueEvent::QueueChanged { attraction, previous, .. } => {
            assert_eq!(previous, Some(Some(40)));
            assert_eq!(attraction.queues[&QueueKind::Standby].wait_time(), None);
        }
        other => panic!("unexpected event {other:?}"),
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn adapter_session_is_fetched_once() {
    let adapter = Arc::new(FeedAdapter::default());
    adapter.set("tiki", StatusValue::Operating, json!("5"));
    let cache = Arc::new(Cache::in_memory());
    let venue = Venue::new("dlr", Los_Angeles, fast_settings(), adapter.clone(), cache.clone()).unwrap();

    let (a, b, c) = tokio::join!(venue.update(), venue.update(), venue.update_with_retry());
    assert_eq!((a, b, c), (Ok(()), Ok(()), Ok(())));
    assert_eq!(adapter.logins.load(Ordering::SeqCst), 1);
    assert!(cache.contains_key("dlr:session"));

    let tiki = venue.attraction("tiki").await.unwrap();
    assert_eq!(tiki.kind, AttractionKind::Show);
    assert_eq!(tiki.queues[&QueueKind::Standby].wait_time(), Some(5));
}

#[tokio::test]
async fn unknown_feed_rows_are_ignored() {
    let adapter = Arc::new(FeedAdapter::default());
    adapter.set("monorail-ghost", StatusValue::Closed, json!(0));
    adapter.set("tiki", StatusValue::Refurbishment, json!(null));
    let venue = Venue::new(
        "dlr",
        Los_Angeles,
        fast_settings(),
        adapter,
        Arc::new(Cache::in_memory()),
    )
    .unwrap();

    venue.update().await.unwrap();
    let ids: Vec<String> = venue.attractions().await.into_iter().map(|a| a.id).collect();
    assert_eq!(ids, vec!["dlr_tiki".to_string()]);

    assert!(venue.toggle_tag("tiki", TagKind::OnRidePhoto, false).await);
    assert!(venue.toggle_tag("tiki", TagKind::UnsuitablePregnant, true).await);
    let tags = venue.attraction("tiki").await.unwrap().tags;
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].kind, TagKind::UnsuitablePregnant);
}

#[tokio::test]
async fn shared_cache_restores_state_for_new_manager() {
    let cache = Arc::new(Cache::in_memory());
    let adapter = Arc::new(FeedAdapter::default());
    adapter.set("matterhorn", StatusValue::Operating, json!(35));

    let first = Venue::new("dlr", Los_Angeles, fast_settings(), adapter.clone(), cache.clone()).unwrap();
    first.update().await.unwrap();
    let before = first.attraction("matterhorn").await.unwrap();

    let manager = VenueManager::new(cache, fast_settings());
    let idle = VenueSettings {
        update_interval: Duration::from_secs(3600),
        ..fast_settings()
    };
    adapter.feed.lock().unwrap().clear();
    let second = manager
        .register_with("dlr", Los_Angeles, idle, adapter.clone())
        .unwrap();
    let restored = second.find_or_create("matterhorn").await.unwrap();
    assert_eq!(restored.read().await.status, before.status);
    assert_eq!(restored.read().await.queues, before.queues);
    manager.shutdown().await;
}
