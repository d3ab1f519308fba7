use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::SharedAttraction;
use crate::adapter::Adapter;
use crate::cache::Cache;
use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::singleflight::SingleFlight;
use crate::tags::{self, Tag, TagChange, TagKind};

/// Attractions of one venue, keyed by adapter-local id.
///
/// Entities are created lazily on first reference and mirrored to the cache
/// after every mutation, so a fresh registry on the same cache picks up where
/// the last one left off.
pub struct Registry {
    venue_id: String,
    adapter: Arc<dyn Adapter>,
    cache: Arc<Cache>,
    notify: Arc<NotifyHub>,
    attractions: DashMap<String, SharedAttraction>,
    creating: SingleFlight<String, Option<SharedAttraction>>,
    /// Validated tag writes for attractions that do not exist yet.
    pending_tags: DashMap<String, Vec<Tag>>,
}

pub(crate) fn snapshot_key(venue_id: &str, attraction_id: &str) -> String {
    format!("{venue_id}:attraction:{attraction_id}")
}

/// Normalize a numeric queue payload to a wait in minutes.
/// Negative, non-finite or non-numeric input means "unknown".
pub fn normalize_wait(value: &Value) -> Option<u32> {
    let minutes = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !minutes.is_finite() || minutes < 0.0 {
        return None;
    }
    Some(minutes.round().min(u32::MAX as f64) as u32)
}

fn valid_local_id(local_id: &str) -> bool {
    !local_id.is_empty() && local_id.len() <= MAX_LOCAL_ID_LEN
}

impl Registry {
    pub fn new(
        venue_id: String,
        adapter: Arc<dyn Adapter>,
        cache: Arc<Cache>,
        notify: Arc<NotifyHub>,
    ) -> Self {
        Self {
            venue_id,
            adapter,
            cache,
            notify,
            attractions: DashMap::new(),
            creating: SingleFlight::new(),
            pending_tags: DashMap::new(),
        }
    }

    pub fn attraction_id(&self, local_id: &str) -> String {
        format!("{}_{}", self.venue_id, local_id)
    }

    pub fn get(&self, local_id: &str) -> Option<SharedAttraction> {
        self.attractions.get(local_id).map(|e| e.value().clone())
    }

    pub fn attraction_count(&self) -> usize {
        self.attractions.len()
    }

    /// Ids holding buffered tags for an attraction not created yet.
    pub fn pending_tag_ids(&self) -> usize {
        self.pending_tags.len()
    }

    /// Snapshots of every attraction, ordered by id.
    pub async fn snapshot(&self) -> Vec<Attraction> {
        let shared: Vec<SharedAttraction> = self.attractions.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for attraction in shared {
            out.push(attraction.read().await.clone());
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    async fn persist(&self, attraction: &Attraction) {
        let key = snapshot_key(&self.venue_id, &attraction.id);
        if let Err(e) = self.cache.set(&key, attraction, ATTRACTION_SNAPSHOT_TTL_MS).await {
            warn!(venue = %self.venue_id, attraction = %attraction.id, error = %e, "failed to persist snapshot");
        }
    }

    // ── Creation ─────────────────────────────────────────────

    /// Existing entity, or build it from adapter data. Concurrent calls for
    /// one id share a single build. `None` means "not found yet".
    pub async fn find_or_create(self: &Arc<Self>, local_id: &str) -> Option<SharedAttraction> {
        if let Some(existing) = self.get(local_id) {
            return Some(existing);
        }
        if !valid_local_id(local_id) {
            debug!(venue = %self.venue_id, "ignoring invalid local id");
            return None;
        }
        let registry = self.clone();
        let owned = local_id.to_string();
        self.creating
            .run(local_id.to_string(), move || async move { Ok(registry.create(owned).await) })
            .await
            .ok()
            .flatten()
    }

    async fn create(self: Arc<Self>, local_id: String) -> Option<SharedAttraction> {
        if let Some(existing) = self.get(&local_id) {
            return Some(existing);
        }
        let template = match self.adapter.build_attraction(&local_id).await {
            Ok(Some(template)) if !template.name.trim().is_empty() => template,
            Ok(_) => {
                debug!(venue = %self.venue_id, local_id = %local_id, "adapter has no attraction");
                return None;
            }
            Err(e) => {
                warn!(venue = %self.venue_id, local_id = %local_id, error = %e, "build_attraction failed");
                return None;
            }
        };
        if self.attractions.len() >= MAX_ATTRACTIONS_PER_VENUE {
            warn!(venue = %self.venue_id, local_id = %local_id, "attraction limit reached");
            return None;
        }

        let id = self.attraction_id(&local_id);
        let mut attraction = match self.cache.get::<Attraction>(&snapshot_key(&self.venue_id, &id)) {
            Some(cached) if cached.id == id => cached,
            _ => Attraction::new(id, local_id.clone(), template.name.clone(), template.kind),
        };
        attraction.name = template.name;
        attraction.kind = template.kind;
        for tag in template.tags {
            if !tags::apply(&mut attraction.tags, tag.key.as_deref(), tag.kind, tag.value) {
                debug!(venue = %self.venue_id, local_id = %local_id, kind = tag.kind.as_str(), "dropping invalid template tag");
            }
        }

        let shared: SharedAttraction = Arc::new(RwLock::new(attraction));
        let mut guard = shared.write().await;
        self.attractions.insert(local_id.clone(), shared.clone());
        // Tags buffered before this point are drained under the write lock;
        // later ones see the entity and apply directly.
        if let Some((_, pending)) = self.pending_tags.remove(&local_id) {
            for tag in pending {
                tags::apply(&mut guard.tags, tag.key.as_deref(), tag.kind, tag.value);
            }
        }
        self.persist(&guard).await;
        let event = VenueEvent::AttractionCreated {
            venue_id: self.venue_id.clone(),
            attraction_id: guard.id.clone(),
        };
        drop(guard);

        metrics::gauge!(crate::observability::ATTRACTIONS_ACTIVE, "venue" => self.venue_id.clone())
            .set(self.attractions.len() as f64);
        self.notify.send(&event);
        Some(shared)
    }

    // ── Live data ────────────────────────────────────────────

    pub async fn update_status(self: &Arc<Self>, local_id: &str, value: StatusValue) {
        let Some(shared) = self.find_or_create(local_id).await else {
            return;
        };
        let mut guard = shared.write().await;
        let now = now_ms();
        let previous = guard.status;
        let last_updated = previous.map_or(now, |p| now.max(p.last_updated));
        let changed = previous.map(|p| p.value) != Some(value);
        let last_changed = match previous {
            Some(p) if !changed => p.last_changed,
            _ => last_updated,
        };
        guard.status = Some(StatusRecord {
            value,
            last_updated,
            last_changed,
        });
        self.persist(&guard).await;
        let event = changed.then(|| VenueEvent::StatusChanged {
            attraction: guard.clone(),
            previous: previous.map(|p| p.value),
        });
        drop(guard);
        if let Some(event) = event {
            self.notify.send(&event);
        }
    }

    /// `None` removes the queue entry. Numeric kinds get change detection;
    /// structured kinds are stored as supplied.
    pub async fn update_queue(self: &Arc<Self>, local_id: &str, kind: QueueKind, value: Option<Value>) {
        let Some(shared) = self.find_or_create(local_id).await else {
            return;
        };
        let mut guard = shared.write().await;
        let now = now_ms();

        let event = match value {
            None => match guard.queues.remove(&kind) {
                Some(_) => Some(VenueEvent::QueueRemoved {
                    attraction: guard.clone(),
                    queue: kind,
                }),
                None => return,
            },
            Some(raw) if kind.is_numeric() => {
                let wait_time = normalize_wait(&raw);
                let previous = guard.queues.get(&kind).cloned();
                let (last_updated, last_changed, changed) = match &previous {
                    Some(QueueRecord::Wait {
                        wait_time: prev_wait,
                        last_updated,
                        last_changed,
                    }) => {
                        let updated = now.max(*last_updated);
                        if *prev_wait == wait_time {
                            (updated, *last_changed, false)
                        } else {
                            (updated, updated, true)
                        }
                    }
                    Some(QueueRecord::Structured { last_updated, .. }) => {
                        let updated = now.max(*last_updated);
                        (updated, updated, true)
                    }
                    None => (now, now, true),
                };
                guard.queues.insert(
                    kind,
                    QueueRecord::Wait {
                        wait_time,
                        last_updated,
                        last_changed,
                    },
                );
                changed.then(|| VenueEvent::QueueChanged {
                    attraction: guard.clone(),
                    queue: kind,
                    previous: previous.map(|p| p.wait_time()),
                })
            }
            Some(raw) => {
                let last_updated = match guard.queues.get(&kind) {
                    Some(QueueRecord::Wait { last_updated, .. })
                    | Some(QueueRecord::Structured { last_updated, .. }) => now.max(*last_updated),
                    None => now,
                };
                guard.queues.insert(
                    kind,
                    QueueRecord::Structured {
                        value: raw,
                        last_updated,
                    },
                );
                None
            }
        };

        self.persist(&guard).await;
        drop(guard);
        if let Some(event) = event {
            self.notify.send(&event);
        }
    }

    // ── Tags ─────────────────────────────────────────────────

    /// Validate and apply a tag write. Writes for attractions that do not
    /// exist yet are buffered until creation.
    pub async fn set_tag(&self, local_id: &str, key: Option<&str>, kind: TagKind, value: Option<Value>) -> bool {
        if let Some(shared) = self.get(local_id) {
            let mut guard = shared.write().await;
            if !tags::apply(&mut guard.tags, key, kind, value) {
                return false;
            }
            self.persist(&guard).await;
            return true;
        }

        if !valid_local_id(local_id) || tags::normalize(kind, value.clone()) == TagChange::Reject {
            return false;
        }
        if !self.pending_tags.contains_key(local_id) && self.pending_tags.len() >= MAX_PENDING_TAG_IDS {
            warn!(venue = %self.venue_id, local_id = %local_id, "pending tag buffer full");
            return false;
        }
        {
            let mut pending = self.pending_tags.entry(local_id.to_string()).or_default();
            if pending.len() >= MAX_PENDING_TAGS_PER_ID {
                return false;
            }
            pending.push(Tag::new(key, kind, value));
        }
        // Lost the race with creation: drain what creation missed.
        if self.attractions.contains_key(local_id) {
            self.drain_pending(local_id).await;
        }
        true
    }

    async fn drain_pending(&self, local_id: &str) {
        let Some(shared) = self.get(local_id) else {
            return;
        };
        let Some((_, pending)) = self.pending_tags.remove(local_id) else {
            return;
        };
        let mut guard = shared.write().await;
        for tag in pending {
            tags::apply(&mut guard.tags, tag.key.as_deref(), tag.kind, tag.value);
        }
        self.persist(&guard).await;
    }

    pub async fn remove_tag(&self, local_id: &str, key: Option<&str>, kind: TagKind) -> bool {
        if let Some(shared) = self.get(local_id) {
            let mut guard = shared.write().await;
            let removed = tags::remove(&mut guard.tags, key, kind);
            if removed {
                self.persist(&guard).await;
            }
            return removed;
        }
        let removed = match self.pending_tags.get_mut(local_id) {
            Some(mut pending) => tags::remove(&mut pending, key, kind),
            None => return false,
        };
        self.pending_tags.remove_if(local_id, |_, pending| pending.is_empty());
        removed
    }
}
