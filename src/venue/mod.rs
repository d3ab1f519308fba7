mod calendar;
mod registry;
mod scheduler;

pub use registry::{Registry, normalize_wait};
pub use scheduler::{LifecycleState, run_scheduler};

use std::sync::atomic::{AtomicBool, AtomicU8};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use chrono_tz::Tz;
use tokio::sync::{Notify, RwLock};

use crate::adapter::Adapter;
use crate::cache::Cache;
use crate::error::SyncError;
use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::singleflight::SingleFlight;
use crate::tags::TagKind;

pub type SharedAttraction = Arc<RwLock<Attraction>>;

/// Operations a venue exposes to outer layers (debug views, HTTP glue).
pub const OPERATIONS: &[&str] = &[
    "init",
    "update",
    "find_or_create",
    "update_status",
    "update_queue",
    "set_tag",
    "remove_tag",
    "toggle_tag",
    "operating_hours",
    "calendar",
    "active_park_date",
    "next_opening_time",
    "next_closing_time",
    "is_open",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VenueSettings {
    pub update_interval: Duration,
    pub max_update_attempts: u32,
    pub retry_delay: Duration,
    /// Rolling calendar length in days, counted from yesterday.
    pub calendar_days: u32,
}

impl Default for VenueSettings {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_millis(DEFAULT_UPDATE_INTERVAL_MS),
            max_update_attempts: DEFAULT_MAX_UPDATE_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            calendar_days: DEFAULT_CALENDAR_DAYS,
        }
    }
}

/// One park or destination: an adapter driving one registry + scheduler pair.
pub struct Venue {
    id: String,
    timezone: Tz,
    settings: VenueSettings,
    adapter: Arc<dyn Adapter>,
    cache: Arc<Cache>,
    pub notify: Arc<NotifyHub>,
    registry: Arc<Registry>,
    lifecycle: AtomicU8,
    init_flight: SingleFlight<(), ()>,
    update_flight: SingleFlight<(), ()>,
    /// Last recorded active park date; compared after every update.
    active_date: Mutex<Option<NaiveDate>>,
    updates_disabled: AtomicBool,
    shutdown: Notify,
}

/// Venue ids end up inside cache keys and attraction ids.
fn validate_venue_id(id: &str) -> Result<(), SyncError> {
    if id.is_empty() {
        return Err(SyncError::InvalidVenue("empty venue id".into()));
    }
    if id.len() > MAX_VENUE_ID_LEN {
        return Err(SyncError::LimitExceeded("venue id too long"));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(SyncError::InvalidVenue(format!(
            "venue id {id:?} may only contain ASCII letters, digits and '-'"
        )));
    }
    Ok(())
}

impl Venue {
    pub fn new(
        id: &str,
        timezone: Tz,
        settings: VenueSettings,
        adapter: Arc<dyn Adapter>,
        cache: Arc<Cache>,
    ) -> Result<Arc<Self>, SyncError> {
        validate_venue_id(id)?;
        let notify = Arc::new(NotifyHub::new());
        let registry = Arc::new(Registry::new(
            id.to_string(),
            adapter.clone(),
            cache.clone(),
            notify.clone(),
        ));
        Ok(Arc::new(Self {
            id: id.to_string(),
            timezone,
            settings,
            adapter,
            cache,
            notify,
            registry,
            lifecycle: AtomicU8::new(LifecycleState::Uninitialized as u8),
            init_flight: SingleFlight::new(),
            update_flight: SingleFlight::new(),
            active_date: Mutex::new(None),
            updates_disabled: AtomicBool::new(false),
            shutdown: Notify::new(),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn settings(&self) -> &VenueSettings {
        &self.settings
    }

    /// Shared cache, also available to adapters for their upstream fetches.
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn operations() -> &'static [&'static str] {
        OPERATIONS
    }

    // ── Registry ─────────────────────────────────────────────

    pub async fn find_or_create(&self, local_id: &str) -> Option<SharedAttraction> {
        self.registry.find_or_create(local_id).await
    }

    /// Current snapshot of an attraction already in the registry.
    pub async fn attraction(&self, local_id: &str) -> Option<Attraction> {
        let shared = self.registry.get(local_id)?;
        let guard = shared.read().await;
        Some(guard.clone())
    }

    pub async fn attractions(&self) -> Vec<Attraction> {
        self.registry.snapshot().await
    }

    pub fn attraction_count(&self) -> usize {
        self.registry.attraction_count()
    }

    pub async fn update_status(&self, local_id: &str, value: StatusValue) {
        self.registry.update_status(local_id, value).await
    }

    /// `None` removes the queue. Numeric queue kinds accept a wait in minutes;
    /// structured kinds store the payload as-is.
    pub async fn update_queue(&self, local_id: &str, kind: QueueKind, value: Option<serde_json::Value>) {
        self.registry.update_queue(local_id, kind, value).await
    }

    // ── Tags ─────────────────────────────────────────────────

    pub async fn set_tag(
        &self,
        local_id: &str,
        key: Option<&str>,
        kind: TagKind,
        value: Option<serde_json::Value>,
    ) -> bool {
        self.registry.set_tag(local_id, key, kind, value).await
    }

    /// Like `set_tag`, with the kind given by its wire name.
    pub async fn set_tag_named(
        &self,
        local_id: &str,
        key: Option<&str>,
        kind: &str,
        value: Option<serde_json::Value>,
    ) -> bool {
        match TagKind::parse(kind) {
            Some(kind) => self.registry.set_tag(local_id, key, kind, value).await,
            None => {
                tracing::debug!(venue = %self.id, kind, "rejecting unknown tag kind");
                false
            }
        }
    }

    pub async fn remove_tag(&self, local_id: &str, key: Option<&str>, kind: TagKind) -> bool {
        self.registry.remove_tag(local_id, key, kind).await
    }

    /// Presence-only tags: `true` sets, `false` removes.
    pub async fn toggle_tag(&self, local_id: &str, kind: TagKind, enabled: bool) -> bool {
        self.registry
            .set_tag(local_id, None, kind, Some(serde_json::Value::Bool(enabled)))
            .await
    }
}
