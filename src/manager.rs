use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapter::Adapter;
use crate::cache::Cache;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::limits::*;
use crate::observability;
use crate::reaper;
use crate::venue::{Venue, VenueSettings};

/// Registry of venue contexts sharing one cache. Each registered venue gets
/// its own scheduler task.
pub struct VenueManager {
    venues: DashMap<String, Arc<Venue>>,
    schedulers: DashMap<String, JoinHandle<()>>,
    cache: Arc<Cache>,
    settings: VenueSettings,
    maintenance: Vec<JoinHandle<()>>,
}

impl VenueManager {
    /// Manager over an existing cache. No background maintenance is spawned.
    pub fn new(cache: Arc<Cache>, settings: VenueSettings) -> Self {
        Self {
            venues: DashMap::new(),
            schedulers: DashMap::new(),
            cache,
            settings,
            maintenance: Vec::new(),
        }
    }

    /// Open the cache described by `config` and spawn its sweeper and
    /// compactor. Must be called from within a tokio runtime.
    pub fn from_config(config: &SyncConfig) -> std::io::Result<Self> {
        let cache = match &config.cache_path {
            Some(path) => Arc::new(Cache::open(path)?),
            None => Arc::new(Cache::in_memory()),
        };

        let mut maintenance = vec![tokio::spawn(reaper::run_sweeper(
            cache.clone(),
            Duration::from_millis(CACHE_SWEEP_INTERVAL_MS),
        ))];
        if cache.is_persistent() {
            maintenance.push(tokio::spawn(reaper::run_compactor(
                cache.clone(),
                config.compact_threshold,
                Duration::from_millis(COMPACT_CHECK_INTERVAL_MS),
            )));
        }
        info!(
            persistent = cache.is_persistent(),
            entries = cache.len(),
            "venue manager ready"
        );

        Ok(Self {
            maintenance,
            ..Self::new(cache, config.venue_settings())
        })
    }

    /// Process entry point: install the log subscriber and the metrics
    /// exporter described by `config`, then open the manager.
    pub fn start(config: &SyncConfig) -> std::io::Result<Self> {
        observability::init_tracing();
        observability::init(config.metrics_port);
        info!(
            cache_path = ?config.cache_path,
            metrics_port = ?config.metrics_port,
            update_interval_ms = config.update_interval.as_millis() as u64,
            "starting parksync"
        );
        Self::from_config(config)
    }

    /// `start` with settings read from `PARKSYNC_*` environment variables.
    pub fn start_from_env() -> std::io::Result<Self> {
        Self::start(&SyncConfig::from_env())
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Register a venue with the manager's default settings and start its
    /// scheduler.
    pub fn register(&self, id: &str, timezone: Tz, adapter: Arc<dyn Adapter>) -> Result<Arc<Venue>, SyncError> {
        self.register_with(id, timezone, self.settings.clone(), adapter)
    }

    pub fn register_with(
        &self,
        id: &str,
        timezone: Tz,
        settings: VenueSettings,
        adapter: Arc<dyn Adapter>,
    ) -> Result<Arc<Venue>, SyncError> {
        if self.venues.len() >= MAX_VENUES {
            return Err(SyncError::LimitExceeded("too many venues"));
        }
        let venue = match self.venues.entry(id.to_string()) {
            Entry::Occupied(_) => {
                return Err(SyncError::InvalidVenue(format!("venue {id} already registered")));
            }
            Entry::Vacant(e) => {
                let venue = Venue::new(id, timezone, settings, adapter, self.cache.clone())?;
                e.insert(venue.clone());
                venue
            }
        };
        self.schedulers.insert(id.to_string(), venue.start());
        metrics::gauge!(crate::observability::VENUES_ACTIVE).set(self.venues.len() as f64);
        info!(venue = id, timezone = %timezone, "venue registered");
        Ok(venue)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Venue>> {
        self.venues.get(id).map(|v| v.value().clone())
    }

    /// Registered venue ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.venues.iter().map(|v| v.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.venues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.venues.is_empty()
    }

    /// Stop a venue's scheduler and forget it. Its cached snapshots stay.
    pub async fn unregister(&self, id: &str) -> Option<Arc<Venue>> {
        let (_, venue) = self.venues.remove(id)?;
        venue.disable_updates();
        if let Some((_, handle)) = self.schedulers.remove(id)
            && let Err(e) = handle.await
        {
            warn!(venue = id, error = %e, "scheduler task ended abnormally");
        }
        metrics::gauge!(crate::observability::VENUES_ACTIVE).set(self.venues.len() as f64);
        Some(venue)
    }

    /// Stop every scheduler, wait for in-flight updates, then compact the
    /// cache journal.
    pub async fn shutdown(&self) {
        for venue in self.venues.iter() {
            venue.disable_updates();
        }
        let ids: Vec<String> = self.schedulers.iter().map(|h| h.key().clone()).collect();
        for id in ids {
            if let Some((_, handle)) = self.schedulers.remove(&id)
                && let Err(e) = handle.await
            {
                warn!(venue = %id, error = %e, "scheduler task ended abnormally");
            }
        }
        for task in &self.maintenance {
            task.abort();
        }
        if let Err(e) = self.cache.compact().await {
            warn!(error = %e, "final journal compaction failed");
        }
        info!(venues = self.venues.len(), "venue manager shut down");
    }
}
