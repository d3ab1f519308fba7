use std::path::PathBuf;
use std::time::Duration;

use crate::limits::*;
use crate::venue::VenueSettings;

/// Process-level settings, read from `PARKSYNC_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Cache journal location. `None` keeps the cache in memory only.
    pub cache_path: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub update_interval: Duration,
    pub max_update_attempts: u32,
    pub retry_delay: Duration,
    pub compact_threshold: u64,
    pub calendar_days: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_path: None,
            metrics_port: None,
            update_interval: Duration::from_millis(DEFAULT_UPDATE_INTERVAL_MS),
            max_update_attempts: DEFAULT_MAX_UPDATE_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            calendar_days: DEFAULT_CALENDAR_DAYS,
        }
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|s| s.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unparseable values fall back
    /// to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let cache_path = lookup("PARKSYNC_CACHE_PATH")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let metrics_port: Option<u16> = parse_var(&lookup, "PARKSYNC_METRICS_PORT");
        let update_interval = parse_var::<u64>(&lookup, "PARKSYNC_UPDATE_INTERVAL_SECS")
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.update_interval);
        let max_update_attempts = parse_var::<u32>(&lookup, "PARKSYNC_MAX_UPDATE_ATTEMPTS")
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_update_attempts);
        let retry_delay = parse_var::<u64>(&lookup, "PARKSYNC_RETRY_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_delay);
        let compact_threshold = parse_var(&lookup, "PARKSYNC_COMPACT_THRESHOLD")
            .unwrap_or(defaults.compact_threshold);
        let calendar_days = parse_var::<u32>(&lookup, "PARKSYNC_CALENDAR_DAYS")
            .map(|d| d.clamp(1, MAX_CALENDAR_DAYS))
            .unwrap_or(defaults.calendar_days);

        Self {
            cache_path,
            metrics_port,
            update_interval,
            max_update_attempts,
            retry_delay,
            compact_threshold,
            calendar_days,
        }
    }

    /// Default settings for venues registered under this config.
    pub fn venue_settings(&self) -> VenueSettings {
        VenueSettings {
            update_interval: self.update_interval,
            max_update_attempts: self.max_update_attempts,
            retry_delay: self.retry_delay,
            calendar_days: self.calendar_days,
        }
    }
}
