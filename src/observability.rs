use std::net::SocketAddr;

use crate::model::VenueEvent;

// ── Update cycle ────────────────────────────────────────────────

/// Counter: update cycles run. Labels: venue, outcome.
pub const UPDATES_TOTAL: &str = "parksync_updates_total";

/// Histogram: update cycle latency in seconds (all attempts). Labels: venue.
pub const UPDATE_DURATION_SECONDS: &str = "parksync_update_duration_seconds";

/// Counter: failed update attempts that were retried. Labels: venue.
pub const UPDATE_RETRIES_TOTAL: &str = "parksync_update_retries_total";

/// Counter: venue events emitted. Labels: event.
pub const EVENTS_TOTAL: &str = "parksync_events_total";

// ── Registry ────────────────────────────────────────────────────

/// Gauge: attractions held in memory. Labels: venue.
pub const ATTRACTIONS_ACTIVE: &str = "parksync_attractions_active";

/// Gauge: registered venue contexts.
pub const VENUES_ACTIVE: &str = "parksync_venues_active";

// ── Cache ───────────────────────────────────────────────────────

/// Counter: cache lookups served from a live entry.
pub const CACHE_HITS_TOTAL: &str = "parksync_cache_hits_total";

/// Counter: cache lookups that ran a producer.
pub const CACHE_MISSES_TOTAL: &str = "parksync_cache_misses_total";

/// Counter: callers that joined an in-flight computation instead of starting one.
pub const COALESCED_CALLS_TOTAL: &str = "parksync_coalesced_calls_total";

/// Counter: expired entries removed by the sweeper.
pub const CACHE_EXPIRED_TOTAL: &str = "parksync_cache_expired_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "parksync_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (records per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "parksync_journal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Install the fmt subscriber. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().try_init();
}

/// Map an event variant to a short label for metrics.
pub fn event_label(event: &VenueEvent) -> &'static str {
    match event {
        VenueEvent::AttractionCreated { .. } => "attraction_created",
        VenueEvent::StatusChanged { .. } => "status_changed",
        VenueEvent::QueueChanged { .. } => "queue_changed",
        VenueEvent::QueueRemoved { .. } => "queue_removed",
        VenueEvent::DateRolled { .. } => "date_rolled",
        VenueEvent::InitFailed { .. } => "init_failed",
        VenueEvent::UpdateFailed { .. } => "update_failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_distinct() {
        let events = [
            VenueEvent::InitFailed {
                venue_id: "v".into(),
                error: "e".into(),
            },
            VenueEvent::UpdateFailed {
                venue_id: "v".into(),
                attempts: 5,
                error: "e".into(),
            },
            VenueEvent::AttractionCreated {
                venue_id: "v".into(),
                attraction_id: "v_1".into(),
            },
        ];
        let labels: Vec<_> = events.iter().map(event_label).collect();
        assert_eq!(labels, vec!["init_failed", "update_failed", "attraction_created"]);
    }

    #[test]
    fn init_without_port_is_noop() {
        init(None);
    }
}
