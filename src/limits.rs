use crate::model::Ms;

pub const SECOND_MS: Ms = 1_000;
pub const MINUTE_MS: Ms = 60 * SECOND_MS;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// TTL used for attraction snapshots. Saturates to "never expires".
pub const ATTRACTION_SNAPSHOT_TTL_MS: Ms = Ms::MAX;

/// Per-date operating hours are refreshed at most this often.
pub const OPERATING_HOURS_TTL_MS: Ms = 3 * HOUR_MS;

/// Default rolling calendar horizon, counted from yesterday.
pub const DEFAULT_CALENDAR_DAYS: u32 = 60;
pub const MAX_CALENDAR_DAYS: u32 = 400;

pub const DEFAULT_UPDATE_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_MAX_UPDATE_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;

/// Journal appends before the compactor rewrites it.
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 10_000;

pub const MAX_VENUES: usize = 512;
pub const MAX_VENUE_ID_LEN: usize = 128;
pub const MAX_LOCAL_ID_LEN: usize = 256;
pub const MAX_CACHE_KEY_LEN: usize = 1024;
pub const MAX_ATTRACTIONS_PER_VENUE: usize = 20_000;
pub const MAX_TAGS_PER_ATTRACTION: usize = 64;
pub const MAX_PENDING_TAGS_PER_ID: usize = 64;
/// Distinct not-yet-created attractions that may hold buffered tags.
pub const MAX_PENDING_TAG_IDS: usize = 4_096;

/// Per-date hours lookups a calendar scan keeps in flight.
pub const CALENDAR_FETCH_CONCURRENCY: usize = 8;

pub const CACHE_SWEEP_INTERVAL_MS: u64 = 30_000;
pub const COMPACT_CHECK_INTERVAL_MS: u64 = 60_000;
