use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::{AttractionKind, CalendarWindow};
use crate::tags::Tag;
use crate::venue::Venue;

pub type AdapterResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Static metadata an adapter supplies for an attraction it knows about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttractionTemplate {
    pub name: String,
    pub kind: AttractionKind,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl AttractionTemplate {
    pub fn new(name: impl Into<String>, kind: AttractionKind) -> Self {
        Self {
            name: name.into(),
            kind,
            tags: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }
}

/// Callbacks a destination integration implements. The venue context drives
/// them; an adapter never owns scheduling, caching or change detection.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// One-time setup, e.g. fetching static reference data.
    async fn init(&self, venue: &Venue) -> AdapterResult<()>;

    /// One refresh cycle. Expected to call `venue.update_status` /
    /// `venue.update_queue`. Must be safe to retry.
    async fn update(&self, venue: &Venue) -> AdapterResult<()>;

    /// Static data for an attraction not yet in the registry. `None` means
    /// "no such attraction yet".
    async fn build_attraction(&self, local_id: &str) -> AdapterResult<Option<AttractionTemplate>>;

    /// Operating windows for one venue-local date. `None` means no data.
    async fn operating_hours(&self, date: NaiveDate) -> AdapterResult<Option<Vec<CalendarWindow>>>;
}
