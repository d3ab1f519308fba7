use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::tags::Tag;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    /// Not validated: adapters may hand in reversed or empty spans, which
    /// callers filter with `is_empty`.
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    /// True when the span covers no instant (`end <= start`).
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// True once `now` is at or past the end of the span.
    pub fn has_ended(&self, now: Ms) -> bool {
        self.end <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttractionKind {
    Ride,
    Show,
    Transport,
    Parade,
    MeetAndGreet,
    Restaurant,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusValue {
    Operating,
    Down,
    Closed,
    Refurbishment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub value: StatusValue,
    pub last_updated: Ms,
    pub last_changed: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueKind {
    Standby,
    SingleRider,
    PaidStandby,
    ReturnTime,
    PaidReturnTime,
    BoardingGroup,
}

impl QueueKind {
    /// Numeric queues carry a wait time in minutes and get change detection.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            QueueKind::Standby | QueueKind::SingleRider | QueueKind::PaidStandby
        )
    }
}

/// One queue on an attraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueueRecord {
    /// `wait_time = None` means unknown, not closed.
    Wait {
        wait_time: Option<u32>,
        last_updated: Ms,
        last_changed: Ms,
    },
    /// Return-time / boarding-group payload, stored as supplied.
    Structured {
        value: serde_json::Value,
        last_updated: Ms,
    },
}

impl QueueRecord {
    pub fn wait_time(&self) -> Option<u32> {
        match self {
            QueueRecord::Wait { wait_time, .. } => *wait_time,
            QueueRecord::Structured { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attraction {
    pub id: String,
    pub local_id: String,
    pub name: String,
    pub kind: AttractionKind,
    pub status: Option<StatusRecord>,
    #[serde(default)]
    pub queues: BTreeMap<QueueKind, QueueRecord>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl Attraction {
    pub fn new(id: String, local_id: String, name: String, kind: AttractionKind) -> Self {
        Self {
            id,
            local_id,
            name,
            kind,
            status: None,
            queues: BTreeMap::new(),
            tags: Vec::new(),
        }
    }

    pub fn status_value(&self) -> Option<StatusValue> {
        self.status.map(|s| s.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowKind {
    Operating,
    ExtraHours,
    Ticketed,
    Private,
    Informational,
}

/// A single operating window on a calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarWindow {
    pub span: Span,
    pub kind: WindowKind,
    #[serde(default)]
    pub description: Option<String>,
}

impl CalendarWindow {
    pub fn new(opening_time: Ms, closing_time: Ms, kind: WindowKind) -> Self {
        Self {
            span: Span::new(opening_time, closing_time),
            kind,
            description: None,
        }
    }
}

/// Rolling calendar keyed by the venue-local date.
pub type Calendar = BTreeMap<NaiveDate, Vec<CalendarWindow>>;

/// Notifications emitted by a venue context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VenueEvent {
    AttractionCreated {
        venue_id: String,
        attraction_id: String,
    },
    StatusChanged {
        attraction: Attraction,
        previous: Option<StatusValue>,
    },
    QueueChanged {
        attraction: Attraction,
        queue: QueueKind,
        previous: Option<Option<u32>>,
    },
    QueueRemoved {
        attraction: Attraction,
        queue: QueueKind,
    },
    DateRolled {
        venue_id: String,
        previous: NaiveDate,
        current: NaiveDate,
    },
    InitFailed {
        venue_id: String,
        error: String,
    },
    UpdateFailed {
        venue_id: String,
        attempts: u32,
        error: String,
    },
}

impl VenueEvent {
    /// The attraction an event concerns, if any.
    pub fn attraction_id(&self) -> Option<&str> {
        match self {
            VenueEvent::AttractionCreated { attraction_id, .. } => Some(attraction_id),
            VenueEvent::StatusChanged { attraction, .. }
            | VenueEvent::QueueChanged { attraction, .. }
            | VenueEvent::QueueRemoved { attraction, .. } => Some(&attraction.id),
            VenueEvent::DateRolled { .. }
            | VenueEvent::InitFailed { .. }
            | VenueEvent::UpdateFailed { .. } => None,
        }
    }
}
