use chrono::{DateTime, NaiveDate};
use futures::stream::{self, StreamExt};
use tracing::warn;

use super::Venue;
use crate::cache::Ttl;
use crate::error::SyncError;
use crate::limits::*;
use crate::model::*;

fn hours_key(venue_id: &str, date: NaiveDate) -> String {
    format!("{venue_id}:hours:{}", date.format("%Y-%m-%d"))
}

fn valid_windows(venue_id: &str, date: NaiveDate, windows: Vec<CalendarWindow>) -> Option<Vec<CalendarWindow>> {
    let supplied = windows.len();
    let kept: Vec<CalendarWindow> = windows.into_iter().filter(|w| !w.span.is_empty()).collect();
    if kept.len() < supplied {
        warn!(venue = venue_id, %date, dropped = supplied - kept.len(), "dropping empty or reversed hours windows");
    }
    (!kept.is_empty()).then_some(kept)
}

impl Venue {
    /// Calendar date at `at` in the venue's timezone.
    pub fn local_date(&self, at: Ms) -> NaiveDate {
        DateTime::from_timestamp_millis(at)
            .unwrap_or_default()
            .with_timezone(&self.timezone)
            .date_naive()
    }

    /// Operating windows for one venue-local date, cached for a few hours.
    /// Adapter failures are logged and read as "no data". Windows that close
    /// at or before they open are dropped; a date left with none has no data.
    pub async fn operating_hours(&self, date: NaiveDate) -> Option<Vec<CalendarWindow>> {
        let adapter = self.adapter.clone();
        let venue_id = self.id.clone();
        let result = self
            .cache
            .wrap(
                &hours_key(&self.id, date),
                Ttl::Fixed(OPERATING_HOURS_TTL_MS),
                move || async move {
                    let windows = adapter.operating_hours(date).await.map_err(SyncError::adapter)?;
                    Ok(windows.and_then(|windows| valid_windows(&venue_id, date, windows)))
                },
            )
            .await;
        match result {
            Ok(windows) => windows,
            Err(e) => {
                warn!(venue = %self.id, %date, error = %e, "operating hours lookup failed");
                None
            }
        }
    }

    /// Rolling calendar of `days` dates starting at yesterday.
    pub async fn calendar(&self, days: u32) -> Calendar {
        self.calendar_at(now_ms(), days).await
    }

    pub async fn calendar_at(&self, now: Ms, days: u32) -> Calendar {
        let today = self.local_date(now);
        let Some(start) = today.pred_opt() else {
            return Calendar::new();
        };
        let days = days.min(MAX_CALENDAR_DAYS) as usize;

        let fetched: Vec<(NaiveDate, Option<Vec<CalendarWindow>>)> = stream::iter(start.iter_days().take(days))
            .map(|date| async move { (date, self.operating_hours(date).await) })
            .buffered(CALENDAR_FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut calendar = Calendar::new();
        for (date, windows) in fetched {
            let Some(windows) = windows else {
                continue;
            };
            // A past date only matters while one of its windows runs past midnight.
            if date < today && windows.iter().all(|w| w.span.has_ended(now)) {
                continue;
            }
            calendar.insert(date, windows);
        }
        calendar
    }

    /// Yesterday, today and tomorrow with their windows, in that order.
    async fn nearby_windows(&self, now: Ms) -> Vec<(NaiveDate, Vec<CalendarWindow>)> {
        let today = self.local_date(now);
        let mut out = Vec::with_capacity(3);
        for date in [today.pred_opt(), Some(today), today.succ_opt()].into_iter().flatten() {
            if let Some(windows) = self.operating_hours(date).await {
                out.push((date, windows));
            }
        }
        out
    }

    /// The operating date `now` belongs to. An overnight window keeps
    /// yesterday active past midnight.
    pub async fn active_park_date(&self) -> NaiveDate {
        self.active_park_date_at(now_ms()).await
    }

    pub async fn active_park_date_at(&self, now: Ms) -> NaiveDate {
        self.nearby_windows(now)
            .await
            .into_iter()
            .find(|(_, windows)| windows.iter().any(|w| w.span.contains_instant(now)))
            .map(|(date, _)| date)
            .unwrap_or_else(|| self.local_date(now))
    }

    pub async fn is_open(&self) -> bool {
        self.is_open_at(now_ms()).await
    }

    pub async fn is_open_at(&self, now: Ms) -> bool {
        self.nearby_windows(now)
            .await
            .iter()
            .any(|(_, windows)| windows.iter().any(|w| w.span.contains_instant(now)))
    }

    /// Milliseconds until the venue next opens: `0` while open, `None` when
    /// nothing opens within the calendar horizon.
    pub async fn next_opening_time(&self) -> Option<Ms> {
        self.next_opening_time_at(now_ms()).await
    }

    pub async fn next_opening_time_at(&self, now: Ms) -> Option<Ms> {
        let calendar = self.calendar_at(now, self.settings.calendar_days).await;
        let windows = calendar.values().flatten();
        let mut next: Option<Ms> = None;
        for window in windows {
            if window.span.contains_instant(now) {
                return Some(0);
            }
            if window.span.start > now {
                let delay = window.span.start - now;
                next = Some(next.map_or(delay, |n| n.min(delay)));
            }
        }
        next
    }

    /// Milliseconds until the venue next closes. While open this is the latest
    /// end among the running windows; otherwise the end of the next window to
    /// open. `0` when nothing is scheduled.
    pub async fn next_closing_time(&self) -> Ms {
        self.next_closing_time_at(now_ms()).await
    }

    pub async fn next_closing_time_at(&self, now: Ms) -> Ms {
        let calendar = self.calendar_at(now, self.settings.calendar_days).await;
        let windows: Vec<&CalendarWindow> = calendar.values().flatten().collect();

        let running_end = windows
            .iter()
            .filter(|w| w.span.contains_instant(now))
            .map(|w| w.span.end)
            .max();
        if let Some(end) = running_end {
            return end - now;
        }
        windows
            .iter()
            .filter(|w| w.span.start > now)
            .min_by_key(|w| w.span.start)
            .map_or(0, |w| w.span.end - now)
    }
}
