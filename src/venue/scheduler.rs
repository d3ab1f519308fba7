use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use chrono::NaiveDate;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::Venue;
use crate::error::SyncError;
use crate::model::*;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    ShutDown = 3,
}

impl From<u8> for LifecycleState {
    fn from(v: u8) -> Self {
        match v {
            1 => LifecycleState::Initializing,
            2 => LifecycleState::Ready,
            3 => LifecycleState::ShutDown,
            _ => LifecycleState::Uninitialized,
        }
    }
}

impl Venue {
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.load(Ordering::Acquire).into()
    }

    /// Move from `from` to `to`. Fails once the venue is shut down.
    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.lifecycle
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn updates_disabled(&self) -> bool {
        self.updates_disabled.load(Ordering::Acquire)
    }

    /// Run the adapter's one-time setup. Concurrent callers share one run; a
    /// failure leaves the venue uninitialized so the next call retries.
    pub async fn init(self: &Arc<Self>) -> Result<(), SyncError> {
        match self.state() {
            LifecycleState::Ready => return Ok(()),
            LifecycleState::ShutDown => return Err(SyncError::ShutDown(self.id.clone())),
            _ => {}
        }
        let venue = self.clone();
        self.init_flight
            .run((), move || async move { venue.run_init().await })
            .await
    }

    async fn run_init(&self) -> Result<(), SyncError> {
        if !self.transition(LifecycleState::Uninitialized, LifecycleState::Initializing) {
            return match self.state() {
                LifecycleState::ShutDown => Err(SyncError::ShutDown(self.id.clone())),
                _ => Ok(()),
            };
        }
        let started = Instant::now();
        match self.adapter.init(self).await {
            Ok(()) => {
                if !self.transition(LifecycleState::Initializing, LifecycleState::Ready) {
                    return Err(SyncError::ShutDown(self.id.clone()));
                }
                info!(venue = %self.id, elapsed_ms = started.elapsed().as_millis() as u64, "venue initialized");
                Ok(())
            }
            Err(e) => {
                let err = SyncError::adapter(e);
                self.transition(LifecycleState::Initializing, LifecycleState::Uninitialized);
                error!(venue = %self.id, error = %err, "venue init failed");
                self.notify.send(&VenueEvent::InitFailed {
                    venue_id: self.id.clone(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// One adapter refresh, initializing first if needed. Concurrent callers
    /// share one run.
    pub async fn update(self: &Arc<Self>) -> Result<(), SyncError> {
        if self.state() != LifecycleState::Ready {
            self.init().await?;
        }
        let venue = self.clone();
        self.update_flight
            .run((), move || async move {
                venue.adapter.update(&venue).await.map_err(SyncError::adapter)
            })
            .await
    }

    /// `update` with up to `max_update_attempts` tries. Exhaustion is reported
    /// as `UpdateFailed`; the venue keeps its schedule.
    pub async fn update_with_retry(self: &Arc<Self>) -> Result<(), SyncError> {
        let attempts = self.settings.max_update_attempts.max(1);
        let started = Instant::now();
        let mut attempt = 1;
        loop {
            match self.update().await {
                Ok(()) => {
                    metrics::counter!(crate::observability::UPDATES_TOTAL, "venue" => self.id.clone(), "outcome" => "ok")
                        .increment(1);
                    metrics::histogram!(crate::observability::UPDATE_DURATION_SECONDS, "venue" => self.id.clone())
                        .record(started.elapsed().as_secs_f64());
                    return Ok(());
                }
                Err(e) if attempt >= attempts => {
                    error!(venue = %self.id, attempts = attempt, error = %e, "update failed, giving up until next tick");
                    metrics::counter!(crate::observability::UPDATES_TOTAL, "venue" => self.id.clone(), "outcome" => "error")
                        .increment(1);
                    self.notify.send(&VenueEvent::UpdateFailed {
                        venue_id: self.id.clone(),
                        attempts: attempt,
                        error: e.to_string(),
                    });
                    return Err(e);
                }
                Err(e) => {
                    warn!(venue = %self.id, attempt, error = %e, "update failed, retrying");
                    metrics::counter!(crate::observability::UPDATE_RETRIES_TOTAL, "venue" => self.id.clone())
                        .increment(1);
                    tokio::time::sleep(self.settings.retry_delay).await;
                    if self.updates_disabled() {
                        return Err(SyncError::ShutDown(self.id.clone()));
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Last active park date seen by `post_update`.
    pub fn recorded_active_date(&self) -> Option<NaiveDate> {
        *self.active_date.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn post_update(&self) {
        self.post_update_at(now_ms()).await
    }

    /// Recompute the active park date and announce a rollover. The first
    /// observation is only recorded.
    pub async fn post_update_at(&self, now: Ms) {
        let current = self.active_park_date_at(now).await;
        let mut stored = self.active_date.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = *stored
            && previous != current
        {
            info!(venue = %self.id, %previous, %current, "park date rolled over");
            self.notify.send(&VenueEvent::DateRolled {
                venue_id: self.id.clone(),
                previous,
                current,
            });
        }
        *stored = Some(current);
    }

    /// Spawn the update loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(run_scheduler(self.clone()))
    }

    /// Stop scheduling. An update already running finishes; no further
    /// ticks fire.
    pub fn disable_updates(&self) {
        if self.updates_disabled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.lifecycle
            .store(LifecycleState::ShutDown as u8, Ordering::Release);
        self.shutdown.notify_one();
        info!(venue = %self.id, "updates disabled");
    }
}

/// One scheduled refresh plus the housekeeping that follows it.
async fn tick(venue: &Arc<Venue>) {
    let _ = venue.update_with_retry().await;
    venue.post_update().await;
    let pruned = venue.notify.prune();
    if pruned > 0 {
        debug!(venue = %venue.id, pruned, "dropped idle attraction channels");
    }
}

/// init → first tick → (sleep → tick)* until disabled.
pub async fn run_scheduler(venue: Arc<Venue>) {
    info!(venue = %venue.id, interval_ms = venue.settings.update_interval.as_millis() as u64, "scheduler started");

    // An init failure is already reported; update_with_retry re-runs it.
    let _ = venue.init().await;
    if !venue.updates_disabled() {
        tick(&venue).await;
    }

    while !venue.updates_disabled() {
        tokio::select! {
            _ = tokio::time::sleep(venue.settings.update_interval) => {}
            _ = venue.shutdown.notified() => break,
        }
        if venue.updates_disabled() {
            break;
        }
        tick(&venue).await;
    }

    info!(venue = %venue.id, "scheduler stopped");
}
