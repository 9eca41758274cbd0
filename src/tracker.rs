//! Tracking session orchestration
//!
//! [`StepTracker`] is what a background service hosts. It owns the in-memory
//! accumulator state (the source of truth while the process runs), forwards
//! every transition's writes to the store without waiting on them, and
//! reloads a user's stored state whenever the tracked user changes.

use chrono::{DateTime, FixedOffset};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::oneshot::error::TryRecvError;
use uuid::Uuid;

use crate::accumulator::StepAccumulator;
use crate::config::TrackerConfig;
use crate::error::{StoreError, TrackerError};
use crate::store::{PendingLoad, StoreHandle, StoreWrite, StoredSnapshot};
use crate::types::{
    local_date, local_now, AccumulatorState, FilterMode, SensorCapabilities, SensorEvent,
    SensorReading, StepOutcome, TrackerStatus, TrackingPhase, UserKey,
};

/// Most pedometer readings held while a load is outstanding
pub const MAX_BUFFERED_READINGS: usize = 512;

/// Load requested for a newly started user, plus readings held until it lands
struct PendingState {
    rx: PendingLoad,
    date: String,
    buffered: VecDeque<SensorReading>,
    dropped: usize,
}

impl PendingState {
    /// Hold a reading, dropping the oldest once the buffer is full.
    ///
    /// Replay measures the first held reading against the stored baseline,
    /// so losing older readings of a rising counter loses no steps.
    fn hold(&mut self, reading: SensorReading) {
        if self.buffered.len() >= MAX_BUFFERED_READINGS {
            self.buffered.pop_front();
            if self.dropped == 0 {
                warn!("Stored state still loading; dropping oldest held readings");
            }
            self.dropped += 1;
        }
        self.buffered.push_back(reading);
    }
}

/// Serializable view of a tracker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerSnapshot {
    pub user_key: Option<UserKey>,
    pub session_id: Option<Uuid>,
    pub status: TrackerStatus,
    pub phase: TrackingPhase,
    pub filtering: bool,
    pub current_date: Option<String>,
    pub today_steps: i64,
    /// `None` while no baseline is set
    pub baseline: Option<f64>,
}

pub struct StepTracker {
    store: StoreHandle,
    mode: FilterMode,
    accumulator: StepAccumulator,
    state: Option<AccumulatorState>,
    session_id: Option<Uuid>,
    pending: Option<PendingState>,
    sensor_available: bool,
    stopped: bool,
    clock: fn() -> DateTime<FixedOffset>,
}

impl StepTracker {
    pub fn new(store: StoreHandle, config: &TrackerConfig) -> Self {
        Self {
            store,
            mode: config.filter,
            accumulator: StepAccumulator::for_mode(config.filter, config.sensors),
            state: None,
            session_id: None,
            pending: None,
            sensor_available: true,
            stopped: false,
            clock: local_now,
        }
    }

    /// Replace the wall clock used to pick the day to load
    pub fn with_clock(mut self, clock: fn() -> DateTime<FixedOffset>) -> Self {
        self.clock = clock;
        self
    }

    /// Begin (or resume) tracking for `identity`.
    ///
    /// A new identity discards the previous user's in-memory state and
    /// requests the new user's stored state. A missing identity resumes the
    /// current user, or fails with [`TrackerError::MissingIdentity`] if there
    /// is none.
    pub fn on_start(
        &mut self,
        identity: Option<&str>,
        caps: SensorCapabilities,
    ) -> Result<TrackerStatus, TrackerError> {
        match identity.map(str::trim).filter(|s| !s.is_empty()) {
            Some(identity) => {
                let key = UserKey::from_identity(identity)?;
                let same_user = self.state.as_ref().is_some_and(|s| s.user_key == key);
                if !same_user {
                    self.switch_user(key);
                }
            }
            None if self.state.is_none() => {
                warn!("Tracking not started: no user identity");
                return Err(TrackerError::MissingIdentity);
            }
            None => {}
        }

        self.accumulator = StepAccumulator::for_mode(self.mode, caps);
        self.sensor_available = caps.step_counter;
        self.stopped = false;
        if !caps.step_counter {
            warn!("Step counter sensor not available on this device");
        }

        Ok(self.status())
    }

    fn switch_user(&mut self, key: UserKey) {
        let today = local_date(&(self.clock)());
        let session_id = Uuid::new_v4();
        info!("Tracking session {session_id} started for {key}");

        let rx = self.store.load(key.clone(), today.clone());
        self.state = Some(AccumulatorState::new(key, today.clone()));
        self.session_id = Some(session_id);
        self.pending = Some(PendingState {
            rx,
            date: today,
            buffered: VecDeque::new(),
            dropped: 0,
        });
    }

    /// Handle one sensor callback
    pub fn on_sensor_event(&mut self, event: SensorEvent) -> Result<StepOutcome, TrackerError> {
        if self.state.is_none() {
            return Err(TrackerError::NotStarted);
        }
        if self.stopped || !self.sensor_available {
            return Ok(StepOutcome::Unchanged);
        }
        self.poll_load();

        match event {
            SensorEvent::Accelerometer { magnitude } => {
                if let Some(state) = self.state.take() {
                    self.state = Some(StepAccumulator::apply_accelerometer(state, magnitude));
                }
                Ok(StepOutcome::Unchanged)
            }
            SensorEvent::Pedometer {
                raw_count,
                observed_at,
            } => {
                let mut reading = SensorReading::new(raw_count, observed_at);
                if let Some(pending) = self.pending.as_mut() {
                    // Keep the magnitude current at arrival for the replay
                    reading.accel_magnitude =
                        self.state.as_ref().and_then(|s| s.last_accel_magnitude);
                    pending.hold(reading);
                    return Ok(StepOutcome::Buffered);
                }
                Ok(self.apply(reading))
            }
        }
    }

    /// Release sensor subscriptions. Persisted state and queued writes are
    /// left alone; calling it again has no effect.
    pub fn on_stop(&mut self) {
        if !self.stopped {
            info!("Tracking stopped");
        }
        self.stopped = true;
    }

    /// Wait for the current user's stored state and replay held readings
    pub async fn ready(&mut self) {
        if let Some(PendingState {
            rx,
            date,
            buffered,
            dropped,
        }) = self.pending.take()
        {
            let resolved = rx.await.unwrap_or(Err(StoreError::Closed));
            self.finish_load(&date, buffered, dropped, resolved);
        }
    }

    /// Blocking variant of [`StepTracker::ready`] for synchronous hosts.
    ///
    /// Must not be called from within an async runtime.
    pub fn blocking_ready(&mut self) {
        if let Some(PendingState {
            rx,
            date,
            buffered,
            dropped,
        }) = self.pending.take()
        {
            let resolved = rx.blocking_recv().unwrap_or(Err(StoreError::Closed));
            self.finish_load(&date, buffered, dropped, resolved);
        }
    }

    /// Wait until every write queued so far has reached the store
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.store.flush().await
    }

    pub fn state(&self) -> Option<&AccumulatorState> {
        self.state.as_ref()
    }

    pub fn status(&self) -> TrackerStatus {
        if self.state.is_none() {
            TrackerStatus::NotTracking
        } else if !self.sensor_available {
            TrackerStatus::SensorUnavailable
        } else if self.stopped {
            TrackerStatus::Stopped
        } else if self.pending.is_some() {
            TrackerStatus::Loading
        } else {
            TrackerStatus::Tracking
        }
    }

    pub fn phase(&self) -> TrackingPhase {
        self.state
            .as_ref()
            .map_or(TrackingPhase::Uninitialized, AccumulatorState::phase)
    }

    pub fn today_steps(&self) -> i64 {
        self.state.as_ref().map_or(0, |s| s.today_steps)
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let state = self.state.as_ref();
        TrackerSnapshot {
            user_key: state.map(|s| s.user_key.clone()),
            session_id: self.session_id,
            status: self.status(),
            phase: self.phase(),
            filtering: self.accumulator.is_filtering(),
            current_date: state.map(|s| s.current_date.clone()),
            today_steps: self.today_steps(),
            baseline: state.filter(|s| s.has_baseline()).map(|s| s.baseline),
        }
    }

    fn poll_load(&mut self) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        let resolved = match pending.rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Closed) => Err(StoreError::Closed),
        };
        if let Some(PendingState {
            date,
            buffered,
            dropped,
            ..
        }) = self.pending.take()
        {
            self.finish_load(&date, buffered, dropped, resolved);
        }
    }

    fn finish_load(
        &mut self,
        date: &str,
        buffered: VecDeque<SensorReading>,
        dropped: usize,
        resolved: Result<StoredSnapshot, StoreError>,
    ) {
        let snapshot = match resolved {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("Loading stored steps failed, starting from defaults: {err}");
                StoredSnapshot::default()
            }
        };
        if let Some(state) = self.state.take() {
            let state = StepAccumulator::merge_loaded(state, &snapshot, date);
            debug!(
                "Loaded state for {}: {} steps, baseline {}",
                state.user_key, state.today_steps, state.baseline
            );
            self.state = Some(state);
        }
        if dropped > 0 {
            warn!("Dropped {dropped} held readings while stored state was loading");
        }
        for reading in buffered {
            self.apply(reading);
        }
    }

    fn apply(&mut self, reading: SensorReading) -> StepOutcome {
        let Some(state) = self.state.take() else {
            return StepOutcome::Unchanged;
        };
        let (state, outcome) = self.accumulator.apply_reading(state, &reading);

        for write in StoreWrite::for_outcome(&state, &outcome) {
            self.store.write(&state.user_key, write);
        }
        match outcome {
            StepOutcome::Counted { delta } => {
                debug!("Steps updated: {} (delta: {delta})", state.today_steps)
            }
            StepOutcome::Rejected { delta } => debug!("Rejected {delta} steps as noise"),
            StepOutcome::Anchored { baseline } => debug!("Baseline anchored at {baseline}"),
            StepOutcome::Buffered | StepOutcome::Unchanged => {}
        }

        self.state = Some(state);
        outcome
    }
}
