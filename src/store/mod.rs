//! Persistence collaborators
//!
//! The accumulator's authoritative state lives in a per-user document store.
//! This module defines the read/write contract, two stores implementing it,
//! and the ordered background writer the tracker talks to.

mod handle;
mod json_file;
mod memory;

pub use handle::{PendingLoad, StoreHandle};
pub use json_file::{JsonFileStore, StoreDocument};
pub use memory::MemoryStore;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::types::{AccumulatorState, StepOutcome, UserKey};

/// Document field holding per-day step history
pub const HISTORY_FIELD: &str = "daily_history";
/// Document field holding the latest day's steps for quick dashboard reads
pub const CURRENT_STEPS_FIELD: &str = "currentSteps";
/// Document field holding the raw sensor baseline
pub const BASELINE_FIELD: &str = "last_sensor_value";

/// What a store returns when a tracker (re)starts for a user
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    /// `daily_history/{date}` for the requested date
    pub today_steps: Option<i64>,
    /// `last_sensor_value`
    pub baseline: Option<f64>,
}

/// One best-effort `set(path, value)` against a user's document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum StoreWrite {
    History { date: String, steps: i64 },
    CurrentSteps { steps: i64 },
    LastSensorValue { value: f64 },
}

impl StoreWrite {
    /// Document path relative to the user's node
    pub fn path(&self) -> String {
        match self {
            StoreWrite::History { date, .. } => format!("{HISTORY_FIELD}/{date}"),
            StoreWrite::CurrentSteps { .. } => CURRENT_STEPS_FIELD.to_string(),
            StoreWrite::LastSensorValue { .. } => BASELINE_FIELD.to_string(),
        }
    }

    /// Writes implied by a transition.
    ///
    /// Every write is a snapshot of the current cumulative value, so a dropped
    /// write is superseded by the next one.
    pub fn for_outcome(state: &AccumulatorState, outcome: &StepOutcome) -> Vec<StoreWrite> {
        match outcome {
            StepOutcome::Counted { .. } => vec![
                StoreWrite::History {
                    date: state.current_date.clone(),
                    steps: state.today_steps,
                },
                StoreWrite::CurrentSteps {
                    steps: state.today_steps,
                },
                StoreWrite::LastSensorValue {
                    value: state.baseline,
                },
            ],
            StepOutcome::Anchored { .. } | StepOutcome::Rejected { .. } => {
                vec![StoreWrite::LastSensorValue {
                    value: state.baseline,
                }]
            }
            StepOutcome::Buffered | StepOutcome::Unchanged => Vec::new(),
        }
    }
}

/// A user's document as held by a store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(default)]
    pub daily_history: BTreeMap<String, i64>,
    #[serde(rename = "currentSteps", default, skip_serializing_if = "Option::is_none")]
    pub current_steps: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sensor_value: Option<f64>,
}

impl UserRecord {
    pub fn snapshot(&self, date: &str) -> StoredSnapshot {
        StoredSnapshot {
            today_steps: self.daily_history.get(date).copied(),
            baseline: self.last_sensor_value,
        }
    }

    pub fn apply(&mut self, write: &StoreWrite) {
        match write {
            StoreWrite::History { date, steps } => {
                self.daily_history.insert(date.clone(), *steps);
            }
            StoreWrite::CurrentSteps { steps } => self.current_steps = Some(*steps),
            StoreWrite::LastSensorValue { value } => self.last_sensor_value = Some(*value),
        }
    }
}

/// Read/write contract of a persistence collaborator.
///
/// Implementations may block (network, disk); the tracker only ever calls
/// them from the [`StoreHandle`] worker thread.
pub trait StepStore: Send + 'static {
    /// Load the stored steps for `date` and the stored baseline
    fn load(&mut self, user: &UserKey, date: &str) -> Result<StoredSnapshot, StoreError>;

    /// Apply a single field write
    fn write(&mut self, user: &UserKey, write: &StoreWrite) -> Result<(), StoreError>;

    /// Full document for a user, if one exists
    fn record(&self, user: &UserKey) -> Result<Option<UserRecord>, StoreError>;
}
