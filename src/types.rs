//! Core types for stepflux
//!
//! This module defines the data that flows through the tracker: sensor input,
//! the per-user accumulator state, and the outcome reported for each reading.

use chrono::{DateTime, FixedOffset, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::TrackerError;

/// Baseline sentinel meaning "no reference point for the current epoch"
pub const UNSET_BASELINE: f64 = -1.0;

/// Format of `current_date` and of history keys
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Storage partition key derived from an account identity.
///
/// Document stores reject `.` in keys, so it is replaced with `_`
/// (`jane.doe@mail.com` becomes `jane_doe@mail_com`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserKey(String);

impl UserKey {
    /// Derive the key for an identity, rejecting blank identities
    pub fn from_identity(identity: &str) -> Result<Self, TrackerError> {
        let trimmed = identity.trim();
        if trimmed.is_empty() {
            return Err(TrackerError::MissingIdentity);
        }
        Ok(Self(trimmed.replace('.', "_")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current wall-clock time with the device's local offset
pub fn local_now() -> DateTime<FixedOffset> {
    Local::now().fixed_offset()
}

/// Calendar day of a timestamp, in the offset it was taken in
pub fn local_date(at: &DateTime<FixedOffset>) -> String {
    at.date_naive().format(DATE_FORMAT).to_string()
}

/// A single step-counter sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Cumulative hardware count since device boot
    pub raw_count: f64,
    /// Acceleration magnitude (m/s²) sampled alongside the count, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accel_magnitude: Option<f64>,
    /// When the sample was taken (local offset)
    pub observed_at: DateTime<FixedOffset>,
}

impl SensorReading {
    pub fn new(raw_count: f64, observed_at: DateTime<FixedOffset>) -> Self {
        Self {
            raw_count,
            accel_magnitude: None,
            observed_at,
        }
    }

    pub fn with_accel(mut self, magnitude: f64) -> Self {
        self.accel_magnitude = Some(magnitude);
        self
    }

    /// Calendar day this reading belongs to
    pub fn date(&self) -> String {
        local_date(&self.observed_at)
    }
}

/// Events delivered by the platform's sensor callbacks.
///
/// Pedometer and accelerometer updates arrive through one listener; each is
/// dispatched to its own handler over the same state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SensorEvent {
    Pedometer {
        raw_count: f64,
        #[serde(default = "local_now")]
        observed_at: DateTime<FixedOffset>,
    },
    Accelerometer {
        magnitude: f64,
    },
}

impl SensorEvent {
    pub fn pedometer(raw_count: f64, observed_at: DateTime<FixedOffset>) -> Self {
        SensorEvent::Pedometer {
            raw_count,
            observed_at,
        }
    }

    pub fn accelerometer(magnitude: f64) -> Self {
        SensorEvent::Accelerometer { magnitude }
    }
}

/// Which accumulation variant to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Filter whenever an accelerometer is available
    #[default]
    Auto,
    /// Accept every positive delta
    Base,
    /// Gate deltas on acceleration magnitude and step spacing
    Filtered,
}

impl FilterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterMode::Auto => "auto",
            FilterMode::Base => "base",
            FilterMode::Filtered => "filtered",
        }
    }

    /// Whether this mode filters on a device with the given sensors
    pub fn filters_with(&self, caps: SensorCapabilities) -> bool {
        match self {
            FilterMode::Auto => caps.accelerometer,
            FilterMode::Base => false,
            FilterMode::Filtered => true,
        }
    }
}

impl FromStr for FilterMode {
    type Err = TrackerError;

    /// Parse the serialized name (`auto`, `base` or `filtered`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| TrackerError::ConfigError(format!("unknown filter mode '{s}'")))
    }
}

/// Sensors the host device exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorCapabilities {
    pub step_counter: bool,
    pub accelerometer: bool,
}

impl Default for SensorCapabilities {
    fn default() -> Self {
        Self::pedometer_only()
    }
}

impl SensorCapabilities {
    pub fn pedometer_only() -> Self {
        Self {
            step_counter: true,
            accelerometer: false,
        }
    }

    pub fn full() -> Self {
        Self {
            step_counter: true,
            accelerometer: true,
        }
    }

    pub fn none() -> Self {
        Self {
            step_counter: false,
            accelerometer: false,
        }
    }
}

/// Per-session phase of the accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingPhase {
    Uninitialized,
    BaselinePending,
    Tracking,
}

/// Status reported to the lifecycle host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerStatus {
    /// No user identity; nothing is tracked
    NotTracking,
    /// Device has no step counter
    SensorUnavailable,
    /// Waiting for the user's stored state
    Loading,
    Tracking,
    /// Sensor subscriptions released
    Stopped,
}

/// Accumulator state for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorState {
    pub user_key: UserKey,
    /// Raw count that corresponds to zero steps in this epoch
    pub baseline: f64,
    pub today_steps: i64,
    /// Day `today_steps` applies to (`YYYY-MM-DD`)
    pub current_date: String,
    /// Steps per day; today's entry is kept live
    #[serde(default)]
    pub history: BTreeMap<String, i64>,
    /// Last accelerometer magnitude seen (not persisted)
    #[serde(skip)]
    pub last_accel_magnitude: Option<f64>,
    /// Timestamp of the last accepted delta (not persisted)
    #[serde(skip)]
    pub last_accepted_at: Option<DateTime<FixedOffset>>,
}

impl AccumulatorState {
    pub fn new(user_key: UserKey, current_date: impl Into<String>) -> Self {
        Self {
            user_key,
            baseline: UNSET_BASELINE,
            today_steps: 0,
            current_date: current_date.into(),
            history: BTreeMap::new(),
            last_accel_magnitude: None,
            last_accepted_at: None,
        }
    }

    /// Raw counts are never negative, so any negative baseline is unset
    pub fn has_baseline(&self) -> bool {
        self.baseline >= 0.0
    }

    pub fn phase(&self) -> TrackingPhase {
        if self.has_baseline() {
            TrackingPhase::Tracking
        } else {
            TrackingPhase::BaselinePending
        }
    }
}

/// What a single reading did to the state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Reading became the new baseline; no steps awarded
    Anchored { baseline: f64 },
    /// Delta credited to today's steps
    Counted { delta: i64 },
    /// Delta treated as noise; baseline advanced past it
    Rejected { delta: i64 },
    /// Held until the user's stored state has loaded
    Buffered,
    Unchanged,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_user_key_replaces_dots() {
        let key = UserKey::from_identity("jane.doe@mail.com").unwrap();
        assert_eq!(key.as_str(), "jane_doe@mail_com");
    }

    #[test]
    fn test_user_key_rejects_blank() {
        assert!(matches!(
            UserKey::from_identity("   "),
            Err(TrackerError::MissingIdentity)
        ));
    }

    #[test]
    fn test_local_date_uses_reading_offset() {
        // 23:30 at UTC-5 is already the next day in UTC
        let at = DateTime::parse_from_rfc3339("2024-03-09T23:30:00-05:00").unwrap();
        assert_eq!(local_date(&at), "2024-03-09");
    }

    #[test]
    fn test_new_state_is_baseline_pending() {
        let state = AccumulatorState::new(UserKey::from_identity("a@x.com").unwrap(), "2024-03-09");
        assert_eq!(state.baseline, UNSET_BASELINE);
        assert_eq!(state.phase(), TrackingPhase::BaselinePending);
    }

    #[test]
    fn test_sensor_event_tagging() {
        let event: SensorEvent = serde_json::from_str(
            r#"{"type":"pedometer","raw_count":1200.0,"observed_at":"2024-03-09T08:00:00+01:00"}"#,
        )
        .unwrap();
        assert!(matches!(event, SensorEvent::Pedometer { raw_count, .. } if raw_count == 1200.0));

        let event: SensorEvent =
            serde_json::from_str(r#"{"type":"accelerometer","magnitude":13.5}"#).unwrap();
        assert_eq!(event, SensorEvent::accelerometer(13.5));
    }

    #[test]
    fn test_filter_mode_resolution() {
        assert!(FilterMode::Auto.filters_with(SensorCapabilities::full()));
        assert!(!FilterMode::Auto.filters_with(SensorCapabilities::pedometer_only()));
        assert!(FilterMode::Filtered.filters_with(SensorCapabilities::pedometer_only()));
        assert!(!FilterMode::Base.filters_with(SensorCapabilities::full()));
    }

    #[test]
    fn test_filter_mode_parses_serialized_names() {
        for mode in [FilterMode::Auto, FilterMode::Base, FilterMode::Filtered] {
            assert_eq!(mode.as_str().parse::<FilterMode>().unwrap(), mode);
        }
        assert!(matches!(
            "aggressive".parse::<FilterMode>(),
            Err(TrackerError::ConfigError(_))
        ));
    }
}
