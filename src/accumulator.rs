//! Step accumulation
//!
//! Hardware step counters report a cumulative count since boot. This module
//! turns that count into "steps taken today" that survives process restarts,
//! day rollovers, counter resets and user switches.
//!
//! Every operation takes the state by value and returns the next state, so the
//! caller decides what to persist after each transition.

use log::debug;

use crate::store::StoredSnapshot;
use crate::types::{
    AccumulatorState, FilterMode, SensorCapabilities, SensorReading, StepOutcome, UNSET_BASELINE,
};

/// Acceleration magnitude (m/s²) above which motion counts as human gait.
/// Vehicle vibration stays below it.
pub const STEP_THRESHOLD: f64 = 12.0;

/// Minimum spacing between accepted deltas, in milliseconds
pub const MIN_STEP_INTERVAL_MS: i64 = 300;

/// Stateless step accumulator; the variant is fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepAccumulator {
    filtering: bool,
}

impl StepAccumulator {
    /// Accept every positive delta
    pub fn base() -> Self {
        Self { filtering: false }
    }

    /// Gate deltas on acceleration magnitude and step spacing
    pub fn filtered() -> Self {
        Self { filtering: true }
    }

    pub fn for_mode(mode: FilterMode, caps: SensorCapabilities) -> Self {
        Self {
            filtering: mode.filters_with(caps),
        }
    }

    pub fn is_filtering(&self) -> bool {
        self.filtering
    }

    /// Apply one step-counter reading
    pub fn apply_reading(
        &self,
        mut state: AccumulatorState,
        reading: &SensorReading,
    ) -> (AccumulatorState, StepOutcome) {
        if !reading.raw_count.is_finite() || reading.raw_count < 0.0 {
            return (state, StepOutcome::Unchanged);
        }
        if let Some(magnitude) = reading.accel_magnitude.filter(|m| m.is_finite()) {
            state.last_accel_magnitude = Some(magnitude);
        }

        // An earlier date (late callback, clock or zone change) stays on the
        // current day; ISO dates order correctly as strings
        let today = reading.date();
        if today > state.current_date {
            debug!(
                "Day rolled over for {}: {} -> {today}",
                state.user_key, state.current_date
            );
            state.today_steps = 0;
            state.current_date = today;
        }

        // First reading of an epoch, or the counter went backwards (reboot)
        if !state.has_baseline() || reading.raw_count < state.baseline {
            state.baseline = reading.raw_count;
            return (
                state,
                StepOutcome::Anchored {
                    baseline: reading.raw_count,
                },
            );
        }

        let delta = (reading.raw_count - state.baseline).floor() as i64;
        if delta <= 0 {
            return (state, StepOutcome::Unchanged);
        }

        if self.filtering && !Self::is_gait(&state, reading) {
            state.baseline = reading.raw_count;
            return (state, StepOutcome::Rejected { delta });
        }

        state.today_steps = state.today_steps.saturating_add(delta);
        state.baseline = reading.raw_count;
        if self.filtering {
            state.last_accepted_at = Some(reading.observed_at);
        }
        state
            .history
            .insert(state.current_date.clone(), state.today_steps);

        (state, StepOutcome::Counted { delta })
    }

    /// Record the latest accelerometer magnitude for the next delta
    pub fn apply_accelerometer(mut state: AccumulatorState, magnitude: f64) -> AccumulatorState {
        if magnitude.is_finite() {
            state.last_accel_magnitude = Some(magnitude);
        }
        state
    }

    /// Fold a user's stored state into the in-memory state.
    ///
    /// `loaded_date` is the day the load was requested for; stored steps only
    /// apply if the state is still on that day, and the larger of the stored
    /// and in-memory counts wins.
    pub fn merge_loaded(
        mut state: AccumulatorState,
        snapshot: &StoredSnapshot,
        loaded_date: &str,
    ) -> AccumulatorState {
        state.baseline = snapshot
            .baseline
            .filter(|b| b.is_finite() && *b >= 0.0)
            .unwrap_or(UNSET_BASELINE);

        if state.current_date == loaded_date {
            if let Some(steps) = snapshot.today_steps {
                state.today_steps = state.today_steps.max(steps).max(0);
                state
                    .history
                    .insert(state.current_date.clone(), state.today_steps);
            }
        }
        state
    }

    fn is_gait(state: &AccumulatorState, reading: &SensorReading) -> bool {
        let strong_enough = state
            .last_accel_magnitude
            .is_some_and(|magnitude| magnitude > STEP_THRESHOLD);
        let spaced = match state.last_accepted_at {
            Some(previous) => {
                (reading.observed_at - previous).num_milliseconds() > MIN_STEP_INTERVAL_MS
            }
            None => true,
        };
        strong_enough && spaced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TrackingPhase, UserKey};
    use chrono::{DateTime, Duration, FixedOffset};
    use pretty_assertions::assert_eq;

    fn at(rfc3339: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap()
    }

    fn morning() -> DateTime<FixedOffset> {
        at("2024-03-09T08:00:00+01:00")
    }

    fn state() -> AccumulatorState {
        AccumulatorState::new(UserKey::from_identity("a@x.com").unwrap(), "2024-03-09")
    }

    fn feed(
        acc: &StepAccumulator,
        state: AccumulatorState,
        counts: &[f64],
    ) -> AccumulatorState {
        counts.iter().enumerate().fold(state, |state, (i, raw)| {
            let reading = SensorReading::new(*raw, morning() + Duration::seconds(i as i64));
            acc.apply_reading(state, &reading).0
        })
    }

    #[test]
    fn test_first_reading_anchors_without_steps() {
        let acc = StepAccumulator::base();
        let (next, outcome) = acc.apply_reading(state(), &SensorReading::new(5000.0, morning()));

        assert_eq!(outcome, StepOutcome::Anchored { baseline: 5000.0 });
        assert_eq!(next.today_steps, 0);
        assert_eq!(next.phase(), TrackingPhase::Tracking);
    }

    #[test]
    fn test_steps_are_monotonic_within_a_day() {
        let acc = StepAccumulator::base();
        let counts = [100.0, 103.0, 103.0, 110.0, 50.0, 58.0, 58.5, 60.0];
        let mut current = state();
        let mut last = 0;

        for (i, raw) in counts.iter().enumerate() {
            let reading = SensorReading::new(*raw, morning() + Duration::seconds(i as i64));
            current = acc.apply_reading(current, &reading).0;
            assert!(current.today_steps >= last);
            last = current.today_steps;
        }
        // 3 + 7 before the reset at 50, then 8 + 2
        assert_eq!(current.today_steps, 20);
        assert_eq!(current.history["2024-03-09"], 20);
    }

    #[test]
    fn test_restart_re_anchors_then_counts() {
        let acc = StepAccumulator::base();
        let snapshot = StoredSnapshot {
            today_steps: Some(420),
            baseline: Some(9000.0),
        };
        let restored = StepAccumulator::merge_loaded(state(), &snapshot, "2024-03-09");
        assert_eq!(restored.today_steps, 420);

        let (restored, outcome) =
            acc.apply_reading(restored, &SensorReading::new(9000.0, morning()));
        assert_eq!(outcome, StepOutcome::Unchanged);
        assert_eq!(restored.today_steps, 420);

        let (restored, outcome) = acc.apply_reading(
            restored,
            &SensorReading::new(9005.0, morning() + Duration::seconds(5)),
        );
        assert_eq!(outcome, StepOutcome::Counted { delta: 5 });
        assert_eq!(restored.today_steps, 425);
    }

    #[test]
    fn test_day_rollover_starts_at_zero_and_keeps_history() {
        let acc = StepAccumulator::base();
        let mut current = state();
        current.baseline = 1000.0;
        current.today_steps = 42;
        current.history.insert("2024-03-09".to_string(), 42);

        let next_day = at("2024-03-10T00:05:00+01:00");
        let (current, outcome) = acc.apply_reading(current, &SensorReading::new(1003.0, next_day));

        assert_eq!(outcome, StepOutcome::Counted { delta: 3 });
        assert_eq!(current.current_date, "2024-03-10");
        assert_eq!(current.today_steps, 3);
        assert_eq!(current.history["2024-03-09"], 42);
        assert_eq!(current.history["2024-03-10"], 3);
    }

    #[test]
    fn test_counter_reset_only_moves_baseline() {
        let acc = StepAccumulator::base();
        let current = feed(&acc, state(), &[800.0, 830.0]);
        assert_eq!(current.today_steps, 30);

        let (current, outcome) = acc.apply_reading(current, &SensorReading::new(12.0, morning()));
        assert_eq!(outcome, StepOutcome::Anchored { baseline: 12.0 });
        assert_eq!(current.today_steps, 30);
        assert_eq!(current.baseline, 12.0);
    }

    #[test]
    fn test_repeated_reading_is_a_no_op() {
        let acc = StepAccumulator::base();
        let current = feed(&acc, state(), &[200.0, 210.0]);
        let (current, outcome) = acc.apply_reading(current, &SensorReading::new(210.0, morning()));

        assert_eq!(outcome, StepOutcome::Unchanged);
        assert_eq!(current.today_steps, 10);
    }

    #[test]
    fn test_fractional_progress_is_not_lost() {
        let acc = StepAccumulator::base();
        let current = feed(&acc, state(), &[100.0, 100.6]);
        assert_eq!(current.today_steps, 0);
        assert_eq!(current.baseline, 100.0);

        let current = feed(&acc, current, &[101.2]);
        assert_eq!(current.today_steps, 1);
    }

    #[test]
    fn test_filter_rejects_vehicle_vibration() {
        let acc = StepAccumulator::filtered();
        let current = feed(&acc, state(), &[500.0]);

        let reading = SensorReading::new(510.0, morning() + Duration::seconds(10)).with_accel(3.0);
        let (current, outcome) = acc.apply_reading(current, &reading);

        assert_eq!(outcome, StepOutcome::Rejected { delta: 10 });
        assert_eq!(current.today_steps, 0);
        assert_eq!(current.baseline, 510.0);
    }

    #[test]
    fn test_filter_accepts_gait() {
        let acc = StepAccumulator::filtered();
        let current = feed(&acc, state(), &[500.0]);
        let current = StepAccumulator::apply_accelerometer(current, 14.2);

        let reading = SensorReading::new(504.0, morning() + Duration::seconds(10));
        let (current, outcome) = acc.apply_reading(current, &reading);

        assert_eq!(outcome, StepOutcome::Counted { delta: 4 });
        assert_eq!(current.last_accepted_at, Some(reading.observed_at));
    }

    #[test]
    fn test_filter_enforces_min_step_interval() {
        let acc = StepAccumulator::filtered();
        let current = feed(&acc, state(), &[500.0]);
        let t0 = morning() + Duration::seconds(10);

        let (current, _) =
            acc.apply_reading(current, &SensorReading::new(501.0, t0).with_accel(13.0));
        let (current, outcome) = acc.apply_reading(
            current,
            &SensorReading::new(502.0, t0 + Duration::milliseconds(200)).with_accel(13.0),
        );
        assert_eq!(outcome, StepOutcome::Rejected { delta: 1 });

        let (current, outcome) = acc.apply_reading(
            current,
            &SensorReading::new(503.0, t0 + Duration::milliseconds(301)).with_accel(13.0),
        );
        assert_eq!(outcome, StepOutcome::Counted { delta: 1 });
        assert_eq!(current.today_steps, 2);
    }

    #[test]
    fn test_filter_without_any_magnitude_rejects() {
        let acc = StepAccumulator::filtered();
        let current = feed(&acc, state(), &[500.0]);
        let (_, outcome) = acc.apply_reading(current, &SensorReading::new(520.0, morning()));
        assert_eq!(outcome, StepOutcome::Rejected { delta: 20 });
    }

    #[test]
    fn test_merge_ignores_steps_for_another_day() {
        let snapshot = StoredSnapshot {
            today_steps: Some(77),
            baseline: Some(300.0),
        };
        let merged = StepAccumulator::merge_loaded(state(), &snapshot, "2024-03-08");

        assert_eq!(merged.today_steps, 0);
        assert_eq!(merged.baseline, 300.0);
    }

    #[test]
    fn test_late_reading_from_previous_day_keeps_todays_steps() {
        let acc = StepAccumulator::base();
        let next_day = at("2024-03-10T09:00:00+01:00");
        let mut current = state();
        current.current_date = "2024-03-10".to_string();

        let (current, _) = acc.apply_reading(current, &SensorReading::new(100.0, next_day));
        let (current, _) = acc.apply_reading(
            current,
            &SensorReading::new(600.0, next_day + Duration::minutes(1)),
        );
        assert_eq!(current.today_steps, 500);

        let (current, outcome) = acc.apply_reading(
            current,
            &SensorReading::new(601.0, at("2024-03-09T23:59:00+01:00")),
        );
        assert_eq!(outcome, StepOutcome::Counted { delta: 1 });
        assert_eq!(current.current_date, "2024-03-10");
        assert_eq!(current.today_steps, 501);

        let (current, _) = acc.apply_reading(
            current,
            &SensorReading::new(605.0, next_day + Duration::minutes(2)),
        );
        assert_eq!(current.today_steps, 505);
        assert_eq!(current.history.len(), 1);
        assert_eq!(current.history["2024-03-10"], 505);
    }

    #[test]
    fn test_huge_counter_jumps_saturate() {
        let acc = StepAccumulator::base();
        let current = feed(&acc, state(), &[0.0, 1e19, 2e19]);

        assert_eq!(current.today_steps, i64::MAX);
        assert_eq!(current.history["2024-03-09"], i64::MAX);
    }

    #[test]
    fn test_merge_keeps_the_larger_count_for_the_day() {
        let mut current = state();
        current.today_steps = 50;

        let stored = |steps| StoredSnapshot {
            today_steps: Some(steps),
            baseline: Some(300.0),
        };
        let merged = StepAccumulator::merge_loaded(current.clone(), &stored(30), "2024-03-09");
        assert_eq!(merged.today_steps, 50);
        assert_eq!(merged.history["2024-03-09"], 50);

        let merged = StepAccumulator::merge_loaded(current, &stored(80), "2024-03-09");
        assert_eq!(merged.today_steps, 80);
        assert_eq!(merged.history["2024-03-09"], 80);
    }

    #[test]
    fn test_merge_without_stored_state_stays_pending() {
        let merged =
            StepAccumulator::merge_loaded(state(), &StoredSnapshot::default(), "2024-03-09");
        assert_eq!(merged.baseline, UNSET_BASELINE);
        assert_eq!(merged.phase(), TrackingPhase::BaselinePending);
    }

    #[test]
    fn test_invalid_raw_counts_are_ignored() {
        let acc = StepAccumulator::base();
        for raw in [f64::NAN, -4.0] {
            let (next, outcome) = acc.apply_reading(state(), &SensorReading::new(raw, morning()));
            assert_eq!(outcome, StepOutcome::Unchanged);
            assert_eq!(next.baseline, UNSET_BASELINE);
        }
    }
}
