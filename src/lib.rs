//! stepflux - Restart-safe step accumulation for on-device pedometer tracking
//!
//! Hardware step counters report a cumulative count since boot. stepflux turns
//! that stream into a per-day step count that survives process restarts,
//! midnight rollovers, counter resets and user switches, and persists it to a
//! per-user document store without ever blocking sensor processing:
//! sensor event → accumulator → ordered best-effort store writes.
//!
//! ## Modules
//!
//! - **Accumulator**: pure state transitions for pedometer and accelerometer input
//! - **Tracker**: the lifecycle-facing session a background service hosts
//! - **Store**: the persistence contract, in-memory and JSON-file stores, and
//!   the ordered background writer

pub mod accumulator;
pub mod config;
pub mod error;
pub mod store;
pub mod tracker;
pub mod types;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use accumulator::{StepAccumulator, MIN_STEP_INTERVAL_MS, STEP_THRESHOLD};
pub use config::TrackerConfig;
pub use error::{StoreError, TrackerError};
pub use store::{JsonFileStore, MemoryStore, StepStore, StoreHandle};
pub use tracker::{StepTracker, TrackerSnapshot};
pub use types::{
    AccumulatorState, FilterMode, SensorCapabilities, SensorEvent, SensorReading, StepOutcome,
    TrackerStatus, TrackingPhase, UserKey,
};

/// stepflux version
pub const STEPFLUX_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name reported by the CLI and FFI
pub const PRODUCER_NAME: &str = "stepflux";
