//! FFI bindings for stepflux
//!
//! C-compatible functions so a mobile background service can host a
//! [`StepTracker`]. Sensor callbacks may arrive on different threads, so the
//! tracker sits behind a mutex. Strings returned by these functions must be
//! freed with `stepflux_free_string`.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, FixedOffset};

use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::store::{JsonFileStore, StoreHandle};
use crate::tracker::StepTracker;
use crate::types::{FilterMode, SensorCapabilities, SensorEvent};

// Thread-local storage for the last error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Opaque tracker handle owned by the host
pub struct StepTrackerHandle {
    tracker: Mutex<StepTracker>,
}

impl StepTrackerHandle {
    fn lock(&self) -> MutexGuard<'_, StepTracker> {
        match self.tracker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn parse_filter_mode(mode: Option<String>) -> Result<FilterMode, TrackerError> {
    match mode.as_deref() {
        None | Some("") => Ok(FilterMode::Auto),
        Some(name) => name.parse(),
    }
}

fn timestamp(observed_at_ms: i64, utc_offset_secs: i32) -> Option<DateTime<FixedOffset>> {
    let offset = FixedOffset::east_opt(utc_offset_secs)?;
    DateTime::from_timestamp_millis(observed_at_ms).map(|utc| utc.with_timezone(&offset))
}

// ============================================================================
// Tracker lifecycle
// ============================================================================

/// Create a tracker persisting to the JSON document store at `store_path`.
///
/// # Safety
/// - `store_path` must be a valid null-terminated C string.
/// - `filter_mode` may be NULL (auto) or one of "auto", "base", "filtered".
/// - Returns NULL on error; call `stepflux_last_error` to get the error message.
/// - The returned handle must be freed with `stepflux_tracker_free`.
#[no_mangle]
pub unsafe extern "C" fn stepflux_tracker_new(
    store_path: *const c_char,
    filter_mode: *const c_char,
) -> *mut StepTrackerHandle {
    clear_last_error();

    let path = match cstr_to_string(store_path) {
        Some(s) => s,
        None => {
            set_last_error("Invalid store path pointer");
            return ptr::null_mut();
        }
    };

    let filter = match parse_filter_mode(cstr_to_string(filter_mode)) {
        Ok(filter) => filter,
        Err(e) => {
            set_last_error(&e.to_string());
            return ptr::null_mut();
        }
    };

    let config = TrackerConfig {
        filter,
        store_path: path.into(),
        ..TrackerConfig::default()
    };

    let store = match JsonFileStore::open(&config.store_path).and_then(StoreHandle::spawn) {
        Ok(store) => store,
        Err(e) => {
            set_last_error(&e.to_string());
            return ptr::null_mut();
        }
    };

    let handle = Box::new(StepTrackerHandle {
        tracker: Mutex::new(StepTracker::new(store, &config)),
    });
    Box::into_raw(handle)
}

/// Free a tracker. Queued store writes are completed first.
///
/// # Safety
/// - `tracker` must be a valid pointer returned by `stepflux_tracker_new`, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn stepflux_tracker_free(tracker: *mut StepTrackerHandle) {
    if !tracker.is_null() {
        drop(Box::from_raw(tracker));
    }
}

/// Start tracking for `identity` (e.g. the account email).
///
/// # Safety
/// - `tracker` must be a valid pointer returned by `stepflux_tracker_new`.
/// - `identity` may be NULL to resume the current user.
/// - Returns 0 on success, -1 on error (see `stepflux_last_error`).
#[no_mangle]
pub unsafe extern "C" fn stepflux_tracker_start(
    tracker: *mut StepTrackerHandle,
    identity: *const c_char,
    has_step_counter: bool,
    has_accelerometer: bool,
) -> i32 {
    clear_last_error();

    if tracker.is_null() {
        set_last_error("Null tracker pointer");
        return -1;
    }

    let handle = &*tracker;
    let identity = cstr_to_string(identity);
    let caps = SensorCapabilities {
        step_counter: has_step_counter,
        accelerometer: has_accelerometer,
    };

    match handle.lock().on_start(identity.as_deref(), caps) {
        Ok(_) => 0,
        Err(e) => {
            set_last_error(&e.to_string());
            -1
        }
    }
}

/// Block until the current user's stored state has loaded.
///
/// # Safety
/// - `tracker` must be a valid pointer returned by `stepflux_tracker_new`.
/// - Must not be called from a thread driving an async runtime.
#[no_mangle]
pub unsafe extern "C" fn stepflux_tracker_await_ready(tracker: *mut StepTrackerHandle) -> i32 {
    clear_last_error();

    if tracker.is_null() {
        set_last_error("Null tracker pointer");
        return -1;
    }

    (*tracker).lock().blocking_ready();
    0
}

/// Release sensor subscriptions. Idempotent.
///
/// # Safety
/// - `tracker` must be a valid pointer returned by `stepflux_tracker_new`, or NULL.
#[no_mangle]
pub unsafe extern "C" fn stepflux_tracker_stop(tracker: *mut StepTrackerHandle) {
    if !tracker.is_null() {
        (*tracker).lock().on_stop();
    }
}

// ============================================================================
// Sensor callbacks
// ============================================================================

/// Feed a step-counter sample.
///
/// `observed_at_ms` is Unix epoch milliseconds; `utc_offset_secs` is the
/// device's local offset at that instant.
///
/// # Safety
/// - `tracker` must be a valid pointer returned by `stepflux_tracker_new`.
/// - Returns today's step count, or -1 on error (see `stepflux_last_error`).
#[no_mangle]
pub unsafe extern "C" fn stepflux_tracker_on_step_counter(
    tracker: *mut StepTrackerHandle,
    raw_count: f64,
    observed_at_ms: i64,
    utc_offset_secs: i32,
) -> i64 {
    clear_last_error();

    if tracker.is_null() {
        set_last_error("Null tracker pointer");
        return -1;
    }

    let observed_at = match timestamp(observed_at_ms, utc_offset_secs) {
        Some(at) => at,
        None => {
            set_last_error("Invalid timestamp or UTC offset");
            return -1;
        }
    };

    let mut tracker = (*tracker).lock();
    match tracker.on_sensor_event(SensorEvent::pedometer(raw_count, observed_at)) {
        Ok(_) => tracker.today_steps(),
        Err(e) => {
            set_last_error(&e.to_string());
            -1
        }
    }
}

/// Feed an accelerometer magnitude (m/s²).
///
/// # Safety
/// - `tracker` must be a valid pointer returned by `stepflux_tracker_new`.
/// - Returns 0 on success, -1 on error (see `stepflux_last_error`).
#[no_mangle]
pub unsafe extern "C" fn stepflux_tracker_on_accelerometer(
    tracker: *mut StepTrackerHandle,
    magnitude: f64,
) -> i32 {
    clear_last_error();

    if tracker.is_null() {
        set_last_error("Null tracker pointer");
        return -1;
    }

    match (*tracker)
        .lock()
        .on_sensor_event(SensorEvent::accelerometer(magnitude))
    {
        Ok(_) => 0,
        Err(e) => {
            set_last_error(&e.to_string());
            -1
        }
    }
}

// ============================================================================
// Queries
// ============================================================================

/// Steps counted today, or 0 when not tracking.
///
/// # Safety
/// - `tracker` must be a valid pointer returned by `stepflux_tracker_new`, or NULL.
#[no_mangle]
pub unsafe extern "C" fn stepflux_tracker_today_steps(tracker: *mut StepTrackerHandle) -> i64 {
    if tracker.is_null() {
        return 0;
    }
    (*tracker).lock().today_steps()
}

/// Tracker snapshot as JSON.
///
/// # Safety
/// - `tracker` must be a valid pointer returned by `stepflux_tracker_new`.
/// - Returns a newly allocated string that must be freed with `stepflux_free_string`.
/// - Returns NULL on error; call `stepflux_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn stepflux_tracker_snapshot(tracker: *mut StepTrackerHandle) -> *mut c_char {
    clear_last_error();

    if tracker.is_null() {
        set_last_error("Null tracker pointer");
        return ptr::null_mut();
    }

    let snapshot = (*tracker).lock().snapshot();
    match serde_json::to_string(&snapshot) {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by stepflux functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by a stepflux function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn stepflux_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error message.
///
/// # Safety
/// - Returns a pointer to a thread-local error string.
/// - The returned pointer is valid until the next stepflux call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn stepflux_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

/// Get the library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn stepflux_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    // 2024-03-09T08:00:00+01:00
    const MORNING_MS: i64 = 1_709_967_600_000;
    const CET: i32 = 3600;

    fn new_tracker(dir: &tempfile::TempDir) -> *mut StepTrackerHandle {
        let path = CString::new(dir.path().join("steps.json").to_str().unwrap()).unwrap();
        unsafe { stepflux_tracker_new(path.as_ptr(), ptr::null()) }
    }

    #[test]
    fn test_ffi_tracker_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let identity = CString::new("jane.doe@mail.com").unwrap();

        unsafe {
            let tracker = new_tracker(&dir);
            assert!(!tracker.is_null());

            assert_eq!(stepflux_tracker_start(tracker, identity.as_ptr(), true, false), 0);
            assert_eq!(stepflux_tracker_await_ready(tracker), 0);

            assert_eq!(stepflux_tracker_on_step_counter(tracker, 4000.0, MORNING_MS, CET), 0);
            assert_eq!(
                stepflux_tracker_on_step_counter(tracker, 4012.0, MORNING_MS + 5_000, CET),
                12
            );

            let snapshot = stepflux_tracker_snapshot(tracker);
            assert!(!snapshot.is_null());
            let json: serde_json::Value =
                serde_json::from_str(CStr::from_ptr(snapshot).to_str().unwrap()).unwrap();
            assert_eq!(json["user_key"], "jane_doe@mail_com");
            assert_eq!(json["today_steps"], 12);
            assert_eq!(json["current_date"], "2024-03-09");
            stepflux_free_string(snapshot);

            stepflux_tracker_stop(tracker);
            stepflux_tracker_free(tracker);
        }

        // Freeing drained the writer into the file
        let saved = std::fs::read_to_string(dir.path().join("steps.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&saved).unwrap();
        assert_eq!(doc["users"]["jane_doe@mail_com"]["currentSteps"], 12);
    }

    #[test]
    fn test_ffi_start_without_identity_fails() {
        let dir = tempfile::tempdir().unwrap();

        unsafe {
            let tracker = new_tracker(&dir);
            assert_eq!(stepflux_tracker_start(tracker, ptr::null(), true, true), -1);

            let error = stepflux_last_error();
            assert!(!error.is_null());
            assert!(CStr::from_ptr(error)
                .to_str()
                .unwrap()
                .contains("identity"));

            assert_eq!(stepflux_tracker_on_step_counter(tracker, 1.0, MORNING_MS, CET), -1);
            stepflux_tracker_free(tracker);
        }
    }

    #[test]
    fn test_ffi_rejects_unknown_filter_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = CString::new(dir.path().join("steps.json").to_str().unwrap()).unwrap();
        let mode = CString::new("aggressive").unwrap();

        unsafe {
            let tracker = stepflux_tracker_new(path.as_ptr(), mode.as_ptr());
            assert!(tracker.is_null());
            assert!(!stepflux_last_error().is_null());
        }
    }

    #[test]
    fn test_ffi_version() {
        unsafe {
            let version = stepflux_version();
            assert!(!version.is_null());

            let version_str = CStr::from_ptr(version).to_str().unwrap();
            assert!(!version_str.is_empty());
        }
    }
}
