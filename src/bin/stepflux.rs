//! stepflux CLI - Command-line host for the step tracker
//!
//! Commands:
//! - run: Replay lifecycle and sensor events from stdin (streaming mode)
//! - show: Print a user's stored step history
//! - doctor: Diagnose store and configuration files
//! - schema: Print the input event schema

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chrono::{DateTime, FixedOffset};
use stepflux::store::StoreDocument;
use stepflux::types::local_now;
use stepflux::{
    FilterMode, JsonFileStore, SensorCapabilities, SensorEvent, StepOutcome, StepStore,
    StepTracker, StoreError, StoreHandle, TrackerConfig, TrackerError, TrackerSnapshot, UserKey,
    PRODUCER_NAME, STEPFLUX_VERSION,
};

/// stepflux - Restart-safe step accumulation
#[derive(Parser)]
#[command(name = "stepflux")]
#[command(author = "Synheart AI Inc")]
#[command(version = STEPFLUX_VERSION)]
#[command(about = "Turn pedometer counter readings into daily step counts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay lifecycle and sensor events from stdin (streaming mode)
    Run {
        /// JSON document store (overrides the config file)
        #[arg(long)]
        store: Option<PathBuf>,

        /// Tracker config file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Accumulation variant: auto, base or filtered (overrides the config file)
        #[arg(long)]
        filter: Option<FilterMode>,

        /// Start tracking this identity before reading input
        #[arg(long)]
        identity: Option<String>,

        /// Only print the final snapshot
        #[arg(long)]
        summary: bool,

        /// Buffer output instead of flushing after each record
        #[arg(long)]
        no_flush: bool,
    },

    /// Print a user's stored step history
    Show {
        /// JSON document store
        #[arg(long)]
        store: PathBuf,

        /// Account identity (e.g. email)
        #[arg(long)]
        identity: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Diagnose store and configuration files
    Doctor {
        /// Check this store file
        #[arg(long)]
        store: Option<PathBuf>,

        /// Check this config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the input event schema
    Schema {
        /// Output as JSON schema
        #[arg(long)]
        json_schema: bool,
    },
}

/// One line of `run` input
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputEvent {
    Start {
        #[serde(default)]
        identity: Option<String>,
        #[serde(default)]
        sensors: Option<SensorCapabilities>,
    },
    Stop,
    Pedometer {
        raw_count: f64,
        #[serde(default = "local_now")]
        observed_at: DateTime<FixedOffset>,
    },
    Accelerometer {
        magnitude: f64,
    },
}

#[derive(serde::Serialize)]
struct RunRecord {
    line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<StepOutcome>,
    snapshot: TrackerSnapshot,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), StepfluxCliError> {
    match cli.command {
        Commands::Run {
            store,
            config,
            filter,
            identity,
            summary,
            no_flush,
        } => {
            let mut tracker_config = match config {
                Some(path) => TrackerConfig::load(&path)?,
                None => TrackerConfig::default(),
            };
            if let Some(store) = store {
                tracker_config.store_path = store;
            }
            if let Some(filter) = filter {
                tracker_config.filter = filter;
            }
            cmd_run(&tracker_config, identity.as_deref(), summary, !no_flush)
        }

        Commands::Show {
            store,
            identity,
            json,
        } => cmd_show(&store, &identity, json),

        Commands::Doctor {
            store,
            config,
            json,
        } => cmd_doctor(store.as_deref(), config.as_deref(), json),

        Commands::Schema { json_schema } => cmd_schema(json_schema),
    }
}

fn cmd_run(
    config: &TrackerConfig,
    identity: Option<&str>,
    summary: bool,
    flush: bool,
) -> Result<(), StepfluxCliError> {
    let runtime = tokio::runtime::Builder::new_current_thread().build()?;

    runtime.block_on(async {
        let store = StoreHandle::spawn(JsonFileStore::open(&config.store_path)?)?;
        let mut tracker = StepTracker::new(store, config);

        if identity.is_some() {
            tracker.on_start(identity, config.sensors)?;
            tracker.ready().await;
        }

        let stdin = io::stdin();
        let mut stdout = io::stdout();

        for (index, line) in stdin.lock().lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();

            if trimmed.is_empty() {
                continue;
            }

            let event: InputEvent = serde_json::from_str(trimmed).map_err(|e| {
                StepfluxCliError::ParseError(format!("Line {}: {}", index + 1, e))
            })?;

            let outcome = match event {
                InputEvent::Start { identity, sensors } => {
                    tracker.on_start(identity.as_deref(), sensors.unwrap_or(config.sensors))?;
                    tracker.ready().await;
                    None
                }
                InputEvent::Stop => {
                    tracker.on_stop();
                    None
                }
                InputEvent::Pedometer {
                    raw_count,
                    observed_at,
                } => Some(
                    tracker.on_sensor_event(SensorEvent::pedometer(raw_count, observed_at))?,
                ),
                InputEvent::Accelerometer { magnitude } => {
                    Some(tracker.on_sensor_event(SensorEvent::accelerometer(magnitude))?)
                }
            };

            if !summary {
                let record = RunRecord {
                    line: index + 1,
                    outcome,
                    snapshot: tracker.snapshot(),
                };
                writeln!(stdout, "{}", serde_json::to_string(&record)?)?;
                if flush {
                    stdout.flush()?;
                }
            }
        }

        tracker.flush().await?;

        if summary {
            writeln!(stdout, "{}", serde_json::to_string(&tracker.snapshot())?)?;
        }
        stdout.flush()?;

        Ok::<(), StepfluxCliError>(())
    })
}

fn cmd_show(store_path: &Path, identity: &str, json: bool) -> Result<(), StepfluxCliError> {
    let store = JsonFileStore::open(store_path)?;
    let key = UserKey::from_identity(identity)?;
    let record = store
        .record(&key)?
        .ok_or_else(|| StepfluxCliError::UnknownUser(key.to_string()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!("Step history for {}", key);
        println!("=================={}", "=".repeat(key.as_str().len()));
        println!(
            "Current steps:     {}",
            record.current_steps.unwrap_or_default()
        );
        match record.last_sensor_value {
            Some(value) => println!("Last sensor value: {}", value),
            None => println!("Last sensor value: unset"),
        }
        println!();
        for (date, steps) in &record.daily_history {
            println!("  {}  {:>8}", date, steps);
        }
    }

    Ok(())
}

fn cmd_doctor(
    store: Option<&Path>,
    config: Option<&Path>,
    json: bool,
) -> Result<(), StepfluxCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "stepflux_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("stepflux version {}", STEPFLUX_VERSION),
    });

    if let Some(store_path) = store {
        let check = if !store_path.exists() {
            DoctorCheck {
                name: "store".to_string(),
                status: CheckStatus::Warning,
                message: "Store file does not exist (it will be created)".to_string(),
            }
        } else {
            match fs::read_to_string(store_path)
                .map_err(StoreError::from)
                .and_then(|content| Ok(StoreDocument::from_json(&content)?))
            {
                Ok(document) => DoctorCheck {
                    name: "store".to_string(),
                    status: CheckStatus::Ok,
                    message: format!("Store file valid ({} users)", document.users.len()),
                },
                Err(e) => DoctorCheck {
                    name: "store".to_string(),
                    status: CheckStatus::Error,
                    message: format!("Invalid store file: {}", e),
                },
            }
        };
        checks.push(check);
    }

    if let Some(config_path) = config {
        let check = match TrackerConfig::load(config_path) {
            Ok(config) => DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Ok,
                message: format!(
                    "Config valid (filter: {}, store: {})",
                    config.filter.as_str(),
                    config.store_path.display()
                ),
            },
            Err(e) => DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Error,
                message: e.to_string(),
            },
        };
        checks.push(check);
    }

    // Check stdin is available (for streaming mode)
    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (interactive mode)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (streaming mode ready)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: STEPFLUX_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("stepflux Doctor Report");
        println!("======================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(StepfluxCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn cmd_schema(json_schema: bool) -> Result<(), StepfluxCliError> {
    if json_schema {
        println!("{}", get_input_json_schema());
    } else {
        println!("Input: one JSON object per line, tagged by \"type\"");
        println!();
        println!("1. start - Begin or resume tracking");
        println!("   - identity: account identity (omit to resume the current user)");
        println!("   - sensors: {{ step_counter, accelerometer }} (optional)");
        println!();
        println!("2. stop - Release sensor subscriptions");
        println!();
        println!("3. pedometer - Cumulative step-counter reading");
        println!("   - raw_count: count since device boot");
        println!("   - observed_at: RFC 3339 timestamp with local offset (default: now)");
        println!();
        println!("4. accelerometer - Acceleration magnitude in m/s²");
        println!("   - magnitude");
    }

    Ok(())
}

fn get_input_json_schema() -> String {
    serde_json::json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "$id": "https://synheart.ai/schemas/stepflux.input_event.v1.json",
        "title": "stepflux.input_event.v1",
        "description": "stepflux lifecycle and sensor event",
        "type": "object",
        "required": ["type"],
        "oneOf": [
            {
                "properties": {
                    "type": { "const": "start" },
                    "identity": { "type": "string" },
                    "sensors": {
                        "type": "object",
                        "properties": {
                            "step_counter": { "type": "boolean" },
                            "accelerometer": { "type": "boolean" }
                        }
                    }
                }
            },
            {
                "properties": { "type": { "const": "stop" } }
            },
            {
                "required": ["raw_count"],
                "properties": {
                    "type": { "const": "pedometer" },
                    "raw_count": { "type": "number", "minimum": 0 },
                    "observed_at": { "type": "string", "format": "date-time" }
                }
            },
            {
                "required": ["magnitude"],
                "properties": {
                    "type": { "const": "accelerometer" },
                    "magnitude": { "type": "number" }
                }
            }
        ]
    })
    .to_string()
}

// Error types

#[derive(Debug)]
enum StepfluxCliError {
    Io(io::Error),
    Tracker(TrackerError),
    Store(StoreError),
    Json(serde_json::Error),
    UnknownUser(String),
    DoctorFailed,
    ParseError(String),
}

impl From<io::Error> for StepfluxCliError {
    fn from(e: io::Error) -> Self {
        StepfluxCliError::Io(e)
    }
}

impl From<TrackerError> for StepfluxCliError {
    fn from(e: TrackerError) -> Self {
        StepfluxCliError::Tracker(e)
    }
}

impl From<StoreError> for StepfluxCliError {
    fn from(e: StoreError) -> Self {
        StepfluxCliError::Store(e)
    }
}

impl From<serde_json::Error> for StepfluxCliError {
    fn from(e: serde_json::Error) -> Self {
        StepfluxCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<StepfluxCliError> for CliError {
    fn from(e: StepfluxCliError) -> Self {
        match e {
            StepfluxCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            StepfluxCliError::Tracker(TrackerError::MissingIdentity) => CliError {
                code: "MISSING_IDENTITY".to_string(),
                message: TrackerError::MissingIdentity.to_string(),
                hint: Some("Pass --identity or send a start event with an identity".to_string()),
            },
            StepfluxCliError::Tracker(TrackerError::NotStarted) => CliError {
                code: "NOT_STARTED".to_string(),
                message: TrackerError::NotStarted.to_string(),
                hint: Some("Send a start event before sensor events".to_string()),
            },
            StepfluxCliError::Tracker(e) => CliError {
                code: "TRACKER_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'stepflux doctor' to check your files".to_string()),
            },
            StepfluxCliError::Store(e) => CliError {
                code: "STORE_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'stepflux doctor --store <path>' for details".to_string()),
            },
            StepfluxCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            StepfluxCliError::UnknownUser(key) => CliError {
                code: "UNKNOWN_USER".to_string(),
                message: format!("No stored steps for {}", key),
                hint: Some("Check the identity spelling".to_string()),
            },
            StepfluxCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
            StepfluxCliError::ParseError(msg) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: msg,
                hint: Some("Run 'stepflux schema' for the input format".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_run(args: &[&str]) -> (Option<FilterMode>, bool) {
        let argv = ["stepflux", "run"].into_iter().chain(args.iter().copied());
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Commands::Run {
                filter, no_flush, ..
            } => (filter, no_flush),
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_run_flushes_unless_disabled() {
        assert_eq!(parse_run(&[]), (None, false));
        assert_eq!(parse_run(&["--no-flush"]), (None, true));
    }

    #[test]
    fn test_run_filter_uses_serialized_names() {
        assert_eq!(
            parse_run(&["--filter", "filtered"]).0,
            Some(FilterMode::Filtered)
        );
        assert!(Cli::try_parse_from(["stepflux", "run", "--filter", "aggressive"]).is_err());
    }
}
