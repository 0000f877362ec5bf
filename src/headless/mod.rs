//! Headless mode - JSON event output for scripts and editor integrations
//!
//! Every project event is written to stdout as NDJSON (newline-delimited
//! JSON), one event per line, stamped with the time it was emitted.
//!
//! # Example Output
//!
//! ```json
//! {"event":"projectStateChanged","data":{"status":"starting","startupMessage":"building","stageProgress":0.4,"previewUrl":null,"selectedDevice":{"id":"pixel","name":"Pixel 7","platform":"android"},"previewZoom":null},"timestamp":1704700001000}
//! {"event":"log","data":{"level":"warning","message":"Device is busy"},"timestamp":1704700002000}
//! {"event":"error","data":{"message":"Failed to start bundler","fatal":true},"timestamp":1704700003000}
//! ```

pub mod runner;

use chrono::Utc;
use serde::Serialize;
use std::io::{self, Write};
use tracing::error;

use simdemon_core::ProjectEvent;

/// Events emitted by the headless runner itself
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum RunnerEvent {
    /// Something went wrong outside of the project state
    Error { message: String, fatal: bool },

    /// The runner finished disposing the project
    Shutdown,
}

impl RunnerEvent {
    pub fn error(message: impl Into<String>, fatal: bool) -> Self {
        Self::Error {
            message: message.into(),
            fatal,
        }
    }
}

/// A single NDJSON line
#[derive(Debug, Serialize)]
struct Stamped<'a, T: Serialize> {
    #[serde(flatten)]
    payload: &'a T,
    timestamp: i64,
}

/// Serialize `payload` as one NDJSON line stamped with `timestamp`
pub fn to_line<T: Serialize>(payload: &T, timestamp: i64) -> serde_json::Result<String> {
    serde_json::to_string(&Stamped { payload, timestamp })
}

/// Emit a payload to stdout as JSON
pub fn emit<T: Serialize>(payload: &T) {
    let json = match to_line(payload, now()) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize headless event: {}", e);
            return;
        }
    };

    let mut stdout = io::stdout().lock();
    if let Err(e) = writeln!(stdout, "{}", json) {
        error!("Failed to write headless event to stdout: {}", e);
        return;
    }

    // Consumers read line by line
    if let Err(e) = stdout.flush() {
        error!("Failed to flush headless stdout: {}", e);
    }
}

pub fn emit_project_event(event: &ProjectEvent) {
    emit(event);
}

/// Current timestamp in milliseconds
fn now() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use simdemon_core::LogLevel;

    #[test]
    fn test_project_event_line() {
        let event = ProjectEvent::Log {
            level: LogLevel::Warning,
            message: "Device is busy".to_string(),
        };

        let line = to_line(&event, 42).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["event"], "log");
        assert_eq!(value["data"]["message"], "Device is busy");
        assert_eq!(value["timestamp"], 42);
    }

    #[test]
    fn test_unit_event_line() {
        let line = to_line(&ProjectEvent::NeedsNativeRebuild, 7).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["event"], "needsNativeRebuild");
        assert_eq!(value["timestamp"], 7);
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_runner_error_line() {
        let line = to_line(&RunnerEvent::error("no devices", true), 1).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["event"], "error");
        assert_eq!(value["data"]["message"], "no devices");
        assert_eq!(value["data"]["fatal"], true);
    }
}
