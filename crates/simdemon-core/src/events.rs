//! Event types exchanged between the running app, the orchestrator and observers
//!
//! Messages on the instrumentation channel are JSON objects of the form
//! `{"type": "<name>", "data": <payload>}`. Inbound messages are validated
//! into [`AppEvent`]; anything unknown or malformed is rejected.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::{
    DeviceInfo, DeviceSettings, InspectData, LogLevel, NavigationEntry, ProjectState,
};

// ─────────────────────────────────────────────────────────────────────────────
// App → Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

/// Events reported by the running application
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    AppReady,
    FastRefreshStarted,
    FastRefreshComplete,
    NavigationChanged(NavigationEntry),
    InspectData { id: u64, data: InspectData },
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct InspectReply {
    id: u64,
    #[serde(flatten)]
    data: InspectData,
}

impl AppEvent {
    /// Parse one instrumentation message.
    ///
    /// Returns a description of the problem for unknown types or payloads that
    /// don't match the expected shape.
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let raw: RawMessage =
            serde_json::from_str(text).map_err(|e| format!("malformed message: {e}"))?;

        let payload_err = |e: serde_json::Error| format!("invalid '{}' payload: {e}", raw.kind);

        match raw.kind.as_str() {
            "appReady" => Ok(AppEvent::AppReady),
            "fastRefreshStarted" => Ok(AppEvent::FastRefreshStarted),
            "fastRefreshComplete" => Ok(AppEvent::FastRefreshComplete),
            "navigationChanged" => serde_json::from_value(raw.data.clone())
                .map(AppEvent::NavigationChanged)
                .map_err(payload_err),
            "inspectData" => serde_json::from_value::<InspectReply>(raw.data.clone())
                .map(|reply| AppEvent::InspectData {
                    id: reply.id,
                    data: reply.data,
                })
                .map_err(payload_err),
            other => Err(format!("unknown message type '{other}'")),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            AppEvent::AppReady => EventKind::AppReady,
            AppEvent::FastRefreshStarted => EventKind::FastRefreshStarted,
            AppEvent::FastRefreshComplete => EventKind::FastRefreshComplete,
            AppEvent::NavigationChanged(_) => EventKind::AppNavigationChanged,
            AppEvent::InspectData { .. } => EventKind::InspectData,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator → App
// ─────────────────────────────────────────────────────────────────────────────

/// Commands delivered to the running application
#[derive(Debug, Clone, PartialEq)]
pub enum AppCommand {
    OpenPreview {
        preview_id: String,
    },
    OpenUrl {
        url: String,
    },
    OpenNavigation {
        id: String,
    },
    Inspect {
        id: u64,
        x: f64,
        y: f64,
        request_stack: bool,
    },
    IosDevMenu,
    EditorFileChanged {
        filename: String,
        follow_enabled: bool,
    },
}

impl AppCommand {
    pub fn type_name(&self) -> &'static str {
        match self {
            AppCommand::OpenPreview { .. } => "openPreview",
            AppCommand::OpenUrl { .. } => "openUrl",
            AppCommand::OpenNavigation { .. } => "openNavigation",
            AppCommand::Inspect { .. } => "inspect",
            AppCommand::IosDevMenu => "iosDevMenu",
            AppCommand::EditorFileChanged { .. } => "editorFileChanged",
        }
    }

    /// Encode as an instrumentation channel message
    pub fn to_message(&self) -> String {
        let data = match self {
            AppCommand::OpenPreview { preview_id } => json!({ "previewId": preview_id }),
            AppCommand::OpenUrl { url } => json!({ "url": url }),
            AppCommand::OpenNavigation { id } => json!({ "id": id }),
            AppCommand::Inspect {
                id,
                x,
                y,
                request_stack,
            } => json!({ "id": id, "x": x, "y": y, "requestStack": request_stack }),
            AppCommand::IosDevMenu => Value::Null,
            AppCommand::EditorFileChanged {
                filename,
                follow_enabled,
            } => json!({ "filename": filename, "followEnabled": follow_enabled }),
        };

        let mut message = json!({ "type": self.type_name() });
        if !data.is_null() {
            message["data"] = data;
        }
        message.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator → Observers
// ─────────────────────────────────────────────────────────────────────────────

/// Events published to observers of the project
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ProjectEvent {
    ProjectStateChanged(ProjectState),
    DeviceSettingsChanged(DeviceSettings),
    NeedsNativeRebuild,
    NavigationChanged(NavigationEntry),
    Log { level: LogLevel, message: String },
    DevicesChanged(Vec<DeviceInfo>),
}

impl ProjectEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ProjectEvent::ProjectStateChanged(_) => EventKind::ProjectStateChanged,
            ProjectEvent::DeviceSettingsChanged(_) => EventKind::DeviceSettingsChanged,
            ProjectEvent::NeedsNativeRebuild => EventKind::NeedsNativeRebuild,
            ProjectEvent::NavigationChanged(_) => EventKind::NavigationChanged,
            ProjectEvent::Log { .. } => EventKind::Log,
            ProjectEvent::DevicesChanged(_) => EventKind::DevicesChanged,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Notifier Registry Keys
// ─────────────────────────────────────────────────────────────────────────────

/// Any event the notifier dispatches to local listeners
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    App(AppEvent),
    Project(ProjectEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::App(event) => event.kind(),
            Event::Project(event) => event.kind(),
        }
    }
}

impl From<AppEvent> for Event {
    fn from(event: AppEvent) -> Self {
        Event::App(event)
    }
}

impl From<ProjectEvent> for Event {
    fn from(event: ProjectEvent) -> Self {
        Event::Project(event)
    }
}

/// Closed set of event names listeners can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AppReady,
    FastRefreshStarted,
    FastRefreshComplete,
    AppNavigationChanged,
    InspectData,
    ProjectStateChanged,
    DeviceSettingsChanged,
    NeedsNativeRebuild,
    NavigationChanged,
    Log,
    DevicesChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::AppReady,
        EventKind::FastRefreshStarted,
        EventKind::FastRefreshComplete,
        EventKind::AppNavigationChanged,
        EventKind::InspectData,
        EventKind::ProjectStateChanged,
        EventKind::DeviceSettingsChanged,
        EventKind::NeedsNativeRebuild,
        EventKind::NavigationChanged,
        EventKind::Log,
        EventKind::DevicesChanged,
    ];
}

// ─────────────────────────────────────────────────────────────────────────────
// Collaborator Events
// ─────────────────────────────────────────────────────────────────────────────

/// Output of a managed child process
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    Exited { code: Option<i32> },
}

/// Events from the JS bundler
#[derive(Debug, Clone, PartialEq)]
pub enum BundlerEvent {
    Ready,
    /// Bundle transform progress in `0.0..=1.0`
    Progress(f64),
    BundleError {
        message: String,
    },
    IncrementalBundleError {
        message: String,
        module: Option<String>,
    },
}

/// Events from an attached debugger
#[derive(Debug, Clone, PartialEq)]
pub enum DebuggerEvent {
    ConsoleLog { level: LogLevel, message: String },
    Paused { reason: String },
    Resumed,
}

impl DebuggerEvent {
    pub fn is_exception_pause(&self) -> bool {
        matches!(self, DebuggerEvent::Paused { reason } if reason == "exception")
    }
}
