//! Core domain types

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Platform & Devices
// ─────────────────────────────────────────────────────────────────────────────

/// Target platform of a device and its build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    /// Workspace store key holding the cached build for this platform
    pub fn cache_key(&self) -> &'static str {
        match self {
            Platform::Ios => "ios_build_cache",
            Platform::Android => "android_build_cache",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Ios => write!(f, "iOS"),
            Platform::Android => write!(f, "Android"),
        }
    }
}

/// A simulator or emulator that can be selected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Simulator UDID or AVD name
    pub id: String,
    pub name: String,
    pub platform: Platform,
    /// Runtime or system image, e.g. "iOS 17.2" or "android-34"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_image: Option<String>,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>, platform: Platform) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            platform,
            system_image: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Build Results
// ─────────────────────────────────────────────────────────────────────────────

/// Installable output of a native build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "platform", rename_all = "lowercase")]
pub enum BuildResult {
    #[serde(rename_all = "camelCase")]
    Ios { app_path: PathBuf, bundle_id: String },
    #[serde(rename_all = "camelCase")]
    Android {
        apk_path: PathBuf,
        package_name: String,
    },
}

impl BuildResult {
    pub fn platform(&self) -> Platform {
        match self {
            BuildResult::Ios { .. } => Platform::Ios,
            BuildResult::Android { .. } => Platform::Android,
        }
    }

    /// Path of the artifact on disk (`.app` directory or `.apk` file)
    pub fn artifact_path(&self) -> &Path {
        match self {
            BuildResult::Ios { app_path, .. } => app_path,
            BuildResult::Android { apk_path, .. } => apk_path,
        }
    }

    /// Bundle identifier or package name
    pub fn app_id(&self) -> &str {
        match self {
            BuildResult::Ios { bundle_id, .. } => bundle_id,
            BuildResult::Android { package_name, .. } => package_name,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device Settings
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Appearance {
    Light,
    #[default]
    Dark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentSize {
    XSmall,
    Small,
    #[default]
    Normal,
    Large,
    XLarge,
    XXLarge,
    XXXLarge,
}

impl ContentSize {
    /// `simctl ui content_size` argument
    pub fn ios_category(&self) -> &'static str {
        match self {
            ContentSize::XSmall => "extra-small",
            ContentSize::Small => "small",
            ContentSize::Normal => "medium",
            ContentSize::Large => "large",
            ContentSize::XLarge => "extra-large",
            ContentSize::XXLarge => "extra-extra-large",
            ContentSize::XXXLarge => "extra-extra-extra-large",
        }
    }

    /// Android `font_scale` system setting
    pub fn android_font_scale(&self) -> f32 {
        match self {
            ContentSize::XSmall => 0.7,
            ContentSize::Small => 0.85,
            ContentSize::Normal => 1.0,
            ContentSize::Large => 1.15,
            ContentSize::XLarge => 1.3,
            ContentSize::XXLarge => 1.5,
            ContentSize::XXXLarge => 1.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub is_disabled: bool,
}

impl Default for Location {
    fn default() -> Self {
        Self {
            latitude: 50.048653,
            longitude: 19.965474,
            is_disabled: true,
        }
    }
}

/// Simulated device environment applied after boot
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSettings {
    #[serde(default)]
    pub appearance: Appearance,
    #[serde(default)]
    pub content_size: ContentSize,
    #[serde(default)]
    pub location: Location,
}

/// Zoom of the preview surface
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoomLevel {
    Fit,
    Scale(f64),
}

// ─────────────────────────────────────────────────────────────────────────────
// Project Status
// ─────────────────────────────────────────────────────────────────────────────

/// Coarse status of the project as seen by observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProjectStatus {
    #[default]
    Starting,
    Running,
    BuildError,
    RuntimeError,
    BundleError,
    IncrementalBundleError,
    DebuggerPaused,
    Refreshing,
}

/// Ordered startup stages with display text and progress weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StartupMessage {
    InitializingDevice,
    StartingPackager,
    BootingDevice,
    Building,
    Installing,
    Launching,
    WaitingForAppToLoad,
    AttachingDebugger,
    Restarting,
}

impl StartupMessage {
    /// Stages that contribute to overall startup progress, in order.
    pub const WEIGHTED: [StartupMessage; 8] = [
        StartupMessage::InitializingDevice,
        StartupMessage::StartingPackager,
        StartupMessage::BootingDevice,
        StartupMessage::Building,
        StartupMessage::Installing,
        StartupMessage::Launching,
        StartupMessage::WaitingForAppToLoad,
        StartupMessage::AttachingDebugger,
    ];

    pub fn message(&self) -> &'static str {
        match self {
            StartupMessage::InitializingDevice => "Initializing device",
            StartupMessage::StartingPackager => "Starting packager",
            StartupMessage::BootingDevice => "Booting device",
            StartupMessage::Building => "Building",
            StartupMessage::Installing => "Installing",
            StartupMessage::Launching => "Launching",
            StartupMessage::WaitingForAppToLoad => "Waiting for app to load",
            StartupMessage::AttachingDebugger => "Attaching debugger",
            StartupMessage::Restarting => "Restarting",
        }
    }

    pub fn weight(&self) -> Option<u32> {
        match self {
            StartupMessage::InitializingDevice => Some(1),
            StartupMessage::StartingPackager => Some(1),
            StartupMessage::BootingDevice => Some(2),
            StartupMessage::Building => Some(7),
            StartupMessage::Installing => Some(1),
            StartupMessage::Launching => Some(1),
            StartupMessage::WaitingForAppToLoad => Some(6),
            StartupMessage::AttachingDebugger => Some(1),
            StartupMessage::Restarting => None,
        }
    }

    /// Overall startup progress in `0.0..=1.0` given progress within this stage.
    ///
    /// Returns `None` for stages that carry no weight.
    pub fn overall_progress(&self, stage_progress: Option<f64>) -> Option<f64> {
        let weight = self.weight()?;
        let total: u32 = Self::WEIGHTED.iter().filter_map(|s| s.weight()).sum();
        let done: u32 = Self::WEIGHTED
            .iter()
            .take_while(|s| *s != self)
            .filter_map(|s| s.weight())
            .sum();
        let within = stage_progress.unwrap_or(0.0).clamp(0.0, 1.0);
        Some((done as f64 + weight as f64 * within) / total as f64)
    }
}

impl fmt::Display for StartupMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// State exposed to observers, owned by the project orchestrator
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectState {
    pub status: ProjectStatus,
    pub startup_message: Option<StartupMessage>,
    pub stage_progress: Option<f64>,
    pub preview_url: Option<String>,
    pub selected_device: Option<DeviceInfo>,
    pub preview_zoom: Option<ZoomLevel>,
}

impl ProjectState {
    pub fn new(preview_zoom: Option<ZoomLevel>) -> Self {
        Self {
            preview_zoom,
            ..Default::default()
        }
    }

    /// Merge a partial update.
    ///
    /// Any update touching `status` or `startup_message` resets
    /// `stage_progress`, so progress never leaks across stages. Within a
    /// stage, progress only moves forward.
    pub fn apply(&mut self, update: ProjectStateUpdate) {
        let resets_progress = update.status.is_some() || update.startup_message.is_some();

        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(message) = update.startup_message {
            self.startup_message = message;
        }
        if resets_progress {
            self.stage_progress = None;
        } else if let Some(progress) = update.stage_progress {
            if self.stage_progress.map_or(true, |current| progress > current) {
                self.stage_progress = Some(progress);
            }
        }
        if let Some(url) = update.preview_url {
            self.preview_url = url;
        }
        if let Some(device) = update.selected_device {
            self.selected_device = device;
        }
        if let Some(zoom) = update.preview_zoom {
            self.preview_zoom = Some(zoom);
        }
    }
}

/// Partial [`ProjectState`] update. Unset fields are left untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProjectStateUpdate {
    pub status: Option<ProjectStatus>,
    pub startup_message: Option<Option<StartupMessage>>,
    pub stage_progress: Option<f64>,
    pub preview_url: Option<Option<String>>,
    pub selected_device: Option<Option<DeviceInfo>>,
    pub preview_zoom: Option<ZoomLevel>,
}

impl ProjectStateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(status: ProjectStatus) -> Self {
        Self::new().with_status(status)
    }

    pub fn startup(message: StartupMessage) -> Self {
        Self::new().with_startup_message(Some(message))
    }

    pub fn progress(progress: f64) -> Self {
        Self {
            stage_progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: ProjectStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_startup_message(mut self, message: Option<StartupMessage>) -> Self {
        self.startup_message = Some(message);
        self
    }

    pub fn with_preview_url(mut self, url: Option<String>) -> Self {
        self.preview_url = Some(url);
        self
    }

    pub fn with_selected_device(mut self, device: DeviceInfo) -> Self {
        self.selected_device = Some(Some(device));
        self
    }

    pub fn without_selected_device(mut self) -> Self {
        self.selected_device = Some(None);
        self
    }

    pub fn with_preview_zoom(mut self, zoom: ZoomLevel) -> Self {
        self.preview_zoom = Some(zoom);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime Controls
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TouchType {
    Down,
    Move,
    Up,
}

impl TouchType {
    /// Preview server stdin verb
    pub fn command(&self) -> &'static str {
        match self {
            TouchType::Down => "touchDown",
            TouchType::Move => "touchMove",
            TouchType::Up => "touchUp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyDirection {
    Down,
    Up,
}

impl KeyDirection {
    pub fn command(&self) -> &'static str {
        match self {
            KeyDirection::Down => "keyDown",
            KeyDirection::Up => "keyUp",
        }
    }
}

/// Permission groups that can be reset for the installed app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AppPermission {
    All,
    Location,
    Photos,
    Contacts,
    Calendar,
}

impl AppPermission {
    /// `simctl privacy` service name
    pub fn ios_service(&self) -> &'static str {
        match self {
            AppPermission::All => "all",
            AppPermission::Location => "location",
            AppPermission::Photos => "photos",
            AppPermission::Contacts => "contacts",
            AppPermission::Calendar => "calendar",
        }
    }

    /// Android runtime permissions in this group. Empty for [`AppPermission::All`],
    /// which resets every permission of the package instead.
    pub fn android_permissions(&self) -> &'static [&'static str] {
        match self {
            AppPermission::All => &[],
            AppPermission::Location => &[
                "android.permission.ACCESS_FINE_LOCATION",
                "android.permission.ACCESS_COARSE_LOCATION",
                "android.permission.ACCESS_BACKGROUND_LOCATION",
            ],
            AppPermission::Photos => &[
                "android.permission.READ_MEDIA_IMAGES",
                "android.permission.READ_MEDIA_VIDEO",
                "android.permission.READ_EXTERNAL_STORAGE",
            ],
            AppPermission::Contacts => &[
                "android.permission.READ_CONTACTS",
                "android.permission.WRITE_CONTACTS",
                "android.permission.GET_ACCOUNTS",
            ],
            AppPermission::Calendar => &[
                "android.permission.READ_CALENDAR",
                "android.permission.WRITE_CALENDAR",
            ],
        }
    }
}

/// Re-orchestration levels, from heaviest to lightest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReloadAction {
    Rebuild,
    Reboot,
    Reinstall,
    RestartProcess,
    ReloadJs,
    HotReload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Map a console API call type (`log`, `warn`, `error`, ...) to a level
    pub fn from_console_type(kind: &str) -> Self {
        match kind {
            "error" | "assert" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warning,
            "debug" | "trace" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inspector
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Frame {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLocation {
    pub file_name: String,
    pub line0_based: u32,
    pub column0_based: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectStackItem {
    pub component_name: String,
    pub source: SourceLocation,
    /// Set for frames outside the app's own sources
    #[serde(default)]
    pub hide: bool,
}

/// Element found under a point of the preview
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InspectData {
    pub frame: Frame,
    #[serde(default)]
    pub stack: Option<Vec<InspectStackItem>>,
}

/// Route reported by the running app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationEntry {
    pub id: String,
    pub display_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_update_clears_stage_progress() {
        let mut state = ProjectState::default();
        state.apply(ProjectStateUpdate::startup(StartupMessage::Building));
        state.apply(ProjectStateUpdate::progress(0.4));
        assert_eq!(state.stage_progress, Some(0.4));

        state.apply(ProjectStateUpdate::startup(StartupMessage::Installing));
        assert_eq!(state.stage_progress, None);
        assert_eq!(state.startup_message, Some(StartupMessage::Installing));

        state.apply(ProjectStateUpdate::progress(0.9));
        state.apply(ProjectStateUpdate::status(ProjectStatus::Running));
        assert_eq!(state.stage_progress, None);
    }

    #[test]
    fn test_stage_progress_never_goes_back() {
        let mut state = ProjectState::default();
        state.apply(ProjectStateUpdate::startup(StartupMessage::Building));
        state.apply(ProjectStateUpdate::progress(0.6));
        state.apply(ProjectStateUpdate::progress(0.3));
        assert_eq!(state.stage_progress, Some(0.6));

        state.apply(ProjectStateUpdate::progress(0.8));
        assert_eq!(state.stage_progress, Some(0.8));

        state.apply(ProjectStateUpdate::startup(StartupMessage::Installing));
        state.apply(ProjectStateUpdate::progress(0.1));
        assert_eq!(state.stage_progress, Some(0.1));
    }

    #[test]
    fn test_partial_update_leaves_other_fields() {
        let device = DeviceInfo::new("sim-1", "iPhone 15", Platform::Ios);
        let mut state = ProjectState::new(Some(ZoomLevel::Fit));
        state.apply(
            ProjectStateUpdate::status(ProjectStatus::Starting)
                .with_selected_device(device.clone())
                .with_preview_url(Some("http://localhost:1/stream.mjpeg".into())),
        );
        state.apply(ProjectStateUpdate::new().with_preview_url(None));

        assert_eq!(state.selected_device, Some(device));

        state.apply(ProjectStateUpdate::new().without_selected_device());
        assert_eq!(state.selected_device, None);
        assert_eq!(state.preview_zoom, Some(ZoomLevel::Fit));
        assert_eq!(state.preview_url, None);
        assert_eq!(state.preview_zoom, Some(ZoomLevel::Fit));
    }

    #[test]
    fn test_startup_stages_are_ordered() {
        assert!(StartupMessage::InitializingDevice < StartupMessage::Building);
        assert!(StartupMessage::WaitingForAppToLoad < StartupMessage::AttachingDebugger);
        assert_eq!(StartupMessage::Building.weight(), Some(7));
        assert_eq!(StartupMessage::Restarting.weight(), None);
        assert_eq!(
            StartupMessage::WaitingForAppToLoad.to_string(),
            "Waiting for app to load"
        );
    }

    #[test]
    fn test_overall_progress() {
        assert_eq!(
            StartupMessage::InitializingDevice.overall_progress(None),
            Some(0.0)
        );
        // 1 + 1 + 2 = 4 of 20 done, half of building (3.5) on top
        let progress = StartupMessage::Building
            .overall_progress(Some(0.5))
            .unwrap();
        assert!((progress - 7.5 / 20.0).abs() < f64::EPSILON);
        assert_eq!(StartupMessage::Restarting.overall_progress(Some(0.5)), None);
    }

    #[test]
    fn test_device_settings_defaults() {
        let settings = DeviceSettings::default();
        assert_eq!(settings.appearance, Appearance::Dark);
        assert_eq!(settings.content_size, ContentSize::Normal);
        assert!(settings.location.is_disabled);
        assert_eq!(settings.location.latitude, 50.048653);
    }

    #[test]
    fn test_build_result_serde_shape() {
        let result = BuildResult::Android {
            apk_path: PathBuf::from("/w/app-debug.apk"),
            package_name: "com.example".into(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["platform"], "android");
        assert_eq!(json["packageName"], "com.example");
        assert_eq!(result.platform().cache_key(), "android_build_cache");
        assert_eq!(result.app_id(), "com.example");
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&ProjectStatus::IncrementalBundleError).unwrap();
        assert_eq!(json, "\"incrementalBundleError\"");
    }

    #[test]
    fn test_app_permission_names() {
        let json = serde_json::to_string(&AppPermission::Photos).unwrap();
        assert_eq!(json, "\"photos\"");
        assert_eq!(AppPermission::All.ios_service(), "all");
        assert!(AppPermission::All.android_permissions().is_empty());
        assert!(AppPermission::Location
            .android_permissions()
            .contains(&"android.permission.ACCESS_FINE_LOCATION"));
    }

    #[test]
    fn test_console_level_mapping() {
        assert_eq!(LogLevel::from_console_type("warn"), LogLevel::Warning);
        assert_eq!(LogLevel::from_console_type("error"), LogLevel::Error);
        assert_eq!(LogLevel::from_console_type("log"), LogLevel::Info);
    }
}
