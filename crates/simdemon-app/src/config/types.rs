//! Configuration types for Sim Demon
//!
//! Defines `Settings` (`.simdemon/config.toml`) and its sections.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use simdemon_core::FingerprintOptions;
use simdemon_daemon::{
    AndroidBuildConfig, BundlerConfig, IosBuildConfig, NodeModules, DEFAULT_BUNDLER_PORT,
};

/// Application settings (.simdemon/config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub build: BuildSettings,

    #[serde(default)]
    pub launch: LaunchSettings,

    #[serde(default)]
    pub watcher: WatcherSettings,

    #[serde(default)]
    pub inspector: InspectorSettings,

    #[serde(default)]
    pub fingerprint: FingerprintSettings,

    #[serde(default)]
    pub bundler: BundlerSettings,
}

// ─────────────────────────────────────────────────────────────────────────────
// Build
// ─────────────────────────────────────────────────────────────────────────────

/// Native build settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildSettings {
    /// Skip native builds and run inside Expo Go
    #[serde(default)]
    pub use_expo_go: bool,

    /// Directory holding the Expo Go `.app` and `.apk`
    #[serde(default)]
    pub expo_go_dir: Option<PathBuf>,

    /// Minimum interval between build progress updates
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    #[serde(default)]
    pub android: AndroidBuildSettings,

    #[serde(default)]
    pub ios: IosBuildSettings,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            use_expo_go: false,
            expo_go_dir: None,
            progress_interval_ms: default_progress_interval_ms(),
            android: AndroidBuildSettings::default(),
            ios: IosBuildSettings::default(),
        }
    }
}

impl BuildSettings {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AndroidBuildSettings {
    #[serde(default = "default_variant")]
    pub variant: String,

    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for AndroidBuildSettings {
    fn default() -> Self {
        Self {
            variant: default_variant(),
            extra_args: Vec::new(),
        }
    }
}

impl From<&AndroidBuildSettings> for AndroidBuildConfig {
    fn from(settings: &AndroidBuildSettings) -> Self {
        Self {
            variant: settings.variant.clone(),
            extra_args: settings.extra_args.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IosBuildSettings {
    #[serde(default)]
    pub scheme: Option<String>,

    #[serde(default = "default_configuration")]
    pub configuration: String,

    #[serde(default = "default_true")]
    pub install_pods: bool,

    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for IosBuildSettings {
    fn default() -> Self {
        Self {
            scheme: None,
            configuration: default_configuration(),
            install_pods: true,
            extra_args: Vec::new(),
        }
    }
}

impl From<&IosBuildSettings> for IosBuildConfig {
    fn from(settings: &IosBuildSettings) -> Self {
        Self {
            scheme: settings.scheme.clone(),
            configuration: settings.configuration.clone(),
            install_pods: settings.install_pods,
            extra_args: settings.extra_args.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Launch
// ─────────────────────────────────────────────────────────────────────────────

/// App launch and debugger attachment
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LaunchSettings {
    /// Wait for the app to report ready before attaching the debugger
    #[serde(default = "default_true")]
    pub wait_for_app_launch: bool,

    /// How long to look for a debugger target
    #[serde(default = "default_debugger_timeout_ms")]
    pub debugger_timeout_ms: u64,

    /// Preview server executable; the preview is disabled when unset
    #[serde(default)]
    pub preview_server: Option<PathBuf>,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            wait_for_app_launch: true,
            debugger_timeout_ms: default_debugger_timeout_ms(),
            preview_server: None,
        }
    }
}

impl LaunchSettings {
    pub fn debugger_timeout(&self) -> Duration {
        Duration::from_millis(self.debugger_timeout_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Watcher / Inspector / Fingerprint / Bundler
// ─────────────────────────────────────────────────────────────────────────────

/// Native change watcher settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatcherSettings {
    /// Minimum interval between native change checks
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,

    /// Debounce duration for raw filesystem events
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            throttle_ms: default_throttle_ms(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl WatcherSettings {
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Element inspector settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InspectorSettings {
    /// Glob patterns of source files hidden from inspector stacks
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FingerprintSettings {
    /// Extra files or directories that invalidate native builds
    #[serde(default)]
    pub extra_paths: Vec<PathBuf>,
}

impl FingerprintSettings {
    pub fn options(&self) -> FingerprintOptions {
        FingerprintOptions::default().with_extra_paths(self.extra_paths.clone())
    }
}

/// JS bundler process settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BundlerSettings {
    #[serde(default = "default_bundler_command")]
    pub command: String,

    #[serde(default = "default_bundler_args")]
    pub args: Vec<String>,

    /// 0 picks a free port
    #[serde(default = "default_bundler_port")]
    pub port: u16,

    /// Installs node modules; detected from the lockfile when unset
    #[serde(default)]
    pub package_manager: Option<String>,
}

impl Default for BundlerSettings {
    fn default() -> Self {
        Self {
            command: default_bundler_command(),
            args: default_bundler_args(),
            port: default_bundler_port(),
            package_manager: None,
        }
    }
}

impl BundlerSettings {
    pub fn to_config(&self, workspace_root: impl Into<PathBuf>) -> BundlerConfig {
        BundlerConfig {
            workspace_root: workspace_root.into(),
            command: self.command.clone(),
            args: self.args.clone(),
            port: self.port,
        }
    }

    pub fn node_modules(&self, workspace_root: impl Into<PathBuf>) -> NodeModules {
        NodeModules::new(workspace_root).with_package_manager(self.package_manager.clone())
    }
}

fn default_true() -> bool {
    true
}

fn default_progress_interval_ms() -> u64 {
    100
}

fn default_variant() -> String {
    "debug".to_string()
}

fn default_configuration() -> String {
    "Debug".to_string()
}

fn default_debugger_timeout_ms() -> u64 {
    15_000
}

fn default_throttle_ms() -> u64 {
    300
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_bundler_command() -> String {
    "npx".to_string()
}

fn default_bundler_args() -> Vec<String> {
    vec!["react-native".to_string(), "start".to_string()]
}

fn default_bundler_port() -> u16 {
    DEFAULT_BUNDLER_PORT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(!settings.build.use_expo_go);
        assert_eq!(settings.build.progress_interval(), Duration::from_millis(100));
        assert!(settings.launch.wait_for_app_launch);
        assert_eq!(settings.launch.debugger_timeout(), Duration::from_secs(15));
        assert_eq!(settings.watcher.throttle(), Duration::from_millis(300));
        assert_eq!(settings.bundler.port, DEFAULT_BUNDLER_PORT);
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let settings: Settings = toml::from_str(
            r#"
[build.android]
variant = "staging"

[launch]
wait_for_app_launch = false
"#,
        )
        .unwrap();

        assert_eq!(settings.build.android.variant, "staging");
        assert_eq!(settings.build.ios.configuration, "Debug");
        assert!(!settings.launch.wait_for_app_launch);
        assert_eq!(settings.launch.debugger_timeout_ms, 15_000);

        let config = AndroidBuildConfig::from(&settings.build.android);
        assert_eq!(config.variant, "staging");
    }

    #[test]
    fn test_bundler_config_from_settings() {
        let settings = BundlerSettings {
            command: "yarn".into(),
            args: vec!["start".into()],
            port: 0,
            package_manager: Some("yarn".into()),
        };
        let config = settings.to_config("/work");
        assert_eq!(config.command, "yarn");
        assert_eq!(config.port, 0);
        assert_eq!(config.workspace_root, PathBuf::from("/work"));
        assert_eq!(settings.node_modules("/work").package_manager(), "yarn");
    }
}
