//! Locating external tools
//!
//! Resolves `xcrun`, `adb` and `emulator` once at startup. Android tools are
//! looked up in `PATH` first and then under `ANDROID_HOME` / `ANDROID_SDK_ROOT`.

use std::path::PathBuf;

use simdemon_core::prelude::*;

/// Resolved paths of the device tooling
#[derive(Debug, Clone, Default)]
pub struct ToolPaths {
    /// `xcrun` (macOS with Xcode)
    pub xcrun: Option<PathBuf>,
    /// Android Debug Bridge
    pub adb: Option<PathBuf>,
    /// Android emulator launcher
    pub emulator: Option<PathBuf>,
}

impl ToolPaths {
    /// Look up every tool (run once at startup)
    pub fn discover() -> Self {
        let tools = Self {
            xcrun: Self::find_xcrun(),
            adb: Self::find_android_tool("adb", "platform-tools"),
            emulator: Self::find_android_tool("emulator", "emulator"),
        };
        debug!("Tool discovery: {:?}", tools);
        tools
    }

    fn find_xcrun() -> Option<PathBuf> {
        #[cfg(not(target_os = "macos"))]
        return None;

        #[cfg(target_os = "macos")]
        which::which("xcrun").ok()
    }

    fn find_android_tool(name: &str, sdk_subdir: &str) -> Option<PathBuf> {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }

        sdk_roots()
            .into_iter()
            .map(|root| root.join(sdk_subdir).join(name))
            .find(|candidate| candidate.is_file())
    }

    pub fn xcrun(&self) -> Result<PathBuf> {
        self.xcrun
            .clone()
            .ok_or_else(|| Error::tool_not_found("xcrun (install Xcode to use iOS simulators)"))
    }

    pub fn adb(&self) -> Result<PathBuf> {
        self.adb
            .clone()
            .ok_or_else(|| Error::tool_not_found("adb (set ANDROID_HOME or install Android Studio)"))
    }

    pub fn emulator(&self) -> Result<PathBuf> {
        self.emulator.clone().ok_or_else(|| {
            Error::tool_not_found("emulator (set ANDROID_HOME or install Android Studio)")
        })
    }
}

/// Android SDK roots from the environment, in priority order
pub fn sdk_roots() -> Vec<PathBuf> {
    ["ANDROID_HOME", "ANDROID_SDK_ROOT"]
        .iter()
        .filter_map(|var| std::env::var_os(var))
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .collect()
}
