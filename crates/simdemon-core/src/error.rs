//! Application error types with rich context

use std::path::PathBuf;
use thiserror::Error;

use crate::types::Platform;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Application error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Workspace not found: {path}")]
    NoWorkspace { path: PathBuf },

    // ─────────────────────────────────────────────────────────────
    // Process Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Required tool not found: {tool}. Ensure it is installed and in your PATH.")]
    ToolNotFound { tool: String },

    #[error("Process error: {message}")]
    Process { message: String },

    #[error("Failed to spawn process: {reason}")]
    ProcessSpawn { reason: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // ─────────────────────────────────────────────────────────────
    // Build Errors
    // ─────────────────────────────────────────────────────────────
    #[error("{platform} build failed: {message}")]
    Build { platform: Platform, message: String },

    #[error("Build was cancelled")]
    BuildCancelled,

    // ─────────────────────────────────────────────────────────────
    // Device Errors
    // ─────────────────────────────────────────────────────────────
    #[error(
        "This device is already used by another instance ({device_id}). Please select another device."
    )]
    DeviceBusy { device_id: String },

    #[error("Failed to boot device: {message}")]
    BootFailed { message: String },

    #[error("Failed to install app: {message}")]
    InstallFailed { message: String },

    #[error("Failed to launch app: {message}")]
    LaunchFailed { message: String },

    #[error("Preview error: {message}")]
    Preview { message: String },

    // ─────────────────────────────────────────────────────────────
    // Bundler/Debugger Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Bundler error: {message}")]
    Bundler { message: String },

    #[error("Debugger attach failed: {message}")]
    DebuggerAttach { message: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ─────────────────────────────────────────────────────────────
    // Channel/Communication Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Channel send error: {message}")]
    ChannelSend { message: String },

    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn process(message: impl Into<String>) -> Self {
        Self::Process {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn build(platform: Platform, message: impl Into<String>) -> Self {
        Self::Build {
            platform,
            message: message.into(),
        }
    }

    pub fn device_busy(device_id: impl Into<String>) -> Self {
        Self::DeviceBusy {
            device_id: device_id.into(),
        }
    }

    pub fn boot(message: impl Into<String>) -> Self {
        Self::BootFailed {
            message: message.into(),
        }
    }

    pub fn install(message: impl Into<String>) -> Self {
        Self::InstallFailed {
            message: message.into(),
        }
    }

    pub fn launch(message: impl Into<String>) -> Self {
        Self::LaunchFailed {
            message: message.into(),
        }
    }

    pub fn preview(message: impl Into<String>) -> Self {
        Self::Preview {
            message: message.into(),
        }
    }

    pub fn bundler(message: impl Into<String>) -> Self {
        Self::Bundler {
            message: message.into(),
        }
    }

    pub fn debugger_attach(message: impl Into<String>) -> Self {
        Self::DebuggerAttach {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn channel_send(message: impl Into<String>) -> Self {
        Self::ChannelSend {
            message: message.into(),
        }
    }

    pub fn tool_not_found(tool: impl Into<String>) -> Self {
        Self::ToolNotFound { tool: tool.into() }
    }

    /// Errors the operator can resolve by picking something else or fixing
    /// their environment. These are surfaced as-is instead of as a build error.
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            Error::DeviceBusy { .. } | Error::ToolNotFound { .. } | Error::NoWorkspace { .. }
        )
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::BuildCancelled
                | Error::DebuggerAttach { .. }
                | Error::Protocol { .. }
                | Error::ChannelSend { .. }
                | Error::Preview { .. }
                | Error::DeviceBusy { .. }
        )
    }

    /// Check if this error should trigger application exit
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::NoWorkspace { .. } | Error::ToolNotFound { .. })
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions (for use with color-eyre)
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = Error::build(Platform::Android, "gradle exited with code 1");
        assert_eq!(
            err.to_string(),
            "Android build failed: gradle exited with code 1"
        );

        let err = Error::device_busy("emulator-5554");
        assert!(err.to_string().contains("already used by another instance"));
        assert!(err.to_string().contains("Please select another device"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_is_user_actionable() {
        assert!(Error::device_busy("sim-1").is_user_actionable());
        assert!(Error::tool_not_found("xcrun").is_user_actionable());
        assert!(!Error::build(Platform::Ios, "xcodebuild failed").is_user_actionable());
    }

    #[test]
    fn test_error_is_recoverable() {
        assert!(Error::BuildCancelled.is_recoverable());
        assert!(Error::debugger_attach("no target").is_recoverable());
        assert!(!Error::install("apk missing").is_recoverable());
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(Error::NoWorkspace {
            path: PathBuf::from("/test")
        }
        .is_fatal());
        assert!(!Error::BuildCancelled.is_fatal());
    }

    #[test]
    fn test_result_ext_context_preserves_error() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let err = result.context("reading state file").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
