//! # simdemon-core - Core Domain Types
//!
//! Foundation crate for Sim Demon. Provides domain types, error handling,
//! event definitions, cancellation and workspace fingerprinting.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, thiserror, tracing, sha2, walkdir, tokio-util).
//!
//! ## Public API
//!
//! ### Domain Types (`types`)
//! - [`Platform`], [`DeviceInfo`], [`DeviceSettings`] - Devices and their environment
//! - [`BuildResult`] - Installable artifact of a native build
//! - [`ProjectState`], [`ProjectStatus`], [`StartupMessage`] - Observer-facing state
//!
//! ### Events (`events`)
//! - [`AppEvent`], [`AppCommand`] - Instrumentation channel messages
//! - [`ProjectEvent`] - Events published to observers
//! - [`Event`], [`EventKind`] - Notifier registry keys
//!
//! ### Cancellation (`cancel`)
//! - [`CancelToken`] - Write-once cancellation with ordered callbacks
//!
//! ### Fingerprints (`fingerprint`)
//! - [`Fingerprint`] - Hash of the native build inputs
//! - [`fingerprint::content_hash()`] - Hash of a build artifact
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use simdemon_core::prelude::*;
//! ```

pub mod cancel;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod logging;
pub mod prelude;
pub mod types;

// Re-export commonly used types at crate root for convenience
pub use cancel::CancelToken;
pub use error::{Error, Result, ResultExt};
pub use events::{
    AppCommand, AppEvent, BundlerEvent, DebuggerEvent, Event, EventKind, ProcessEvent,
    ProjectEvent,
};
pub use fingerprint::{Fingerprint, FingerprintOptions};
pub use types::{
    AppPermission, Appearance, BuildResult, ContentSize, DeviceInfo, DeviceSettings, Frame, InspectData,
    InspectStackItem, KeyDirection, Location, LogLevel, NavigationEntry, Platform, ProjectState,
    ProjectStateUpdate, ProjectStatus, ReloadAction, SourceLocation, StartupMessage, TouchType,
    ZoomLevel,
};
