//! # simdemon-daemon - Processes, Devices and Runtime Tooling
//!
//! Everything that talks to the outside world: child processes, native build
//! tools, simulators and emulators, the preview stream, the JS bundler, the JS
//! debugger and the instrumentation channel to the running app.
//!
//! Depends on [`simdemon_core`] for domain types and error handling.
//!
//! ## Public API
//!
//! ### Process Management
//! - [`ManagedProcess`] - Spawn, stream output of, and force-kill child processes
//! - [`ProcessSpec`] - What to run and where
//!
//! ### Native Builds
//! - [`NativeBuilder`] - Build a workspace for one platform
//! - [`GradleBuilder`], [`XcodeBuilder`] - Android and iOS builders
//!
//! ### Devices
//! - [`DeviceProvider`], [`DeviceDriver`] - Listing, locking and controlling devices
//! - [`LocalDeviceProvider`] - `xcrun simctl` and `emulator`/`adb` backed devices
//!
//! ### Runtime Collaborators
//! - [`Bundler`], [`MetroBundler`] - JS bundler process and HTTP endpoints
//! - [`NodeModules`] - Installs JS dependencies before the bundler starts
//! - [`DebuggerConnector`], [`CdpConnector`] - JS debugger over CDP
//! - [`AppTransport`], [`InstrumentationServer`] - Channel to the running app

pub mod build;
pub mod bundler;
pub mod debugger;
pub mod dependencies;
pub mod devices;
pub mod instrumentation;
pub mod preview;
pub mod process;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod tools;

pub use build::{
    AndroidBuildConfig, BuildRequest, GradleBuilder, IosBuildConfig, NativeBuilder, OutputSink,
    ProgressSink, XcodeBuilder,
};
pub use bundler::{Bundler, BundlerConfig, MetroBundler, DEFAULT_BUNDLER_PORT};
pub use debugger::{CdpConnector, DebugConnection, DebuggerConnector};
pub use dependencies::{NodeModules, Prerequisite};
pub use devices::{DeviceDriver, DeviceLock, DeviceProvider, LocalDeviceProvider};
pub use instrumentation::{AppTransport, InstrumentationServer};
pub use preview::Preview;
pub use process::{ManagedProcess, ProcessSpec};
pub use tools::ToolPaths;

#[cfg(feature = "test-helpers")]
pub use build::MockNativeBuilder;
#[cfg(feature = "test-helpers")]
pub use bundler::MockBundler;
