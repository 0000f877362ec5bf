//! # simdemon-app - Build Cache and Session Orchestration
//!
//! Ties the runtime tooling of [`simdemon_daemon`] together: decides when a
//! native build can be reused, drives one device through boot, install and
//! launch, and keeps an observable project state.
//!
//! ## Public API
//!
//! ### Configuration and Persistence
//! - [`Settings`], [`load_settings()`], [`init_simdemon_directory()`] - `.simdemon/config.toml`
//! - [`WorkspaceStore`] - Per-workspace JSON state
//!
//! ### Builds
//! - [`BuildCache`] - Fingerprint-keyed artifact cache
//! - [`BuildManager`], [`DisposableBuild`] - Cache-aware, cancellable builds
//!
//! ### Orchestration
//! - [`Notifier`] - Typed event hub between app, orchestrator and observers
//! - [`DeviceSession`] - One device running one build
//! - [`Project`], [`ProjectApi`] - Device selection, status and controls
//!
//! ### Utilities
//! - [`Throttle`] - Leading and trailing edge throttling
//! - [`spawn_detached()`] - Background work that logs its failures
//! - [`NativeWatcher`] - Native input change detection

pub mod build_cache;
pub mod build_manager;
pub mod config;
pub mod device_session;
pub mod notifier;
pub mod project;
pub mod store;
pub mod task;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod throttle;
pub mod watcher;

pub use build_cache::{BuildCache, BuildCacheEntry};
pub use build_manager::{BuildManager, BuildOptions, DisposableBuild};
pub use config::{init_simdemon_directory, load_settings, Settings};
pub use device_session::{DeviceSession, SessionCallbacks, SessionPhase, SessionServices};
pub use notifier::{Handler, ListenOptions, Listener, Notifier};
pub use project::{LocalProjectApi, Project, ProjectApi, ProjectServices, StartOptions};
pub use store::WorkspaceStore;
pub use task::spawn_detached;
pub use throttle::Throttle;
pub use watcher::NativeWatcher;
