//! Project orchestrator
//!
//! A [`Project`] owns the observer-facing [`ProjectState`] and at most one
//! [`DeviceSession`]. It selects devices, reacts to bundler, debugger and app
//! events, tracks native changes and exposes the control surface observers
//! use through [`ProjectApi`].
//!
//! Every device selection bumps a generation counter. Work awaited on behalf
//! of a selection only touches shared state while its generation (and, for
//! session-scoped updates, its session) is still the current one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use glob::Pattern;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use simdemon_core::events::{BundlerEvent, DebuggerEvent};
use simdemon_core::prelude::*;
use simdemon_core::{
    AppEvent, AppPermission, DeviceInfo, DeviceSettings, Event, EventKind, InspectData,
    KeyDirection, LogLevel, ProjectEvent, ProjectState, ProjectStateUpdate, ProjectStatus,
    ReloadAction, StartupMessage, TouchType, ZoomLevel,
};
use simdemon_daemon::{
    AppTransport, Bundler, DebuggerConnector, DeviceDriver, DeviceProvider, NativeBuilder,
    ProgressSink,
};

use crate::build_cache::BuildCache;
use crate::build_manager::{BuildManager, BuildOptions, SuccessCallback};
use crate::config::Settings;
use crate::device_session::{
    DeviceSession, SessionCallbacks, SessionPhase, SessionServices, StageCallback,
};
use crate::notifier::{Handler, ListenOptions, Listener, Notifier};
use crate::store::{
    WorkspaceStore, DEVICE_SETTINGS_KEY, LAST_SELECTED_DEVICE_KEY, PREVIEW_ZOOM_KEY,
};
use crate::task::spawn_detached;
use crate::throttle::Throttle;
use crate::watcher::NativeWatcher;

/// Everything a project needs, passed in explicitly
pub struct ProjectServices {
    pub workspace_root: PathBuf,
    pub settings: Settings,
    pub store: Arc<WorkspaceStore>,
    pub devices: Arc<dyn DeviceProvider>,
    pub builders: Vec<Arc<dyn NativeBuilder>>,
    pub bundler: Arc<dyn Bundler>,
    pub debugger: Arc<dyn DebuggerConnector>,
    pub transport: Arc<dyn AppTransport>,
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Device to select first, overriding the last selected one
    pub device_id: Option<String>,
    pub force_clean_build: bool,
}

/// Control surface used by observers
#[trait_variant::make(ProjectApi: Send)]
pub trait LocalProjectApi {
    fn project_state(&self) -> ProjectState;

    fn device_settings(&self) -> DeviceSettings;

    /// Persist, apply to the running device and announce new settings
    async fn update_device_settings(&self, settings: DeviceSettings) -> Result<()>;

    fn update_preview_zoom(&self, zoom: ZoomLevel) -> Result<()>;

    /// Restart the app with the lightest action that picks up the changes
    async fn restart(&self, force_clean_build: bool, prefer_hot_reload: bool) -> Result<()>;

    /// Returns whether the action ran
    async fn reload(&self, action: ReloadAction) -> Result<bool>;

    async fn go_home(&self) -> Result<()>;

    /// Reset app permissions on the selected device, restarting the app when
    /// the device requires it
    async fn reset_app_permissions(&self, permission: AppPermission) -> Result<()>;

    async fn dispatch_touch(&self, x: f64, y: f64, touch: TouchType) -> Result<()>;

    async fn dispatch_key(&self, key_code: u32, direction: KeyDirection) -> Result<()>;

    async fn dispatch_paste(&self, text: &str) -> Result<()>;

    /// Element under `(x, y)`, with frames outside the app's sources hidden
    async fn inspect_element_at(
        &self,
        x: f64,
        y: f64,
        request_stack: bool,
    ) -> Result<Option<InspectData>>;

    fn open_navigation(&self, id: &str);

    fn open_preview(&self, preview_id: &str);

    fn on_active_file_change(&self, filename: &str, follow_enabled: bool);

    async fn open_dev_menu(&self) -> Result<()>;

    async fn resume_debugger(&self) -> Result<()>;

    async fn step_over_debugger(&self) -> Result<()>;

    fn build_output(&self) -> Vec<String>;

    /// Handlers run synchronously during dispatch and must not update the
    /// project state themselves.
    fn add_listener(&self, kind: EventKind, handler: Handler) -> Listener;

    fn remove_listener(&self, listener: &Listener);
}

// ─────────────────────────────────────────────────────────────────────────────
// Status Rules
// ─────────────────────────────────────────────────────────────────────────────

/// Status after a bundler event, if it changes
pub fn bundler_status(current: ProjectStatus, event: &BundlerEvent) -> Option<ProjectStatus> {
    match event {
        BundlerEvent::BundleError { .. } => Some(ProjectStatus::BundleError),
        BundlerEvent::IncrementalBundleError { .. } => (current != ProjectStatus::BundleError)
            .then_some(ProjectStatus::IncrementalBundleError),
        BundlerEvent::Ready | BundlerEvent::Progress(_) => None,
    }
}

/// Status after a debugger event, if it changes
pub fn debugger_status(current: ProjectStatus, event: &DebuggerEvent) -> Option<ProjectStatus> {
    match event {
        DebuggerEvent::Paused { .. } if event.is_exception_pause() => {
            (current != ProjectStatus::IncrementalBundleError).then_some(ProjectStatus::RuntimeError)
        }
        DebuggerEvent::Paused { .. } => Some(ProjectStatus::DebuggerPaused),
        DebuggerEvent::Resumed => matches!(
            current,
            ProjectStatus::DebuggerPaused | ProjectStatus::RuntimeError
        )
        .then_some(ProjectStatus::Running),
        DebuggerEvent::ConsoleLog { .. } => None,
    }
}

/// Status when the app starts applying a fast refresh
pub fn fast_refresh_started_status(current: ProjectStatus) -> Option<ProjectStatus> {
    (current != ProjectStatus::Refreshing).then_some(ProjectStatus::Refreshing)
}

/// Status once a fast refresh is applied. A successful refresh clears a full
/// bundle error, but not errors the refresh cannot have fixed.
pub fn fast_refresh_complete_status(current: ProjectStatus) -> Option<ProjectStatus> {
    match current {
        ProjectStatus::Starting
        | ProjectStatus::IncrementalBundleError
        | ProjectStatus::RuntimeError
        | ProjectStatus::Running => None,
        _ => Some(ProjectStatus::Running),
    }
}

fn session_phase_for(status: ProjectStatus) -> Option<SessionPhase> {
    match status {
        ProjectStatus::Running => Some(SessionPhase::Running),
        ProjectStatus::RuntimeError => Some(SessionPhase::RuntimeError),
        ProjectStatus::BundleError | ProjectStatus::IncrementalBundleError => {
            Some(SessionPhase::BundleError)
        }
        ProjectStatus::DebuggerPaused => Some(SessionPhase::DebuggerPaused),
        ProjectStatus::Refreshing => Some(SessionPhase::Refreshing),
        ProjectStatus::Starting | ProjectStatus::BuildError => None,
    }
}

/// Whether a stack frame from `file_name` belongs outside the app's sources
pub fn is_hidden_frame(file_name: &str, workspace_root: &Path, patterns: &[Pattern]) -> bool {
    let path = Path::new(file_name);
    let Ok(relative) = path.strip_prefix(workspace_root) else {
        return true;
    };
    relative
        .components()
        .any(|component| component.as_os_str() == "node_modules")
        || patterns
            .iter()
            .any(|pattern| pattern.matches_path(relative) || pattern.matches_path(path))
}

fn mark_hidden_frames(data: &mut InspectData, workspace_root: &Path, patterns: &[Pattern]) {
    for item in data.stack.iter_mut().flatten() {
        item.hide = is_hidden_frame(&item.source.file_name, workspace_root, patterns);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared State
// ─────────────────────────────────────────────────────────────────────────────

struct Inner {
    workspace_root: PathBuf,
    settings: Settings,
    store: Arc<WorkspaceStore>,
    devices: Arc<dyn DeviceProvider>,
    bundler: Arc<dyn Bundler>,
    debugger: Arc<dyn DebuggerConnector>,
    notifier: Arc<Notifier>,
    build_manager: BuildManager,
    exclude_patterns: Vec<Pattern>,

    /// Held while applying and dispatching a state update, so observers see
    /// updates in the order they were made
    dispatch_lock: Mutex<()>,
    state: Mutex<ProjectState>,
    device_settings: Mutex<DeviceSettings>,
    session: Mutex<Option<Arc<DeviceSession>>>,
    generation: AtomicU64,
    needs_native_rebuild: AtomicBool,

    native_check: Mutex<Option<Throttle<()>>>,
    watcher: Mutex<Option<NativeWatcher>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    listeners: Mutex<Vec<Listener>>,
    disposed: AtomicBool,
}

impl Inner {
    fn current_session(&self) -> Option<Arc<DeviceSession>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn selected_device(&self) -> Option<DeviceInfo> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .selected_device
            .clone()
    }

    fn is_current(&self, generation: u64, session: Option<&Arc<DeviceSession>>) -> bool {
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        match session {
            None => true,
            Some(session) => self
                .session
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, session)),
        }
    }

    /// Apply the update `f` derives from the current state, then dispatch the
    /// new state. Returns the new state if an update was made.
    fn update_state_with(
        &self,
        f: impl FnOnce(&ProjectState) -> Option<ProjectStateUpdate>,
    ) -> Option<ProjectState> {
        let _order = self.dispatch_lock.lock().unwrap_or_else(|e| e.into_inner());
        let (changed, snapshot) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let update = f(&state)?;
            let before = state.clone();
            state.apply(update);
            (*state != before, state.clone())
        };

        if changed {
            self.notifier
                .send(ProjectEvent::ProjectStateChanged(snapshot.clone()));
        }
        Some(snapshot)
    }

    fn update_state(&self, update: ProjectStateUpdate) {
        self.update_state_with(|_| Some(update));
    }

    /// Update only while `generation` and `session` are current
    fn update_if(
        &self,
        generation: u64,
        session: Option<&Arc<DeviceSession>>,
        update: ProjectStateUpdate,
    ) -> bool {
        self.update_state_with(|_| self.is_current(generation, session).then_some(update))
            .is_some()
    }

    fn mark_running(&self, generation: u64, session: &Arc<DeviceSession>) -> bool {
        let updated = self.update_if(
            generation,
            Some(session),
            ProjectStateUpdate::status(ProjectStatus::Running).with_startup_message(None),
        );
        if updated {
            session.enter(SessionPhase::Running);
        }
        updated
    }

    /// Apply a status rule and mirror the result in the session phase
    fn react(&self, rule: impl FnOnce(ProjectStatus) -> Option<ProjectStatus>) {
        let updated = self.update_state_with(|state| rule(state.status).map(ProjectStateUpdate::status));
        let (Some(state), Some(session)) = (updated, self.current_session()) else {
            return;
        };
        if let Some(phase) = session_phase_for(state.status) {
            if session.phase() != phase && !session.enter(phase) {
                trace!("Session stays {:?} for status {:?}", session.phase(), state.status);
            }
        }
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.notifier.send(ProjectEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn session_services(&self) -> SessionServices {
        SessionServices {
            notifier: Arc::clone(&self.notifier),
            bundler: Arc::clone(&self.bundler),
            debugger: Arc::clone(&self.debugger),
            launch: self.settings.launch.clone(),
        }
    }

    fn track_task(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    fn track_listener(&self, listener: Listener) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    fn on_bundler_event(&self, event: BundlerEvent) {
        match &event {
            BundlerEvent::Ready => debug!("Bundler ready"),
            BundlerEvent::Progress(progress) => {
                let progress = *progress;
                self.update_state_with(|state| {
                    (state.startup_message == Some(StartupMessage::WaitingForAppToLoad))
                        .then(|| ProjectStateUpdate::progress(progress))
                });
            }
            BundlerEvent::BundleError { message } => {
                warn!("Bundle error: {}", message);
                self.log(LogLevel::Error, message.clone());
            }
            BundlerEvent::IncrementalBundleError { message, module } => {
                warn!("Incremental bundle error in {:?}: {}", module, message);
                self.log(LogLevel::Error, message.clone());
            }
        }
        self.react(|status| bundler_status(status, &event));
    }

    fn on_debugger_event(&self, event: DebuggerEvent) {
        if let DebuggerEvent::ConsoleLog { level, message } = &event {
            self.log(*level, message.clone());
        }
        self.react(|status| debugger_status(status, &event));
    }

    /// Stage reports of `session`, applied only while it is current
    fn stage_callback(self: &Arc<Self>, generation: u64, session: &Arc<DeviceSession>) -> StageCallback {
        let inner = Arc::downgrade(self);
        let session = Arc::downgrade(session);
        Arc::new(move |stage| {
            if let (Some(inner), Some(session)) = (inner.upgrade(), session.upgrade()) {
                inner.update_if(generation, Some(&session), ProjectStateUpdate::startup(stage));
            }
        })
    }

    fn session_callbacks(
        self: &Arc<Self>,
        generation: u64,
        session: &Arc<DeviceSession>,
    ) -> SessionCallbacks {
        let inner = Arc::downgrade(self);
        let weak_session = Arc::downgrade(session);
        SessionCallbacks {
            on_progress: self.stage_callback(generation, session),
            on_preview_ready: Arc::new(move |url| {
                if let (Some(inner), Some(session)) = (inner.upgrade(), weak_session.upgrade()) {
                    inner.update_if(
                        generation,
                        Some(&session),
                        ProjectStateUpdate::new().with_preview_url(Some(url)),
                    );
                }
            }),
        }
    }
}

async fn pump_events<E: Clone>(
    mut events: broadcast::Receiver<E>,
    inner: Weak<Inner>,
    source: &'static str,
    handle: fn(&Inner, E),
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                handle(&inner, event);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Dropped {} {} events", skipped, source);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("{} event pump stopped", source);
}

// ─────────────────────────────────────────────────────────────────────────────
// Project
// ─────────────────────────────────────────────────────────────────────────────

/// Cheap, cloneable handle to one orchestrated workspace
#[derive(Clone)]
pub struct Project {
    inner: Arc<Inner>,
}

impl Project {
    pub fn new(services: ProjectServices) -> Self {
        let ProjectServices {
            workspace_root,
            settings,
            store,
            devices,
            builders,
            bundler,
            debugger,
            transport,
        } = services;

        let build_manager = BuildManager::new(
            workspace_root.clone(),
            BuildCache::new(Arc::clone(&store)),
            settings.build.clone(),
            settings.fingerprint.options(),
            builders,
        );
        let exclude_patterns = settings
            .inspector
            .exclude_patterns
            .iter()
            .filter_map(|pattern| match Pattern::new(pattern) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!("Ignoring inspector exclude pattern {:?}: {}", pattern, e);
                    None
                }
            })
            .collect();

        let state = ProjectState::new(store.get::<ZoomLevel>(PREVIEW_ZOOM_KEY));
        let device_settings = store
            .get::<DeviceSettings>(DEVICE_SETTINGS_KEY)
            .unwrap_or_default();

        Self {
            inner: Arc::new(Inner {
                workspace_root,
                settings,
                store,
                devices,
                bundler,
                debugger,
                notifier: Arc::new(Notifier::new(transport)),
                build_manager,
                exclude_patterns,
                dispatch_lock: Mutex::new(()),
                state: Mutex::new(state),
                device_settings: Mutex::new(device_settings),
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                needs_native_rebuild: AtomicBool::new(false),
                native_check: Mutex::new(None),
                watcher: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.inner.workspace_root
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.inner.notifier
    }

    /// Set once native inputs changed since the last build; cleared by the
    /// next successful build
    pub fn needs_native_rebuild(&self) -> bool {
        self.inner.needs_native_rebuild.load(Ordering::SeqCst)
    }

    pub fn current_session(&self) -> Option<Arc<DeviceSession>> {
        self.inner.current_session()
    }

    /// Wire up event handlers, start the bundler and the native watcher, and
    /// select the initial device
    pub async fn start(&self, options: StartOptions) -> Result<()> {
        info!("Starting project in {}", self.inner.workspace_root.display());

        self.register_app_handlers();
        self.watch_device_removal();
        self.spawn_event_pumps();
        let node_modules = self
            .inner
            .settings
            .bundler
            .node_modules(&self.inner.workspace_root);
        self.inner
            .bundler
            .start(false, vec![node_modules.prerequisite()])
            .await?;
        self.start_watcher();

        let devices = match self.refresh_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Failed to list devices: {}", e);
                Vec::new()
            }
        };

        match self.initial_device(&devices, options.device_id.as_deref()) {
            Some(device) => {
                if let Err(e) = self.select_device(&device, options.force_clean_build).await {
                    error!("Failed to start {}: {}", device.name, e);
                }
            }
            None => {
                info!("No devices available, waiting for one");
                self.select_when_available();
            }
        }
        Ok(())
    }

    fn initial_device(&self, devices: &[DeviceInfo], requested: Option<&str>) -> Option<DeviceInfo> {
        let find = |id: &str| devices.iter().find(|device| device.id == id).cloned();

        if let Some(id) = requested {
            match find(id) {
                Some(device) => return Some(device),
                None => warn!("Device {} not found", id),
            }
        }
        self.inner
            .store
            .get::<String>(LAST_SELECTED_DEVICE_KEY)
            .and_then(|id| find(&id))
            .or_else(|| devices.first().cloned())
    }

    /// Select the first device of the next non-empty device list
    fn select_when_available(&self) {
        let project = Arc::downgrade(&self.inner);
        let listener = self.inner.notifier.listen(
            EventKind::DevicesChanged,
            move |event| {
                let Some(inner) = project.upgrade() else {
                    return;
                };
                let project = Project { inner };
                let Event::Project(ProjectEvent::DevicesChanged(devices)) = event else {
                    return;
                };
                match devices.first().cloned() {
                    Some(device) => {
                        spawn_detached("initial device selection", async move {
                            project.select_device(&device, false).await.map(drop)
                        });
                    }
                    None => project.select_when_available(),
                }
            },
            ListenOptions { once: true },
        );
        self.inner.track_listener(listener);
    }

    /// Move off the selected device once it drops out of the device list
    fn watch_device_removal(&self) {
        let project = Arc::downgrade(&self.inner);
        let listener = self.inner.notifier.listen(
            EventKind::DevicesChanged,
            move |event| {
                let (Some(inner), Event::Project(ProjectEvent::DevicesChanged(devices))) =
                    (project.upgrade(), event)
                else {
                    return;
                };
                let Some(selected) = inner.selected_device() else {
                    return;
                };
                if devices.iter().any(|device| device.id == selected.id) {
                    return;
                }

                let project = Project { inner };
                let devices = devices.clone();
                spawn_detached("device removal", async move {
                    project.on_device_removed(&selected, &devices).await;
                    Ok(())
                });
            },
            ListenOptions::default(),
        );
        self.inner.track_listener(listener);
    }

    async fn on_device_removed(&self, removed: &DeviceInfo, devices: &[DeviceInfo]) {
        let still_selected = self
            .inner
            .selected_device()
            .is_some_and(|device| device.id == removed.id);
        if !still_selected {
            return;
        }
        warn!("{} ({}) was removed", removed.name, removed.id);
        self.inner.log(
            LogLevel::Warning,
            format!("{} is no longer available", removed.name),
        );

        if let Some(device) = self.initial_device(devices, None) {
            if let Err(e) = self.select_device(&device, false).await {
                error!("Failed to start {}: {}", device.name, e);
            }
            return;
        }

        // Invalidates the removed device's selection if it is still starting
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let session = self.inner.session.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(session) = session {
            session.dispose().await;
        }
        self.inner.update_state(
            ProjectStateUpdate::status(ProjectStatus::Starting)
                .with_startup_message(None)
                .with_preview_url(None)
                .without_selected_device(),
        );
        info!("No devices available, waiting for one");
        self.select_when_available();
    }

    fn register_app_handlers(&self) {
        let inner = Arc::downgrade(&self.inner);
        let navigation = self.inner.notifier.listen(
            EventKind::AppNavigationChanged,
            move |event| {
                if let (Some(inner), Event::App(AppEvent::NavigationChanged(entry))) =
                    (inner.upgrade(), event)
                {
                    inner
                        .notifier
                        .send(ProjectEvent::NavigationChanged(entry.clone()));
                }
            },
            ListenOptions::default(),
        );

        let inner = Arc::downgrade(&self.inner);
        let refresh_started = self.inner.notifier.listen(
            EventKind::FastRefreshStarted,
            move |_| {
                if let Some(inner) = inner.upgrade() {
                    inner.react(fast_refresh_started_status);
                }
            },
            ListenOptions::default(),
        );

        let inner = Arc::downgrade(&self.inner);
        let refresh_complete = self.inner.notifier.listen(
            EventKind::FastRefreshComplete,
            move |_| {
                if let Some(inner) = inner.upgrade() {
                    inner.react(fast_refresh_complete_status);
                }
            },
            ListenOptions::default(),
        );

        for listener in [navigation, refresh_started, refresh_complete] {
            self.inner.track_listener(listener);
        }
    }

    fn spawn_event_pumps(&self) {
        let bundler = tokio::spawn(pump_events(
            self.inner.bundler.subscribe(),
            Arc::downgrade(&self.inner),
            "bundler",
            Inner::on_bundler_event,
        ));
        let debugger = tokio::spawn(pump_events(
            self.inner.debugger.subscribe(),
            Arc::downgrade(&self.inner),
            "debugger",
            Inner::on_debugger_event,
        ));
        self.inner.track_task(bundler);
        self.inner.track_task(debugger);
    }

    fn start_watcher(&self) {
        let inner = Arc::downgrade(&self.inner);
        let check = Throttle::new(self.inner.settings.watcher.throttle(), move |()| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let project = Project { inner };
            spawn_detached("native change check", async move {
                project.check_native_changes().await;
                Ok(())
            });
        });

        // The watcher reports from its own thread; checks run on the runtime
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();
        let mut watcher = NativeWatcher::new(
            self.inner.workspace_root.clone(),
            self.inner.settings.watcher.debounce(),
        );
        if let Err(e) = watcher.start(move |paths| {
            let _ = tx.send(paths);
        }) {
            warn!("Native change tracking disabled: {}", e);
            return;
        }

        let throttled = check.clone();
        let forward = tokio::spawn(async move {
            while let Some(paths) = rx.recv().await {
                trace!("Native inputs changed: {:?}", paths);
                throttled.call(());
            }
        });

        self.inner.track_task(forward);
        *self.inner.native_check.lock().unwrap_or_else(|e| e.into_inner()) = Some(check);
        *self.inner.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(watcher);
    }

    /// List devices and announce them to observers
    pub async fn refresh_devices(&self) -> Result<Vec<DeviceInfo>> {
        let devices = self.inner.devices.list_devices().await?;
        debug!("Found {} device(s)", devices.len());
        self.inner
            .notifier
            .send(ProjectEvent::DevicesChanged(devices.clone()));
        Ok(devices)
    }

    /// Flag a needed native rebuild once the fingerprint drifts from the
    /// cached build. Returns whether the flag was raised by this call.
    pub async fn check_native_changes(&self) -> bool {
        if self.needs_native_rebuild() {
            return false;
        }
        let Some(device) = self.inner.selected_device() else {
            return false;
        };
        if !self
            .inner
            .build_manager
            .did_fingerprint_change(device.platform)
            .await
        {
            return false;
        }
        if self.inner.needs_native_rebuild.swap(true, Ordering::SeqCst) {
            return false;
        }

        info!("Native inputs changed, a rebuild is needed");
        self.inner.notifier.send(ProjectEvent::NeedsNativeRebuild);
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Device Selection
    // ─────────────────────────────────────────────────────────────────────────

    /// Run `device` from scratch.
    ///
    /// Returns `Ok(false)` when the device is busy or a newer selection took
    /// over before this one finished.
    pub async fn select_device(&self, device: &DeviceInfo, force_clean_build: bool) -> Result<bool> {
        let inner = &self.inner;
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Selecting {} ({})", device.name, device.id);

        // The current session still holds this device's lock
        if let Some(previous) = inner
            .current_session()
            .filter(|session| session.device_info().id == device.id)
        {
            self.dispose_session(&previous).await;
        }

        let driver = match inner.devices.acquire(device).await {
            Ok(driver) => driver,
            Err(e @ Error::DeviceBusy { .. }) => {
                warn!("{}", e);
                inner.log(LogLevel::Warning, e.to_string());
                return Ok(false);
            }
            Err(e) => {
                if inner.update_if(generation, None, ProjectStateUpdate::status(ProjectStatus::BuildError)) {
                    return Err(e);
                }
                return Ok(false);
            }
        };
        if !inner.is_current(generation, None) {
            driver.dispose();
            return Ok(false);
        }

        if let Err(e) = inner.store.set(LAST_SELECTED_DEVICE_KEY, &device.id) {
            warn!("Failed to remember selected device: {}", e);
        }
        let previous = inner.session.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(previous) = previous {
            previous.dispose().await;
        }

        inner.update_if(
            generation,
            None,
            ProjectStateUpdate::status(ProjectStatus::Starting)
                .with_selected_device(device.clone())
                .with_startup_message(Some(StartupMessage::InitializingDevice))
                .with_preview_url(None),
        );

        let mut created = None;
        match self
            .run_selection(generation, device, driver, force_clean_build, &mut created)
            .await
        {
            Ok(started) => Ok(started),
            Err(e) => {
                let failed = inner.update_if(
                    generation,
                    created.as_ref(),
                    ProjectStateUpdate::status(ProjectStatus::BuildError),
                );
                if failed {
                    error!("Failed to start {}: {}", device.name, e);
                    inner.log(LogLevel::Error, e.to_string());
                    Err(e)
                } else {
                    debug!("Superseded selection of {} ended: {}", device.name, e);
                    Ok(false)
                }
            }
        }
    }

    async fn run_selection(
        &self,
        generation: u64,
        device: &DeviceInfo,
        driver: Arc<dyn DeviceDriver>,
        force_clean_build: bool,
        created: &mut Option<Arc<DeviceSession>>,
    ) -> Result<bool> {
        let inner = &self.inner;

        inner.update_if(
            generation,
            None,
            ProjectStateUpdate::startup(StartupMessage::StartingPackager),
        );
        let ready = tokio::try_join!(inner.notifier.ready(), inner.bundler.ready());
        if let Err(e) = ready {
            driver.dispose();
            return Err(e);
        }
        if !inner.is_current(generation, None) {
            driver.dispose();
            return Ok(false);
        }

        let build = inner.build_manager.start_build(
            device,
            BuildOptions {
                force_clean_build,
                on_progress: Some(self.build_progress(generation)),
                on_success: Some(self.build_success()),
            },
        );
        let session = Arc::new(DeviceSession::new(driver, build, inner.session_services()));
        *created = Some(Arc::clone(&session));

        let installed = {
            let mut slot = inner.session.lock().unwrap_or_else(|e| e.into_inner());
            let current = inner.generation.load(Ordering::SeqCst) == generation;
            if current {
                *slot = Some(Arc::clone(&session));
            }
            current
        };
        if !installed {
            session.dispose().await;
            return Ok(false);
        }

        let settings = *inner.device_settings.lock().unwrap_or_else(|e| e.into_inner());
        session
            .start(settings, inner.session_callbacks(generation, &session))
            .await?;

        Ok(inner.mark_running(generation, &session))
    }

    /// Build progress, reported only during the building stage of `generation`
    fn build_progress(&self, generation: u64) -> ProgressSink {
        let inner = Arc::downgrade(&self.inner);
        Arc::new(move |progress| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            inner.update_state_with(|state| {
                (inner.generation.load(Ordering::SeqCst) == generation
                    && state.startup_message == Some(StartupMessage::Building))
                    .then(|| ProjectStateUpdate::progress(progress))
            });
        })
    }

    fn build_success(&self) -> SuccessCallback {
        let inner = Arc::downgrade(&self.inner);
        Arc::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.needs_native_rebuild.store(false, Ordering::SeqCst);
            }
        })
    }

    async fn dispose_session(&self, session: &Arc<DeviceSession>) {
        {
            let mut slot = self.inner.session.lock().unwrap_or_else(|e| e.into_inner());
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, session)) {
                *slot = None;
            }
        }
        session.dispose().await;
    }

    async fn relaunch(&self, session: &Arc<DeviceSession>, reinstall: bool) -> Result<bool> {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let on_progress = self.inner.stage_callback(generation, session);
        if reinstall {
            session.reinstall(on_progress).await?;
        } else {
            session.restart(on_progress).await?;
        }
        Ok(self.inner.mark_running(generation, session))
    }

    /// Tear everything down. Idempotent.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Disposing project");

        // Invalidates selections still in flight
        inner.generation.fetch_add(1, Ordering::SeqCst);

        let listeners: Vec<Listener> =
            std::mem::take(&mut *inner.listeners.lock().unwrap_or_else(|e| e.into_inner()));
        for listener in listeners {
            listener.remove();
        }
        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *inner.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        if let Some(check) = inner.native_check.lock().unwrap_or_else(|e| e.into_inner()).take() {
            check.cancel();
        }
        if let Some(mut watcher) = inner.watcher.lock().unwrap_or_else(|e| e.into_inner()).take() {
            watcher.stop();
        }

        let session = inner.session.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(session) = session {
            session.dispose().await;
        }
        inner.bundler.stop().await;
    }
}

impl ProjectApi for Project {
    fn project_state(&self) -> ProjectState {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn device_settings(&self) -> DeviceSettings {
        *self
            .inner
            .device_settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    async fn update_device_settings(&self, settings: DeviceSettings) -> Result<()> {
        *self
            .inner
            .device_settings
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = settings;
        self.inner.store.set(DEVICE_SETTINGS_KEY, &settings)?;

        if let Some(session) = self.inner.current_session() {
            session.change_device_settings(&settings).await?;
        }
        self.inner
            .notifier
            .send(ProjectEvent::DeviceSettingsChanged(settings));
        Ok(())
    }

    fn update_preview_zoom(&self, zoom: ZoomLevel) -> Result<()> {
        self.inner.store.set(PREVIEW_ZOOM_KEY, &zoom)?;
        self.inner
            .update_state(ProjectStateUpdate::new().with_preview_zoom(zoom));
        Ok(())
    }

    async fn restart(&self, force_clean_build: bool, prefer_hot_reload: bool) -> Result<()> {
        let Some(session) = self.inner.current_session() else {
            warn!("Restart requested without a selected device");
            return Ok(());
        };
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let device = session.device_info().clone();

        self.inner.update_if(
            generation,
            Some(&session),
            ProjectStateUpdate::status(ProjectStatus::Starting)
                .with_startup_message(Some(StartupMessage::Restarting)),
        );

        if force_clean_build {
            return ProjectApi::reload(self, ReloadAction::Rebuild).await.map(drop);
        }
        if self.needs_native_rebuild() {
            info!("Native inputs changed, rebuilding {}", device.name);
            return self.select_device(&device, false).await.map(drop);
        }
        if prefer_hot_reload && self.inner.notifier.connected_to_app() {
            match ProjectApi::reload(self, ReloadAction::HotReload).await {
                Ok(true) => {
                    self.inner.mark_running(generation, &session);
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => warn!("Hot reload failed, restarting the app: {}", e),
            }
        }

        match self.relaunch(&session, false).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Restart failed, selecting {} again: {}", device.name, e);
                if self.inner.is_current(generation, Some(&session)) {
                    self.select_device(&device, false).await?;
                }
                Ok(())
            }
        }
    }

    async fn reload(&self, action: ReloadAction) -> Result<bool> {
        info!("Reload: {:?}", action);
        match action {
            ReloadAction::ReloadJs => {
                self.inner.bundler.reload().await?;
                Ok(true)
            }
            ReloadAction::HotReload => {
                if !self.inner.notifier.connected_to_app() {
                    debug!("No app connected, skipping hot reload");
                    return Ok(false);
                }
                self.inner.bundler.reload().await?;
                Ok(true)
            }
            ReloadAction::Rebuild | ReloadAction::Reboot => {
                let Some(device) = self.inner.selected_device() else {
                    warn!("No device selected");
                    return Ok(false);
                };
                self.select_device(&device, action == ReloadAction::Rebuild)
                    .await
            }
            ReloadAction::Reinstall | ReloadAction::RestartProcess => {
                let Some(session) = self.inner.current_session() else {
                    warn!("No device selected");
                    return Ok(false);
                };
                self.relaunch(&session, action == ReloadAction::Reinstall)
                    .await
            }
        }
    }

    async fn go_home(&self) -> Result<()> {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        self.inner.bundler.reload().await?;
        if let Some(session) = self.inner.current_session() {
            self.inner.mark_running(generation, &session);
        }
        Ok(())
    }

    async fn reset_app_permissions(&self, permission: AppPermission) -> Result<()> {
        let Some(session) = self.inner.current_session() else {
            return Ok(());
        };
        if session.reset_app_permissions(permission).await? {
            ProjectApi::restart(self, false, false).await?;
        }
        Ok(())
    }

    async fn dispatch_touch(&self, x: f64, y: f64, touch: TouchType) -> Result<()> {
        match self.inner.current_session() {
            Some(session) => session.send_touch(x, y, touch).await,
            None => Ok(()),
        }
    }

    async fn dispatch_key(&self, key_code: u32, direction: KeyDirection) -> Result<()> {
        match self.inner.current_session() {
            Some(session) => session.send_key(key_code, direction).await,
            None => Ok(()),
        }
    }

    async fn dispatch_paste(&self, text: &str) -> Result<()> {
        match self.inner.current_session() {
            Some(session) => session.send_paste(text).await,
            None => Ok(()),
        }
    }

    async fn inspect_element_at(
        &self,
        x: f64,
        y: f64,
        request_stack: bool,
    ) -> Result<Option<InspectData>> {
        let Some(session) = self.inner.current_session() else {
            return Ok(None);
        };
        let Ok(mut data) = session.inspect_element_at(x, y, request_stack).await else {
            debug!("Inspect request dropped");
            return Ok(None);
        };
        mark_hidden_frames(
            &mut data,
            &self.inner.workspace_root,
            &self.inner.exclude_patterns,
        );
        Ok(Some(data))
    }

    fn open_navigation(&self, id: &str) {
        if let Some(session) = self.inner.current_session() {
            session.open_navigation(id);
        }
    }

    fn open_preview(&self, preview_id: &str) {
        if let Some(session) = self.inner.current_session() {
            session.open_preview(preview_id);
        }
    }

    fn on_active_file_change(&self, filename: &str, follow_enabled: bool) {
        if let Some(session) = self.inner.current_session() {
            session.on_active_file_change(filename, follow_enabled);
        }
    }

    async fn open_dev_menu(&self) -> Result<()> {
        match self.inner.current_session() {
            Some(session) => session.open_dev_menu().await,
            None => Ok(()),
        }
    }

    async fn resume_debugger(&self) -> Result<()> {
        match self.inner.current_session() {
            Some(session) => session.resume_debugger().await,
            None => Ok(()),
        }
    }

    async fn step_over_debugger(&self) -> Result<()> {
        match self.inner.current_session() {
            Some(session) => session.step_over_debugger().await,
            None => Ok(()),
        }
    }

    fn build_output(&self) -> Vec<String> {
        self.inner.build_manager.build_output()
    }

    fn add_listener(&self, kind: EventKind, handler: Handler) -> Listener {
        self.inner
            .notifier
            .listen(kind, move |event| handler(event), ListenOptions::default())
    }

    fn remove_listener(&self, listener: &Listener) {
        listener.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::{
        bundler_status, debugger_status, fast_refresh_complete_status,
        fast_refresh_started_status, is_hidden_frame, mark_hidden_frames, Project, ProjectApi,
        ProjectServices, StartOptions,
    };
    use crate::config::Settings;
    use crate::store::{WorkspaceStore, LAST_SELECTED_DEVICE_KEY};
    use crate::test_utils::{FakeBuilder, FakeBundler, FakeDebugger, FakeProvider, FakeTransport};
    use glob::Pattern;
    use simdemon_core::events::{BundlerEvent, DebuggerEvent};
    use simdemon_core::{
        AppEvent, AppPermission, Event, EventKind, Frame, InspectData, InspectStackItem, LogLevel,
        ProjectEvent, ProjectStatus, SourceLocation, ZoomLevel,
    };
    use simdemon_daemon::test_utils::test_emulator;
    use simdemon_daemon::NativeBuilder;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_bundler_status_rules() {
        let full = BundlerEvent::BundleError {
            message: "boom".into(),
        };
        let incremental = BundlerEvent::IncrementalBundleError {
            message: "boom".into(),
            module: None,
        };

        assert_eq!(
            bundler_status(ProjectStatus::Running, &full),
            Some(ProjectStatus::BundleError)
        );
        assert_eq!(
            bundler_status(ProjectStatus::Running, &incremental),
            Some(ProjectStatus::IncrementalBundleError)
        );
        assert_eq!(bundler_status(ProjectStatus::BundleError, &incremental), None);
        assert_eq!(
            bundler_status(ProjectStatus::Running, &BundlerEvent::Progress(0.5)),
            None
        );
    }

    #[test]
    fn test_debugger_status_rules() {
        let exception = DebuggerEvent::Paused {
            reason: "exception".into(),
        };
        let breakpoint = DebuggerEvent::Paused {
            reason: "other".into(),
        };

        assert_eq!(
            debugger_status(ProjectStatus::Running, &exception),
            Some(ProjectStatus::RuntimeError)
        );
        assert_eq!(
            debugger_status(ProjectStatus::IncrementalBundleError, &exception),
            None
        );
        assert_eq!(
            debugger_status(ProjectStatus::Running, &breakpoint),
            Some(ProjectStatus::DebuggerPaused)
        );
        assert_eq!(
            debugger_status(ProjectStatus::DebuggerPaused, &DebuggerEvent::Resumed),
            Some(ProjectStatus::Running)
        );
        assert_eq!(
            debugger_status(ProjectStatus::Starting, &DebuggerEvent::Resumed),
            None
        );
    }

    #[test]
    fn test_fast_refresh_status_rules() {
        use ProjectStatus::*;

        assert_eq!(fast_refresh_started_status(Running), Some(Refreshing));
        assert_eq!(fast_refresh_started_status(BundleError), Some(Refreshing));
        assert_eq!(fast_refresh_started_status(Refreshing), None);

        assert_eq!(fast_refresh_complete_status(Refreshing), Some(Running));
        assert_eq!(fast_refresh_complete_status(BundleError), Some(Running));
        assert_eq!(fast_refresh_complete_status(DebuggerPaused), Some(Running));
        assert_eq!(fast_refresh_complete_status(Starting), None);
        assert_eq!(fast_refresh_complete_status(IncrementalBundleError), None);
        assert_eq!(fast_refresh_complete_status(RuntimeError), None);
        assert_eq!(fast_refresh_complete_status(Running), None);
    }

    #[test]
    fn test_hidden_frames() {
        let root = Path::new("/work/app");
        let patterns = vec![Pattern::new("**/generated/**").unwrap()];

        assert!(!is_hidden_frame("/work/app/src/App.tsx", root, &patterns));
        assert!(is_hidden_frame("/usr/lib/react/index.js", root, &patterns));
        assert!(is_hidden_frame(
            "/work/app/node_modules/react-native/Libraries/View.js",
            root,
            &patterns
        ));
        assert!(is_hidden_frame("/work/app/src/generated/Api.ts", root, &patterns));

        let item = |file: &str| InspectStackItem {
            component_name: "View".into(),
            source: SourceLocation {
                file_name: file.into(),
                line0_based: 0,
                column0_based: 0,
            },
            hide: false,
        };
        let mut data = InspectData {
            frame: Frame::default(),
            stack: Some(vec![
                item("/work/app/src/App.tsx"),
                item("/work/app/node_modules/x.js"),
            ]),
        };
        mark_hidden_frames(&mut data, root, &patterns);
        let hidden: Vec<bool> = data.stack.unwrap().iter().map(|i| i.hide).collect();
        assert_eq!(hidden, vec![false, true]);
    }

    struct Fixture {
        _workspace: TempDir,
        transport: Arc<FakeTransport>,
        provider: Arc<FakeProvider>,
        bundler: Arc<FakeBundler>,
        debugger: Arc<FakeDebugger>,
        builder: Arc<FakeBuilder>,
        store: Arc<WorkspaceStore>,
        project: Project,
    }

    fn fixture(devices: Vec<simdemon_core::DeviceInfo>) -> Fixture {
        let fixture = fixture_with(devices, Settings::default());
        std::fs::create_dir(fixture._workspace.path().join("node_modules")).unwrap();
        fixture
    }

    /// Workspace without node modules
    fn fixture_with(devices: Vec<simdemon_core::DeviceInfo>, settings: Settings) -> Fixture {
        let workspace = tempfile::tempdir().unwrap();
        std::fs::write(workspace.path().join("package.json"), "{}").unwrap();
        let transport = Arc::new(FakeTransport::new());
        let provider = Arc::new(FakeProvider::new(devices).with_app(transport.clone()));
        let bundler = Arc::new(FakeBundler::new());
        let debugger = Arc::new(FakeDebugger::new());
        let platform = simdemon_core::Platform::Android;
        let builder = Arc::new(FakeBuilder::new(platform, workspace.path().join("out")));
        let store = Arc::new(WorkspaceStore::in_memory());

        let project = Project::new(ProjectServices {
            workspace_root: workspace.path().to_path_buf(),
            settings,
            store: store.clone(),
            devices: provider.clone(),
            builders: vec![builder.clone() as Arc<dyn NativeBuilder>],
            bundler: bundler.clone(),
            debugger: debugger.clone(),
            transport: transport.clone(),
        });

        Fixture {
            _workspace: workspace,
            transport,
            provider,
            bundler,
            debugger,
            builder,
            store,
            project,
        }
    }

    fn record_events(project: &Project, kind: EventKind) -> Arc<Mutex<Vec<Event>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        project.add_listener(
            kind,
            Arc::new(move |event: &Event| sink.lock().unwrap().push(event.clone())),
        );
        events
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_start_selects_last_selected_device() {
        let f = fixture(vec![test_emulator("first"), test_emulator("second")]);
        f.store
            .set(LAST_SELECTED_DEVICE_KEY, &"second".to_string())
            .unwrap();

        f.project.start(StartOptions::default()).await.unwrap();

        let state = f.project.project_state();
        assert_eq!(state.status, ProjectStatus::Running);
        assert_eq!(state.selected_device.unwrap().id, "second");
        assert_eq!(state.startup_message, None);
        assert_eq!(f.bundler.starts(), vec![false]);
        assert_eq!(f.builder.build_count(), 1);

        f.project.dispose().await;
        assert!(f.bundler.is_stopped());
        assert_eq!(f.provider.driver("second").unwrap().dispose_count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_node_modules_installed_before_bundler_starts() {
        let mut settings = Settings::default();
        settings.bundler.package_manager = Some("true".into());
        let f = fixture_with(vec![], settings);

        f.project.start(StartOptions::default()).await.unwrap();
        assert_eq!(f.bundler.starts(), vec![false]);
        f.project.dispose().await;

        let mut settings = Settings::default();
        settings.bundler.package_manager = Some("false".into());
        let f = fixture_with(vec![test_emulator("pixel")], settings);

        let result = f.project.start(StartOptions::default()).await;
        assert!(matches!(result, Err(simdemon_core::Error::Bundler { .. })));
        assert!(f.bundler.starts().is_empty());
        assert!(f.provider.driver("pixel").is_none());
        f.project.dispose().await;
    }

    #[tokio::test]
    async fn test_busy_device_leaves_state_untouched() {
        let device = test_emulator("pixel");
        let f = fixture(vec![device.clone()]);
        f.provider.mark_busy("pixel");
        let logs = record_events(&f.project, EventKind::Log);

        let started = f.project.select_device(&device, false).await.unwrap();

        assert!(!started);
        assert_eq!(f.project.project_state().selected_device, None);
        assert_eq!(f.project.project_state().status, ProjectStatus::Starting);
        assert!(matches!(
            logs.lock().unwrap().as_slice(),
            [Event::Project(ProjectEvent::Log {
                level: LogLevel::Warning,
                ..
            })]
        ));
    }

    #[tokio::test]
    async fn test_build_failure_sets_build_error() {
        let device = test_emulator("pixel");
        let f = fixture(vec![device.clone()]);
        f.builder.fail_with("gradle exploded");

        let result = f.project.select_device(&device, false).await;

        assert!(result.is_err());
        assert_eq!(f.project.project_state().status, ProjectStatus::BuildError);
    }

    #[tokio::test]
    async fn test_preview_failure_sets_build_error() {
        let device = test_emulator("pixel");
        let f = fixture(vec![device.clone()]);
        f.provider.fail_preview("pixel");

        let result = f.project.select_device(&device, false).await;

        assert!(result.is_err());
        let state = f.project.project_state();
        assert_eq!(state.status, ProjectStatus::BuildError);
        assert_eq!(state.preview_url, None);
        assert!(f.debugger.attached().is_empty());
    }

    #[tokio::test]
    async fn test_superseded_selection_does_not_touch_state() {
        let slow = test_emulator("slow");
        let fast = test_emulator("fast");
        let f = fixture(vec![slow.clone(), fast.clone()]);
        f.builder.block_device("slow");

        let project = f.project.clone();
        let first = tokio::spawn(async move { project.select_device(&slow, false).await });
        assert!(eventually(|| f.builder.build_count() == 1).await);

        assert!(f.project.select_device(&fast, false).await.unwrap());
        assert!(!first.await.unwrap().unwrap());

        let state = f.project.project_state();
        assert_eq!(state.status, ProjectStatus::Running);
        assert_eq!(state.selected_device.unwrap().id, "fast");
        assert_eq!(f.builder.kill_count(), 1);
        assert!(f.provider.driver("slow").unwrap().is_disposed());
    }

    #[tokio::test]
    async fn test_reselecting_same_device_releases_it_first() {
        let device = test_emulator("pixel");
        let f = fixture(vec![device.clone()]);
        f.builder.fail_with("gradle exploded");

        // The failed session still holds the device until it is reselected
        assert!(f.project.select_device(&device, false).await.is_err());
        assert!(f.project.select_device(&device, false).await.is_err());
        assert_eq!(f.project.project_state().status, ProjectStatus::BuildError);
    }

    #[tokio::test]
    async fn test_debugger_and_bundler_events_drive_status() {
        let f = fixture(vec![test_emulator("pixel")]);
        f.project.start(StartOptions::default()).await.unwrap();
        let logs = record_events(&f.project, EventKind::Log);

        f.debugger.emit(DebuggerEvent::Paused {
            reason: "exception".into(),
        });
        assert!(
            eventually(|| f.project.project_state().status == ProjectStatus::RuntimeError).await
        );

        f.debugger.emit(DebuggerEvent::Resumed);
        assert!(eventually(|| f.project.project_state().status == ProjectStatus::Running).await);

        f.bundler.emit(BundlerEvent::BundleError {
            message: "SyntaxError".into(),
        });
        assert!(
            eventually(|| f.project.project_state().status == ProjectStatus::BundleError).await
        );

        f.debugger.emit(DebuggerEvent::ConsoleLog {
            level: LogLevel::Info,
            message: "hello".into(),
        });
        assert!(eventually(|| logs.lock().unwrap().len() == 2).await);

        f.project.dispose().await;
    }

    #[tokio::test]
    async fn test_fast_refresh_clears_bundle_error() {
        let f = fixture(vec![test_emulator("pixel")]);
        f.project.start(StartOptions::default()).await.unwrap();

        f.bundler.emit(BundlerEvent::BundleError {
            message: "SyntaxError".into(),
        });
        assert!(
            eventually(|| f.project.project_state().status == ProjectStatus::BundleError).await
        );

        f.transport.emit(AppEvent::FastRefreshStarted);
        assert!(
            eventually(|| f.project.project_state().status == ProjectStatus::Refreshing).await
        );
        f.transport.emit(AppEvent::FastRefreshComplete);
        assert!(eventually(|| f.project.project_state().status == ProjectStatus::Running).await);

        let session = f.project.current_session().unwrap();
        assert_eq!(session.phase(), crate::device_session::SessionPhase::Running);
        f.project.dispose().await;
    }

    #[tokio::test]
    async fn test_fast_refresh_keeps_runtime_error() {
        let f = fixture(vec![test_emulator("pixel")]);
        f.project.start(StartOptions::default()).await.unwrap();

        f.debugger.emit(DebuggerEvent::Paused {
            reason: "exception".into(),
        });
        assert!(
            eventually(|| f.project.project_state().status == ProjectStatus::RuntimeError).await
        );

        f.transport.emit(AppEvent::FastRefreshComplete);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.project.project_state().status, ProjectStatus::RuntimeError);
        f.project.dispose().await;
    }

    #[tokio::test]
    async fn test_permission_reset_restarts_app() {
        let f = fixture(vec![test_emulator("pixel")]);
        f.project.reset_app_permissions(AppPermission::All).await.unwrap();

        f.project.start(StartOptions::default()).await.unwrap();
        f.project
            .reset_app_permissions(AppPermission::Location)
            .await
            .unwrap();

        let calls = f.provider.driver("pixel").unwrap().calls();
        let reset = calls
            .iter()
            .position(|call| call == "reset_permissions location")
            .unwrap();
        assert!(calls[reset + 1..].iter().any(|call| call.starts_with("launch")));
        assert_eq!(f.builder.build_count(), 1);
        assert_eq!(f.project.project_state().status, ProjectStatus::Running);
        f.project.dispose().await;
    }

    #[tokio::test]
    async fn test_removed_device_selects_another() {
        let f = fixture(vec![test_emulator("first"), test_emulator("second")]);
        f.project.start(StartOptions::default()).await.unwrap();
        assert_eq!(f.project.project_state().selected_device.unwrap().id, "first");
        let logs = record_events(&f.project, EventKind::Log);

        f.provider.set_devices(vec![test_emulator("second")]);
        f.project.refresh_devices().await.unwrap();

        let on_second = || {
            let state = f.project.project_state();
            state.status == ProjectStatus::Running
                && state.selected_device.is_some_and(|device| device.id == "second")
        };
        assert!(eventually(on_second).await);
        assert!(f.provider.driver("first").unwrap().is_disposed());
        assert!(!logs.lock().unwrap().is_empty());
        f.project.dispose().await;
    }

    #[tokio::test]
    async fn test_removing_last_device_waits_for_another() {
        let f = fixture(vec![test_emulator("only")]);
        f.project.start(StartOptions::default()).await.unwrap();

        f.provider.set_devices(vec![]);
        f.project.refresh_devices().await.unwrap();
        assert!(eventually(|| f.project.project_state().selected_device.is_none()).await);
        assert!(eventually(|| f.provider.driver("only").unwrap().is_disposed()).await);
        assert!(f.project.current_session().is_none());

        f.provider.set_devices(vec![test_emulator("late")]);
        f.project.refresh_devices().await.unwrap();
        let on_late = || {
            let state = f.project.project_state();
            state.status == ProjectStatus::Running
                && state.selected_device.is_some_and(|device| device.id == "late")
        };
        assert!(eventually(on_late).await);
        f.project.dispose().await;
    }

    #[tokio::test]
    async fn test_preview_zoom_and_settings_are_persisted() {
        let f = fixture(vec![]);
        f.project.update_preview_zoom(ZoomLevel::Scale(1.5)).unwrap();
        assert_eq!(
            f.project.project_state().preview_zoom,
            Some(ZoomLevel::Scale(1.5))
        );

        let changes = record_events(&f.project, EventKind::DeviceSettingsChanged);
        let mut settings = f.project.device_settings();
        settings.location.is_disabled = false;
        f.project.update_device_settings(settings).await.unwrap();

        assert_eq!(changes.lock().unwrap().len(), 1);
        assert_eq!(
            f.store.get::<ZoomLevel>(crate::store::PREVIEW_ZOOM_KEY),
            Some(ZoomLevel::Scale(1.5))
        );
        assert_eq!(f.project.device_settings(), settings);
    }

    #[tokio::test]
    async fn test_waits_for_devices_when_none_listed() {
        let f = fixture(vec![]);
        f.project.start(StartOptions::default()).await.unwrap();
        assert_eq!(f.project.project_state().selected_device, None);

        f.provider.set_devices(vec![test_emulator("late")]);
        f.project.refresh_devices().await.unwrap();

        assert!(
            eventually(|| f.project.project_state().status == ProjectStatus::Running).await
        );
        assert_eq!(
            f.project.project_state().selected_device.unwrap().id,
            "late"
        );
        f.project.dispose().await;
    }
}
