//! One device running one build
//!
//! A [`DeviceSession`] sequences boot, settings, build, install, launch and
//! debugger attachment for the selected device, then forwards runtime
//! controls to the device and the running app.
//!
//! ## Phases
//!
//! ```text
//! Idle → Booting → SettingsApplied → Building → Installing → Launching
//!      → WaitingForAppReady → AttachingDebugger → Running
//!
//! Running ⇄ RuntimeError | BundleError | DebuggerPaused | Refreshing
//! Running (or a side state) → Launching        restart
//! Running (or a side state) → Installing       reinstall
//! any → Disposed
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use simdemon_core::prelude::*;
use simdemon_core::{
    AppCommand, AppEvent, AppPermission, BuildResult, CancelToken, DeviceInfo, DeviceSettings, Event, EventKind,
    InspectData, KeyDirection, Platform, StartupMessage, TouchType,
};
use simdemon_daemon::{Bundler, DebugConnection, DebuggerConnector, DeviceDriver};

use crate::build_manager::DisposableBuild;
use crate::config::LaunchSettings;
use crate::notifier::{ListenOptions, Listener, Notifier};

/// First id used for inspect requests
pub const FIRST_INSPECT_ID: u64 = 7621;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Booting,
    SettingsApplied,
    Building,
    Installing,
    Launching,
    WaitingForAppReady,
    AttachingDebugger,
    Running,
    RuntimeError,
    BundleError,
    DebuggerPaused,
    Refreshing,
    Disposed,
}

impl SessionPhase {
    /// States entered from `Running` and left back to it
    pub fn is_side_state(&self) -> bool {
        matches!(
            self,
            SessionPhase::RuntimeError
                | SessionPhase::BundleError
                | SessionPhase::DebuggerPaused
                | SessionPhase::Refreshing
        )
    }

    fn is_launch_stage(&self) -> bool {
        matches!(
            self,
            SessionPhase::Launching
                | SessionPhase::WaitingForAppReady
                | SessionPhase::AttachingDebugger
        )
    }

    pub fn can_transition_to(&self, next: SessionPhase) -> bool {
        use SessionPhase::*;

        if *self == Disposed {
            return false;
        }
        if next == Disposed {
            return true;
        }

        match (self, next) {
            (Idle, Booting)
            | (Booting, SettingsApplied)
            | (SettingsApplied, Building)
            | (Building, Installing)
            | (Installing, Launching)
            | (Launching, WaitingForAppReady)
            | (WaitingForAppReady, AttachingDebugger)
            | (AttachingDebugger, Running) => true,
            (Running, next) if next.is_side_state() => true,
            (current, Running) if current.is_side_state() => true,
            // A fast refresh may fix whatever put the app aside
            (current, Refreshing) if current.is_side_state() => *current != Refreshing,
            // Restart or reinstall, also while a previous launch is pending
            (current, Launching | Installing) => {
                *current == Running || current.is_side_state() || current.is_launch_stage()
            }
            _ => false,
        }
    }
}

pub type StageCallback = Arc<dyn Fn(StartupMessage) + Send + Sync>;
pub type PreviewCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Clone)]
pub struct SessionCallbacks {
    pub on_progress: StageCallback,
    pub on_preview_ready: PreviewCallback,
}

/// Shared collaborators of every session
#[derive(Clone)]
pub struct SessionServices {
    pub notifier: Arc<Notifier>,
    pub bundler: Arc<dyn Bundler>,
    pub debugger: Arc<dyn DebuggerConnector>,
    pub launch: LaunchSettings,
}

type PendingInspects = Arc<Mutex<HashMap<u64, oneshot::Sender<InspectData>>>>;

pub struct DeviceSession {
    device: Arc<dyn DeviceDriver>,
    build: DisposableBuild,
    services: SessionServices,
    phase: Mutex<SessionPhase>,
    build_result: Mutex<Option<BuildResult>>,
    debugger: Mutex<Option<Arc<dyn DebugConnection>>>,
    next_inspect_id: AtomicU64,
    pending_inspects: PendingInspects,
    inspect_listener: Listener,
    preview_task: Mutex<Option<JoinHandle<()>>>,
    lifetime: CancelToken,
    disposed: AtomicBool,
}

impl DeviceSession {
    pub fn new(device: Arc<dyn DeviceDriver>, build: DisposableBuild, services: SessionServices) -> Self {
        let pending_inspects: PendingInspects = Arc::new(Mutex::new(HashMap::new()));

        let pending = Arc::clone(&pending_inspects);
        let inspect_listener = services.notifier.listen(
            EventKind::InspectData,
            move |event| {
                if let Event::App(AppEvent::InspectData { id, data }) = event {
                    let reply = pending.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
                    match reply {
                        Some(tx) => {
                            let _ = tx.send(data.clone());
                        }
                        None => trace!("Ignoring inspect reply {}", id),
                    }
                }
            },
            ListenOptions::default(),
        );

        Self {
            device,
            build,
            services,
            phase: Mutex::new(SessionPhase::Idle),
            build_result: Mutex::new(None),
            debugger: Mutex::new(None),
            next_inspect_id: AtomicU64::new(FIRST_INSPECT_ID),
            pending_inspects,
            inspect_listener,
            preview_task: Mutex::new(None),
            lifetime: CancelToken::new(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn device_info(&self) -> &DeviceInfo {
        self.device.info()
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn build_result(&self) -> Option<BuildResult> {
        self.build_result
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn transition(&self, next: SessionPhase) -> Result<()> {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if !phase.can_transition_to(next) {
            return Err(Error::process(format!(
                "invalid session transition {:?} -> {:?}",
                *phase, next
            )));
        }
        trace!("Session {:?} -> {:?}", *phase, next);
        *phase = next;
        Ok(())
    }

    /// Move between `Running` and its side states, or into a fast refresh
    /// from any of them. Returns whether the transition was allowed.
    pub fn enter(&self, next: SessionPhase) -> bool {
        let allowed = {
            let phase = self.phase();
            (phase == SessionPhase::Running && next.is_side_state())
                || (phase.is_side_state()
                    && matches!(next, SessionPhase::Running | SessionPhase::Refreshing))
        };
        allowed && self.transition(next).is_ok()
    }

    /// Run `future` unless the session is disposed first
    async fn guarded<T>(&self, future: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.lifetime.cancelled() => Err(Error::process("device session disposed")),
            result = future => result,
        }
    }

    fn stage(&self, callbacks: &StageCallback, next: SessionPhase, message: StartupMessage) -> Result<()> {
        self.transition(next)?;
        callbacks(message);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Startup
    // ─────────────────────────────────────────────────────────────────────────

    /// Boot, build, install and launch
    pub async fn start(&self, settings: DeviceSettings, callbacks: SessionCallbacks) -> Result<()> {
        let info = self.device.info().clone();
        info!("Starting session on {} ({})", info.name, info.id);

        self.stage(&callbacks.on_progress, SessionPhase::Booting, StartupMessage::BootingDevice)?;
        self.guarded(self.device.boot()).await?;
        self.guarded(self.device.apply_settings(&settings)).await?;
        self.transition(SessionPhase::SettingsApplied)?;

        self.stage(&callbacks.on_progress, SessionPhase::Building, StartupMessage::Building)?;
        let build = self.guarded(self.build.result()).await?;

        self.stage(&callbacks.on_progress, SessionPhase::Installing, StartupMessage::Installing)?;
        self.guarded(self.device.install(&build, false)).await?;
        *self.build_result.lock().unwrap_or_else(|e| e.into_inner()) = Some(build);

        self.start_preview_in_background(callbacks.on_preview_ready.clone());

        self.launch(&callbacks.on_progress).await
    }

    fn start_preview_in_background(&self, on_preview_ready: PreviewCallback) {
        let device = Arc::clone(&self.device);
        let lifetime = self.lifetime.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = lifetime.cancelled() => {}
                result = device.start_preview() => match result {
                    Ok(url) => on_preview_ready(url),
                    Err(e) => warn!("Preview unavailable: {}", e),
                },
            }
        });
        if let Some(previous) = self
            .preview_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task)
        {
            previous.abort();
        }
    }

    /// Launch the installed build and attach the debugger
    async fn launch(&self, on_progress: &StageCallback) -> Result<()> {
        let build = self
            .build_result()
            .ok_or_else(|| Error::launch("no build has been installed"))?;
        let notifier = &self.services.notifier;

        // Registered before launching so an early ready message is not lost
        let app_ready = notifier.wait_for(EventKind::AppReady);

        self.stage(on_progress, SessionPhase::Launching, StartupMessage::Launching)?;
        self.disconnect_debugger().await;
        self.guarded(self.device.launch(
            &build,
            self.services.bundler.port(),
            notifier.instrumentation_port(),
        ))
        .await?;

        self.stage(
            on_progress,
            SessionPhase::WaitingForAppReady,
            StartupMessage::WaitingForAppToLoad,
        )?;
        let wait_for_app = self.services.launch.wait_for_app_launch;
        // Both the app and its preview stream must come up
        self.guarded(async {
            tokio::try_join!(
                async {
                    if wait_for_app {
                        app_ready.await.map(|_| ()).map_err(|_| Error::ChannelClosed)
                    } else {
                        Ok(())
                    }
                },
                self.device.start_preview(),
            )
            .map(drop)
        })
        .await?;

        self.stage(
            on_progress,
            SessionPhase::AttachingDebugger,
            StartupMessage::AttachingDebugger,
        )?;
        self.guarded(async {
            self.attach_debugger().await;
            Ok(())
        })
        .await?;

        self.transition(SessionPhase::Running)?;
        info!("App running on {}", self.device.info().name);
        Ok(())
    }

    async fn attach_debugger(&self) {
        let timeout = self.services.launch.debugger_timeout();
        let Some(url) = self.services.bundler.debugger_target_url(timeout).await else {
            error!("No debugger target found, continuing without debugger");
            return;
        };

        match self.services.debugger.attach(&url).await {
            Ok(connection) => {
                *self.debugger.lock().unwrap_or_else(|e| e.into_inner()) = Some(connection);
            }
            Err(e) => error!("Failed to attach debugger: {}", e),
        }
    }

    async fn disconnect_debugger(&self) {
        let connection = self.debugger.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(connection) = connection {
            connection.disconnect().await;
        }
    }

    /// Relaunch the app without reinstalling
    pub async fn restart(&self, on_progress: StageCallback) -> Result<()> {
        info!("Restarting app on {}", self.device.info().name);
        self.launch(&on_progress).await
    }

    /// Force-reinstall the build, then relaunch
    pub async fn reinstall(&self, on_progress: StageCallback) -> Result<()> {
        let build = self
            .build_result()
            .ok_or_else(|| Error::install("no build has been installed"))?;

        self.stage(&on_progress, SessionPhase::Installing, StartupMessage::Installing)?;
        self.guarded(self.device.install(&build, true)).await?;
        self.launch(&on_progress).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Runtime Controls
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn send_touch(&self, x: f64, y: f64, touch: TouchType) -> Result<()> {
        self.device.send_touch(x, y, touch).await
    }

    pub async fn send_key(&self, key_code: u32, direction: KeyDirection) -> Result<()> {
        self.device.send_key(key_code, direction).await
    }

    pub async fn send_paste(&self, text: &str) -> Result<()> {
        self.device.send_paste(text).await
    }

    /// Ask the app which element is at `(x, y)`
    pub fn inspect_element_at(
        &self,
        x: f64,
        y: f64,
        request_stack: bool,
    ) -> oneshot::Receiver<InspectData> {
        let id = self.next_inspect_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_inspects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        self.services.notifier.send_to_app(AppCommand::Inspect {
            id,
            x,
            y,
            request_stack,
        });
        rx
    }

    pub fn open_navigation(&self, id: &str) {
        self.services
            .notifier
            .send_to_app(AppCommand::OpenNavigation { id: id.to_string() });
    }

    pub async fn open_dev_menu(&self) -> Result<()> {
        match self.device.platform() {
            Platform::Ios => {
                self.services.notifier.send_to_app(AppCommand::IosDevMenu);
                Ok(())
            }
            Platform::Android => self.device.open_dev_menu().await,
        }
    }

    /// Reset app permissions on the device. Returns whether the app needs a
    /// restart, which is never the case before anything was installed.
    pub async fn reset_app_permissions(&self, permission: AppPermission) -> Result<bool> {
        let Some(build) = self.build_result() else {
            debug!("Nothing installed, skipping permission reset");
            return Ok(false);
        };
        self.guarded(self.device.reset_app_permissions(&build, permission))
            .await
    }

    pub fn open_preview(&self, preview_id: &str) {
        self.services.notifier.send_to_app(AppCommand::OpenPreview {
            preview_id: preview_id.to_string(),
        });
    }

    pub fn on_active_file_change(&self, filename: &str, follow_enabled: bool) {
        self.services
            .notifier
            .send_to_app(AppCommand::EditorFileChanged {
                filename: filename.to_string(),
                follow_enabled,
            });
    }

    pub async fn change_device_settings(&self, settings: &DeviceSettings) -> Result<()> {
        self.device.apply_settings(settings).await
    }

    fn debug_connection(&self) -> Option<Arc<dyn DebugConnection>> {
        self.debugger.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn resume_debugger(&self) -> Result<()> {
        match self.debug_connection() {
            Some(connection) => connection.resume().await,
            None => Ok(()),
        }
    }

    pub async fn step_over_debugger(&self) -> Result<()> {
        match self.debug_connection() {
            Some(connection) => connection.step_over().await,
            None => Ok(()),
        }
    }

    /// Tear the session down. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Disposing session on {}", self.device.info().id);

        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = SessionPhase::Disposed;
        self.lifetime.cancel();
        self.inspect_listener.remove();
        self.pending_inspects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        if let Some(task) = self
            .preview_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }

        self.disconnect_debugger().await;
        self.build.dispose();
        self.device.dispose();
    }
}
