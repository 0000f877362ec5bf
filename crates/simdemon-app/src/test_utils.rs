//! In-memory collaborators for orchestrator tests
//!
//! The fakes record what was asked of them so tests can assert on call order
//! without spawning simulators, bundlers or build tools.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use simdemon_core::events::{BundlerEvent, DebuggerEvent};
use simdemon_core::prelude::*;
use simdemon_core::{
    AppCommand, AppEvent, AppPermission, BuildResult, CancelToken, DeviceInfo, DeviceSettings,
    KeyDirection, Platform, TouchType,
};
use simdemon_daemon::test_utils::write_test_artifact;
use simdemon_daemon::{
    AppTransport, BuildRequest, Bundler, DebugConnection, DebuggerConnector, DeviceDriver,
    DeviceProvider, NativeBuilder, OutputSink, Prerequisite, ProgressSink, DEFAULT_BUNDLER_PORT,
};

pub const FAKE_INSTRUMENTATION_PORT: u16 = 9000;

pub const FAKE_DEBUGGER_URL: &str = "ws://127.0.0.1:8081/inspector/debug?device=0&page=1";

// ─────────────────────────────────────────────────────────────────────────────
// App Transport
// ─────────────────────────────────────────────────────────────────────────────

pub struct FakeTransport {
    connected: AtomicBool,
    sent: Mutex<Vec<AppCommand>>,
    events: broadcast::Sender<AppEvent>,
}

impl FakeTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            connected: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Pretend the app sent `event`
    pub fn emit(&self, event: AppEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<AppCommand> {
        self.sent.lock().unwrap().clone()
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AppTransport for FakeTransport {
    fn port(&self) -> u16 {
        FAKE_INSTRUMENTATION_PORT
    }

    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, command: AppCommand) {
        self.sent.lock().unwrap().push(command);
    }

    fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Devices
// ─────────────────────────────────────────────────────────────────────────────

pub struct FakeDriver {
    info: DeviceInfo,
    app: Option<Arc<FakeTransport>>,
    calls: Mutex<Vec<String>>,
    fail_boot: AtomicBool,
    fail_preview: AtomicBool,
    disposals: AtomicUsize,
}

impl FakeDriver {
    /// A driver whose launches make `app` report ready
    pub fn new(info: DeviceInfo, app: Option<Arc<FakeTransport>>) -> Self {
        Self {
            info,
            app,
            calls: Mutex::new(Vec::new()),
            fail_boot: AtomicBool::new(false),
            fail_preview: AtomicBool::new(false),
            disposals: AtomicUsize::new(0),
        }
    }

    pub fn fail_boot(&self) {
        self.fail_boot.store(true, Ordering::SeqCst);
    }

    /// Make the preview stream refuse to start
    pub fn fail_preview(&self) {
        self.fail_preview.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn dispose_count(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.dispose_count() > 0
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl DeviceDriver for FakeDriver {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    async fn boot(&self) -> Result<()> {
        self.record("boot");
        if self.fail_boot.load(Ordering::SeqCst) {
            return Err(Error::boot(format!("{} did not boot", self.info.name)));
        }
        Ok(())
    }

    async fn apply_settings(&self, _settings: &DeviceSettings) -> Result<()> {
        self.record("apply_settings");
        Ok(())
    }

    async fn install(&self, _build: &BuildResult, force: bool) -> Result<()> {
        self.record(if force { "install --force" } else { "install" });
        Ok(())
    }

    async fn launch(
        &self,
        _build: &BuildResult,
        bundler_port: u16,
        instrumentation_port: u16,
    ) -> Result<()> {
        self.record(format!("launch {bundler_port} {instrumentation_port}"));
        if let Some(app) = &self.app {
            app.set_connected(true);
            app.emit(AppEvent::AppReady);
        }
        Ok(())
    }

    async fn start_preview(&self) -> Result<String> {
        if self.fail_preview.load(Ordering::SeqCst) {
            return Err(Error::preview("preview server exited"));
        }
        Ok(format!("http://preview/{}", self.info.id))
    }

    fn preview_url(&self) -> Option<String> {
        Some(format!("http://preview/{}", self.info.id))
    }

    async fn send_touch(&self, x: f64, y: f64, touch: TouchType) -> Result<()> {
        self.record(format!("touch {} {x} {y}", touch.command()));
        Ok(())
    }

    async fn send_key(&self, key_code: u32, direction: KeyDirection) -> Result<()> {
        self.record(format!("key {} {key_code}", direction.command()));
        Ok(())
    }

    async fn send_paste(&self, text: &str) -> Result<()> {
        self.record(format!("paste {text}"));
        Ok(())
    }

    async fn open_dev_menu(&self) -> Result<()> {
        self.record("dev_menu");
        Ok(())
    }

    async fn reset_app_permissions(
        &self,
        _build: &BuildResult,
        permission: AppPermission,
    ) -> Result<bool> {
        self.record(format!("reset_permissions {}", permission.ios_service()));
        Ok(true)
    }

    fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

/// Devices held by an undisposed driver are busy, like a held device lock
pub struct FakeProvider {
    devices: Mutex<Vec<DeviceInfo>>,
    drivers: Mutex<HashMap<String, Arc<FakeDriver>>>,
    busy: Mutex<HashSet<String>>,
    no_preview: Mutex<HashSet<String>>,
    app: Option<Arc<FakeTransport>>,
}

impl FakeProvider {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices: Mutex::new(devices),
            drivers: Mutex::new(HashMap::new()),
            busy: Mutex::new(HashSet::new()),
            no_preview: Mutex::new(HashSet::new()),
            app: None,
        }
    }

    pub fn with_app(mut self, app: Arc<FakeTransport>) -> Self {
        self.app = Some(app);
        self
    }

    pub fn set_devices(&self, devices: Vec<DeviceInfo>) {
        *self.devices.lock().unwrap() = devices;
    }

    /// Pretend another instance holds `device_id`
    pub fn mark_busy(&self, device_id: &str) {
        self.busy.lock().unwrap().insert(device_id.to_string());
    }

    /// Drivers handed out for `device_id` fail to start a preview
    pub fn fail_preview(&self, device_id: &str) {
        self.no_preview.lock().unwrap().insert(device_id.to_string());
    }

    /// Most recent driver handed out for `device_id`
    pub fn driver(&self, device_id: &str) -> Option<Arc<FakeDriver>> {
        self.drivers.lock().unwrap().get(device_id).cloned()
    }
}

#[async_trait]
impl DeviceProvider for FakeProvider {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn acquire(&self, device: &DeviceInfo) -> Result<Arc<dyn DeviceDriver>> {
        if self.busy.lock().unwrap().contains(&device.id) {
            return Err(Error::device_busy(&device.id));
        }

        let mut drivers = self.drivers.lock().unwrap();
        if drivers
            .get(&device.id)
            .is_some_and(|driver| !driver.is_disposed())
        {
            return Err(Error::device_busy(&device.id));
        }

        let driver = Arc::new(FakeDriver::new(device.clone(), self.app.clone()));
        if self.no_preview.lock().unwrap().contains(&device.id) {
            driver.fail_preview();
        }
        drivers.insert(device.id.clone(), Arc::clone(&driver));
        Ok(driver)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

pub struct FakeBuilder {
    platform: Platform,
    out_dir: PathBuf,
    builds: AtomicUsize,
    kills: Arc<AtomicUsize>,
    blocked: Mutex<HashSet<String>>,
    failure: Mutex<Option<String>>,
    steps: Mutex<Vec<f64>>,
}

impl FakeBuilder {
    pub fn new(platform: Platform, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            platform,
            out_dir: out_dir.into(),
            builds: AtomicUsize::new(0),
            kills: Arc::new(AtomicUsize::new(0)),
            blocked: Mutex::new(HashSet::new()),
            failure: Mutex::new(None),
            steps: Mutex::new(vec![0.5]),
        }
    }

    /// Progress reported before a build finishes, in order
    pub fn report_progress(&self, steps: Vec<f64>) {
        *self.steps.lock().unwrap() = steps;
    }

    /// Builds for `device_id` hang until cancelled
    pub fn block_device(&self, device_id: &str) {
        self.blocked.lock().unwrap().insert(device_id.to_string());
    }

    /// Every following build fails with `message`
    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NativeBuilder for FakeBuilder {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn build(
        &self,
        request: BuildRequest,
        cancel: CancelToken,
        progress: ProgressSink,
        output: OutputSink,
    ) -> Result<BuildResult> {
        let number = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        output(&format!("Building {} #{number}", request.device.id));
        let steps = self.steps.lock().unwrap().clone();
        for step in steps {
            progress(step);
        }

        if self.blocked.lock().unwrap().contains(&request.device.id) {
            let kills = Arc::clone(&self.kills);
            cancel.on_cancel(move || {
                kills.fetch_add(1, Ordering::SeqCst);
            });
            cancel.cancelled().await;
            return Err(Error::BuildCancelled);
        }

        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(Error::build(self.platform, message));
        }

        let dir = self.out_dir.join(&request.device.id);
        std::fs::create_dir_all(&dir)?;
        let result = write_test_artifact(&dir, self.platform, &format!("build {number}"));
        progress(1.0);
        Ok(result)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bundler
// ─────────────────────────────────────────────────────────────────────────────

pub struct FakeBundler {
    events: broadcast::Sender<BundlerEvent>,
    debugger_url: Mutex<Option<String>>,
    starts: Mutex<Vec<bool>>,
    reloads: AtomicUsize,
    stopped: AtomicBool,
}

impl FakeBundler {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            debugger_url: Mutex::new(Some(FAKE_DEBUGGER_URL.to_string())),
            starts: Mutex::new(Vec::new()),
            reloads: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn set_debugger_url(&self, url: Option<String>) {
        *self.debugger_url.lock().unwrap() = url;
    }

    pub fn emit(&self, event: BundlerEvent) {
        let _ = self.events.send(event);
    }

    /// `clean` flag of every start
    pub fn starts(&self) -> Vec<bool> {
        self.starts.lock().unwrap().clone()
    }

    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Default for FakeBundler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bundler for FakeBundler {
    async fn start(&self, clean: bool, prerequisites: Vec<Prerequisite>) -> Result<()> {
        for prerequisite in prerequisites {
            prerequisite.await?;
        }
        self.starts.lock().unwrap().push(clean);
        Ok(())
    }

    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn debugger_target_url(&self, _timeout: Duration) -> Option<String> {
        self.debugger_url.lock().unwrap().clone()
    }

    fn port(&self) -> u16 {
        DEFAULT_BUNDLER_PORT
    }

    fn subscribe(&self) -> broadcast::Receiver<BundlerEvent> {
        self.events.subscribe()
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Debugger
// ─────────────────────────────────────────────────────────────────────────────

pub struct FakeDebugger {
    events: broadcast::Sender<DebuggerEvent>,
    attached: Mutex<Vec<String>>,
    stats: Arc<ConnectionStats>,
}

#[derive(Default)]
struct ConnectionStats {
    resumes: AtomicUsize,
    steps: AtomicUsize,
    disconnects: AtomicUsize,
}

impl FakeDebugger {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            attached: Mutex::new(Vec::new()),
            stats: Arc::new(ConnectionStats::default()),
        }
    }

    pub fn emit(&self, event: DebuggerEvent) {
        let _ = self.events.send(event);
    }

    pub fn attached(&self) -> Vec<String> {
        self.attached.lock().unwrap().clone()
    }

    pub fn resumes(&self) -> usize {
        self.stats.resumes.load(Ordering::SeqCst)
    }

    pub fn steps(&self) -> usize {
        self.stats.steps.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.stats.disconnects.load(Ordering::SeqCst)
    }
}

impl Default for FakeDebugger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DebuggerConnector for FakeDebugger {
    async fn attach(&self, url: &str) -> Result<Arc<dyn DebugConnection>> {
        self.attached.lock().unwrap().push(url.to_string());
        Ok(Arc::new(FakeConnection {
            stats: Arc::clone(&self.stats),
            closed: AtomicBool::new(false),
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<DebuggerEvent> {
        self.events.subscribe()
    }
}

struct FakeConnection {
    stats: Arc<ConnectionStats>,
    closed: AtomicBool,
}

#[async_trait]
impl DebugConnection for FakeConnection {
    async fn resume(&self) -> Result<()> {
        self.stats.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn step_over(&self) -> Result<()> {
        self.stats.steps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stats.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simdemon_daemon::test_utils::test_emulator;

    #[tokio::test]
    async fn test_provider_reports_held_devices_busy() {
        let device = test_emulator("pixel");
        let provider = FakeProvider::new(vec![device.clone()]);

        let driver = provider.acquire(&device).await.unwrap();
        assert!(matches!(
            provider.acquire(&device).await,
            Err(Error::DeviceBusy { .. })
        ));

        driver.dispose();
        assert!(provider.acquire(&device).await.is_ok());
    }

    #[tokio::test]
    async fn test_launch_reports_app_ready() {
        let app = Arc::new(FakeTransport::new());
        let mut events = app.subscribe();
        let driver = FakeDriver::new(test_emulator("pixel"), Some(Arc::clone(&app)));
        let build = BuildResult::Android {
            apk_path: PathBuf::from("app.apk"),
            package_name: "org.example".into(),
        };

        driver.launch(&build, 8081, 9000).await.unwrap();

        assert!(app.is_connected());
        assert_eq!(events.recv().await.unwrap(), AppEvent::AppReady);
        assert_eq!(driver.calls(), vec!["launch 8081 9000"]);
    }
}
