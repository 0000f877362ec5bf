//! Simulators and emulators
//!
//! A [`DeviceProvider`] lists the devices available on this machine and hands
//! out exclusive [`DeviceDriver`]s. Exclusivity across processes is enforced
//! with an advisory lock file per device, so two instances never drive the same
//! simulator.

pub mod emulator;
pub mod simulator;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fs2::FileExt;
use tokio::sync::OnceCell;

use simdemon_core::prelude::*;
use simdemon_core::{
    AppPermission, BuildResult, DeviceInfo, DeviceSettings, KeyDirection, Platform, TouchType,
};

use crate::preview::Preview;
use crate::process::ProcessSpec;
use crate::tools::ToolPaths;

pub use emulator::AndroidEmulator;
pub use simulator::IosSimulator;

/// Control of one booted simulator or emulator
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    fn platform(&self) -> Platform {
        self.info().platform
    }

    /// Boot the device and wait until it accepts commands
    async fn boot(&self) -> Result<()>;

    /// Apply appearance, text size and location
    async fn apply_settings(&self, settings: &DeviceSettings) -> Result<()>;

    /// Install the build, uninstalling any previous copy first when `force` is set
    async fn install(&self, build: &BuildResult, force: bool) -> Result<()>;

    /// (Re)start the app, pointing it at the bundler and instrumentation ports
    async fn launch(
        &self,
        build: &BuildResult,
        bundler_port: u16,
        instrumentation_port: u16,
    ) -> Result<()>;

    /// Start the preview stream, or return the running one's URL
    async fn start_preview(&self) -> Result<String>;

    fn preview_url(&self) -> Option<String>;

    async fn send_touch(&self, x: f64, y: f64, touch: TouchType) -> Result<()>;

    async fn send_key(&self, key_code: u32, direction: KeyDirection) -> Result<()>;

    async fn send_paste(&self, text: &str) -> Result<()>;

    /// Open the React Native developer menu through the device itself
    async fn open_dev_menu(&self) -> Result<()>;

    /// Reset `permission` for the app in `build`. Returns whether the app must
    /// be restarted to see the change.
    async fn reset_app_permissions(
        &self,
        build: &BuildResult,
        permission: AppPermission,
    ) -> Result<bool>;

    /// Stop the preview and release the device lock. Idempotent.
    fn dispose(&self);
}

/// Source of selectable devices
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Take exclusive ownership of `device`.
    ///
    /// Fails with [`Error::DeviceBusy`] when another instance holds it.
    async fn acquire(&self, device: &DeviceInfo) -> Result<Arc<dyn DeviceDriver>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Device Lock
// ─────────────────────────────────────────────────────────────────────────────

/// Exclusive advisory lock on a device, released on drop
#[derive(Debug)]
pub struct DeviceLock {
    file: File,
    path: PathBuf,
}

impl DeviceLock {
    pub fn acquire(lock_dir: &Path, device_id: &str) -> Result<Self> {
        std::fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(format!("{}.lock", lock_file_stem(device_id)));

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Acquired device lock {}", path.display());
                Ok(Self { file, path })
            }
            Err(e) if is_contended(&e) => Err(Error::device_busy(device_id)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
        debug!("Released device lock {}", self.path.display());
    }
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn lock_file_stem(device_id: &str) -> String {
    device_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared Driver State
// ─────────────────────────────────────────────────────────────────────────────

/// State common to every driver: identity, lock and preview stream
pub struct DeviceCore {
    info: DeviceInfo,
    preview_server: Option<PathBuf>,
    preview: OnceCell<Preview>,
    lock: Mutex<Option<DeviceLock>>,
}

impl DeviceCore {
    pub fn new(info: DeviceInfo, lock: DeviceLock, preview_server: Option<PathBuf>) -> Self {
        Self {
            info,
            preview_server,
            preview: OnceCell::new(),
            lock: Mutex::new(Some(lock)),
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Start the preview server with platform `args` unless already running
    pub async fn start_preview(&self, args: Vec<String>) -> Result<String> {
        let server = self
            .preview_server
            .as_ref()
            .ok_or_else(|| Error::preview("no preview server configured"))?;
        let spec = ProcessSpec::new(server).args(args);

        let preview = self
            .preview
            .get_or_try_init(|| Preview::start(&spec))
            .await?;
        Ok(preview.stream_url().to_string())
    }

    pub fn preview_url(&self) -> Option<String> {
        self.preview.get().map(|p| p.stream_url().to_string())
    }

    pub async fn send_touch(&self, x: f64, y: f64, touch: TouchType) -> Result<()> {
        match self.preview.get() {
            Some(preview) => preview.send_touch(x, y, touch).await,
            None => Ok(()),
        }
    }

    pub async fn send_key(&self, key_code: u32, direction: KeyDirection) -> Result<()> {
        match self.preview.get() {
            Some(preview) => preview.send_key(key_code, direction).await,
            None => Ok(()),
        }
    }

    pub async fn send_paste(&self, text: &str) -> Result<()> {
        match self.preview.get() {
            Some(preview) => preview.send_paste(text).await,
            None => Ok(()),
        }
    }

    pub fn dispose(&self) {
        if let Some(preview) = self.preview.get() {
            preview.dispose();
        }
        let lock = self.lock.lock().unwrap_or_else(|e| e.into_inner()).take();
        if lock.is_some() {
            info!("Released device {}", self.info.id);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Local Provider
// ─────────────────────────────────────────────────────────────────────────────

/// Lists local simulators/emulators and locks them under `lock_dir`
pub struct LocalDeviceProvider {
    tools: ToolPaths,
    lock_dir: PathBuf,
    preview_server: Option<PathBuf>,
}

impl LocalDeviceProvider {
    pub fn new(tools: ToolPaths, preview_server: Option<PathBuf>) -> Self {
        Self {
            tools,
            lock_dir: simdemon_core::logging::data_directory().join("locks"),
            preview_server,
        }
    }

    pub fn with_lock_dir(mut self, lock_dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = lock_dir.into();
        self
    }
}

#[async_trait]
impl DeviceProvider for LocalDeviceProvider {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut devices = Vec::new();

        if let Ok(xcrun) = self.tools.xcrun() {
            match simulator::list_simulators(&xcrun).await {
                Ok(found) => devices.extend(found),
                Err(e) => warn!("Failed to list iOS simulators: {}", e),
            }
        }
        if let Ok(emulator) = self.tools.emulator() {
            match emulator::list_avds(&emulator).await {
                Ok(found) => devices.extend(found),
                Err(e) => warn!("Failed to list Android emulators: {}", e),
            }
        }

        debug!("Found {} devices", devices.len());
        Ok(devices)
    }

    async fn acquire(&self, device: &DeviceInfo) -> Result<Arc<dyn DeviceDriver>> {
        let lock = DeviceLock::acquire(&self.lock_dir, &device.id)?;
        let core = DeviceCore::new(device.clone(), lock, self.preview_server.clone());

        let driver: Arc<dyn DeviceDriver> = match device.platform {
            Platform::Ios => Arc::new(IosSimulator::new(core, self.tools.xcrun()?)),
            Platform::Android => Arc::new(AndroidEmulator::new(
                core,
                self.tools.adb()?,
                self.tools.emulator()?,
            )),
        };
        Ok(driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let temp = tempfile::tempdir().unwrap();
        let first = DeviceLock::acquire(temp.path(), "ABC-123").unwrap();
        assert!(first.path().exists());

        match DeviceLock::acquire(temp.path(), "ABC-123") {
            Err(Error::DeviceBusy { device_id }) => assert_eq!(device_id, "ABC-123"),
            other => panic!("expected DeviceBusy, got {other:?}"),
        }

        let other_device = DeviceLock::acquire(temp.path(), "Pixel_7_API_34");
        assert!(other_device.is_ok());

        drop(first);
        assert!(DeviceLock::acquire(temp.path(), "ABC-123").is_ok());
    }

    #[test]
    fn test_lock_file_stem_sanitizes_ids() {
        assert_eq!(lock_file_stem("emulator-5554"), "emulator-5554");
        assert_eq!(lock_file_stem("a/b c"), "a_b_c");
    }

    #[tokio::test]
    async fn test_core_without_preview_server() {
        let temp = tempfile::tempdir().unwrap();
        let lock = DeviceLock::acquire(temp.path(), "sim").unwrap();
        let core = DeviceCore::new(DeviceInfo::new("sim", "iPhone", Platform::Ios), lock, None);

        assert!(matches!(
            core.start_preview(vec![]).await,
            Err(Error::Preview { .. })
        ));
        assert_eq!(core.preview_url(), None);
        // Input without a preview is dropped
        core.send_touch(0.1, 0.1, TouchType::Down).await.unwrap();

        core.dispose();
        core.dispose();
        assert!(DeviceLock::acquire(temp.path(), "sim").is_ok());
    }

    #[tokio::test]
    async fn test_acquire_busy_device() {
        let temp = tempfile::tempdir().unwrap();
        let provider = LocalDeviceProvider::new(
            ToolPaths {
                xcrun: Some(PathBuf::from("xcrun")),
                ..Default::default()
            },
            None,
        )
        .with_lock_dir(temp.path());
        let device = DeviceInfo::new("UDID-1", "iPhone 15", Platform::Ios);

        let driver = provider.acquire(&device).await.unwrap();
        assert!(matches!(
            provider.acquire(&device).await,
            Err(Error::DeviceBusy { .. })
        ));

        driver.dispose();
        assert!(provider.acquire(&device).await.is_ok());
    }
}
