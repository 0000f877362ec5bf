//! Android emulator control through `emulator` and `adb`

use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::mpsc;

use simdemon_core::events::ProcessEvent;
use simdemon_core::prelude::*;
use simdemon_core::{
    AppPermission, Appearance, BuildResult, DeviceInfo, DeviceSettings, KeyDirection, Platform, TouchType,
};

use super::{DeviceCore, DeviceDriver};
use crate::process::{self, ManagedProcess, ProcessSpec};

/// How long to wait for a cold emulator boot
const BOOT_TIMEOUT: Duration = Duration::from_secs(180);

const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// `KEYCODE_MENU`, opens the React Native dev menu
const MENU_KEY_EVENT: &str = "82";

static API_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_API_(\d+)$").expect("Invalid API pattern regex"));

/// List AVDs known to the emulator
pub async fn list_avds(emulator: &Path) -> Result<Vec<DeviceInfo>> {
    let output = process::run(&ProcessSpec::new(emulator).arg("-list-avds")).await?;
    Ok(parse_avd_list(&output))
}

/// Parse `emulator -list-avds`, one AVD name per line
pub fn parse_avd_list(output: &str) -> Vec<DeviceInfo> {
    output
        .lines()
        .map(str::trim)
        // The emulator prints diagnostics like "INFO | ..." on some versions
        .filter(|line| !line.is_empty() && !line.contains(" | "))
        .map(|name| {
            let (display_name, api_level) = parse_avd_name(name);
            DeviceInfo {
                id: name.to_string(),
                name: display_name,
                platform: Platform::Android,
                system_image: api_level.map(|level| format!("API {level}")),
            }
        })
        .collect()
}

/// `Pixel_6_API_33` -> (`Pixel 6`, `Some(33)`)
fn parse_avd_name(name: &str) -> (String, Option<u32>) {
    if let Some(caps) = API_PATTERN.captures(name) {
        let api_level = caps.get(1).and_then(|m| m.as_str().parse().ok());
        let display = API_PATTERN.replace(name, "").replace('_', " ");
        return (display.trim().to_string(), api_level);
    }

    (name.replace('_', " "), None)
}

/// Serials of running emulators from `adb devices`
pub fn parse_adb_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            (serial.starts_with("emulator-") && state == "device").then(|| serial.to_string())
        })
        .collect()
}

/// An Android Virtual Device acquired for this session
pub struct AndroidEmulator {
    core: DeviceCore,
    adb: PathBuf,
    emulator: PathBuf,
    serial: Mutex<Option<String>>,
    process: Mutex<Option<ManagedProcess>>,
}

impl AndroidEmulator {
    pub fn new(core: DeviceCore, adb: PathBuf, emulator: PathBuf) -> Self {
        Self {
            core,
            adb,
            emulator,
            serial: Mutex::new(None),
            process: Mutex::new(None),
        }
    }

    fn avd_name(&self) -> &str {
        &self.core.info().id
    }

    fn serial(&self) -> Result<String> {
        self.serial
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| Error::boot(format!("emulator {} is not booted", self.avd_name())))
    }

    fn adb<I, S>(&self, serial: &str, args: I) -> ProcessSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProcessSpec::new(&self.adb).args(["-s", serial]).args(args)
    }

    /// Serial of a running emulator whose AVD name matches ours
    async fn find_running_serial(&self) -> Option<String> {
        let devices = process::run(&ProcessSpec::new(&self.adb).arg("devices"))
            .await
            .ok()?;

        for serial in parse_adb_devices(&devices) {
            let name = process::run(&self.adb(&serial, ["emu", "avd", "name"]))
                .await
                .unwrap_or_default();
            if name.lines().next().map(str::trim) == Some(self.avd_name()) {
                return Some(serial);
            }
        }
        None
    }

    fn spawn_emulator(&self) -> Result<()> {
        let spec = ProcessSpec::new(&self.emulator).args([
            "-avd",
            self.avd_name(),
            "-no-boot-anim",
            "-no-snapshot-save",
        ]);

        let (tx, mut rx) = mpsc::channel::<ProcessEvent>(64);
        let child = ManagedProcess::spawn(&spec, tx).map_err(|e| Error::boot(e.to_string()))?;
        let avd = self.avd_name().to_string();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    ProcessEvent::Stdout(line) | ProcessEvent::Stderr(line) => {
                        trace!("emulator {}: {}", avd, line);
                    }
                    ProcessEvent::Exited { code } => {
                        info!("Emulator {} exited with {:?}", avd, code);
                        break;
                    }
                }
            }
        });

        *self.process.lock().unwrap_or_else(|e| e.into_inner()) = Some(child);
        Ok(())
    }

    async fn wait_for_boot(&self) -> Result<String> {
        let serial = loop {
            if let Some(serial) = self.find_running_serial().await {
                break serial;
            }
            tokio::time::sleep(BOOT_POLL_INTERVAL).await;
        };

        loop {
            let booted = process::run(&self.adb(&serial, ["shell", "getprop", "sys.boot_completed"]))
                .await
                .map(|out| out.trim() == "1")
                .unwrap_or(false);
            if booted {
                return Ok(serial);
            }
            tokio::time::sleep(BOOT_POLL_INTERVAL).await;
        }
    }

    fn package_name(build: &BuildResult) -> Result<(&Path, &str)> {
        match build {
            BuildResult::Android {
                apk_path,
                package_name,
            } => Ok((apk_path, package_name)),
            BuildResult::Ios { .. } => Err(Error::install("expected an Android build")),
        }
    }
}

#[async_trait]
impl DeviceDriver for AndroidEmulator {
    fn info(&self) -> &DeviceInfo {
        self.core.info()
    }

    async fn boot(&self) -> Result<()> {
        if self.find_running_serial().await.is_none() {
            info!("Starting emulator {}", self.avd_name());
            self.spawn_emulator()?;
        }

        let serial = tokio::time::timeout(BOOT_TIMEOUT, self.wait_for_boot())
            .await
            .map_err(|_| {
                Error::boot(format!(
                    "emulator {} did not boot within {:?}",
                    self.avd_name(),
                    BOOT_TIMEOUT
                ))
            })??;

        info!("Emulator {} booted as {}", self.avd_name(), serial);
        *self.serial.lock().unwrap_or_else(|e| e.into_inner()) = Some(serial);
        Ok(())
    }

    async fn apply_settings(&self, settings: &DeviceSettings) -> Result<()> {
        let serial = self.serial()?;

        let night = match settings.appearance {
            Appearance::Light => "no",
            Appearance::Dark => "yes",
        };
        process::run(&self.adb(&serial, ["shell", "cmd", "uimode", "night", night])).await?;
        process::run(&self.adb(&serial, ["shell", "settings", "put", "system", "font_scale"]).arg(
            settings.content_size.android_font_scale().to_string(),
        ))
        .await?;

        let location = settings.location;
        if !location.is_disabled {
            process::run(
                &self
                    .adb(&serial, ["emu", "geo", "fix"])
                    .arg(location.longitude.to_string())
                    .arg(location.latitude.to_string()),
            )
            .await?;
        }
        Ok(())
    }

    async fn install(&self, build: &BuildResult, force: bool) -> Result<()> {
        let serial = self.serial()?;
        let (apk_path, package_name) = Self::package_name(build)?;

        if force {
            if let Err(e) = process::run(&self.adb(&serial, ["uninstall", package_name])).await {
                debug!("Uninstall before reinstall failed: {}", e);
            }
        }

        process::run(
            &self
                .adb(&serial, ["install", "-r"])
                .arg(apk_path.display().to_string()),
        )
        .await
        .map_err(|e| Error::install(e.to_string()))?;
        Ok(())
    }

    async fn launch(
        &self,
        build: &BuildResult,
        bundler_port: u16,
        instrumentation_port: u16,
    ) -> Result<()> {
        let serial = self.serial()?;
        let (_, package_name) = Self::package_name(build)?;

        for port in [bundler_port, instrumentation_port] {
            let tcp = format!("tcp:{port}");
            process::run(&self.adb(&serial, ["reverse", tcp.as_str(), tcp.as_str()]))
                .await
                .map_err(|e| Error::launch(e.to_string()))?;
        }

        process::run(&self.adb(&serial, ["shell", "am", "force-stop", package_name])).await?;
        process::run(&self.adb(
            &serial,
            [
                "shell",
                "monkey",
                "-p",
                package_name,
                "-c",
                "android.intent.category.LAUNCHER",
                "1",
            ],
        ))
        .await
        .map_err(|e| Error::launch(e.to_string()))?;
        Ok(())
    }

    async fn start_preview(&self) -> Result<String> {
        let serial = self.serial()?;
        self.core
            .start_preview(vec!["android".into(), "--id".into(), serial])
            .await
    }

    fn preview_url(&self) -> Option<String> {
        self.core.preview_url()
    }

    async fn send_touch(&self, x: f64, y: f64, touch: TouchType) -> Result<()> {
        self.core.send_touch(x, y, touch).await
    }

    async fn send_key(&self, key_code: u32, direction: KeyDirection) -> Result<()> {
        self.core.send_key(key_code, direction).await
    }

    async fn send_paste(&self, text: &str) -> Result<()> {
        self.core.send_paste(text).await
    }

    async fn open_dev_menu(&self) -> Result<()> {
        let serial = self.serial()?;
        process::run(&self.adb(&serial, ["shell", "input", "keyevent", MENU_KEY_EVENT])).await?;
        Ok(())
    }

    async fn reset_app_permissions(
        &self,
        build: &BuildResult,
        permission: AppPermission,
    ) -> Result<bool> {
        let serial = self.serial()?;
        let (_, package_name) = Self::package_name(build)?;
        info!("Resetting {:?} permissions of {}", permission, package_name);

        if permission == AppPermission::All {
            process::run(&self.adb(
                &serial,
                ["shell", "pm", "reset-permissions", "-p", package_name],
            ))
            .await?;
            return Ok(true);
        }

        for name in permission.android_permissions() {
            // pm refuses permissions the app never declared
            if let Err(e) =
                process::run(&self.adb(&serial, ["shell", "pm", "revoke", package_name, name])).await
            {
                debug!("Not revoking {}: {}", name, e);
            }
        }
        Ok(true)
    }

    fn dispose(&self) {
        self.core.dispose();
        if let Some(process) = self.process.lock().unwrap_or_else(|e| e.into_inner()).take() {
            process.kill();
        }
    }
}
