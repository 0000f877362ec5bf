//! iOS Simulator control through `xcrun simctl`

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use simdemon_core::prelude::*;
use simdemon_core::{
    AppPermission, Appearance, BuildResult, DeviceInfo, DeviceSettings, KeyDirection, Platform, TouchType,
};

use super::{DeviceCore, DeviceDriver};
use crate::process::{self, ProcessSpec};

const RUNTIME_PREFIX: &str = "com.apple.CoreSimulator.SimRuntime.";

#[derive(Debug, Deserialize)]
struct SimctlList {
    devices: HashMap<String, Vec<SimctlDevice>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimctlDevice {
    udid: String,
    name: String,
    #[serde(default)]
    is_available: Option<bool>,
}

/// List available iPhone/iPad simulators
pub async fn list_simulators(xcrun: &Path) -> Result<Vec<DeviceInfo>> {
    let spec = ProcessSpec::new(xcrun).args(["simctl", "list", "devices", "available", "-j"]);
    let output = process::run(&spec).await?;
    parse_simctl_list(&output)
}

/// Parse `xcrun simctl list devices -j`, keeping iOS runtimes only
pub fn parse_simctl_list(json: &str) -> Result<Vec<DeviceInfo>> {
    let list: SimctlList = serde_json::from_str(json)?;

    let mut devices: Vec<DeviceInfo> = list
        .devices
        .into_iter()
        .filter_map(|(runtime, devices)| runtime_name(&runtime).map(|name| (name, devices)))
        .filter(|(name, _)| name.starts_with("iOS"))
        .flat_map(|(runtime, devices)| {
            devices
                .into_iter()
                .filter(|d| d.is_available.unwrap_or(true))
                .map(move |d| DeviceInfo {
                    id: d.udid,
                    name: d.name,
                    platform: Platform::Ios,
                    system_image: Some(runtime.clone()),
                })
        })
        .collect();

    devices.sort_by(|a, b| {
        b.system_image
            .cmp(&a.system_image)
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(devices)
}

/// `com.apple.CoreSimulator.SimRuntime.iOS-17-2` -> `iOS 17.2`
fn runtime_name(identifier: &str) -> Option<String> {
    let rest = identifier.strip_prefix(RUNTIME_PREFIX)?;
    let (os, version) = rest.split_once('-')?;
    Some(format!("{} {}", os, version.replace('-', ".")))
}

/// A simulator acquired for this session
pub struct IosSimulator {
    core: DeviceCore,
    xcrun: PathBuf,
}

impl IosSimulator {
    pub fn new(core: DeviceCore, xcrun: PathBuf) -> Self {
        Self { core, xcrun }
    }

    fn udid(&self) -> &str {
        &self.core.info().id
    }

    fn simctl<I, S>(&self, args: I) -> ProcessSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProcessSpec::new(&self.xcrun).arg("simctl").args(args)
    }

    fn bundle_id(build: &BuildResult) -> Result<(&Path, &str)> {
        match build {
            BuildResult::Ios { app_path, bundle_id } => Ok((app_path, bundle_id)),
            BuildResult::Android { .. } => Err(Error::install("expected an iOS build")),
        }
    }
}

#[async_trait]
impl DeviceDriver for IosSimulator {
    fn info(&self) -> &DeviceInfo {
        self.core.info()
    }

    async fn boot(&self) -> Result<()> {
        info!("Booting simulator {}", self.udid());
        if let Err(e) = process::run(&self.simctl(["boot", self.udid()])).await {
            // simctl refuses to boot an already booted device
            if !e.to_string().contains("current state: Booted") {
                return Err(Error::boot(e.to_string()));
            }
            debug!("Simulator {} already booted", self.udid());
        }

        process::run(&self.simctl(["bootstatus", self.udid(), "-b"]))
            .await
            .map_err(|e| Error::boot(e.to_string()))?;
        Ok(())
    }

    async fn apply_settings(&self, settings: &DeviceSettings) -> Result<()> {
        let appearance = match settings.appearance {
            Appearance::Light => "light",
            Appearance::Dark => "dark",
        };
        process::run(&self.simctl(["ui", self.udid(), "appearance", appearance])).await?;
        process::run(&self.simctl([
            "ui",
            self.udid(),
            "content_size",
            settings.content_size.ios_category(),
        ]))
        .await?;

        let location = settings.location;
        let spec = if location.is_disabled {
            self.simctl(["location", self.udid(), "clear"])
        } else {
            self.simctl(["location", self.udid(), "set"]).arg(format!(
                "{},{}",
                location.latitude, location.longitude
            ))
        };
        process::run(&spec).await?;
        Ok(())
    }

    async fn install(&self, build: &BuildResult, force: bool) -> Result<()> {
        let (app_path, bundle_id) = Self::bundle_id(build)?;

        if force {
            if let Err(e) = process::run(&self.simctl(["uninstall", self.udid(), bundle_id])).await
            {
                debug!("Uninstall before reinstall failed: {}", e);
            }
        }

        let spec = self
            .simctl(["install", self.udid()])
            .arg(app_path.display().to_string());
        process::run(&spec)
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
        let (_, bundle_id) = Self::bundle_id(build)?;

        if let Err(e) = process::run(&self.simctl(["terminate", self.udid(), bundle_id])).await {
            trace!("terminate before launch: {}", e);
        }

        // SIMCTL_CHILD_ variables are forwarded to the launched app
        let spec = self
            .simctl(["launch", "--terminate-running-process", self.udid(), bundle_id])
            .env("SIMCTL_CHILD_RCT_METRO_PORT", bundler_port.to_string())
            .env(
                "SIMCTL_CHILD_SIMDEMON_INSTRUMENTATION_PORT",
                instrumentation_port.to_string(),
            );
        process::run(&spec)
            .await
            .map_err(|e| Error::launch(e.to_string()))?;
        Ok(())
    }

    async fn start_preview(&self) -> Result<String> {
        self.core
            .start_preview(vec!["ios".into(), "--id".into(), self.udid().to_string()])
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
        Err(Error::process(
            "the iOS simulator has no dev menu command; use the app channel",
        ))
    }

    async fn reset_app_permissions(
        &self,
        build: &BuildResult,
        permission: AppPermission,
    ) -> Result<bool> {
        let (_, bundle_id) = Self::bundle_id(build)?;
        info!("Resetting {} permissions of {}", permission.ios_service(), bundle_id);
        process::run(&self.simctl([
            "privacy",
            self.udid(),
            "reset",
            permission.ios_service(),
            bundle_id,
        ]))
        .await?;
        // simctl terminates the app when revoking access
        Ok(true)
    }

    fn dispose(&self) {
        self.core.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceLock;
    use simdemon_core::{ContentSize, Location};

    const SIMCTL_JSON: &str = r#"{
      "devices": {
        "com.apple.CoreSimulator.SimRuntime.iOS-17-2": [
          {"udid": "AAA", "name": "iPhone 15", "state": "Shutdown", "isAvailable": true},
          {"udid": "BBB", "name": "iPad Air", "state": "Booted", "isAvailable": false}
        ],
        "com.apple.CoreSimulator.SimRuntime.iOS-16-4": [
          {"udid": "CCC", "name": "iPhone 14", "state": "Shutdown"}
        ],
        "com.apple.CoreSimulator.SimRuntime.watchOS-10-2": [
          {"udid": "DDD", "name": "Apple Watch", "state": "Shutdown", "isAvailable": true}
        ]
      }
    }"#;

    #[test]
    fn test_parse_simctl_list() {
        let devices = parse_simctl_list(SIMCTL_JSON).unwrap();
        let ids: Vec<_> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["AAA", "CCC"]);
        assert_eq!(devices[0].system_image.as_deref(), Some("iOS 17.2"));
        assert!(devices.iter().all(|d| d.platform == Platform::Ios));
    }

    #[test]
    fn test_parse_simctl_list_invalid_json() {
        assert!(matches!(parse_simctl_list("not json"), Err(Error::Json(_))));
    }

    #[test]
    fn test_runtime_name() {
        assert_eq!(
            runtime_name("com.apple.CoreSimulator.SimRuntime.iOS-17-2").as_deref(),
            Some("iOS 17.2")
        );
        assert_eq!(runtime_name("something-else"), None);
    }

    #[cfg(unix)]
    fn fake_xcrun(dir: &Path) -> (PathBuf, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("calls.log");
        let script = dir.join("xcrun");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho \"$@\" >> {}\n", log.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_settings_and_install_commands() {
        let temp = tempfile::tempdir().unwrap();
        let (xcrun, log) = fake_xcrun(temp.path());
        let lock = DeviceLock::acquire(&temp.path().join("locks"), "AAA").unwrap();
        let core = DeviceCore::new(DeviceInfo::new("AAA", "iPhone 15", Platform::Ios), lock, None);
        let simulator = IosSimulator::new(core, xcrun);

        let settings = DeviceSettings {
            appearance: Appearance::Light,
            content_size: ContentSize::Large,
            location: Location {
                latitude: 1.5,
                longitude: 2.5,
                is_disabled: false,
            },
        };
        simulator.apply_settings(&settings).await.unwrap();

        let build = BuildResult::Ios {
            app_path: PathBuf::from("/tmp/Demo.app"),
            bundle_id: "org.demo".into(),
        };
        simulator.install(&build, true).await.unwrap();

        let calls = std::fs::read_to_string(&log).unwrap();
        let calls: Vec<_> = calls.lines().collect();
        assert_eq!(
            calls,
            vec![
                "simctl ui AAA appearance light",
                "simctl ui AAA content_size large",
                "simctl location AAA set 1.5,2.5",
                "simctl uninstall AAA org.demo",
                "simctl install AAA /tmp/Demo.app",
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reset_permissions_uses_privacy_service() {
        let temp = tempfile::tempdir().unwrap();
        let (xcrun, log) = fake_xcrun(temp.path());
        let lock = DeviceLock::acquire(&temp.path().join("locks"), "AAA").unwrap();
        let core = DeviceCore::new(DeviceInfo::new("AAA", "iPhone 15", Platform::Ios), lock, None);
        let simulator = IosSimulator::new(core, xcrun);

        let build = BuildResult::Ios {
            app_path: PathBuf::from("/tmp/Demo.app"),
            bundle_id: "org.demo".into(),
        };
        let restart = simulator
            .reset_app_permissions(&build, AppPermission::Location)
            .await
            .unwrap();

        assert!(restart);
        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(calls.trim(), "simctl privacy AAA reset location org.demo");
    }

    #[tokio::test]
    async fn test_android_build_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let lock = DeviceLock::acquire(temp.path(), "AAA").unwrap();
        let core = DeviceCore::new(DeviceInfo::new("AAA", "iPhone 15", Platform::Ios), lock, None);
        let simulator = IosSimulator::new(core, PathBuf::from("xcrun"));
        let build = BuildResult::Android {
            apk_path: PathBuf::from("app.apk"),
            package_name: "com.demo".into(),
        };
        assert!(matches!(
            simulator.install(&build, false).await,
            Err(Error::InstallFailed { .. })
        ));
    }
}
