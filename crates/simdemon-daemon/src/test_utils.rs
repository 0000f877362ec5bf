//! Test helpers for daemon types
//!
//! Mocks for [`NativeBuilder`](crate::build::NativeBuilder) and
//! [`Bundler`](crate::bundler::Bundler) are generated by `mockall` behind the
//! `test-helpers` feature as `MockNativeBuilder` and `MockBundler`.

use std::path::Path;

use simdemon_core::{BuildResult, DeviceInfo, Platform};

/// An iOS simulator device
pub fn test_simulator(id: &str) -> DeviceInfo {
    DeviceInfo {
        system_image: Some("iOS 17.2".to_string()),
        ..DeviceInfo::new(id, format!("iPhone {id}"), Platform::Ios)
    }
}

/// An Android emulator device
pub fn test_emulator(id: &str) -> DeviceInfo {
    DeviceInfo {
        system_image: Some("API 34".to_string()),
        ..DeviceInfo::new(id, format!("Pixel {id}"), Platform::Android)
    }
}

/// Write a fake artifact under `dir` and describe it as a build result.
///
/// iOS artifacts are `.app` directories, Android artifacts are `.apk` files.
pub fn write_test_artifact(dir: &Path, platform: Platform, content: &str) -> BuildResult {
    match platform {
        Platform::Ios => {
            let app_path = dir.join("Demo.app");
            std::fs::create_dir_all(&app_path).expect("create .app");
            std::fs::write(app_path.join("Demo"), content).expect("write binary");
            BuildResult::Ios {
                app_path,
                bundle_id: "org.example.demo".to_string(),
            }
        }
        Platform::Android => {
            let apk_path = dir.join("app-debug.apk");
            std::fs::write(&apk_path, content).expect("write apk");
            BuildResult::Android {
                apk_path,
                package_name: "org.example.demo".to_string(),
            }
        }
    }
}
