//! Android builds through the Gradle wrapper

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use simdemon_core::prelude::*;
use simdemon_core::{BuildResult, CancelToken, Platform};

use super::{run_build_step, BuildRequest, NativeBuilder, OutputSink, ProgressSink, StepProgress};
use crate::process::ProcessSpec;

/// Rough number of Gradle tasks in a debug build of a React Native app
const EXPECTED_GRADLE_TASKS: usize = 350;

static APPLICATION_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"applicationId\s*(?:=\s*)?["']([^"']+)["']"#)
        .expect("Invalid applicationId regex")
});

static GRADLE_TASK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^> Task :").expect("Invalid gradle task regex"));

/// Gradle build configuration
#[derive(Debug, Clone)]
pub struct AndroidBuildConfig {
    /// Build variant, e.g. `debug`
    pub variant: String,
    /// Extra arguments passed to gradle
    pub extra_args: Vec<String>,
}

impl Default for AndroidBuildConfig {
    fn default() -> Self {
        Self {
            variant: "debug".to_string(),
            extra_args: Vec::new(),
        }
    }
}

/// Builds `.apk` files with `./gradlew assemble<Variant>`
#[derive(Debug, Clone, Default)]
pub struct GradleBuilder {
    config: AndroidBuildConfig,
}

impl GradleBuilder {
    pub fn new(config: AndroidBuildConfig) -> Self {
        Self { config }
    }

    fn gradle_spec(&self, android_dir: &Path, clean: bool) -> ProcessSpec {
        let wrapper = if cfg!(windows) {
            "gradlew.bat"
        } else {
            "./gradlew"
        };

        let mut spec = ProcessSpec::new(wrapper).current_dir(android_dir);
        if clean {
            spec = spec.arg("clean");
        }
        spec.arg(format!("assemble{}", capitalize(&self.config.variant)))
            .arg("--console=plain")
            .args(self.config.extra_args.iter().cloned())
    }

    /// Path where Gradle writes the app module's APK for this variant
    pub fn apk_path(&self, workspace_root: &Path) -> PathBuf {
        let variant = &self.config.variant;
        workspace_root
            .join("android/app/build/outputs/apk")
            .join(variant)
            .join(format!("app-{variant}.apk"))
    }
}

#[async_trait]
impl NativeBuilder for GradleBuilder {
    fn platform(&self) -> Platform {
        Platform::Android
    }

    async fn build(
        &self,
        request: BuildRequest,
        cancel: CancelToken,
        progress: ProgressSink,
        output: OutputSink,
    ) -> Result<BuildResult> {
        let android_dir = request.workspace_root.join("android");
        if !android_dir.is_dir() {
            return Err(Error::build(
                Platform::Android,
                format!("no android project at {}", android_dir.display()),
            ));
        }

        let package_name = read_package_name(&android_dir)?;
        let mut parser = StepProgress::new(GRADLE_TASK.clone(), EXPECTED_GRADLE_TASKS);
        let spec = self.gradle_spec(&android_dir, request.clean);

        run_build_step(
            &spec,
            Platform::Android,
            &cancel,
            Some(&mut parser),
            &progress,
            &output,
        )
        .await?;

        let apk_path = self.apk_path(&request.workspace_root);
        if !apk_path.is_file() {
            return Err(Error::build(
                Platform::Android,
                format!("build finished but {} is missing", apk_path.display()),
            ));
        }

        info!("Android build finished: {}", apk_path.display());
        Ok(BuildResult::Android {
            apk_path,
            package_name,
        })
    }
}

/// Read `applicationId` from the app module's Gradle script
pub fn read_package_name(android_dir: &Path) -> Result<String> {
    for script in ["app/build.gradle", "app/build.gradle.kts"] {
        let path = android_dir.join(script);
        if let Ok(content) = std::fs::read_to_string(&path) {
            if let Some(id) = parse_application_id(&content) {
                return Ok(id);
            }
        }
    }
    Err(Error::build(
        Platform::Android,
        "could not find applicationId in android/app/build.gradle",
    ))
}

fn parse_application_id(script: &str) -> Option<String> {
    APPLICATION_ID
        .captures(script)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_application_id_groovy_and_kts() {
        let groovy = "defaultConfig {\n    applicationId \"com.example.demo\"\n}";
        assert_eq!(
            parse_application_id(groovy).as_deref(),
            Some("com.example.demo")
        );
        let kts = "defaultConfig {\n    applicationId = 'com.example.kts'\n}";
        assert_eq!(parse_application_id(kts).as_deref(), Some("com.example.kts"));
        assert_eq!(parse_application_id("android {}"), None);
    }

    #[test]
    fn test_gradle_spec_arguments() {
        let builder = GradleBuilder::default();
        let spec = builder.gradle_spec(Path::new("/w/android"), true);
        assert_eq!(spec.args, vec!["clean", "assembleDebug", "--console=plain"]);
        assert_eq!(spec.cwd.as_deref(), Some(Path::new("/w/android")));

        let spec = builder.gradle_spec(Path::new("/w/android"), false);
        assert_eq!(spec.args[0], "assembleDebug");
    }

    #[test]
    fn test_apk_path_follows_variant() {
        let builder = GradleBuilder::new(AndroidBuildConfig {
            variant: "release".into(),
            extra_args: vec![],
        });
        assert_eq!(
            builder.apk_path(Path::new("/w")),
            PathBuf::from("/w/android/app/build/outputs/apk/release/app-release.apk")
        );
    }

    #[test]
    fn test_read_package_name_from_workspace() {
        let temp = tempfile::tempdir().unwrap();
        let app = temp.path().join("app");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(app.join("build.gradle"), "applicationId \"com.demo\"").unwrap();
        assert_eq!(read_package_name(temp.path()).unwrap(), "com.demo");
    }

    #[tokio::test]
    async fn test_build_without_android_dir_fails() {
        let temp = tempfile::tempdir().unwrap();
        let request = BuildRequest {
            workspace_root: temp.path().to_path_buf(),
            device: simdemon_core::DeviceInfo::new("emu", "Pixel", Platform::Android),
            clean: false,
        };
        let result = GradleBuilder::default()
            .build(
                request,
                CancelToken::new(),
                std::sync::Arc::new(|_| {}),
                std::sync::Arc::new(|_: &str| {}),
            )
            .await;
        assert!(matches!(result, Err(Error::Build { .. })));
    }
}
