//! iOS simulator builds through xcodebuild

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use simdemon_core::prelude::*;
use simdemon_core::{BuildResult, CancelToken, Platform};

use super::{run_build_step, BuildRequest, NativeBuilder, OutputSink, ProgressSink, StepProgress};
use crate::process::{self, ProcessSpec};

/// Rough number of compile/link steps in a debug build with pods
const EXPECTED_XCODE_STEPS: usize = 1500;

static XCODE_STEP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(CompileC|CompileSwift|SwiftCompile|Ld|Libtool|CpResource|ProcessInfoPlistFile|CodeSign|PhaseScriptExecution) ")
        .expect("Invalid xcode step regex")
});

/// xcodebuild configuration
#[derive(Debug, Clone)]
pub struct IosBuildConfig {
    /// Scheme to build; defaults to the workspace/project name
    pub scheme: Option<String>,
    pub configuration: String,
    /// Run `pod install` when a Podfile exists and Pods are missing
    pub install_pods: bool,
    pub extra_args: Vec<String>,
}

impl Default for IosBuildConfig {
    fn default() -> Self {
        Self {
            scheme: None,
            configuration: "Debug".to_string(),
            install_pods: true,
            extra_args: Vec::new(),
        }
    }
}

/// Xcode container to build
#[derive(Debug, Clone, PartialEq)]
pub enum XcodeContainer {
    Workspace(PathBuf),
    Project(PathBuf),
}

impl XcodeContainer {
    /// Prefer a `.xcworkspace` (CocoaPods) over a bare `.xcodeproj`
    pub fn find(ios_dir: &Path) -> Option<Self> {
        let mut workspace = None;
        let mut project = None;
        for entry in std::fs::read_dir(ios_dir).ok()?.flatten() {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("xcworkspace") => workspace = Some(path),
                Some("xcodeproj") => project = Some(path),
                _ => {}
            }
        }
        workspace
            .map(XcodeContainer::Workspace)
            .or(project.map(XcodeContainer::Project))
    }

    fn args(&self) -> [String; 2] {
        match self {
            XcodeContainer::Workspace(path) => {
                ["-workspace".to_string(), path.display().to_string()]
            }
            XcodeContainer::Project(path) => ["-project".to_string(), path.display().to_string()],
        }
    }

    fn name(&self) -> Option<String> {
        let path = match self {
            XcodeContainer::Workspace(path) | XcodeContainer::Project(path) => path,
        };
        path.file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
    }
}

/// Builds simulator `.app` bundles with xcodebuild
#[derive(Debug, Clone, Default)]
pub struct XcodeBuilder {
    config: IosBuildConfig,
}

impl XcodeBuilder {
    pub fn new(config: IosBuildConfig) -> Self {
        Self { config }
    }

    fn base_spec(&self, container: &XcodeContainer, scheme: &str, ios_dir: &Path) -> ProcessSpec {
        ProcessSpec::new("xcodebuild")
            .current_dir(ios_dir)
            .args(container.args())
            .args([
                "-scheme",
                scheme,
                "-configuration",
                &self.config.configuration,
                "-sdk",
                "iphonesimulator",
                "-derivedDataPath",
                "build",
            ])
    }

    fn build_spec(
        &self,
        container: &XcodeContainer,
        scheme: &str,
        ios_dir: &Path,
        clean: bool,
    ) -> ProcessSpec {
        let mut spec = self.base_spec(container, scheme, ios_dir);
        if clean {
            spec = spec.arg("clean");
        }
        spec.arg("build")
            .args(self.config.extra_args.iter().cloned())
    }

    async fn install_pods(
        &self,
        ios_dir: &Path,
        clean: bool,
        cancel: &CancelToken,
        progress: &ProgressSink,
        output: &OutputSink,
    ) -> Result<()> {
        let needs_pods = ios_dir.join("Podfile").is_file()
            && (clean || !ios_dir.join("Pods").is_dir());
        if !self.config.install_pods || !needs_pods {
            return Ok(());
        }

        let spec = ProcessSpec::new("pod")
            .arg("install")
            .current_dir(ios_dir);
        run_build_step(&spec, Platform::Ios, cancel, None, progress, output).await
    }
}

#[async_trait]
impl NativeBuilder for XcodeBuilder {
    fn platform(&self) -> Platform {
        Platform::Ios
    }

    async fn build(
        &self,
        request: BuildRequest,
        cancel: CancelToken,
        progress: ProgressSink,
        output: OutputSink,
    ) -> Result<BuildResult> {
        let ios_dir = request.workspace_root.join("ios");
        let container = XcodeContainer::find(&ios_dir).ok_or_else(|| {
            Error::build(
                Platform::Ios,
                format!("no Xcode workspace or project in {}", ios_dir.display()),
            )
        })?;
        let scheme = self
            .config
            .scheme
            .clone()
            .or_else(|| container.name())
            .ok_or_else(|| Error::build(Platform::Ios, "could not determine Xcode scheme"))?;

        self.install_pods(&ios_dir, request.clean, &cancel, &progress, &output)
            .await?;

        let mut parser = StepProgress::new(XCODE_STEP.clone(), EXPECTED_XCODE_STEPS);
        let spec = self.build_spec(&container, &scheme, &ios_dir, request.clean);
        run_build_step(
            &spec,
            Platform::Ios,
            &cancel,
            Some(&mut parser),
            &progress,
            &output,
        )
        .await?;

        if cancel.is_cancelled() {
            return Err(Error::BuildCancelled);
        }

        let settings_spec = self
            .base_spec(&container, &scheme, &ios_dir)
            .arg("-showBuildSettings");
        let settings = parse_build_settings(&process::run(&settings_spec).await?);
        let result = build_result_from_settings(&settings)?;

        info!("iOS build finished: {}", result.artifact_path().display());
        Ok(result)
    }
}

/// Parse `KEY = value` lines printed by `xcodebuild -showBuildSettings`
pub fn parse_build_settings(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.trim().split_once(" = "))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

fn build_result_from_settings(settings: &HashMap<String, String>) -> Result<BuildResult> {
    let get = |key: &str| {
        settings
            .get(key)
            .cloned()
            .ok_or_else(|| Error::build(Platform::Ios, format!("build settings missing {key}")))
    };

    let app_path = PathBuf::from(get("TARGET_BUILD_DIR")?).join(get("FULL_PRODUCT_NAME")?);
    if !app_path.exists() {
        return Err(Error::build(
            Platform::Ios,
            format!("build finished but {} is missing", app_path.display()),
        ));
    }

    Ok(BuildResult::Ios {
        app_path,
        bundle_id: get("PRODUCT_BUNDLE_IDENTIFIER")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: &str = r#"
Build settings for action build and target Demo:
    FULL_PRODUCT_NAME = Demo.app
    PRODUCT_BUNDLE_IDENTIFIER = org.example.demo
    TARGET_BUILD_DIR = /tmp/build/Products/Debug-iphonesimulator
"#;

    #[test]
    fn test_parse_build_settings() {
        let settings = parse_build_settings(SETTINGS);
        assert_eq!(settings["FULL_PRODUCT_NAME"], "Demo.app");
        assert_eq!(settings["PRODUCT_BUNDLE_IDENTIFIER"], "org.example.demo");
        assert!(!settings.contains_key("Build settings for action build and target Demo:"));
    }

    #[test]
    fn test_build_result_requires_existing_app() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("Demo.app")).unwrap();

        let mut settings = parse_build_settings(SETTINGS);
        settings.insert(
            "TARGET_BUILD_DIR".into(),
            temp.path().display().to_string(),
        );
        let result = build_result_from_settings(&settings).unwrap();
        assert_eq!(result.app_id(), "org.example.demo");
        assert_eq!(result.artifact_path(), temp.path().join("Demo.app"));

        settings.insert("FULL_PRODUCT_NAME".into(), "Missing.app".into());
        assert!(build_result_from_settings(&settings).is_err());
    }

    #[test]
    fn test_container_prefers_workspace() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("Demo.xcodeproj")).unwrap();
        assert_eq!(
            XcodeContainer::find(temp.path()),
            Some(XcodeContainer::Project(temp.path().join("Demo.xcodeproj")))
        );

        std::fs::create_dir_all(temp.path().join("Demo.xcworkspace")).unwrap();
        let container = XcodeContainer::find(temp.path()).unwrap();
        assert_eq!(
            container,
            XcodeContainer::Workspace(temp.path().join("Demo.xcworkspace"))
        );
        assert_eq!(container.name().as_deref(), Some("Demo"));
    }

    #[test]
    fn test_build_spec_arguments() {
        let builder = XcodeBuilder::default();
        let container = XcodeContainer::Workspace(PathBuf::from("/w/ios/Demo.xcworkspace"));
        let spec = builder.build_spec(&container, "Demo", Path::new("/w/ios"), true);
        assert_eq!(spec.program, PathBuf::from("xcodebuild"));
        assert_eq!(&spec.args[..2], ["-workspace", "/w/ios/Demo.xcworkspace"]);
        assert!(spec.args.ends_with(&["clean".to_string(), "build".to_string()]));
        assert!(spec.args.contains(&"iphonesimulator".to_string()));
    }

    #[test]
    fn test_xcode_step_pattern() {
        assert!(XCODE_STEP.is_match("CompileC /tmp/a.o a.m normal arm64"));
        assert!(XCODE_STEP.is_match("Ld /tmp/Demo.app/Demo normal"));
        assert!(!XCODE_STEP.is_match("note: Using new build system"));
    }
}
