//! Cache-aware native builds
//!
//! [`BuildManager::start_build`] either resolves a cached build or runs the
//! platform builder, returning a [`DisposableBuild`] that can be awaited and
//! cancelled. Cancelling kills the build tool.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use simdemon_core::fingerprint;
use simdemon_core::prelude::*;
use simdemon_core::{
    BuildResult, CancelToken, DeviceInfo, Fingerprint, FingerprintOptions, Platform,
};
use simdemon_daemon::{BuildRequest, NativeBuilder, OutputSink, ProgressSink};

use crate::build_cache::BuildCache;
use crate::config::BuildSettings;
use crate::throttle::Throttle;

/// Lines of build output kept for inspection
pub const BUILD_OUTPUT_LINES: usize = 2000;

const EXPO_GO_BUNDLE_ID: &str = "host.exp.Exponent";
const EXPO_GO_PACKAGE_NAME: &str = "host.exp.exponent";

pub type SuccessCallback = Arc<dyn Fn() + Send + Sync>;

/// How to run a build
#[derive(Clone, Default)]
pub struct BuildOptions {
    /// Ignore the cache and discard previous build products
    pub force_clean_build: bool,
    pub on_progress: Option<ProgressSink>,
    /// Called after a fresh build succeeded and was cached
    pub on_success: Option<SuccessCallback>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Disposable Build
// ─────────────────────────────────────────────────────────────────────────────

enum Outcome {
    Pending(JoinHandle<Result<BuildResult>>),
    Done(BuildResult),
    Failed(String),
}

/// A build in flight
pub struct DisposableBuild {
    platform: Platform,
    cancel: CancelToken,
    outcome: tokio::sync::Mutex<Outcome>,
}

impl DisposableBuild {
    fn spawn<F>(platform: Platform, cancel: CancelToken, future: F) -> Self
    where
        F: std::future::Future<Output = Result<BuildResult>> + Send + 'static,
    {
        Self {
            platform,
            cancel,
            outcome: tokio::sync::Mutex::new(Outcome::Pending(tokio::spawn(future))),
        }
    }

    /// Wait for the build.
    ///
    /// The first caller receives the original error; later callers get a
    /// summary of it.
    pub async fn result(&self) -> Result<BuildResult> {
        let mut outcome = self.outcome.lock().await;
        match &mut *outcome {
            Outcome::Done(result) => Ok(result.clone()),
            Outcome::Failed(message) => {
                if self.cancel.is_cancelled() {
                    Err(Error::BuildCancelled)
                } else {
                    Err(Error::build(self.platform, message.clone()))
                }
            }
            Outcome::Pending(handle) => {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) if e.is_cancelled() => Err(Error::BuildCancelled),
                    Err(e) => Err(Error::process(format!("build task failed: {e}"))),
                };
                *outcome = match &result {
                    Ok(build) => Outcome::Done(build.clone()),
                    Err(e) => Outcome::Failed(e.to_string()),
                };
                result
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel the build, killing the build tool if it is running. Idempotent.
    pub fn dispose(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Disposing {} build", self.platform);
        }
        self.cancel.cancel();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Build Manager
// ─────────────────────────────────────────────────────────────────────────────

pub struct BuildManager {
    workspace_root: PathBuf,
    cache: BuildCache,
    settings: BuildSettings,
    fingerprint_options: FingerprintOptions,
    builders: HashMap<Platform, Arc<dyn NativeBuilder>>,
    output: Arc<Mutex<VecDeque<String>>>,
}

impl BuildManager {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        cache: BuildCache,
        settings: BuildSettings,
        fingerprint_options: FingerprintOptions,
        builders: Vec<Arc<dyn NativeBuilder>>,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            cache,
            settings,
            fingerprint_options,
            builders: builders
                .into_iter()
                .map(|builder| (builder.platform(), builder))
                .collect(),
            output: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn cache(&self) -> &BuildCache {
        &self.cache
    }

    /// Build for `device`, reusing a valid cached build unless forced
    pub fn start_build(&self, device: &DeviceInfo, options: BuildOptions) -> DisposableBuild {
        let platform = device.platform;
        let cancel = CancelToken::new();

        if self.settings.use_expo_go {
            let result = self.expo_go_build(platform);
            info!("Using Expo Go for {}", platform);
            return DisposableBuild::spawn(platform, cancel, async move { Ok(result) });
        }

        let progress = options.on_progress.clone().map(|on_progress| {
            let throttle = Throttle::new(self.settings.progress_interval(), move |value: f64| {
                on_progress(value)
            });
            let stop = throttle.clone();
            cancel.on_cancel(move || stop.cancel());
            throttle
        });

        let job = BuildJob {
            workspace_root: self.workspace_root.clone(),
            cache: self.cache.clone(),
            fingerprint_options: self.fingerprint_options.clone(),
            builder: self.builders.get(&platform).cloned(),
            output: Arc::clone(&self.output),
            device: device.clone(),
            force_clean_build: options.force_clean_build,
            on_success: options.on_success,
            progress,
        };

        DisposableBuild::spawn(platform, cancel.clone(), job.run(cancel))
    }

    fn expo_go_build(&self, platform: Platform) -> BuildResult {
        let dir = self
            .settings
            .expo_go_dir
            .clone()
            .unwrap_or_else(|| simdemon_core::logging::data_directory().join("expo-go"));
        match platform {
            Platform::Ios => BuildResult::Ios {
                app_path: dir.join("Exponent.app"),
                bundle_id: EXPO_GO_BUNDLE_ID.to_string(),
            },
            Platform::Android => BuildResult::Android {
                apk_path: dir.join("Exponent.apk"),
                package_name: EXPO_GO_PACKAGE_NAME.to_string(),
            },
        }
    }

    /// Whether the native inputs changed since the cached build was made.
    ///
    /// Failures count as "no change".
    pub async fn did_fingerprint_change(&self, platform: Platform) -> bool {
        if self.settings.use_expo_go {
            return false;
        }

        let fresh = match compute_fingerprint(&self.workspace_root, &self.fingerprint_options).await
        {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!("Failed to fingerprint workspace: {}", e);
                return false;
            }
        };

        let changed = self.cache.cached_fingerprint(platform).as_ref() != Some(&fresh);
        debug!("{} fingerprint changed: {}", platform, changed);
        changed
    }

    /// Captured output of the most recent build
    pub fn build_output(&self) -> Vec<String> {
        self.output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

async fn compute_fingerprint(root: &Path, options: &FingerprintOptions) -> Result<Fingerprint> {
    let root = root.to_path_buf();
    let options = options.clone();
    tokio::task::spawn_blocking(move || fingerprint::compute_with(&root, &options))
        .await
        .map_err(|e| Error::process(format!("fingerprint task failed: {e}")))?
}

/// Everything a spawned build needs, detached from the manager
struct BuildJob {
    workspace_root: PathBuf,
    cache: BuildCache,
    fingerprint_options: FingerprintOptions,
    builder: Option<Arc<dyn NativeBuilder>>,
    output: Arc<Mutex<VecDeque<String>>>,
    device: DeviceInfo,
    force_clean_build: bool,
    on_success: Option<SuccessCallback>,
    progress: Option<Throttle<f64>>,
}

impl BuildJob {
    async fn run(self, cancel: CancelToken) -> Result<BuildResult> {
        let platform = self.device.platform;

        let fingerprint =
            match compute_fingerprint(&self.workspace_root, &self.fingerprint_options).await {
                Ok(fingerprint) => Some(fingerprint),
                Err(e) => {
                    warn!("Failed to fingerprint workspace, build will not be cached: {}", e);
                    None
                }
            };

        if self.force_clean_build {
            self.cache.invalidate(platform);
        } else if let Some(fingerprint) = fingerprint.clone() {
            let cache = self.cache.clone();
            let hit = tokio::task::spawn_blocking(move || cache.lookup(platform, &fingerprint))
                .await
                .unwrap_or_default();
            if let Some(result) = hit {
                return Ok(result);
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::BuildCancelled);
        }

        let builder = self
            .builder
            .ok_or_else(|| Error::build(platform, "no builder available for this platform"))?;

        self.output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        let output_sink = ring_sink(Arc::clone(&self.output));
        let progress_sink: ProgressSink = match self.progress {
            Some(throttle) => Arc::new(move |value| throttle.call(value)),
            None => Arc::new(|_| {}),
        };

        info!("Building {} app (clean: {})", platform, self.force_clean_build);
        let request = BuildRequest {
            workspace_root: self.workspace_root.clone(),
            device: self.device.clone(),
            clean: self.force_clean_build,
        };
        let result = builder
            .build(request, cancel.clone(), progress_sink, output_sink)
            .await?;

        if cancel.is_cancelled() {
            return Err(Error::BuildCancelled);
        }

        if let Some(fingerprint) = fingerprint {
            if let Err(e) = self.cache.store(platform, fingerprint, &result) {
                warn!("Failed to cache {} build: {}", platform, e);
            }
        }
        if let Some(on_success) = &self.on_success {
            on_success();
        }

        info!("{} build finished: {:?}", platform, result.artifact_path());
        Ok(result)
    }
}

fn ring_sink(output: Arc<Mutex<VecDeque<String>>>) -> OutputSink {
    Arc::new(move |line: &str| {
        trace!("build: {}", line);
        let mut output = output.lock().unwrap_or_else(|e| e.into_inner());
        if output.len() == BUILD_OUTPUT_LINES {
            output.pop_front();
        }
        output.push_back(line.to_string());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WorkspaceStore;
    use simdemon_daemon::test_utils::{test_emulator, write_test_artifact};
    use simdemon_daemon::MockNativeBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        workspace: TempDir,
        artifacts: TempDir,
        cache: BuildCache,
    }

    fn fixture() -> Fixture {
        let workspace = tempdir().unwrap();
        std::fs::write(workspace.path().join("package.json"), "{}").unwrap();
        std::fs::create_dir_all(workspace.path().join("android")).unwrap();
        std::fs::write(workspace.path().join("android/build.gradle"), "v1").unwrap();
        Fixture {
            workspace,
            artifacts: tempdir().unwrap(),
            cache: BuildCache::new(Arc::new(WorkspaceStore::in_memory())),
        }
    }

    fn manager(
        f: &Fixture,
        settings: BuildSettings,
        builder: impl NativeBuilder + 'static,
    ) -> BuildManager {
        BuildManager::new(
            f.workspace.path(),
            f.cache.clone(),
            settings,
            FingerprintOptions::default(),
            vec![Arc::new(builder) as Arc<dyn NativeBuilder>],
        )
    }

    fn android_mock(result: BuildResult, times: usize) -> MockNativeBuilder {
        let mut builder = MockNativeBuilder::new();
        builder.expect_platform().return_const(Platform::Android);
        builder
            .expect_build()
            .times(times)
            .returning(move |_, _, _, _| Ok(result.clone()));
        builder
    }

    fn android_mock_unused() -> MockNativeBuilder {
        let mut builder = MockNativeBuilder::new();
        builder.expect_platform().return_const(Platform::Android);
        builder.expect_build().never();
        builder
    }

    #[tokio::test]
    async fn test_miss_builds_and_caches() {
        let f = fixture();
        let artifact = write_test_artifact(f.artifacts.path(), Platform::Android, "v1");
        let manager = manager(&f, BuildSettings::default(), android_mock(artifact.clone(), 1));

        let successes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&successes);
        let options = BuildOptions {
            on_success: Some(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };

        let build = manager.start_build(&test_emulator("pixel"), options);
        assert_eq!(build.result().await.unwrap(), artifact);
        assert_eq!(successes.load(Ordering::SeqCst), 1);

        let fresh = fingerprint::compute(f.workspace.path()).unwrap();
        assert_eq!(f.cache.lookup(Platform::Android, &fresh), Some(artifact));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_builder() {
        let f = fixture();
        let artifact = write_test_artifact(f.artifacts.path(), Platform::Android, "v1");
        let fresh = fingerprint::compute(f.workspace.path()).unwrap();
        f.cache.store(Platform::Android, fresh, &artifact).unwrap();

        let manager = manager(&f, BuildSettings::default(), android_mock(artifact.clone(), 0));
        let build = manager.start_build(&test_emulator("pixel"), BuildOptions::default());
        assert_eq!(build.result().await.unwrap(), artifact);
        assert!(!manager.did_fingerprint_change(Platform::Android).await);
    }

    #[tokio::test]
    async fn test_forced_build_invalidates_and_cleans() {
        let f = fixture();
        let artifact = write_test_artifact(f.artifacts.path(), Platform::Android, "v1");
        let fresh = fingerprint::compute(f.workspace.path()).unwrap();
        f.cache.store(Platform::Android, fresh, &artifact).unwrap();

        let mut builder = MockNativeBuilder::new();
        builder.expect_platform().return_const(Platform::Android);
        let result = artifact.clone();
        builder
            .expect_build()
            .withf(|request, _, _, _| request.clean)
            .times(1)
            .returning(move |_, _, _, _| Ok(result.clone()));

        let manager = manager(&f, BuildSettings::default(), builder);
        let options = BuildOptions {
            force_clean_build: true,
            ..Default::default()
        };
        let build = manager.start_build(&test_emulator("pixel"), options);
        assert_eq!(build.result().await.unwrap(), artifact);
    }

    #[tokio::test]
    async fn test_failed_build_is_not_cached() {
        let f = fixture();
        let mut builder = MockNativeBuilder::new();
        builder.expect_platform().return_const(Platform::Android);
        builder
            .expect_build()
            .returning(|_, _, _, _| Err(Error::build(Platform::Android, "gradle exploded")));

        let manager = manager(&f, BuildSettings::default(), builder);
        let build = manager.start_build(&test_emulator("pixel"), BuildOptions::default());

        assert!(matches!(build.result().await, Err(Error::Build { .. })));
        // Later waiters see the same failure
        assert!(matches!(build.result().await, Err(Error::Build { .. })));
        assert_eq!(f.cache.cached_fingerprint(Platform::Android), None);
        assert!(manager.did_fingerprint_change(Platform::Android).await);
    }

    /// Blocks until cancelled, counting kills
    struct HangingBuilder {
        kills: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl NativeBuilder for HangingBuilder {
        fn platform(&self) -> Platform {
            Platform::Android
        }

        async fn build(
            &self,
            _request: BuildRequest,
            cancel: CancelToken,
            _progress: ProgressSink,
            _output: OutputSink,
        ) -> Result<BuildResult> {
            let kills = Arc::clone(&self.kills);
            cancel.on_cancel(move || {
                kills.fetch_add(1, Ordering::SeqCst);
            });
            cancel.cancelled().await;
            Err(Error::BuildCancelled)
        }
    }

    #[tokio::test]
    async fn test_dispose_kills_exactly_once() {
        let f = fixture();
        let kills = Arc::new(AtomicUsize::new(0));
        let manager = manager(
            &f,
            BuildSettings::default(),
            HangingBuilder {
                kills: Arc::clone(&kills),
            },
        );

        let build = manager.start_build(&test_emulator("pixel"), BuildOptions::default());
        // Let the job reach the builder
        tokio::time::sleep(Duration::from_millis(200)).await;

        build.dispose();
        build.dispose();
        assert!(build.is_disposed());
        assert!(matches!(build.result().await, Err(Error::BuildCancelled)));
        assert!(matches!(build.result().await, Err(Error::BuildCancelled)));
        assert_eq!(kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expo_go_bypasses_builder() {
        let f = fixture();
        let settings = BuildSettings {
            use_expo_go: true,
            expo_go_dir: Some(PathBuf::from("/opt/expo")),
            ..Default::default()
        };
        let manager = manager(&f, settings, android_mock_unused());

        let build = manager.start_build(&test_emulator("pixel"), BuildOptions::default());
        let result = build.result().await.unwrap();
        assert_eq!(result.app_id(), "host.exp.exponent");
        assert_eq!(result.artifact_path(), Path::new("/opt/expo/Exponent.apk"));
        assert!(!manager.did_fingerprint_change(Platform::Android).await);
    }

    #[tokio::test]
    async fn test_native_change_detected() {
        let f = fixture();
        let artifact = write_test_artifact(f.artifacts.path(), Platform::Android, "v1");
        let manager = manager(&f, BuildSettings::default(), android_mock(artifact, 1));

        let build = manager.start_build(&test_emulator("pixel"), BuildOptions::default());
        build.result().await.unwrap();
        assert!(!manager.did_fingerprint_change(Platform::Android).await);

        std::fs::write(f.workspace.path().join("android/build.gradle"), "v2").unwrap();
        assert!(manager.did_fingerprint_change(Platform::Android).await);
    }

    #[tokio::test]
    async fn test_progress_is_throttled_and_output_captured() {
        let f = fixture();
        let artifact = write_test_artifact(f.artifacts.path(), Platform::Android, "v1");

        let mut builder = MockNativeBuilder::new();
        builder.expect_platform().return_const(Platform::Android);
        let result = artifact.clone();
        builder
            .expect_build()
            .returning(move |_, _, progress: ProgressSink, output: OutputSink| {
                for i in 1..=10 {
                    progress(i as f64 / 10.0);
                }
                for i in 0..(BUILD_OUTPUT_LINES + 5) {
                    output(&format!("line {i}"));
                }
                Ok(result.clone())
            });

        let settings = BuildSettings {
            progress_interval_ms: 50,
            ..Default::default()
        };
        let manager = manager(&f, settings, builder);

        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        let options = BuildOptions {
            on_progress: Some(Arc::new(move |value| sink.lock().unwrap().push(value))),
            ..Default::default()
        };

        manager
            .start_build(&test_emulator("pixel"), options)
            .result()
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(*reported.lock().unwrap(), vec![0.1, 1.0]);

        let output = manager.build_output();
        assert_eq!(output.len(), BUILD_OUTPUT_LINES);
        assert_eq!(output.last().map(String::as_str), Some("line 2004"));
        assert_eq!(output.first().map(String::as_str), Some("line 5"));
    }
}
