//! Native platform builds
//!
//! A [`NativeBuilder`] turns a workspace into an installable [`BuildResult`].
//! Builds run as [`ManagedProcess`]es bound to a [`CancelToken`]; cancelling
//! the token force-kills the build tool.

pub mod android;
pub mod ios;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::mpsc;

use simdemon_core::events::ProcessEvent;
use simdemon_core::prelude::*;
use simdemon_core::{BuildResult, CancelToken, DeviceInfo, Platform};

use crate::process::{ManagedProcess, ProcessSpec};

pub use android::{AndroidBuildConfig, GradleBuilder};
pub use ios::{IosBuildConfig, XcodeBuilder};

/// Receives build progress in `0.0..=1.0`
pub type ProgressSink = Arc<dyn Fn(f64) + Send + Sync>;

/// Receives every line of build output
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Number of trailing output lines attached to a build error
const ERROR_TAIL_LINES: usize = 20;

/// A single native build
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub workspace_root: PathBuf,
    pub device: DeviceInfo,
    /// Discard previous build products first
    pub clean: bool,
}

/// Produces installable artifacts for one platform
#[cfg_attr(feature = "test-helpers", mockall::automock)]
#[async_trait]
pub trait NativeBuilder: Send + Sync {
    fn platform(&self) -> Platform;

    /// Run the build until it succeeds, fails, or `cancel` fires.
    ///
    /// A cancelled build resolves to [`Error::BuildCancelled`].
    async fn build(
        &self,
        request: BuildRequest,
        cancel: CancelToken,
        progress: ProgressSink,
        output: OutputSink,
    ) -> Result<BuildResult>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Progress Estimation
// ─────────────────────────────────────────────────────────────────────────────

static PERCENT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3})%").expect("Invalid percent regex"));

/// Estimates progress by counting build steps against an expected total.
///
/// Explicit `NN%` markers in the output take precedence over the estimate.
/// The estimate never reaches 1.0 before the tool exits.
#[derive(Debug)]
pub struct StepProgress {
    step: Regex,
    expected_steps: usize,
    seen: usize,
    last: f64,
}

impl StepProgress {
    pub fn new(step: Regex, expected_steps: usize) -> Self {
        Self {
            step,
            expected_steps: expected_steps.max(1),
            seen: 0,
            last: 0.0,
        }
    }

    /// Feed one output line, returning the new progress when it advanced
    pub fn feed(&mut self, line: &str) -> Option<f64> {
        let candidate = match PERCENT_PATTERN.captures(line) {
            Some(caps) => caps
                .get(1)
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .map(|pct| (pct / 100.0).min(0.99)),
            None if self.step.is_match(line) => {
                self.seen += 1;
                Some((self.seen as f64 / self.expected_steps as f64).min(0.99))
            }
            None => None,
        }?;

        if candidate > self.last {
            self.last = candidate;
            Some(candidate)
        } else {
            None
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Build Process Driver
// ─────────────────────────────────────────────────────────────────────────────

/// Run one build tool invocation to completion.
///
/// Output lines go to `output` and through `parser` to `progress`. The process
/// is killed as soon as `cancel` fires.
pub async fn run_build_step(
    spec: &ProcessSpec,
    platform: Platform,
    cancel: &CancelToken,
    mut parser: Option<&mut StepProgress>,
    progress: &ProgressSink,
    output: &OutputSink,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::BuildCancelled);
    }

    output(&format!("$ {}", spec.display()));

    let (tx, mut rx) = mpsc::channel::<ProcessEvent>(256);
    let process = ManagedProcess::spawn(spec, tx)?;
    let killer = process.kill_handle();
    cancel.on_cancel(move || {
        killer.kill();
    });

    let mut tail: VecDeque<String> = VecDeque::with_capacity(ERROR_TAIL_LINES);
    let code = loop {
        match rx.recv().await {
            Some(ProcessEvent::Stdout(line)) | Some(ProcessEvent::Stderr(line)) => {
                output(&line);
                if let Some(parser) = parser.as_deref_mut() {
                    if let Some(value) = parser.feed(&line) {
                        progress(value);
                    }
                }
                if tail.len() == ERROR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Some(ProcessEvent::Exited { code }) => break code,
            None => break None,
        }
    };

    if cancel.is_cancelled() {
        info!("{} build step cancelled: {}", platform, spec.display());
        return Err(Error::BuildCancelled);
    }

    match code {
        Some(0) => Ok(()),
        code => {
            let tail: Vec<String> = tail.into_iter().collect();
            Err(Error::build(
                platform,
                format!(
                    "`{}` exited with {:?}\n{}",
                    spec.display(),
                    code,
                    tail.join("\n")
                ),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn sinks() -> (ProgressSink, OutputSink, Arc<Mutex<Vec<f64>>>, Arc<Mutex<Vec<String>>>) {
        let progress_values = Arc::new(Mutex::new(Vec::new()));
        let lines = Arc::new(Mutex::new(Vec::new()));
        let p = Arc::clone(&progress_values);
        let l = Arc::clone(&lines);
        (
            Arc::new(move |v| p.lock().unwrap().push(v)),
            Arc::new(move |line: &str| l.lock().unwrap().push(line.to_string())),
            progress_values,
            lines,
        )
    }

    #[test]
    fn test_step_progress_counts_steps() {
        let mut parser = StepProgress::new(Regex::new(r"^> Task ").unwrap(), 4);
        assert_eq!(parser.feed("> Task :app:preBuild"), Some(0.25));
        assert_eq!(parser.feed("unrelated"), None);
        assert_eq!(parser.feed("> Task :app:compile"), Some(0.5));
    }

    #[test]
    fn test_step_progress_is_monotonic_and_capped() {
        let mut parser = StepProgress::new(Regex::new(r"^step").unwrap(), 1);
        assert_eq!(parser.feed("step"), Some(0.99));
        assert_eq!(parser.feed("step"), None);
        assert_eq!(parser.feed("40% EXECUTING"), None);
    }

    #[test]
    fn test_step_progress_prefers_percent_markers() {
        let mut parser = StepProgress::new(Regex::new(r"^step").unwrap(), 100);
        assert_eq!(parser.feed("<====---> 40% EXECUTING"), Some(0.4));
        assert_eq!(parser.feed("step"), None);
    }

    #[tokio::test]
    async fn test_run_build_step_success_and_output() {
        let (progress, output, values, lines) = sinks();
        let mut parser = StepProgress::new(Regex::new(r"^step").unwrap(), 2);
        let spec = ProcessSpec::new("sh").args(["-c", "echo step; echo step"]);

        run_build_step(
            &spec,
            Platform::Android,
            &CancelToken::new(),
            Some(&mut parser),
            &progress,
            &output,
        )
        .await
        .unwrap();

        assert_eq!(*values.lock().unwrap(), vec![0.5, 0.99]);
        assert!(lines.lock().unwrap().iter().any(|l| l.starts_with("$ sh")));
    }

    #[tokio::test]
    async fn test_run_build_step_failure_carries_tail() {
        let (progress, output, _, _) = sinks();
        let spec = ProcessSpec::new("sh").args(["-c", "echo 'error: missing symbol'; exit 65"]);
        let err = run_build_step(
            &spec,
            Platform::Ios,
            &CancelToken::new(),
            None,
            &progress,
            &output,
        )
        .await
        .unwrap_err();

        match err {
            Error::Build { platform, message } => {
                assert_eq!(platform, Platform::Ios);
                assert!(message.contains("missing symbol"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_build_step_cancel_kills_process() {
        let (progress, output, _, _) = sinks();
        let cancel = CancelToken::new();
        let spec = ProcessSpec::new("sh").args(["-c", "sleep 60"]);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_build_step(&spec, Platform::Android, &cancel, None, &progress, &output),
        )
        .await
        .expect("cancelled build finishes promptly");
        assert!(matches!(result, Err(Error::BuildCancelled)));
    }

    #[tokio::test]
    async fn test_run_build_step_already_cancelled() {
        let (progress, output, _, lines) = sinks();
        let cancel = CancelToken::new();
        cancel.cancel();
        let spec = ProcessSpec::new("sh").args(["-c", "echo never"]);
        let result = run_build_step(&spec, Platform::Android, &cancel, None, &progress, &output).await;
        assert!(matches!(result, Err(Error::BuildCancelled)));
        assert!(lines.lock().unwrap().is_empty());
    }
}
