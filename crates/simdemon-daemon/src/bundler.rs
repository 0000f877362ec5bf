//! JavaScript bundler (Metro)
//!
//! The bundler runs as a [`ManagedProcess`]. Its output is classified into
//! [`BundlerEvent`]s which are broadcast to subscribers. Reloads and debugger
//! target discovery go through Metro's HTTP endpoints.

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, watch};

use simdemon_core::events::{BundlerEvent, ProcessEvent};
use simdemon_core::prelude::*;

use crate::dependencies::Prerequisite;
use crate::process::{ManagedProcess, ProcessSpec};

/// Default Metro port
pub const DEFAULT_BUNDLER_PORT: u16 = 8081;

const TARGET_POLL_INTERVAL: Duration = Duration::from_secs(1);

const EVENT_CHANNEL_CAPACITY: usize = 256;

static READY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Welcome to Metro|Metro waiting on|Dev server ready|Logs for your project will appear")
        .expect("Invalid ready regex")
});

static PROGRESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"BUNDLE\b.*?(\d+(?:\.\d+)?)%").expect("Invalid progress regex")
});

static BUNDLE_ERROR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*error\b[:\s]*(.*)$").expect("Invalid error regex"));

static INCREMENTAL_ERROR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Unable to resolve module (\S+)|SyntaxError: (\S+?):").expect("Invalid module regex")
});

static TARGET_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)-(-?\d+)$").expect("Invalid target id regex"));

/// The JS bundler serving the app
#[cfg_attr(feature = "test-helpers", mockall::automock)]
#[async_trait]
pub trait Bundler: Send + Sync {
    /// Await every prerequisite, then start serving. `clean` drops the
    /// transform cache.
    async fn start(&self, clean: bool, prerequisites: Vec<Prerequisite>) -> Result<()>;

    /// Resolve once the bundler accepts requests
    async fn ready(&self) -> Result<()>;

    /// Ask every connected app to reload its bundle
    async fn reload(&self) -> Result<()>;

    /// WebSocket URL of the JS debugger target, polled until `timeout`
    async fn debugger_target_url(&self, timeout: Duration) -> Option<String>;

    fn port(&self) -> u16;

    fn subscribe(&self) -> broadcast::Receiver<BundlerEvent>;

    async fn stop(&self);
}

/// Classify one line of bundler output
pub fn classify_line(line: &str, initial_bundle_done: bool) -> Option<BundlerEvent> {
    if READY_PATTERN.is_match(line) {
        return Some(BundlerEvent::Ready);
    }

    if let Some(caps) = PROGRESS_PATTERN.captures(line) {
        let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
        return Some(BundlerEvent::Progress((percent / 100.0).clamp(0.0, 1.0)));
    }

    if let Some(caps) = INCREMENTAL_ERROR_PATTERN.captures(line) {
        let module = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().to_string());
        let message = line.trim().to_string();
        return Some(if initial_bundle_done {
            BundlerEvent::IncrementalBundleError { message, module }
        } else {
            BundlerEvent::BundleError { message }
        });
    }

    BUNDLE_ERROR_PATTERN
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| BundlerEvent::BundleError {
            message: m.as_str().trim().to_string(),
        })
}

/// Entry of Metro's `/json/list`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebuggerTarget {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub web_socket_debugger_url: String,
}

/// Pick the page of the most recently connected device.
///
/// Target ids are `<device>-<page>`; page `-1` is the device's JS runtime.
pub fn select_debugger_target(targets: &[DebuggerTarget]) -> Option<&DebuggerTarget> {
    targets
        .iter()
        .filter_map(|target| {
            let caps = TARGET_ID_PATTERN.captures(&target.id)?;
            let device: u64 = caps.get(1)?.as_str().parse().ok()?;
            let page: i64 = caps.get(2)?.as_str().parse().ok()?;
            (page == -1).then_some((device, target))
        })
        .max_by_key(|(device, _)| *device)
        .map(|(_, target)| target)
}

// ─────────────────────────────────────────────────────────────────────────────
// Metro
// ─────────────────────────────────────────────────────────────────────────────

/// How to start the bundler
#[derive(Debug, Clone)]
pub struct BundlerConfig {
    pub workspace_root: PathBuf,
    pub command: String,
    pub args: Vec<String>,
    /// 0 picks a free port
    pub port: u16,
}

impl BundlerConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            command: "npx".to_string(),
            args: vec!["react-native".to_string(), "start".to_string()],
            port: DEFAULT_BUNDLER_PORT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BundlerStatus {
    Stopped,
    Starting,
    Ready,
    Exited,
}

/// Metro started as a child process
pub struct MetroBundler {
    config: BundlerConfig,
    port: u16,
    client: reqwest::Client,
    events: broadcast::Sender<BundlerEvent>,
    status: watch::Sender<BundlerStatus>,
    process: Mutex<Option<ManagedProcess>>,
}

impl MetroBundler {
    pub fn new(config: BundlerConfig) -> Result<Self> {
        let port = match config.port {
            0 => free_port()?,
            port => port,
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status, _) = watch::channel(BundlerStatus::Stopped);

        Ok(Self {
            config,
            port,
            client: reqwest::Client::new(),
            events,
            status,
            process: Mutex::new(None),
        })
    }

    fn spec(&self, clean: bool) -> ProcessSpec {
        let mut spec = ProcessSpec::new(&self.config.command)
            .args(self.config.args.iter().cloned())
            .arg("--port")
            .arg(self.port.to_string())
            .current_dir(&self.config.workspace_root)
            .env("RCT_METRO_PORT", self.port.to_string());
        if clean {
            spec = spec.arg("--reset-cache");
        }
        spec
    }

    fn is_running(&self) -> bool {
        self.process
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|p| p.is_running())
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    async fn fetch_targets(&self) -> Result<Vec<DebuggerTarget>> {
        let response = self
            .client
            .get(self.url("/json/list"))
            .send()
            .await
            .map_err(|e| Error::bundler(format!("target list request failed: {e}")))?;
        response
            .json()
            .await
            .map_err(|e| Error::bundler(format!("invalid target list: {e}")))
    }

    async fn pump_output(
        mut rx: mpsc::Receiver<ProcessEvent>,
        events: broadcast::Sender<BundlerEvent>,
        status: watch::Sender<BundlerStatus>,
    ) {
        let mut initial_bundle_done = false;

        while let Some(event) = rx.recv().await {
            let line = match event {
                ProcessEvent::Stdout(line) | ProcessEvent::Stderr(line) => line,
                ProcessEvent::Exited { code } => {
                    warn!("Bundler exited with {:?}", code);
                    status.send_replace(BundlerStatus::Exited);
                    break;
                }
            };

            debug!("bundler: {}", line);
            let Some(event) = classify_line(&line, initial_bundle_done) else {
                continue;
            };

            match &event {
                BundlerEvent::Ready => {
                    info!("Bundler ready");
                    status.send_replace(BundlerStatus::Ready);
                }
                BundlerEvent::Progress(p) if *p >= 1.0 => initial_bundle_done = true,
                BundlerEvent::BundleError { message } => warn!("Bundle error: {}", message),
                _ => {}
            }
            // No subscribers is fine
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl Bundler for MetroBundler {
    async fn start(&self, clean: bool, prerequisites: Vec<Prerequisite>) -> Result<()> {
        if self.is_running() {
            debug!("Bundler already running on port {}", self.port);
            return Ok(());
        }

        self.status.send_replace(BundlerStatus::Starting);
        if let Err(e) = try_join_all(prerequisites).await {
            self.status.send_replace(BundlerStatus::Exited);
            return Err(e);
        }

        let mut process = self.process.lock().unwrap_or_else(|e| e.into_inner());
        if process.as_ref().is_some_and(|p| p.is_running()) {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel::<ProcessEvent>(EVENT_CHANNEL_CAPACITY);
        let child = match ManagedProcess::spawn(&self.spec(clean), tx) {
            Ok(child) => child,
            Err(e) => {
                self.status.send_replace(BundlerStatus::Exited);
                return Err(Error::bundler(format!("failed to start bundler: {e}")));
            }
        };

        tokio::spawn(Self::pump_output(
            rx,
            self.events.clone(),
            self.status.clone(),
        ));
        *process = Some(child);
        info!("Bundler starting on port {}", self.port);
        Ok(())
    }

    async fn ready(&self) -> Result<()> {
        let mut rx = self.status.subscribe();
        let status = rx
            .wait_for(|status| matches!(status, BundlerStatus::Ready | BundlerStatus::Exited))
            .await
            .map(|status| *status)
            .map_err(|_| Error::ChannelClosed)?;

        match status {
            BundlerStatus::Ready => Ok(()),
            _ => Err(Error::bundler("bundler exited before becoming ready")),
        }
    }

    async fn reload(&self) -> Result<()> {
        debug!("Reloading bundle");
        self.client
            .post(self.url("/reload"))
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| Error::bundler(format!("reload failed: {e}")))?;
        Ok(())
    }

    async fn debugger_target_url(&self, timeout: Duration) -> Option<String> {
        let poll = async {
            loop {
                match self.fetch_targets().await {
                    Ok(targets) => {
                        if let Some(target) = select_debugger_target(&targets) {
                            return target.web_socket_debugger_url.clone();
                        }
                        trace!("No debugger target yet among {} targets", targets.len());
                    }
                    Err(e) => trace!("{}", e),
                }
                tokio::time::sleep(TARGET_POLL_INTERVAL).await;
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(url) => Some(url),
            Err(_) => {
                warn!("No debugger target after {:?}", timeout);
                None
            }
        }
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn subscribe(&self) -> broadcast::Receiver<BundlerEvent> {
        self.events.subscribe()
    }

    async fn stop(&self) {
        let process = self.process.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(process) = process {
            info!("Stopping bundler");
            process.kill();
        }
        self.status.send_replace(BundlerStatus::Stopped);
    }
}

fn free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn target(id: &str, url: &str) -> DebuggerTarget {
        DebuggerTarget {
            id: id.to_string(),
            title: None,
            web_socket_debugger_url: url.to_string(),
        }
    }

    /// Minimal HTTP server answering every request with `body`
    async fn serve(body: &'static str) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    fn sh_bundler(script: &str, port: u16) -> MetroBundler {
        let temp = std::env::temp_dir();
        MetroBundler::new(BundlerConfig {
            workspace_root: temp,
            command: "sh".into(),
            args: vec!["-c".into(), script.into(), "metro".into()],
            port,
        })
        .unwrap()
    }

    #[test]
    fn test_classify_ready_and_progress() {
        assert_eq!(
            classify_line("                Welcome to Metro v0.80", false),
            Some(BundlerEvent::Ready)
        );
        assert_eq!(
            classify_line("BUNDLE  ./index.js ▓▓▓▓▓░░░░ 50.0% (120/240)", false),
            Some(BundlerEvent::Progress(0.5))
        );
        assert_eq!(classify_line("info Reloading app...", false), None);
    }

    #[test]
    fn test_classify_errors_by_phase() {
        let line = "error: Unable to resolve module ./Missing from App.tsx";
        assert_eq!(
            classify_line(line, true),
            Some(BundlerEvent::IncrementalBundleError {
                message: line.to_string(),
                module: Some("./Missing".to_string()),
            })
        );
        assert!(matches!(
            classify_line(line, false),
            Some(BundlerEvent::BundleError { .. })
        ));
        assert_eq!(
            classify_line("error Failed to construct transformer", false),
            Some(BundlerEvent::BundleError {
                message: "Failed to construct transformer".to_string()
            })
        );
    }

    #[test]
    fn test_select_debugger_target_prefers_newest_device() {
        let targets = vec![
            target("0-1", "ws://a"),
            target("0--1", "ws://device0"),
            target("2--1", "ws://device2"),
            target("2-3", "ws://page"),
            target("garbage", "ws://x"),
        ];
        assert_eq!(
            select_debugger_target(&targets).map(|t| t.web_socket_debugger_url.as_str()),
            Some("ws://device2")
        );
        assert!(select_debugger_target(&[target("1-0", "ws://p")]).is_none());
    }

    #[tokio::test]
    async fn test_ready_after_welcome_line() {
        let bundler = sh_bundler("echo 'Welcome to Metro'; sleep 30", 0);
        let mut events = bundler.subscribe();
        bundler.start(false, Vec::new()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), bundler.ready())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), BundlerEvent::Ready);
        bundler.stop().await;
    }

    #[tokio::test]
    async fn test_ready_fails_when_bundler_exits() {
        let bundler = sh_bundler("echo starting; exit 1", 0);
        bundler.start(false, Vec::new()).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), bundler.ready())
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::Bundler { .. })));
    }

    #[tokio::test]
    async fn test_prerequisites_run_before_spawn() {
        let temp = tempfile::tempdir().unwrap();
        let marker = temp.path().join("installed");
        let script = format!(
            "[ -f {} ] && echo 'Welcome to Metro'; sleep 30",
            marker.display()
        );
        let bundler = sh_bundler(&script, 0);

        let write = marker.clone();
        let install: Prerequisite = Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(write, "ok")?;
            Ok(())
        });
        bundler.start(false, vec![install]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), bundler.ready())
            .await
            .unwrap()
            .unwrap();
        bundler.stop().await;
    }

    #[tokio::test]
    async fn test_failed_prerequisite_keeps_bundler_down() {
        let bundler = sh_bundler("echo 'Welcome to Metro'; sleep 30", 0);
        let install: Prerequisite =
            Box::pin(async { Err(Error::bundler("installing node modules failed")) });

        let result = bundler.start(false, vec![install]).await;

        assert!(matches!(result, Err(Error::Bundler { .. })));
        assert!(!bundler.is_running());
        let ready = tokio::time::timeout(Duration::from_secs(5), bundler.ready())
            .await
            .unwrap();
        assert!(ready.is_err());
    }

    #[tokio::test]
    async fn test_spec_passes_port_and_reset_cache() {
        let bundler = MetroBundler::new(BundlerConfig::new("/w")).unwrap();
        let spec = bundler.spec(true);
        assert_eq!(spec.program, PathBuf::from("npx"));
        assert_eq!(
            spec.args,
            vec!["react-native", "start", "--port", "8081", "--reset-cache"]
        );
        assert_eq!(bundler.port(), DEFAULT_BUNDLER_PORT);
    }

    #[tokio::test]
    async fn test_debugger_target_url_from_target_list() {
        let port = serve(
            r#"[{"id":"1--1","title":"Hermes","webSocketDebuggerUrl":"ws://127.0.0.1/inspector/debug?device=1&page=-1"}]"#,
        )
        .await;
        let bundler = sh_bundler("true", port);

        let url = bundler.debugger_target_url(Duration::from_secs(5)).await;
        assert_eq!(
            url.as_deref(),
            Some("ws://127.0.0.1/inspector/debug?device=1&page=-1")
        );
    }

    #[tokio::test]
    async fn test_debugger_target_url_times_out() {
        let port = serve("[]").await;
        let bundler = sh_bundler("true", port);
        let url = bundler
            .debugger_target_url(Duration::from_millis(300))
            .await;
        assert_eq!(url, None);
    }

    #[tokio::test]
    async fn test_reload_posts_to_bundler() {
        let port = serve("OK").await;
        let bundler = sh_bundler("true", port);
        bundler.reload().await.unwrap();
    }
}
