//! Child process management
//!
//! Every long-running tool (native builds, bundler, preview server, emulator)
//! runs as a [`ManagedProcess`]. Short commands go through [`run`].

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Notify};

use simdemon_core::events::ProcessEvent;
use simdemon_core::prelude::*;

/// What to spawn and where
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// `program arg1 arg2 ...` for logging
    pub fn display(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }
}

/// Clonable handle that force-kills a [`ManagedProcess`].
///
/// Killing is idempotent: only the first call reaches the process.
#[derive(Clone)]
pub struct KillHandle {
    kill_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl KillHandle {
    /// Returns `true` if this call delivered the kill request
    pub fn kill(&self) -> bool {
        let sender = self
            .kill_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match sender {
            // The wait task may have already exited naturally.
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

/// Manages a child process.
///
/// The `Child` handle is moved into a dedicated `wait_for_exit` background task
/// that emits `ProcessEvent::Exited` with the real exit code. The process keeps
/// a kill channel, an atomic exit flag and a [`Notify`] for awaiting exit
/// without holding a lock across `.await`.
pub struct ManagedProcess {
    stdin_tx: mpsc::Sender<String>,
    pid: Option<u32>,
    killer: KillHandle,
    exited: Arc<AtomicBool>,
    exit_notify: Arc<Notify>,
}

impl ManagedProcess {
    /// Spawn `spec`, forwarding stdout/stderr lines and the exit to `event_tx`
    pub fn spawn(spec: &ProcessSpec, event_tx: mpsc::Sender<ProcessEvent>) -> Result<Self> {
        if let Some(cwd) = &spec.cwd {
            if !cwd.is_dir() {
                return Err(Error::NoWorkspace { path: cwd.clone() });
            }
        }

        info!("Spawning: {}", spec.display());

        let child = spec
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&spec.program, e))?;

        let pid = child.id();
        debug!("Process started with PID: {:?}", pid);

        Ok(Self::attach(child, event_tx))
    }

    fn attach(mut child: Child, event_tx: mpsc::Sender<ProcessEvent>) -> Self {
        let pid = child.id();

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(32);
        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(Self::stdin_writer(stdin, stdin_rx));
        }
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(Self::line_reader(stdout, event_tx.clone(), ProcessEvent::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(Self::line_reader(stderr, event_tx.clone(), ProcessEvent::Stderr));
        }

        let exited = Arc::new(AtomicBool::new(false));
        let exit_notify = Arc::new(Notify::new());
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(Self::wait_for_exit(
            child,
            kill_rx,
            event_tx,
            Arc::clone(&exited),
            Arc::clone(&exit_notify),
        ));

        Self {
            stdin_tx,
            pid,
            killer: KillHandle {
                kill_tx: Arc::new(Mutex::new(Some(kill_tx))),
            },
            exited,
            exit_notify,
        }
    }

    /// Background task: owns `child`, waits for it to exit, emits `ProcessEvent::Exited`.
    ///
    /// Ends either when the process exits on its own or when `kill_rx` fires,
    /// in which case the child is killed (SIGKILL) and then reaped.
    async fn wait_for_exit(
        mut child: Child,
        kill_rx: oneshot::Receiver<()>,
        event_tx: mpsc::Sender<ProcessEvent>,
        exited: Arc<AtomicBool>,
        exit_notify: Arc<Notify>,
    ) {
        let code: Option<i32> = tokio::select! {
            result = child.wait() => {
                match result {
                    Ok(status) => {
                        debug!("Process exited with status: {:?}", status);
                        status.code()
                    }
                    Err(e) => {
                        error!("Error waiting for process: {}", e);
                        None
                    }
                }
            }
            Ok(()) = kill_rx => {
                info!("Kill signal received, force-killing process");
                if let Err(e) = child.kill().await {
                    error!("Failed to kill process: {}", e);
                }
                match child.wait().await {
                    Ok(status) => status.code(),
                    Err(e) => {
                        error!("Error waiting after kill: {}", e);
                        None
                    }
                }
            }
        };

        // Flag before notifying so `has_exited()` is true for anyone woken.
        exited.store(true, Ordering::Release);
        exit_notify.notify_waiters();

        let _ = event_tx.send(ProcessEvent::Exited { code }).await;
    }

    async fn line_reader<R>(
        stream: R,
        tx: mpsc::Sender<ProcessEvent>,
        wrap: fn(String) -> ProcessEvent,
    ) where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(stream).lines();

        while let Ok(Some(line)) = reader.next_line().await {
            trace!("output: {}", line);
            if tx.send(wrap(line)).await.is_err() {
                debug!("output channel closed");
                break;
            }
        }
    }

    async fn stdin_writer(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<String>) {
        while let Some(line) = rx.recv().await {
            trace!("stdin: {}", line);

            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                error!("Failed to write to stdin: {}", e);
                break;
            }
            if let Err(e) = stdin.write_all(b"\n").await {
                error!("Failed to write newline: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                error!("Failed to flush stdin: {}", e);
                break;
            }
        }
    }

    /// Write one line to the process' stdin
    pub async fn send_line(&self, line: impl Into<String>) -> Result<()> {
        self.stdin_tx
            .send(line.into())
            .await
            .map_err(|_| Error::channel_send("stdin channel closed"))
    }

    /// Force kill the process. Safe to call repeatedly.
    pub fn kill(&self) {
        if self.killer.kill() {
            debug!("Kill requested for PID {:?}", self.pid);
        }
    }

    pub fn kill_handle(&self) -> KillHandle {
        self.killer.clone()
    }

    /// Wait until the process has exited
    pub async fn wait(&self) {
        // Create the future before checking so a notification can't slip between.
        let notified = self.exit_notify.notified();
        if self.has_exited() {
            return;
        }
        notified.await;
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        !self.has_exited()
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if !self.has_exited() {
            debug!("ManagedProcess dropped while running, killing");
            self.killer.kill();
        }
    }
}

fn spawn_error(program: &Path, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::tool_not_found(program.display().to_string())
    } else {
        Error::ProcessSpawn {
            reason: format!("{}: {}", program.display(), e),
        }
    }
}

/// Run a short command to completion and capture its output
pub async fn output(spec: &ProcessSpec) -> Result<Output> {
    debug!("Running: {}", spec.display());
    spec.command()
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| spawn_error(&spec.program, e))
}

/// Run a short command and return its stdout, failing on a non-zero exit
pub async fn run(spec: &ProcessSpec) -> Result<String> {
    let output = output(spec).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::process(format!(
            "`{}` failed ({}): {}",
            spec.display(),
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
