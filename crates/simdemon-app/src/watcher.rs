//! Native-change watcher
//!
//! Watches the native project directories and root manifests and reports
//! batches of changed paths that can require a native rebuild. JS-only edits
//! never reach the callback.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use tokio::sync::oneshot;

use simdemon_core::fingerprint::{is_native_input, NATIVE_DIRS};
use simdemon_core::prelude::*;

/// Default debounce duration in milliseconds
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

type ChangeCallback = Arc<dyn Fn(Vec<PathBuf>) + Send + Sync>;

/// Watches a workspace for native build input changes
pub struct NativeWatcher {
    workspace_root: PathBuf,
    debounce: Duration,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl NativeWatcher {
    pub fn new(workspace_root: impl Into<PathBuf>, debounce: Duration) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            debounce,
            stop_tx: None,
        }
    }

    /// Start watching. `on_change` receives workspace-relative paths.
    pub fn start(&mut self, on_change: impl Fn(Vec<PathBuf>) + Send + Sync + 'static) -> Result<()> {
        if self.is_running() {
            return Err(Error::process("native watcher is already running"));
        }

        let workspace_root = self.workspace_root.clone();
        let debounce = self.debounce;
        let (stop_tx, stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);

        let on_change: ChangeCallback = Arc::new(on_change);
        tokio::task::spawn_blocking(move || {
            Self::run_watcher(workspace_root, debounce, on_change, stop_rx);
        });

        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx.is_some()
    }

    fn run_watcher(
        workspace_root: PathBuf,
        debounce: Duration,
        on_change: ChangeCallback,
        stop_rx: oneshot::Receiver<()>,
    ) {
        let root = workspace_root.clone();
        let debouncer_result = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let changed = native_changes(
                        &root,
                        events.iter().flat_map(|event| event.paths.iter()),
                    );
                    if changed.is_empty() {
                        return;
                    }
                    debug!("Native watcher detected {} change(s)", changed.len());
                    on_change(changed);
                }
                Err(errors) => {
                    for error in errors {
                        warn!("Native watcher error: {:?}", error);
                    }
                }
            }
        });

        let mut debouncer = match debouncer_result {
            Ok(d) => d,
            Err(e) => {
                error!("Failed to create native watcher: {}", e);
                return;
            }
        };

        // Root manifests live directly in the workspace root
        if let Err(e) = debouncer.watch(&workspace_root, RecursiveMode::NonRecursive) {
            warn!("Failed to watch {}: {}", workspace_root.display(), e);
        }
        for dir in NATIVE_DIRS {
            let full_path = workspace_root.join(dir);
            if !full_path.is_dir() {
                debug!("No native directory at {}", full_path.display());
                continue;
            }
            match debouncer.watch(&full_path, RecursiveMode::Recursive) {
                Ok(()) => info!("Watching: {}", full_path.display()),
                Err(e) => warn!("Failed to watch {}: {}", full_path.display(), e),
            }
        }

        // Dropping the sender also stops the watcher
        let _ = stop_rx.blocking_recv();
        info!("Native watcher stopping");
    }
}

impl Drop for NativeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Workspace-relative native inputs among `paths`, deduplicated
fn native_changes<'a>(root: &Path, paths: impl Iterator<Item = &'a PathBuf>) -> Vec<PathBuf> {
    let mut changed: Vec<PathBuf> = paths
        .filter_map(|path| path.strip_prefix(root).ok())
        .filter(|relative| is_native_input(relative))
        .map(Path::to_path_buf)
        .collect();
    changed.sort();
    changed.dedup();
    changed
}
