//! Headless mode runner - wires the project together and drives it from stdin
//!
//! Project events are streamed to stdout as NDJSON. Single-letter commands on
//! stdin map to project controls, and SIGINT or SIGTERM dispose the project
//! before exiting.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use simdemon_app::{
    init_simdemon_directory, load_settings, Project, ProjectApi, ProjectServices, StartOptions,
    WorkspaceStore,
};
use simdemon_core::prelude::*;
use simdemon_core::{AppPermission, Event, EventKind, ReloadAction};
use simdemon_daemon::{
    CdpConnector, GradleBuilder, InstrumentationServer, LocalDeviceProvider, MetroBundler,
    NativeBuilder, ToolPaths, XcodeBuilder,
};

use super::{emit, emit_project_event, RunnerEvent};

/// Project events forwarded to stdout
const STREAMED_EVENTS: [EventKind; 6] = [
    EventKind::ProjectStateChanged,
    EventKind::DeviceSettingsChanged,
    EventKind::NeedsNativeRebuild,
    EventKind::NavigationChanged,
    EventKind::Log,
    EventKind::DevicesChanged,
];

/// Command-line overrides for a headless run
#[derive(Debug, Clone, Default)]
pub struct HeadlessOptions {
    pub device_id: Option<String>,
    pub force_clean_build: bool,
    pub use_expo_go: bool,
}

/// Commands accepted on stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinCommand {
    /// `r`: hot reload when possible, otherwise relaunch
    Restart,
    /// `R`: clean native rebuild
    Rebuild,
    /// `j`: reload the JS bundle
    ReloadJs,
    /// `h`: go to the home screen
    Home,
    /// `p`: reset every app permission
    ResetPermissions,
    /// `q`: dispose and exit
    Quit,
}

impl StdinCommand {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "r" | "restart" => Some(Self::Restart),
            "R" | "rebuild" => Some(Self::Rebuild),
            "j" | "reload" => Some(Self::ReloadJs),
            "h" | "home" => Some(Self::Home),
            "p" | "permissions" => Some(Self::ResetPermissions),
            "q" | "quit" => Some(Self::Quit),
            _ => None,
        }
    }
}

/// Run in headless mode against the workspace at `project_path`
pub async fn run_headless(project_path: &Path, options: HeadlessOptions) -> Result<()> {
    info!("═══════════════════════════════════════════════════════");
    info!("Sim Demon starting in HEADLESS mode");
    info!("Project: {}", project_path.display());
    info!("═══════════════════════════════════════════════════════");

    let project = match build_project(project_path, &options).await {
        Ok(project) => project,
        Err(e) => {
            emit(&RunnerEvent::error(e.to_string(), true));
            return Err(e);
        }
    };

    let listeners: Vec<_> = STREAMED_EVENTS
        .iter()
        .map(|kind| {
            project.add_listener(
                *kind,
                Arc::new(|event: &Event| {
                    if let Event::Project(event) = event {
                        emit_project_event(event);
                    }
                }),
            )
        })
        .collect();

    let (command_tx, command_rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        spawn_stdin_reader_blocking(command_tx);
    });

    let start = StartOptions {
        device_id: options.device_id.clone(),
        force_clean_build: options.force_clean_build,
    };
    let result = match project.start(start).await {
        Ok(()) => command_loop(&project, command_rx).await,
        Err(e) => {
            emit(&RunnerEvent::error(e.to_string(), true));
            Err(e)
        }
    };

    for listener in &listeners {
        project.remove_listener(listener);
    }
    project.dispose().await;
    emit(&RunnerEvent::Shutdown);

    info!("Sim Demon headless mode exiting");
    result
}

/// Assemble the project from the on-disk settings and local tooling
async fn build_project(project_path: &Path, options: &HeadlessOptions) -> Result<Project> {
    init_simdemon_directory(project_path)?;
    let mut settings = load_settings(project_path);
    if options.use_expo_go {
        settings.build.use_expo_go = true;
    }

    let tools = ToolPaths::discover();
    let devices = Arc::new(LocalDeviceProvider::new(
        tools,
        settings.launch.preview_server.clone(),
    ));
    let builders: Vec<Arc<dyn NativeBuilder>> = vec![
        Arc::new(GradleBuilder::new((&settings.build.android).into())),
        Arc::new(XcodeBuilder::new((&settings.build.ios).into())),
    ];
    let bundler = Arc::new(MetroBundler::new(settings.bundler.to_config(project_path))?);
    let transport = Arc::new(InstrumentationServer::start().await?);

    Ok(Project::new(ProjectServices {
        workspace_root: PathBuf::from(project_path),
        store: Arc::new(WorkspaceStore::open(project_path)),
        settings,
        devices,
        builders,
        bundler,
        debugger: Arc::new(CdpConnector::new()),
        transport,
    }))
}

/// Process stdin commands until quit or a shutdown signal
async fn command_loop(project: &Project, mut commands: mpsc::Receiver<StdinCommand>) -> Result<()> {
    loop {
        tokio::select! {
            // Disabled once stdin closes; signals still end the loop
            Some(command) = commands.recv() => {
                if command == StdinCommand::Quit {
                    info!("Quit requested");
                    break;
                }
                if let Err(e) = run_command(project, command).await {
                    warn!("Command {:?} failed: {}", command, e);
                    emit(&RunnerEvent::error(e.to_string(), false));
                }
            }
            signal = shutdown_signal() => {
                match signal {
                    Ok(name) => info!("Received {}, shutting down", name),
                    Err(e) => error!("Failed to listen for shutdown signals: {}", e),
                }
                break;
            }
        }
    }

    Ok(())
}

/// Apply one stdin command to the project
pub async fn run_command<P: ProjectApi>(project: &P, command: StdinCommand) -> Result<()> {
    match command {
        StdinCommand::Restart => project.restart(false, true).await,
        StdinCommand::Rebuild => project.restart(true, false).await,
        StdinCommand::ReloadJs => {
            if !project.reload(ReloadAction::ReloadJs).await? {
                warn!("JS reload was not applied");
            }
            Ok(())
        }
        StdinCommand::Home => project.go_home().await,
        StdinCommand::ResetPermissions => project.reset_app_permissions(AppPermission::All).await,
        StdinCommand::Quit => Ok(()),
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "Ctrl-C")
}

/// Read stdin lines and forward recognized commands (blocking version)
fn spawn_stdin_reader_blocking(command_tx: mpsc::Sender<StdinCommand>) {
    use std::io::BufRead;

    let stdin = std::io::stdin();
    let reader = stdin.lock();

    for line in reader.lines() {
        match line {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let Some(command) = StdinCommand::parse(trimmed) else {
                    warn!("Unknown stdin command: {}", trimmed);
                    continue;
                };
                info!("Stdin: {:?} requested", command);
                if command_tx.blocking_send(command).is_err() || command == StdinCommand::Quit {
                    break;
                }
            }
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                break;
            }
        }
    }

    info!("Stdin reader exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stdin_commands() {
        assert_eq!(StdinCommand::parse("r"), Some(StdinCommand::Restart));
        assert_eq!(StdinCommand::parse("R"), Some(StdinCommand::Rebuild));
        assert_eq!(StdinCommand::parse(" j \n"), Some(StdinCommand::ReloadJs));
        assert_eq!(StdinCommand::parse("home"), Some(StdinCommand::Home));
        assert_eq!(StdinCommand::parse("p"), Some(StdinCommand::ResetPermissions));
        assert_eq!(StdinCommand::parse("quit"), Some(StdinCommand::Quit));
    }

    #[test]
    fn test_parse_unknown_command() {
        assert_eq!(StdinCommand::parse("x"), None);
        assert_eq!(StdinCommand::parse(""), None);
        assert_eq!(StdinCommand::parse("rr"), None);
    }

    #[test]
    fn test_streamed_events_are_project_events() {
        for kind in STREAMED_EVENTS {
            assert!(EventKind::ALL.contains(&kind));
        }
        assert!(!STREAMED_EVENTS.contains(&EventKind::AppReady));
        assert!(!STREAMED_EVENTS.contains(&EventKind::InspectData));
    }
}
