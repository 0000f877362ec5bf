//! Sim Demon - build cache and device sessions for simulator and emulator development
//!
//! This is the binary entry point. All logic lives in the library.

use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::{eyre, Result};
use sim_demon::{run_headless, HeadlessOptions};

/// Sim Demon - build, install and launch your app on simulators and emulators
#[derive(Parser, Debug)]
#[command(name = "simdemon")]
#[command(about = "Build cache and device sessions for mobile app development", long_about = None)]
struct Args {
    /// Path to the app workspace
    #[arg(value_name = "PATH")]
    path: Option<PathBuf>,

    /// Device to select on startup instead of the last selected one
    #[arg(long, value_name = "ID")]
    device: Option<String>,

    /// Ignore cached builds for the first launch
    #[arg(long)]
    clean: bool,

    /// Run inside Expo Go instead of building natively
    #[arg(long)]
    expo_go: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    if let Err(e) = simdemon_core::logging::init() {
        eprintln!("Warning: failed to initialize logging: {}", e);
    }

    let base_path = args
        .path
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let project_path = dunce::canonicalize(&base_path)
        .map_err(|e| eyre!("Cannot open workspace {}: {}", base_path.display(), e))?;

    if !project_path.join("package.json").is_file() {
        return Err(eyre!(
            "No package.json found in {}. Run simdemon from your app workspace.",
            project_path.display()
        ));
    }

    let options = HeadlessOptions {
        device_id: args.device,
        force_clean_build: args.clean,
        use_expo_go: args.expo_go,
    };
    run_headless(&project_path, options).await?;

    Ok(())
}
