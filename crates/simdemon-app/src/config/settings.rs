//! Settings parser for .simdemon/config.toml

use std::path::{Path, PathBuf};

use simdemon_core::prelude::*;

use super::types::Settings;

const CONFIG_FILENAME: &str = "config.toml";
pub const SIMDEMON_DIR: &str = ".simdemon";
const GITIGNORE_ENTRY: &str = ".simdemon/";

/// `.simdemon/` directory of a workspace
pub fn simdemon_dir(project_path: &Path) -> PathBuf {
    project_path.join(SIMDEMON_DIR)
}

/// Load settings from `.simdemon/config.toml`.
///
/// A missing or invalid file yields the defaults.
pub fn load_settings(project_path: &Path) -> Settings {
    let config_path = simdemon_dir(project_path).join(CONFIG_FILENAME);

    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return Settings::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => {
                debug!("Loaded settings from {:?}", config_path);
                settings
            }
            Err(e) => {
                warn!("Failed to parse {:?}: {}", config_path, e);
                Settings::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", config_path, e);
            Settings::default()
        }
    }
}

/// Create `.simdemon/` with a default config and keep it out of git
pub fn init_simdemon_directory(project_path: &Path) -> Result<()> {
    let dir = simdemon_dir(project_path);

    if !dir.exists() {
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::config(format!("Failed to create .simdemon dir: {}", e)))?;
        info!("Created .simdemon directory");
    }

    let config_path = dir.join(CONFIG_FILENAME);
    if !config_path.exists() {
        std::fs::write(&config_path, generate_default_config())
            .map_err(|e| Error::config(format!("Failed to write config.toml: {}", e)))?;
        info!("Created default config.toml");
    }

    ensure_gitignore_entry(project_path)
}

fn ensure_gitignore_entry(project_path: &Path) -> Result<()> {
    let gitignore_path = project_path.join(".gitignore");
    let existing_content = std::fs::read_to_string(&gitignore_path).unwrap_or_default();

    if gitignore_contains_entry(&existing_content) {
        debug!("Gitignore already contains {}", GITIGNORE_ENTRY);
        return Ok(());
    }

    let entry_to_add = format!("\n# Sim Demon local state\n{}\n", GITIGNORE_ENTRY);
    let new_content = if existing_content.is_empty() {
        entry_to_add.trim_start().to_string()
    } else if existing_content.ends_with('\n') {
        format!("{}{}", existing_content, entry_to_add)
    } else {
        format!("{}\n{}", existing_content, entry_to_add)
    };

    std::fs::write(&gitignore_path, new_content)
        .map_err(|e| Error::config(format!("Failed to update .gitignore: {}", e)))?;

    info!("Added {} to .gitignore", GITIGNORE_ENTRY);
    Ok(())
}

fn gitignore_contains_entry(content: &str) -> bool {
    content.lines().any(|line| {
        let trimmed = line.trim();
        trimmed == GITIGNORE_ENTRY
            || trimmed == SIMDEMON_DIR
            || trimmed == ".simdemon/*"
            || trimmed == ".simdemon/**"
            || trimmed == "/.simdemon/"
    })
}

fn generate_default_config() -> String {
    r#"# Sim Demon Configuration

[build]
use_expo_go = false        # Run inside Expo Go instead of building natively
progress_interval_ms = 100

[build.android]
variant = "debug"

[build.ios]
configuration = "Debug"
install_pods = true

[launch]
wait_for_app_launch = true
debugger_timeout_ms = 15000

[watcher]
throttle_ms = 300

[inspector]
exclude_patterns = []

[fingerprint]
extra_paths = []

[bundler]
command = "npx"
args = ["react-native", "start"]
port = 8081
# package_manager = "yarn"  # Installs node modules; detected from the lockfile by default
"#
    .to_string()
}
