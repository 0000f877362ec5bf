//! Configuration for Sim Demon
//!
//! Supports:
//! - `.simdemon/config.toml` - Workspace settings

pub mod settings;
pub mod types;

pub use settings::{init_simdemon_directory, load_settings, simdemon_dir, SIMDEMON_DIR};
pub use types::*;
