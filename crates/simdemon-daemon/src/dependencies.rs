//! JS dependencies of the workspace
//!
//! The bundler cannot serve anything before `node_modules` exists, so
//! installing them is handed to [`Bundler::start`](crate::Bundler::start) as a
//! prerequisite. The package manager follows the workspace lockfile unless one
//! is configured.

use std::path::{Path, PathBuf};

use futures_util::future::BoxFuture;

use simdemon_core::prelude::*;

use crate::process::{self, ProcessSpec};

/// Work that must finish before the bundler process is spawned
pub type Prerequisite = BoxFuture<'static, Result<()>>;

/// Lockfiles in the order they are checked
const LOCKFILES: [(&str, &str); 5] = [
    ("bun.lockb", "bun"),
    ("bun.lock", "bun"),
    ("pnpm-lock.yaml", "pnpm"),
    ("yarn.lock", "yarn"),
    ("package-lock.json", "npm"),
];

/// Package manager for the lockfile found in `root`, `npm` without one
pub fn detect_package_manager(root: &Path) -> &'static str {
    LOCKFILES
        .iter()
        .find(|(lockfile, _)| root.join(lockfile).is_file())
        .map(|(_, manager)| *manager)
        .unwrap_or("npm")
}

/// `node_modules` of one workspace
#[derive(Debug, Clone)]
pub struct NodeModules {
    root: PathBuf,
    package_manager: Option<String>,
}

impl NodeModules {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            package_manager: None,
        }
    }

    /// Use `command` instead of the detected package manager
    pub fn with_package_manager(mut self, command: Option<String>) -> Self {
        self.package_manager = command;
        self
    }

    pub fn is_installed(&self) -> bool {
        self.root.join("node_modules").is_dir()
    }

    pub fn package_manager(&self) -> String {
        self.package_manager
            .clone()
            .unwrap_or_else(|| detect_package_manager(&self.root).to_string())
    }

    /// Run `<package manager> install` unless the modules are already there
    pub async fn ensure_installed(&self) -> Result<()> {
        if self.is_installed() {
            debug!("Node modules already installed");
            return Ok(());
        }

        let manager = self.package_manager();
        info!("Installing node modules with {}", manager);
        let spec = ProcessSpec::new(&manager)
            .arg("install")
            .current_dir(&self.root);
        process::run(&spec)
            .await
            .map_err(|e| Error::bundler(format!("installing node modules failed: {e}")))?;
        Ok(())
    }

    pub fn prerequisite(self) -> Prerequisite {
        Box::pin(async move { self.ensure_installed().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_package_manager_from_lockfile() {
        let temp = tempfile::tempdir().unwrap();
        assert_eq!(detect_package_manager(temp.path()), "npm");

        std::fs::write(temp.path().join("yarn.lock"), "").unwrap();
        assert_eq!(detect_package_manager(temp.path()), "yarn");

        std::fs::write(temp.path().join("pnpm-lock.yaml"), "").unwrap();
        assert_eq!(detect_package_manager(temp.path()), "pnpm");
    }

    #[test]
    fn test_configured_package_manager_wins() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("yarn.lock"), "").unwrap();

        let modules = NodeModules::new(temp.path()).with_package_manager(Some("bun".into()));
        assert_eq!(modules.package_manager(), "bun");
    }

    #[tokio::test]
    async fn test_installed_modules_are_left_alone() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir(temp.path().join("node_modules")).unwrap();

        // Would fail if it ran
        let modules =
            NodeModules::new(temp.path()).with_package_manager(Some("false".into()));
        assert!(modules.is_installed());
        modules.prerequisite().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_install_is_a_bundler_error() {
        let temp = tempfile::tempdir().unwrap();
        let modules =
            NodeModules::new(temp.path()).with_package_manager(Some("false".into()));

        let result = modules.ensure_installed().await;
        assert!(matches!(result, Err(Error::Bundler { .. })));
    }
}
