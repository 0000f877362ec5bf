//! Workspace fingerprinting and artifact content hashing
//!
//! A fingerprint identifies the state of every file that can change the
//! outcome of a native build. Two workspaces with the same native inputs get
//! the same fingerprint regardless of file timestamps or JS-only edits.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::Result;

/// Root-level manifests that affect native builds
pub const ROOT_MANIFESTS: &[&str] = &[
    "package.json",
    "app.json",
    "app.config.js",
    "app.config.ts",
    "yarn.lock",
    "package-lock.json",
    "pnpm-lock.yaml",
    "bun.lockb",
];

/// Directories holding native project sources
pub const NATIVE_DIRS: &[&str] = &["ios", "android"];

/// Build outputs and caches inside the native directories
pub const EXCLUDED_DIRS: &[&str] = &[
    "ios/build",
    "ios/Pods",
    "android/build",
    "android/app/build",
    "android/.gradle",
    "android/.idea",
];

/// Directory names skipped at any depth
const SKIPPED_SEGMENTS: &[&str] = &["node_modules", ".git", ".simdemon"];

/// Content-derived identifier of the native build inputs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inputs considered when fingerprinting
#[derive(Debug, Clone, Default)]
pub struct FingerprintOptions {
    /// Extra files or directories, relative to the workspace root
    pub extra_paths: Vec<PathBuf>,
}

impl FingerprintOptions {
    pub fn with_extra_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.extra_paths = paths;
        self
    }
}

/// Compute the fingerprint of a workspace with default options
pub fn compute(workspace_root: &Path) -> Result<Fingerprint> {
    compute_with(workspace_root, &FingerprintOptions::default())
}

/// Compute the fingerprint of a workspace.
///
/// Fails only if the workspace root itself can't be read.
pub fn compute_with(workspace_root: &Path, options: &FingerprintOptions) -> Result<Fingerprint> {
    // Surfaces a missing or unreadable root as an error instead of an empty hash.
    std::fs::read_dir(workspace_root)?;

    let mut files = collect_inputs(workspace_root, options);
    files.sort();
    files.dedup();

    let mut hasher = Sha256::new();
    for relative in &files {
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hash_file_into(&workspace_root.join(relative), &mut hasher)?;
        hasher.update([0u8]);
    }

    Ok(Fingerprint(hex::encode(hasher.finalize())))
}

/// Relative paths of every file that feeds the fingerprint
pub fn collect_inputs(workspace_root: &Path, options: &FingerprintOptions) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for manifest in ROOT_MANIFESTS {
        if workspace_root.join(manifest).is_file() {
            files.push(PathBuf::from(manifest));
        }
    }

    let roots = NATIVE_DIRS
        .iter()
        .map(PathBuf::from)
        .chain(options.extra_paths.iter().cloned());

    for root in roots {
        let full = workspace_root.join(&root);
        if full.is_file() {
            files.push(root);
        } else if full.is_dir() {
            files.extend(walk_files(workspace_root, &full));
        }
    }

    files
}

/// True for paths whose changes can require a native rebuild
pub fn is_native_input(relative: &Path) -> bool {
    if is_excluded(relative) {
        return false;
    }
    let mut components = relative.components();
    match components.next() {
        Some(first) => {
            let first = first.as_os_str();
            let nested = components.next().is_some();
            if nested {
                NATIVE_DIRS.iter().any(|dir| first == *dir)
            } else {
                ROOT_MANIFESTS.iter().any(|manifest| first == *manifest)
                    || NATIVE_DIRS.iter().any(|dir| first == *dir)
            }
        }
        None => false,
    }
}

fn is_excluded(relative: &Path) -> bool {
    EXCLUDED_DIRS
        .iter()
        .any(|excluded| relative.starts_with(excluded))
        || relative.components().any(|c| {
            SKIPPED_SEGMENTS
                .iter()
                .any(|segment| c.as_os_str() == *segment)
        })
}

fn walk_files(workspace_root: &Path, dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| match entry.path().strip_prefix(workspace_root) {
            Ok(relative) => !is_excluded(relative),
            Err(_) => false,
        })
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!("Skipping unreadable fingerprint input: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(workspace_root)
                .ok()
                .map(Path::to_path_buf)
        })
        .collect()
}

/// SHA-256 of a file, or of a directory tree (sorted relative paths and bytes).
///
/// iOS app bundles are directories, so artifacts are hashed either way.
pub fn content_hash(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();

    if path.is_dir() {
        let mut entries: Vec<PathBuf> = WalkDir::new(path)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(std::io::Error::from)?
            .into_iter()
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();
        entries.sort();

        for file in entries {
            let relative = file.strip_prefix(path).unwrap_or(&file);
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hash_file_into(&file, &mut hasher)?;
        }
    } else {
        hash_file_into(path, &mut hasher)?;
    }

    Ok(hex::encode(hasher.finalize()))
}

fn hash_file_into(path: &Path, hasher: &mut Sha256) -> Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(())
}
