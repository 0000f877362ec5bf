//! Per-platform cache of the last successful native build
//!
//! An entry is trusted only when the workspace fingerprint it was built from
//! matches the current one and the artifact on disk still hashes to the value
//! recorded at store time. Any failure to validate is a miss.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use simdemon_core::fingerprint::content_hash;
use simdemon_core::prelude::*;
use simdemon_core::{BuildResult, Fingerprint, Platform};

use crate::store::WorkspaceStore;

/// Persisted record of a cached build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildCacheEntry {
    pub fingerprint: Fingerprint,
    pub build_hash: String,
    pub build_result: BuildResult,
}

#[derive(Debug, Clone)]
pub struct BuildCache {
    store: Arc<WorkspaceStore>,
}

impl BuildCache {
    pub fn new(store: Arc<WorkspaceStore>) -> Self {
        Self { store }
    }

    fn entry(&self, platform: Platform) -> Option<BuildCacheEntry> {
        self.store.get(platform.cache_key())
    }

    /// Cached build for `platform` if it is still valid for `fingerprint`
    pub fn lookup(&self, platform: Platform, fingerprint: &Fingerprint) -> Option<BuildResult> {
        let Some(entry) = self.entry(platform) else {
            debug!("No cached {} build", platform);
            return None;
        };

        if &entry.fingerprint != fingerprint {
            debug!("Cached {} build is for a different fingerprint", platform);
            return None;
        }

        let artifact = entry.build_result.artifact_path();
        if !artifact.exists() {
            info!("Cached {} artifact {:?} no longer exists", platform, artifact);
            return None;
        }

        match content_hash(artifact) {
            Ok(hash) if hash == entry.build_hash => {
                info!("Using cached {} build {:?}", platform, artifact);
                Some(entry.build_result)
            }
            Ok(_) => {
                warn!("Cached {} artifact {:?} was modified", platform, artifact);
                None
            }
            Err(e) => {
                warn!("Failed to hash cached artifact {:?}: {}", artifact, e);
                None
            }
        }
    }

    /// Record a successful build, replacing the previous entry
    pub fn store(
        &self,
        platform: Platform,
        fingerprint: Fingerprint,
        build_result: &BuildResult,
    ) -> Result<()> {
        let build_hash = content_hash(build_result.artifact_path())?;
        let entry = BuildCacheEntry {
            fingerprint,
            build_hash,
            build_result: build_result.clone(),
        };
        self.store.set(platform.cache_key(), &entry)?;
        debug!("Stored {} build in cache", platform);
        Ok(())
    }

    pub fn invalidate(&self, platform: Platform) {
        if let Err(e) = self.store.remove(platform.cache_key()) {
            warn!("Failed to clear cached {} build: {}", platform, e);
        }
    }

    /// Fingerprint the cached build was made from
    pub fn cached_fingerprint(&self, platform: Platform) -> Option<Fingerprint> {
        self.entry(platform).map(|entry| entry.fingerprint)
    }
}
