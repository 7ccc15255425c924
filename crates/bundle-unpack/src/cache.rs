//! Per-bundle unpack cache with garbage collection
//!
//! Layout: `<cache_root>/<bundle>/<key>/...` where `key` is a chart archive
//! name or an image digest. Features:
//! - Per-bundle async locks so unpacks and sweeps never interleave
//! - Staging directories that only become visible once sealed
//! - Sweeps that keep exactly one current directory per bundle

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::OwnedMutexGuard;

use crate::bundle::is_single_component;
use crate::error::{Result, Stage, UnpackError};
use crate::fs::{delete_recursive, seal_read_only};

/// Owner of the on-disk bundle cache
#[derive(Debug)]
pub struct CacheManager {
    root: PathBuf,
    /// Live only while a guard or a waiter holds the mutex
    locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

/// Proof that the caller holds the lock for one bundle name
#[derive(Debug)]
pub struct BundleGuard {
    bundle: String,
    _guard: OwnedMutexGuard<()>,
}

impl BundleGuard {
    pub fn bundle(&self) -> &str {
        &self.bundle
    }
}

impl CacheManager {
    /// Create a cache rooted at `root`; the directory is created lazily
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Cache root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every version of a bundle
    pub fn bundle_path(&self, bundle: &str) -> PathBuf {
        self.root.join(bundle)
    }

    /// Directory of one unpacked version of a bundle
    pub fn unpack_path(&self, bundle: &str, key: &str) -> PathBuf {
        self.bundle_path(bundle).join(key)
    }

    /// Acquire the per-bundle lock, waiting for any holder to release it
    pub async fn lock(&self, bundle: &str) -> BundleGuard {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, lock| lock.strong_count() > 0);
            match locks.get(bundle).and_then(Weak::upgrade) {
                Some(mutex) => mutex,
                None => {
                    let mutex = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(bundle.to_string(), Arc::downgrade(&mutex));
                    mutex
                }
            }
        };
        BundleGuard {
            bundle: bundle.to_string(),
            _guard: mutex.lock_owned().await,
        }
    }

    /// Sealed directory for `key`, if it was unpacked before
    pub fn existing(&self, guard: &BundleGuard, key: &str) -> Option<PathBuf> {
        let path = self.unpack_path(guard.bundle(), key);
        path.is_dir().then_some(path)
    }

    /// Start populating a new version of the guarded bundle
    pub fn stage(&self, guard: &BundleGuard, key: &str) -> Result<Staging> {
        if !is_single_component(key) {
            return Err(UnpackError::InvalidBundle {
                message: format!("unpack key '{}' is not a valid directory name", key),
            });
        }

        let bundle_dir = self.bundle_path(guard.bundle());
        let path = bundle_dir.join(format!(".{}.partial", key));
        let target = bundle_dir.join(key);

        // Leftover from a crashed process
        delete_recursive(&path).map_err(|e| UnpackError::io(Stage::Extract, &path, e))?;
        std::fs::create_dir_all(&path).map_err(|e| UnpackError::io(Stage::Extract, &path, e))?;

        Ok(Staging {
            path,
            target,
            committed: false,
        })
    }

    /// Delete every version of the guarded bundle except `keep`.
    ///
    /// Returns the names of the removed directories.
    pub fn reconcile(&self, guard: &BundleGuard, keep: &str) -> Result<Vec<String>> {
        let bundle_dir = self.bundle_path(guard.bundle());
        let entries = match std::fs::read_dir(&bundle_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(UnpackError::io(Stage::Sweep, &bundle_dir, e)),
        };

        let mut removed = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| UnpackError::io(Stage::Sweep, &bundle_dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == keep {
                continue;
            }
            let path = entry.path();
            delete_recursive(&path).map_err(|e| UnpackError::io(Stage::Sweep, &path, e))?;
            tracing::debug!(bundle = %guard.bundle(), removed = %name, "Removed stale bundle version");
            removed.push(name);
        }

        removed.sort();
        Ok(removed)
    }

    /// Delete the whole bundle subtree (bundle source was removed)
    pub async fn cleanup(&self, bundle: &str) -> Result<()> {
        if !is_single_component(bundle) {
            return Err(UnpackError::InvalidBundle {
                message: format!("bundle name '{}' is not a valid directory name", bundle),
            });
        }
        let _guard = self.lock(bundle).await;
        let path = self.bundle_path(bundle);
        delete_recursive(&path).map_err(|e| UnpackError::io(Stage::Sweep, &path, e))?;
        tracing::info!(bundle = %bundle, "Removed bundle cache");
        Ok(())
    }
}

/// A directory being populated for one bundle version.
///
/// Deleted on drop unless [`Staging::commit`] succeeded.
#[derive(Debug)]
pub struct Staging {
    path: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl Staging {
    /// Directory to populate
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final location once committed
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Seal the tree read-only and move it to its final location
    pub fn commit(mut self) -> Result<PathBuf> {
        seal_read_only(&self.path).map_err(|e| UnpackError::io(Stage::Seal, &self.path, e))?;
        std::fs::rename(&self.path, &self.target)
            .map_err(|e| UnpackError::io(Stage::Seal, &self.target, e))?;
        self.committed = true;
        Ok(self.target.clone())
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = delete_recursive(&self.path) {
            tracing::warn!(path = %self.path.display(), "Failed to remove partial unpack: {}", e);
        }
    }
}
