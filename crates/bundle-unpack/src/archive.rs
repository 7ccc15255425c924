//! Chart archive extraction
//!
//! Streams a `.tgz` chart into a directory. Charts wrap their content in a
//! single folder (`nginx/Chart.yaml`, `nginx/templates/...`); that folder is
//! stripped so the unpacked tree starts at `Chart.yaml`.

use flate2::read::GzDecoder;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, EntryType};
use tokio_util::sync::CancellationToken;

use crate::cache::{BundleGuard, CacheManager};
use crate::config::LinkPolicy;
use crate::error::{Result, Stage, UnpackError};
use crate::fs::{
    MIN_DIR_MODE, MIN_FILE_MODE, contained_link_target, contained_regular_file, create_file,
    effective_mode, ensure_no_symlink_ancestors, prune_escaping_links, relative_entry_path,
    remove_existing, run_blocking, set_mode,
};

/// Counters for one extraction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub files: usize,
    pub directories: usize,
    pub links: usize,
    pub skipped: usize,
}

/// Gzip + tar extractor for chart archives
#[derive(Debug, Clone, Default)]
pub struct ArchiveUnpacker {
    link_policy: LinkPolicy,
}

impl ArchiveUnpacker {
    pub fn new(link_policy: LinkPolicy) -> Self {
        Self { link_policy }
    }

    /// Extract `data` into `<cache>/<bundle>/<filename>` and seal it.
    ///
    /// Extraction runs on the blocking pool and stops between entries once
    /// `cancel` fires. An existing sealed directory for the same filename is
    /// returned as is. On failure nothing is left under the bundle directory
    /// for `filename`.
    pub async fn unpack(
        &self,
        data: Vec<u8>,
        cache: &CacheManager,
        guard: &BundleGuard,
        filename: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        if let Some(existing) = cache.existing(guard, filename) {
            tracing::debug!(bundle = %guard.bundle(), path = %existing.display(), "Chart already unpacked");
            return Ok(existing);
        }

        let staging = cache.stage(guard, filename)?;
        let staging_path = staging.path().to_path_buf();
        let unpacker = self.clone();
        // Stops the task if this future is dropped; the task owns the staging tree
        let task_cancel = cancel.child_token();
        let _stop_on_drop = task_cancel.clone().drop_guard();

        let (root, stats) = run_blocking(Stage::Extract, &staging_path, move || {
            let stats = unpacker.extract(std::io::Cursor::new(data), staging.path(), &task_cancel)?;
            Ok((staging.commit()?, stats))
        })
        .await?;

        tracing::info!(
            bundle = %guard.bundle(),
            path = %root.display(),
            files = stats.files,
            skipped = stats.skipped,
            "Unpacked chart archive"
        );
        Ok(root)
    }

    /// Extract a gzipped tar stream into an existing directory.
    ///
    /// Returns [`UnpackError::Cancelled`] at the next entry once `cancel` fires.
    pub fn extract<R: Read>(
        &self,
        reader: R,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<ExtractStats> {
        let mut archive = Archive::new(GzDecoder::new(reader));
        let mut stats = ExtractStats::default();
        let mut top_level: Option<PathBuf> = None;
        let mut first = true;

        for entry in archive.entries().map_err(invalid_archive)? {
            if cancel.is_cancelled() {
                return Err(UnpackError::Cancelled);
            }
            let mut entry = entry.map_err(invalid_archive)?;
            let raw = entry.path().map_err(invalid_archive)?.into_owned();
            let path = relative_entry_path(&raw)?;
            let entry_type = entry.header().entry_type();

            if first {
                first = false;
                top_level = leading_folder(&path, entry_type);
            }

            let relative = strip_top_level(&path, top_level.as_deref());
            if relative.as_os_str().is_empty() {
                continue;
            }
            ensure_no_symlink_ancestors(dest, &relative)?;
            let target = dest.join(&relative);

            match entry_type {
                EntryType::Directory => {
                    let mode = entry.header().mode().map_err(invalid_archive)?;
                    create_directory(&target, effective_mode(mode, MIN_DIR_MODE))?;
                    stats.directories += 1;
                }
                EntryType::Regular | EntryType::Continuous => {
                    let mode = entry.header().mode().map_err(invalid_archive)?;
                    write_file(&mut entry, &target, effective_mode(mode, MIN_FILE_MODE), cancel)?;
                    stats.files += 1;
                }
                EntryType::Symlink | EntryType::Link => {
                    let link_name = entry
                        .link_name()
                        .map_err(invalid_archive)?
                        .map(|l| l.into_owned())
                        .unwrap_or_default();
                    let kind = if entry_type == EntryType::Symlink {
                        LinkKind::Symbolic(link_name)
                    } else {
                        // Hardlink targets are archive paths, strip them the same way
                        let target = relative_entry_path(&link_name)?;
                        LinkKind::Hard(strip_top_level(&target, top_level.as_deref()))
                    };
                    if materialize_link(dest, &relative, kind, self.link_policy)? {
                        stats.links += 1;
                    } else {
                        stats.skipped += 1;
                    }
                }
                other => {
                    tracing::debug!(path = %raw.display(), entry_type = ?other, "Skipping unsupported entry type in archive");
                    stats.skipped += 1;
                }
            }
        }

        if self.link_policy == LinkPolicy::Preserve {
            let pruned = prune_escaping_links(dest)?;
            stats.links = stats.links.saturating_sub(pruned);
            stats.skipped += pruned;
        }
        Ok(stats)
    }
}

/// Folder every entry is expected to live in, judged from the first entry.
///
/// A lone top-level file is not a folder, so nothing gets stripped.
fn leading_folder(path: &Path, entry_type: EntryType) -> Option<PathBuf> {
    let mut components = path.components();
    let first = components.next()?;
    let nested = components.next().is_some();
    (nested || entry_type == EntryType::Directory).then(|| PathBuf::from(first.as_os_str()))
}

/// Strip the top-level folder; entries outside it keep their full path
fn strip_top_level(path: &Path, top_level: Option<&Path>) -> PathBuf {
    match top_level {
        Some(top) => path.strip_prefix(top).unwrap_or(path).to_path_buf(),
        None => path.to_path_buf(),
    }
}

pub(crate) fn create_directory(path: &Path, mode: u32) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(m) if !m.is_dir() => {
            remove_existing(path).map_err(|e| UnpackError::io(Stage::Extract, path, e))?
        }
        _ => {}
    }
    std::fs::create_dir_all(path).map_err(|e| UnpackError::io(Stage::Extract, path, e))?;
    set_mode(path, mode).map_err(|e| UnpackError::io(Stage::Extract, path, e))
}

/// Replace whatever is at `path` with the entry content
pub(crate) fn write_file<R: Read>(
    entry: &mut R,
    path: &Path,
    mode: u32,
    cancel: &CancellationToken,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| UnpackError::io(Stage::Extract, parent, e))?;
    }
    remove_existing(path).map_err(|e| UnpackError::io(Stage::Extract, path, e))?;

    let mut file = create_file(path, mode).map_err(|e| UnpackError::io(Stage::Extract, path, e))?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        if cancel.is_cancelled() {
            return Err(UnpackError::Cancelled);
        }
        let n = entry.read(&mut buf).map_err(invalid_archive)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .map_err(|e| UnpackError::io(Stage::Extract, path, e))?;
    }
    Ok(())
}

/// Link entry awaiting materialization
pub(crate) enum LinkKind {
    /// Target as written in the archive, relative to the link's folder
    Symbolic(PathBuf),
    /// Root-relative path of an entry extracted earlier
    Hard(PathBuf),
}

/// Create a link under `root` if the policy allows it and the target is
/// contained, as resolved against what is already on disk. Returns whether a
/// link was created.
pub(crate) fn materialize_link(
    root: &Path,
    relative: &Path,
    kind: LinkKind,
    policy: LinkPolicy,
) -> Result<bool> {
    if policy == LinkPolicy::Skip {
        tracing::debug!(path = %relative.display(), "Skipping link entry");
        return Ok(false);
    }

    let path = root.join(relative);
    match kind {
        LinkKind::Symbolic(target) => {
            if contained_link_target(root, relative, &target)?.is_none() {
                tracing::warn!(
                    path = %relative.display(),
                    target = %target.display(),
                    "Skipping symlink pointing outside the destination"
                );
                return Ok(false);
            }
            prepare_link_path(&path)?;
            create_symlink(&target, &path)
        }
        LinkKind::Hard(target) => {
            if !contained_regular_file(root, &target)? {
                tracing::warn!(
                    path = %relative.display(),
                    target = %target.display(),
                    "Skipping hardlink that is not a regular file inside the destination"
                );
                return Ok(false);
            }
            let source = root.join(&target);
            prepare_link_path(&path)?;
            std::fs::hard_link(&source, &path)
                .map_err(|e| UnpackError::io(Stage::Extract, &path, e))?;
            Ok(true)
        }
    }
}

fn prepare_link_path(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| UnpackError::io(Stage::Extract, parent, e))?;
    }
    remove_existing(path).map_err(|e| UnpackError::io(Stage::Extract, path, e))
}

#[cfg(unix)]
fn create_symlink(target: &Path, path: &Path) -> Result<bool> {
    std::os::unix::fs::symlink(target, path)
        .map_err(|e| UnpackError::io(Stage::Extract, path, e))?;
    Ok(true)
}

#[cfg(not(unix))]
fn create_symlink(target: &Path, path: &Path) -> Result<bool> {
    tracing::debug!(path = %path.display(), target = %target.display(), "Symlinks unsupported on this platform");
    Ok(false)
}

pub(crate) fn invalid_archive(e: std::io::Error) -> UnpackError {
    UnpackError::InvalidArchive {
        message: e.to_string(),
    }
}
