//! Filesystem helpers shared by the unpackers

use std::io;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Result, Stage, UnpackError};

/// Lowest permissions applied to extracted directories
pub(crate) const MIN_DIR_MODE: u32 = 0o700;

/// Lowest permissions applied to extracted files
pub(crate) const MIN_FILE_MODE: u32 = 0o400;

/// Turn a raw archive path into a path relative to the destination root.
///
/// `.` components are dropped. `..`, absolute and prefix components are
/// rejected outright rather than re-rooted.
pub(crate) fn relative_entry_path(raw: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(UnpackError::PathTraversal {
                    path: raw.display().to_string(),
                });
            }
        }
    }
    Ok(out)
}

/// Reject writes whose parent chain under `root` passes through a symlink
pub(crate) fn ensure_no_symlink_ancestors(root: &Path, relative: &Path) -> Result<()> {
    let parents = relative.parent().map(|p| p.components().count()).unwrap_or(0);
    if symlink_in_chain(root, relative, parents)? {
        return Err(UnpackError::PathTraversal {
            path: relative.display().to_string(),
        });
    }
    Ok(())
}

/// Whether one of the first `depth` components of `relative` is an existing
/// symlink under `root`. The walk stops at the first missing component.
fn symlink_in_chain(root: &Path, relative: &Path, depth: usize) -> Result<bool> {
    let mut current = root.to_path_buf();
    for component in relative.components().take(depth) {
        current.push(component);
        match std::fs::symlink_metadata(&current) {
            Ok(m) if m.file_type().is_symlink() => return Ok(true),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(UnpackError::io(Stage::Extract, &current, e)),
        }
    }
    Ok(false)
}

fn is_symlink(path: &Path) -> Result<bool> {
    match std::fs::symlink_metadata(path) {
        Ok(m) => Ok(m.file_type().is_symlink()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(UnpackError::io(Stage::Extract, path, e)),
    }
}

/// Resolve a symlink target against the directory holding the link.
///
/// Returns the root-relative target, or `None` when the target leaves the
/// root or steps through another symlink already on disk. The last
/// component may itself be a symlink.
pub(crate) fn contained_link_target(
    root: &Path,
    link: &Path,
    target: &Path,
) -> Result<Option<PathBuf>> {
    if target.is_absolute() {
        return Ok(None);
    }
    let mut resolved = link.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut descended = false;
    for component in target.components() {
        if descended && is_symlink(&root.join(&resolved))? {
            return Ok(None);
        }
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                descended = true;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Ok(None);
                }
            }
            Component::RootDir | Component::Prefix(_) => return Ok(None),
        }
    }
    Ok(Some(resolved))
}

/// Whether `relative` names a regular file under `root` reached without
/// following any symlink
pub(crate) fn contained_regular_file(root: &Path, relative: &Path) -> Result<bool> {
    if relative.as_os_str().is_empty() {
        return Ok(false);
    }
    let depth = relative.components().count();
    if symlink_in_chain(root, relative, depth)? {
        return Ok(false);
    }
    match std::fs::symlink_metadata(root.join(relative)) {
        Ok(m) => Ok(m.file_type().is_file()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(UnpackError::io(Stage::Extract, root.join(relative), e)),
    }
}

/// Remove symlinks under `root` that no longer resolve inside it.
///
/// A link can be contained when written and escape once a later entry turns
/// one of its intermediate components into a symlink. Returns how many were removed.
pub(crate) fn prune_escaping_links(root: &Path) -> Result<usize> {
    let mut links = Vec::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|e| UnpackError::io(Stage::Seal, root, io::Error::other(e)))?;
        if entry.path_is_symlink() {
            links.push(entry.into_path());
        }
    }

    let mut removed = 0;
    for path in links {
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let target = std::fs::read_link(&path).map_err(|e| UnpackError::io(Stage::Seal, &path, e))?;
        if contained_link_target(root, relative, &target)?.is_none() {
            tracing::warn!(
                path = %relative.display(),
                target = %target.display(),
                "Removing symlink that resolves outside the destination"
            );
            std::fs::remove_file(&path).map_err(|e| UnpackError::io(Stage::Seal, &path, e))?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Run blocking filesystem work off the async workers.
///
/// `path` only labels the error if the task dies.
pub(crate) async fn run_blocking<T, F>(stage: Stage, path: &Path, work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| UnpackError::io(stage, path, io::Error::other(e)))?
}

/// Permission bits from an archive header, with a floor applied
pub(crate) fn effective_mode(header_mode: u32, floor: u32) -> u32 {
    (header_mode & 0o777) | floor
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub(crate) fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    std::fs::set_permissions(path, perms)
}

/// Create a new file with the given mode, ready for writing
pub(crate) fn create_file(path: &Path, mode: u32) -> io::Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    options.open(path)
}

/// Remove the write bits from every file and directory under `root`
pub(crate) fn seal_read_only(root: &Path) -> io::Result<()> {
    for entry in WalkDir::new(root).contents_first(true) {
        let entry = entry.map_err(io::Error::other)?;
        if entry.path_is_symlink() {
            continue;
        }
        let metadata = entry.metadata().map_err(io::Error::other)?;
        let mode = permission_bits(&metadata) & !0o222;
        set_mode(entry.path(), mode)?;
    }
    Ok(())
}

#[cfg(unix)]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() { 0o555 } else { 0o755 }
}

/// Delete a tree, including one that was sealed read-only
pub(crate) fn delete_recursive(path: &Path) -> io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !metadata.is_dir() {
        return std::fs::remove_file(path);
    }

    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_dir() {
            let mode = permission_bits(&entry.metadata().map_err(io::Error::other)?);
            set_mode(entry.path(), mode | MIN_DIR_MODE)?;
        }
    }
    std::fs::remove_dir_all(path)
}

/// Remove whatever sits at `path` (file, link or directory), if anything
pub(crate) fn remove_existing(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => delete_recursive(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
