//! Image layer composition
//!
//! Layers are applied bottom to top into one staging directory:
//! - `.wh.<name>` removes `<name>` from lower layers
//! - `.wh..wh..opq` hides every lower-layer child of its directory
//! - any other entry is created, replacing what lower layers left there

use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tar::{Archive, EntryType};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::archive::{LinkKind, create_directory, invalid_archive, materialize_link, write_file};
use crate::bundle::{DigestAlgorithm, check_digest};
use crate::cache::{BundleGuard, CacheManager};
use crate::config::LinkPolicy;
use crate::download::bounded;
use crate::error::{Result, Stage, UnpackError};
use crate::fs::{
    MIN_DIR_MODE, MIN_FILE_MODE, effective_mode, ensure_no_symlink_ancestors,
    prune_escaping_links, relative_entry_path, remove_existing, run_blocking,
};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// One layer blob as listed in the image manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    pub digest: String,
    pub media_type: String,
    pub size: i64,
}

/// An image reference pinned to a manifest digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    /// `registry/repository@digest`
    pub reference: String,
    /// Manifest digest, also the unpack directory name
    pub digest: String,
    /// Layers, lowest first
    pub layers: Vec<LayerDescriptor>,
}

/// Where image manifests and layer blobs come from
#[async_trait]
pub trait LayerSource: Send + Sync {
    /// Resolve the reference to a manifest digest and its layers
    async fn resolve(&self) -> Result<ResolvedImage>;

    /// Stream one compressed layer blob into `out`
    async fn fetch_layer(
        &self,
        layer: &LayerDescriptor,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()>;
}

/// What one layer did to the tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerStats {
    pub entries: usize,
    pub whiteouts: usize,
    pub skipped: usize,
}

/// Decompressing reader for a layer blob, chosen by media type
pub fn layer_reader<'a, R: Read + 'a>(media_type: &str, data: R) -> Result<Box<dyn Read + 'a>> {
    if media_type.ends_with("gzip") {
        Ok(Box::new(GzDecoder::new(data)))
    } else if media_type.ends_with("+zstd") {
        let decoder = zstd::stream::read::Decoder::new(data).map_err(invalid_archive)?;
        Ok(Box::new(decoder))
    } else if media_type.ends_with("tar") {
        Ok(Box::new(data))
    } else {
        Err(UnpackError::UnsupportedMediaType {
            media_type: media_type.to_string(),
        })
    }
}

/// Applies image layers onto a root filesystem
#[derive(Debug, Clone, Default)]
pub struct LayerUnpacker {
    link_policy: LinkPolicy,
}

impl LayerUnpacker {
    pub fn new(link_policy: LinkPolicy) -> Self {
        Self { link_policy }
    }

    /// Resolve, fetch and apply every layer, then seal the result under
    /// `<cache>/<bundle>/<digest>`.
    ///
    /// Blobs are spooled to an unnamed temporary file next to the staging
    /// tree and applied on the blocking pool. Any failure discards the
    /// partial tree.
    pub async fn unpack(
        &self,
        source: &dyn LayerSource,
        cache: &CacheManager,
        guard: &BundleGuard,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<(PathBuf, ResolvedImage)> {
        let image = bounded(Stage::Resolve, timeout, cancel, source.resolve()).await?;

        if let Some(existing) = cache.existing(guard, &image.digest) {
            tracing::debug!(bundle = %guard.bundle(), digest = %image.digest, "Image already unpacked");
            return Ok((existing, image));
        }

        let mut staging = cache.stage(guard, &image.digest)?;
        let staging_path = staging.path().to_path_buf();
        let spool_dir = cache.bundle_path(guard.bundle());
        // Stops a running layer task if this future is dropped
        let task_cancel = cancel.child_token();
        let _stop_on_drop = task_cancel.clone().drop_guard();

        for (index, layer) in image.layers.iter().enumerate() {
            let blob = tempfile::tempfile_in(&spool_dir)
                .map_err(|e| UnpackError::io(Stage::FetchLayer, &spool_dir, e))?;
            let writer = blob
                .try_clone()
                .map_err(|e| UnpackError::io(Stage::FetchLayer, &spool_dir, e))?;
            let mut writer = tokio::fs::File::from_std(writer);
            bounded(Stage::FetchLayer, timeout, cancel, async {
                source.fetch_layer(layer, &mut writer).await?;
                writer
                    .flush()
                    .await
                    .map_err(|e| UnpackError::io(Stage::FetchLayer, &spool_dir, e))
            })
            .await?;
            drop(writer);

            let unpacker = self.clone();
            let descriptor = layer.clone();
            let token = task_cancel.clone();
            let (returned, stats) = run_blocking(Stage::ApplyLayer, &staging_path, move || {
                let stats = unpacker.apply_blob(&descriptor, blob, staging.path(), &token)?;
                Ok((staging, stats))
            })
            .await?;
            staging = returned;
            tracing::info!(
                bundle = %guard.bundle(),
                layer = index,
                digest = %layer.digest,
                entries = stats.entries,
                whiteouts = stats.whiteouts,
                "Applied layer"
            );
        }

        let link_policy = self.link_policy;
        let root = run_blocking(Stage::Seal, &staging_path, move || {
            if link_policy == LinkPolicy::Preserve {
                prune_escaping_links(staging.path())?;
            }
            staging.commit()
        })
        .await?;
        tracing::info!(
            bundle = %guard.bundle(),
            reference = %image.reference,
            layers = image.layers.len(),
            "Unpacked image"
        );
        Ok((root, image))
    }

    /// Verify a layer blob against its descriptor and apply it.
    ///
    /// The blob is read twice: once to hash it, once to unpack it.
    pub fn apply_blob<B: Read + Seek>(
        &self,
        layer: &LayerDescriptor,
        mut blob: B,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<LayerStats> {
        let algorithm = DigestAlgorithm::of(&layer.digest)?;
        let rewind = |blob: &mut B| {
            blob.seek(SeekFrom::Start(0))
                .map_err(|e| UnpackError::io(Stage::ApplyLayer, root, e))
        };

        rewind(&mut blob)?;
        let actual = algorithm
            .digest_reader(&mut blob)
            .map_err(|e| UnpackError::io(Stage::ApplyLayer, root, e))?;
        check_digest(&format!("layer {}", layer.digest), &layer.digest, actual)?;

        rewind(&mut blob)?;
        let reader = layer_reader(&layer.media_type, BufReader::new(blob))?;
        self.apply_layer(reader, root, cancel)
    }

    /// Apply one uncompressed tar stream on top of `root`.
    ///
    /// Returns [`UnpackError::Cancelled`] at the next entry once `cancel` fires.
    pub fn apply_layer<R: Read>(
        &self,
        reader: R,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<LayerStats> {
        let mut archive = Archive::new(reader);
        let mut stats = LayerStats::default();
        // Paths (and their ancestors) written by this layer
        let mut touched: HashSet<PathBuf> = HashSet::new();

        for entry in archive.entries().map_err(invalid_layer)? {
            if cancel.is_cancelled() {
                return Err(UnpackError::Cancelled);
            }
            let mut entry = entry.map_err(invalid_layer)?;
            let raw = entry.path().map_err(invalid_layer)?.into_owned();
            let path = relative_entry_path(&raw)?;
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
            ensure_no_symlink_ancestors(root, &path)?;

            if name == OPAQUE_WHITEOUT {
                clear_lower_children(root, &parent, &touched)?;
                stats.whiteouts += 1;
                continue;
            }

            if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                let hidden = relative_entry_path(&parent.join(hidden))?;
                if hidden == parent {
                    return Err(UnpackError::InvalidArchive {
                        message: format!("malformed whiteout entry {}", raw.display()),
                    });
                }
                let target = root.join(&hidden);
                remove_existing(&target).map_err(|e| UnpackError::io(Stage::ApplyLayer, &target, e))?;
                stats.whiteouts += 1;
                continue;
            }

            let target = root.join(&path);
            let entry_type = entry.header().entry_type();
            match entry_type {
                EntryType::Directory => {
                    let mode = entry.header().mode().map_err(invalid_layer)?;
                    create_directory(&target, effective_mode(mode, MIN_DIR_MODE))?;
                }
                EntryType::Regular | EntryType::Continuous => {
                    let mode = entry.header().mode().map_err(invalid_layer)?;
                    write_file(&mut entry, &target, effective_mode(mode, MIN_FILE_MODE), cancel)?;
                }
                EntryType::Symlink | EntryType::Link => {
                    let link_name = entry
                        .link_name()
                        .map_err(invalid_layer)?
                        .map(|l| l.into_owned())
                        .unwrap_or_default();
                    let kind = if entry_type == EntryType::Symlink {
                        LinkKind::Symbolic(link_name)
                    } else {
                        LinkKind::Hard(relative_entry_path(&link_name)?)
                    };
                    if !materialize_link(root, &path, kind, self.link_policy)? {
                        stats.skipped += 1;
                        continue;
                    }
                }
                other => {
                    tracing::debug!(path = %raw.display(), entry_type = ?other, "Skipping unsupported entry type in layer");
                    stats.skipped += 1;
                    continue;
                }
            }

            for ancestor in path.ancestors().filter(|a| !a.as_os_str().is_empty()) {
                if !touched.insert(ancestor.to_path_buf()) {
                    break;
                }
            }
            stats.entries += 1;
        }

        Ok(stats)
    }
}

/// Remove the children of `dir` that this layer has not written
fn clear_lower_children(root: &Path, dir: &Path, touched: &HashSet<PathBuf>) -> Result<()> {
    let abs = root.join(dir);
    let entries = match std::fs::read_dir(&abs) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(UnpackError::io(Stage::ApplyLayer, &abs, e)),
    };

    for entry in entries {
        let entry = entry.map_err(|e| UnpackError::io(Stage::ApplyLayer, &abs, e))?;
        let child = dir.join(entry.file_name());
        if touched.contains(&child) {
            continue;
        }
        let path = entry.path();
        remove_existing(&path).map_err(|e| UnpackError::io(Stage::ApplyLayer, &path, e))?;
    }
    Ok(())
}

fn invalid_layer(e: std::io::Error) -> UnpackError {
    UnpackError::InvalidArchive {
        message: format!("layer: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::compute_digest;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tar::{Builder, Header};
    use tempfile::TempDir;

    fn tar_layer(entries: &[(&str, Option<&str>)]) -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        for (path, content) in entries {
            let mut header = Header::new_gnu();
            match content {
                Some(content) => {
                    header.set_size(content.len() as u64);
                    header.set_mode(0o644);
                    header.set_cksum();
                    builder.append_data(&mut header, path, content.as_bytes()).unwrap();
                }
                None => {
                    header.set_entry_type(EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    header.set_cksum();
                    builder.append_data(&mut header, path, std::io::empty()).unwrap();
                }
            }
        }
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn descriptor(blob: &[u8]) -> LayerDescriptor {
        LayerDescriptor {
            digest: compute_digest(blob),
            media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
            size: blob.len() as i64,
        }
    }

    fn apply(root: &Path, entries: &[(&str, Option<&str>)]) -> LayerStats {
        LayerUnpacker::default()
            .apply_layer(&tar_layer(entries)[..], root, &CancellationToken::new())
            .unwrap()
    }

    #[test]
    fn test_upper_layer_replaces_file() {
        let temp = TempDir::new().unwrap();
        apply(temp.path(), &[("etc/", None), ("etc/motd", Some("base"))]);
        apply(temp.path(), &[("etc/motd", Some("app"))]);

        assert_eq!(std::fs::read_to_string(temp.path().join("etc/motd")).unwrap(), "app");
    }

    #[test]
    fn test_whiteout_removes_lower_entry() {
        let temp = TempDir::new().unwrap();
        apply(temp.path(), &[("etc/", None), ("etc/passwd", Some("x")), ("etc/group", Some("y"))]);

        let stats = apply(temp.path(), &[("etc/.wh.passwd", Some(""))]);

        assert_eq!(stats.whiteouts, 1);
        assert!(!temp.path().join("etc/passwd").exists());
        assert!(!temp.path().join("etc/.wh.passwd").exists());
        assert!(temp.path().join("etc/group").exists());
    }

    #[test]
    fn test_whiteout_of_directory() {
        let temp = TempDir::new().unwrap();
        apply(temp.path(), &[("var/cache/", None), ("var/cache/a", Some("a"))]);
        apply(temp.path(), &[("var/.wh.cache", Some(""))]);

        assert!(!temp.path().join("var/cache").exists());
        assert!(temp.path().join("var").is_dir());
    }

    #[test]
    fn test_opaque_whiteout_keeps_only_current_layer() {
        let temp = TempDir::new().unwrap();
        apply(temp.path(), &[("app/", None), ("app/old.txt", Some("old")), ("app/lib/", None)]);

        // Marker after a sibling from the same layer
        apply(
            temp.path(),
            &[("app/", None), ("app/new.txt", Some("new")), ("app/.wh..wh..opq", Some(""))],
        );

        let mut names: Vec<_> = std::fs::read_dir(temp.path().join("app"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["new.txt"]);
    }

    #[test]
    fn test_whiteout_cannot_escape_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(temp.path().join("outside"), "keep").unwrap();

        let result = LayerUnpacker::default().apply_layer(
            &tar_layer(&[(".wh...", Some(""))])[..],
            &root,
            &CancellationToken::new(),
        );

        assert!(result.is_err());
        assert!(temp.path().join("outside").exists());
    }

    #[test]
    fn test_layer_reader_media_types() {
        let layer = tar_layer(&[("hello.txt", Some("hi"))]);
        let gz = gzip(&layer);
        let zst = zstd::encode_all(&layer[..], 0).unwrap();

        for (media_type, blob) in [
            ("application/vnd.oci.image.layer.v1.tar", &layer),
            ("application/vnd.oci.image.layer.v1.tar+gzip", &gz),
            ("application/vnd.docker.image.rootfs.diff.tar.gzip", &gz),
            ("application/vnd.oci.image.layer.v1.tar+zstd", &zst),
        ] {
            let temp = TempDir::new().unwrap();
            let reader = layer_reader(media_type, &blob[..]).unwrap();
            LayerUnpacker::default()
                .apply_layer(reader, temp.path(), &CancellationToken::new())
                .unwrap();
            assert_eq!(std::fs::read_to_string(temp.path().join("hello.txt")).unwrap(), "hi");
        }

        let err = layer_reader("application/vnd.oci.image.config.v1+json", &layer[..])
            .err()
            .unwrap();
        assert!(matches!(err, UnpackError::UnsupportedMediaType { .. }));
    }

    #[test]
    fn test_apply_blob_verifies_digest() {
        let temp = TempDir::new().unwrap();
        let blob = gzip(&tar_layer(&[("a", Some("a"))]));
        let mut layer = descriptor(&blob);
        layer.digest = compute_digest(b"something else");

        let err = LayerUnpacker::default()
            .apply_blob(&layer, Cursor::new(&blob), temp.path(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, UnpackError::DigestMismatch { .. }));
        assert!(!temp.path().join("a").exists());
    }

    #[test]
    fn test_apply_blob_accepts_sha512_descriptor() {
        use sha2::{Digest, Sha512};

        let temp = TempDir::new().unwrap();
        let blob = gzip(&tar_layer(&[("a", Some("a"))]));
        let mut layer = descriptor(&blob);
        layer.digest = format!("sha512:{}", hex::encode(Sha512::digest(&blob)));

        let stats = LayerUnpacker::default()
            .apply_blob(&layer, Cursor::new(&blob), temp.path(), &CancellationToken::new())
            .unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(std::fs::read_to_string(temp.path().join("a")).unwrap(), "a");

        layer.digest = format!("sha512:{}", hex::encode(Sha512::digest(b"other")));
        let err = LayerUnpacker::default()
            .apply_blob(&layer, Cursor::new(&blob), temp.path(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, UnpackError::DigestMismatch { .. }));
    }

    #[test]
    fn test_apply_blob_rejects_unknown_digest_algorithm() {
        let temp = TempDir::new().unwrap();
        let blob = gzip(&tar_layer(&[("a", Some("a"))]));
        let mut layer = descriptor(&blob);
        layer.digest = "md5:0cc175b9c0f1b6a831c399e269772661".to_string();

        let err = LayerUnpacker::default()
            .apply_blob(&layer, Cursor::new(&blob), temp.path(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, UnpackError::UnsupportedDigest { .. }));
        assert!(err.is_terminal());
        assert!(!temp.path().join("a").exists());
    }

    #[test]
    fn test_cancelled_layer_stops_before_next_entry() {
        let temp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = LayerUnpacker::default()
            .apply_layer(&tar_layer(&[("one", Some("1")), ("two", Some("2"))])[..], temp.path(), &cancel)
            .unwrap_err();

        assert!(matches!(err, UnpackError::Cancelled));
        assert!(!temp.path().join("one").exists());
    }

    /// In-memory image with an optional failing layer
    struct StaticImage {
        layers: Vec<(LayerDescriptor, Vec<u8>)>,
        fail_at: Option<usize>,
        fetched: AtomicUsize,
    }

    impl StaticImage {
        fn new(layers: &[Vec<u8>]) -> Self {
            Self {
                layers: layers.iter().map(|b| (descriptor(b), b.clone())).collect(),
                fail_at: None,
                fetched: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LayerSource for StaticImage {
        async fn resolve(&self) -> Result<ResolvedImage> {
            Ok(ResolvedImage {
                reference: "registry.test/app@sha256:feed".to_string(),
                digest: "sha256:feed".to_string(),
                layers: self.layers.iter().map(|(d, _)| d.clone()).collect(),
            })
        }

        async fn fetch_layer(
            &self,
            layer: &LayerDescriptor,
            out: &mut (dyn AsyncWrite + Send + Unpin),
        ) -> Result<()> {
            let index = self.fetched.fetch_add(1, Ordering::SeqCst);
            if self.fail_at == Some(index) {
                return Err(UnpackError::Transport {
                    stage: Stage::FetchLayer,
                    message: "connection reset".to_string(),
                });
            }
            let (_, blob) = self
                .layers
                .iter()
                .find(|(d, _)| d == layer)
                .unwrap();
            out.write_all(blob).await.unwrap();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unpack_composes_layers() {
        let temp = TempDir::new().unwrap();
        let cache = CacheManager::new(temp.path());
        let guard = cache.lock("app").await;
        let image = StaticImage::new(&[
            gzip(&tar_layer(&[("bin/", None), ("bin/sh", Some("v1")), ("tmp.txt", Some("t"))])),
            gzip(&tar_layer(&[("bin/sh", Some("v2")), (".wh.tmp.txt", Some(""))])),
        ]);

        let (root, resolved) = LayerUnpacker::default()
            .unpack(&image, &cache, &guard, &CancellationToken::new(), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(root, cache.unpack_path("app", "sha256:feed"));
        assert_eq!(resolved.reference, "registry.test/app@sha256:feed");
        assert_eq!(std::fs::read_to_string(root.join("bin/sh")).unwrap(), "v2");
        assert!(!root.join("tmp.txt").exists());
        assert!(std::fs::metadata(root.join("bin/sh")).unwrap().permissions().readonly());
    }

    #[tokio::test]
    async fn test_failed_layer_leaves_no_directory() {
        let temp = TempDir::new().unwrap();
        let cache = CacheManager::new(temp.path());
        let guard = cache.lock("app").await;
        let mut image = StaticImage::new(&[
            gzip(&tar_layer(&[("one", Some("1"))])),
            gzip(&tar_layer(&[("two", Some("2"))])),
            gzip(&tar_layer(&[("three", Some("3"))])),
        ]);
        image.fail_at = Some(1);

        let err = LayerUnpacker::default()
            .unpack(&image, &cache, &guard, &CancellationToken::new(), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(cache.existing(&guard, "sha256:feed").is_none());
        let leftovers: Vec<_> = std::fs::read_dir(cache.bundle_path("app")).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_fetch() {
        let temp = TempDir::new().unwrap();
        let cache = CacheManager::new(temp.path());
        let guard = cache.lock("app").await;
        let image = StaticImage::new(&[gzip(&tar_layer(&[("one", Some("1"))]))]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = LayerUnpacker::default()
            .unpack(&image, &cache, &guard, &cancel, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, UnpackError::Cancelled));
        assert!(cache.existing(&guard, "sha256:feed").is_none());
    }
}
