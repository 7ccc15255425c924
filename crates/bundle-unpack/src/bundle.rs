//! Bundle descriptors, pull results and unpack results

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::Archive;

use crate::archive::invalid_archive;
use crate::error::{Result, UnpackError};

/// Kind of content a bundle reference points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleType {
    /// A Helm chart archive, over HTTP(S) or from an OCI registry
    Chart,
    /// A layered OCI image
    Image,
}

/// Bundle descriptor supplied by the caller for one unpack attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleSource {
    /// Bundle name, used as the per-bundle cache directory
    pub name: String,

    /// Chart or image
    #[serde(rename = "type")]
    pub bundle_type: BundleType,

    /// Chart URL (`https://`, `oci://`) or image reference
    pub reference: String,

    /// Expected `sha256:<hex>` of a chart archive (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl BundleSource {
    /// Describe a chart bundle
    pub fn chart(name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bundle_type: BundleType::Chart,
            reference: reference.into(),
            digest: None,
        }
    }

    /// Describe an image bundle
    pub fn image(name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bundle_type: BundleType::Image,
            reference: reference.into(),
            digest: None,
        }
    }

    /// Pin the expected archive digest
    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// Check the descriptor before anything touches disk or network
    pub fn validate(&self) -> Result<()> {
        if !is_single_component(&self.name) {
            return Err(UnpackError::InvalidBundle {
                message: format!(
                    "bundle name '{}' must be a non-empty single path component",
                    self.name
                ),
            });
        }
        if self.reference.trim().is_empty() {
            return Err(UnpackError::InvalidBundle {
                message: format!("bundle '{}' has an empty reference", self.name),
            });
        }
        Ok(())
    }
}

/// Whether `name` can be used as exactly one directory name
pub(crate) fn is_single_component(name: &str) -> bool {
    if name.is_empty() || name.contains('/') || name.contains('\\') {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Lifecycle state reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnpackState {
    Unpacked,
    Failed,
}

/// Outcome of one unpack attempt
#[derive(Debug, Clone)]
pub struct UnpackResult {
    /// Root of the sealed, read-only tree (empty when failed)
    pub filesystem_root: PathBuf,
    /// Canonical reference of what was unpacked
    pub resolved_source: BundleSource,
    pub state: UnpackState,
    pub message: String,
}

impl UnpackResult {
    /// Successful result
    pub fn unpacked(root: PathBuf, resolved_source: BundleSource) -> Self {
        let message = format!("unpacked {:?} successfully", resolved_source.reference);
        Self {
            filesystem_root: root,
            resolved_source,
            state: UnpackState::Unpacked,
            message,
        }
    }

    /// Failed result carrying the error text
    pub fn failed(source: &BundleSource, error: &UnpackError) -> Self {
        Self {
            filesystem_root: PathBuf::new(),
            resolved_source: source.clone(),
            state: UnpackState::Failed,
            message: error.to_string(),
        }
    }

    pub fn is_unpacked(&self) -> bool {
        self.state == UnpackState::Unpacked
    }
}

/// Raw chart bytes as returned by a downloader.
///
/// Consumed by the archive unpacker; never stored.
#[derive(Debug)]
pub struct PullResult {
    /// Archive bytes, verbatim
    pub raw: Vec<u8>,
    /// `Chart.yaml` contents, when parsed
    pub metadata: Option<ChartMetadata>,
    /// Name of the unpack directory
    pub filename: String,
}

impl PullResult {
    /// Parse `Chart.yaml` out of the archive and require it to be valid
    pub fn load_chart_metadata(&mut self) -> Result<&ChartMetadata> {
        let metadata = ChartMetadata::from_archive(&self.raw)?;
        metadata.validate()?;
        Ok(self.metadata.insert(metadata))
    }
}

/// The fields of `Chart.yaml` this crate cares about
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

impl ChartMetadata {
    /// Read `Chart.yaml` from a gzipped chart archive.
    ///
    /// The file is accepted at the archive root or one folder deep.
    pub fn from_archive(data: &[u8]) -> Result<Self> {
        let gz = GzDecoder::new(std::io::Cursor::new(data));
        let mut archive = Archive::new(gz);

        let entries = archive.entries().map_err(invalid_archive)?;
        for entry in entries {
            let mut entry = entry.map_err(invalid_archive)?;
            let path = entry.path().map_err(invalid_archive)?.into_owned();
            let names: Vec<_> = path
                .components()
                .filter_map(|c| match c {
                    Component::Normal(n) => Some(n),
                    _ => None,
                })
                .collect();

            let is_chart_yaml = match names.as_slice() {
                [file] | [_, file] => *file == "Chart.yaml",
                _ => false,
            };
            if !is_chart_yaml {
                continue;
            }

            let mut content = String::new();
            entry
                .read_to_string(&mut content)
                .map_err(invalid_archive)?;
            return serde_yaml::from_str(&content).map_err(|e| UnpackError::InvalidArchive {
                message: format!("Chart.yaml: {}", e),
            });
        }

        Err(UnpackError::InvalidArchive {
            message: "archive does not contain a Chart.yaml".to_string(),
        })
    }

    /// Require name and version
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(UnpackError::InvalidArchive {
                message: "Chart.yaml: name is required".to_string(),
            });
        }
        if self.version.trim().is_empty() {
            return Err(UnpackError::InvalidArchive {
                message: "Chart.yaml: version is required".to_string(),
            });
        }
        Ok(())
    }

    /// Conventional archive name, `<name>-<version>.tgz`
    pub fn archive_name(&self) -> String {
        format!("{}-{}.tgz", self.name, self.version)
    }
}

/// Hash algorithm named by an `algorithm:hex` digest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    /// Algorithm of `digest`. Bare hex is taken as sha256.
    pub fn of(digest: &str) -> Result<Self> {
        match digest.trim().split_once([':', '-']) {
            None => Ok(DigestAlgorithm::Sha256),
            Some((algorithm, _)) if algorithm.eq_ignore_ascii_case("sha256") => {
                Ok(DigestAlgorithm::Sha256)
            }
            Some((algorithm, _)) if algorithm.eq_ignore_ascii_case("sha512") => {
                Ok(DigestAlgorithm::Sha512)
            }
            Some(_) => Err(UnpackError::UnsupportedDigest {
                digest: digest.to_string(),
            }),
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    /// Prefixed digest of `data`
    pub fn digest(self, data: &[u8]) -> String {
        let hex = match self {
            DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
            DigestAlgorithm::Sha512 => hex::encode(Sha512::digest(data)),
        };
        format!("{}:{}", self.prefix(), hex)
    }

    /// Prefixed digest of everything `reader` yields
    pub fn digest_reader<R: Read>(self, reader: R) -> std::io::Result<String> {
        let hex = match self {
            DigestAlgorithm::Sha256 => hash_reader::<Sha256, R>(reader)?,
            DigestAlgorithm::Sha512 => hash_reader::<Sha512, R>(reader)?,
        };
        Ok(format!("{}:{}", self.prefix(), hex))
    }
}

fn hash_reader<D: Digest + std::io::Write, R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = D::new();
    std::io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 digest of data
pub fn compute_digest(data: &[u8]) -> String {
    DigestAlgorithm::Sha256.digest(data)
}

/// Check if two digests match (supports various formats)
pub fn digest_matches(expected: &str, actual: &str) -> bool {
    let normalize = |d: &str| {
        let d = d.trim().to_ascii_lowercase().replacen('-', ":", 1);
        if d.contains(':') { d } else { format!("sha256:{}", d) }
    };
    normalize(expected) == normalize(actual)
}

/// Verify `data` against an expected digest, hashed with the algorithm the
/// digest names
pub fn verify_digest(subject: &str, expected: &str, data: &[u8]) -> Result<()> {
    let actual = DigestAlgorithm::of(expected)?.digest(data);
    check_digest(subject, expected, actual)
}

pub(crate) fn check_digest(subject: &str, expected: &str, actual: String) -> Result<()> {
    if digest_matches(expected, &actual) {
        Ok(())
    } else {
        Err(UnpackError::DigestMismatch {
            subject: subject.to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn chart_archive(files: &[(&str, &str)]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_validate_bundle_name() {
        assert!(BundleSource::chart("nginx", "https://x/nginx-1.0.0.tgz").validate().is_ok());
        assert!(BundleSource::chart("", "https://x/a.tgz").validate().is_err());
        assert!(BundleSource::chart("..", "https://x/a.tgz").validate().is_err());
        assert!(BundleSource::chart("a/b", "https://x/a.tgz").validate().is_err());
        assert!(BundleSource::chart("nginx", "  ").validate().is_err());
    }

    #[test]
    fn test_chart_metadata_from_archive() {
        let data = chart_archive(&[
            ("metrics-server/Chart.yaml", "apiVersion: v2\nname: metrics-server\nversion: 3.12.0\nappVersion: 0.7.0\n"),
            ("metrics-server/values.yaml", "replicas: 1\n"),
        ]);

        let metadata = ChartMetadata::from_archive(&data).unwrap();
        assert_eq!(metadata.name, "metrics-server");
        assert_eq!(metadata.version, "3.12.0");
        assert_eq!(metadata.app_version.as_deref(), Some("0.7.0"));
        assert_eq!(metadata.archive_name(), "metrics-server-3.12.0.tgz");
    }

    #[test]
    fn test_nested_chart_yaml_is_ignored() {
        let data = chart_archive(&[
            ("parent/charts/child/Chart.yaml", "name: child\nversion: 1.0.0\n"),
        ]);
        assert!(ChartMetadata::from_archive(&data).is_err());
    }

    #[test]
    fn test_pull_result_requires_valid_metadata() {
        let mut pull = PullResult {
            raw: chart_archive(&[("chart/Chart.yaml", "apiVersion: v2\nname: demo\n")]),
            metadata: None,
            filename: "demo.tgz".to_string(),
        };
        let err = pull.load_chart_metadata().unwrap_err();
        assert!(err.to_string().contains("version is required"));
    }

    #[test]
    fn test_not_gzip_is_invalid_archive() {
        let err = ChartMetadata::from_archive(b"definitely not gzip").unwrap_err();
        assert!(matches!(err, UnpackError::InvalidArchive { .. }));
    }

    #[test]
    fn test_compute_digest() {
        let digest = compute_digest(b"hello world");
        assert!(digest.starts_with("sha256:"));
        assert_eq!(digest.len(), 7 + 64);
    }

    #[test]
    fn test_digest_matches() {
        assert!(digest_matches("sha256:abc123", "sha256:ABC123"));
        assert!(digest_matches("sha256:abc123", "abc123"));
        assert!(digest_matches("sha256:abc123", "sha256-abc123"));
        assert!(!digest_matches("sha256:abc123", "sha256:xyz789"));
    }

    #[test]
    fn test_digest_algorithm_from_prefix() {
        assert_eq!(DigestAlgorithm::of("sha256:abc").unwrap(), DigestAlgorithm::Sha256);
        assert_eq!(DigestAlgorithm::of("SHA512:abc").unwrap(), DigestAlgorithm::Sha512);
        assert_eq!(DigestAlgorithm::of("sha512-abc").unwrap(), DigestAlgorithm::Sha512);
        assert_eq!(DigestAlgorithm::of("abc123").unwrap(), DigestAlgorithm::Sha256);

        let err = DigestAlgorithm::of("md5:abc").unwrap_err();
        assert!(matches!(err, UnpackError::UnsupportedDigest { .. }));
        assert!(err.is_terminal());
    }

    #[test]
    fn test_verify_sha512_digest() {
        let expected = DigestAlgorithm::Sha512.digest(b"payload");
        assert!(expected.starts_with("sha512:"));
        assert_eq!(expected.len(), 7 + 128);
        assert!(verify_digest("blob", &expected, b"payload").is_ok());
        assert!(matches!(
            verify_digest("blob", &expected, b"other"),
            Err(UnpackError::DigestMismatch { .. })
        ));

        let streamed = DigestAlgorithm::Sha512.digest_reader(&b"payload"[..]).unwrap();
        assert_eq!(streamed, expected);
    }

    #[test]
    fn test_verify_digest_mismatch() {
        let err = verify_digest("demo.tgz", "sha256:00", b"payload").unwrap_err();
        assert!(matches!(err, UnpackError::DigestMismatch { .. }));
        assert!(verify_digest("demo.tgz", &compute_digest(b"payload"), b"payload").is_ok());
    }

    #[test]
    fn test_failed_result() {
        let source = BundleSource::image("app", "quay.io/org/app:v1");
        let err = UnpackError::Cancelled;
        let result = UnpackResult::failed(&source, &err);
        assert_eq!(result.state, UnpackState::Failed);
        assert!(!result.is_unpacked());
        assert_eq!(result.message, "Operation cancelled");
    }
}
