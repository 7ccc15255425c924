//! OCI registry access
//!
//! Pulls Helm charts stored as OCI artifacts and resolves container images
//! into their layer descriptors.

use async_trait::async_trait;
use oci_distribution::Reference;
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::RegistryOperation;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tokio::io::AsyncWrite;

use crate::bundle::{PullResult, verify_digest};
use crate::credentials::RegistryCredentials;
use crate::error::{Result, Stage, UnpackError, registry_error};
use crate::layers::{LayerDescriptor, LayerSource, ResolvedImage};
use crate::tls::TransportClients;

/// Media types for Helm charts and image layers in OCI
pub mod media_types {
    /// Helm chart config
    pub const HELM_CONFIG: &str = "application/vnd.cncf.helm.config.v1+json";
    /// Helm chart content layer
    pub const HELM_CONTENT: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";
    /// Chart content pushed by older Helm releases
    pub const HELM_CONTENT_LEGACY: &str = "application/tar+gzip";
    /// Helm chart provenance layer
    pub const HELM_PROVENANCE: &str = "application/vnd.cncf.helm.chart.provenance.v1.prov";

    pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
    pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
}

static CHART_ARCHIVE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<base>.*)-(?P<ver>[0-9.]+)\.tgz$").expect("valid regex")
});

/// Rewrite a Helm-style `name-1.2.3.tgz` reference into `name:1.2.3`.
///
/// Anything that does not end in a versioned `.tgz` is returned unchanged.
pub fn chart_name_converter(reference: &str) -> String {
    match CHART_ARCHIVE_NAME.captures(reference) {
        Some(caps) => format!("{}:{}", &caps["base"], &caps["ver"]),
        None => reference.to_string(),
    }
}

/// Registry host of a reference without scheme: everything before the first `/`
pub fn registry_host(reference: &str) -> Result<&str> {
    let invalid = |reason: &str| UnpackError::InvalidReference {
        reference: reference.to_string(),
        reason: reason.to_string(),
    };

    let (host, _) = reference
        .split_once('/')
        .ok_or_else(|| invalid("missing registry host"))?;
    if host.is_empty()
        || !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '.'))
    {
        return Err(invalid("malformed registry host"));
    }
    Ok(host)
}

fn parse_reference(reference: &str) -> Result<Reference> {
    reference
        .parse::<Reference>()
        .map_err(|e| UnpackError::InvalidReference {
            reference: reference.to_string(),
            reason: e.to_string(),
        })
}

/// Downloads a chart stored as an OCI artifact
#[derive(Debug, Clone)]
pub struct OciDownloader {
    reference: Reference,
    host: String,
    credentials: RegistryCredentials,
}

impl OciDownloader {
    /// `reference` may carry the `oci://` scheme; it is stripped here
    pub fn new(reference: &str, credentials: RegistryCredentials) -> Result<Self> {
        let stripped = strip_oci_scheme(reference);
        let converted = chart_name_converter(stripped);
        let host = registry_host(&converted)?.to_string();
        let reference = parse_reference(&converted)?;

        Ok(Self {
            reference,
            host,
            credentials,
        })
    }

    /// Normalized reference, e.g. `localhost:5000/metrics-server:3.12.0`
    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Log in, pull the manifest and return the chart content layer.
    ///
    /// The filename is derived from the chart's own metadata.
    pub async fn fetch(&self, clients: &TransportClients) -> Result<PullResult> {
        clients.ensure_registry_trust()?;
        let auth = self.credentials.to_registry_auth();
        let registry = clients.registry();

        tracing::debug!(host = %self.host, reference = %self.reference, "Authenticating to registry");
        registry
            .auth(&self.reference, &auth, RegistryOperation::Pull)
            .await
            .map_err(|e| registry_error(Stage::Authenticate, e))?;

        let image = registry
            .pull(
                &self.reference,
                &auth,
                vec![
                    media_types::HELM_CONFIG,
                    media_types::HELM_CONTENT,
                    media_types::HELM_CONTENT_LEGACY,
                    media_types::HELM_PROVENANCE,
                ],
            )
            .await
            .map_err(|e| registry_error(Stage::Pull, e))?;

        if let (Some(expected), Some(actual)) = (self.reference.digest(), image.digest.as_deref()) {
            if expected != actual {
                return Err(UnpackError::DigestMismatch {
                    subject: format!("manifest of {}", self.reference),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        let expected_digest = image.manifest.as_ref().and_then(|m| {
            m.layers
                .iter()
                .find(|l| is_chart_content(&l.media_type))
                .map(|l| l.digest.clone())
        });

        let layer = image
            .layers
            .into_iter()
            .find(|l| is_chart_content(&l.media_type))
            .ok_or_else(|| UnpackError::Registry {
                stage: Stage::Pull,
                status: None,
                message: format!("no chart content layer found in {}", self.reference),
            })?;

        if let Some(expected) = expected_digest {
            verify_digest(&format!("chart layer of {}", self.reference), &expected, &layer.data)?;
        }

        let mut result = PullResult {
            raw: layer.data,
            metadata: None,
            filename: String::new(),
        };
        result.filename = result.load_chart_metadata()?.archive_name();

        tracing::debug!(
            reference = %self.reference,
            filename = %result.filename,
            size = result.raw.len(),
            "Pulled chart from registry"
        );
        Ok(result)
    }
}

fn is_chart_content(media_type: &str) -> bool {
    media_type == media_types::HELM_CONTENT || media_type == media_types::HELM_CONTENT_LEGACY
}

fn strip_oci_scheme(reference: &str) -> &str {
    match reference.split_once("://") {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("oci") => rest,
        _ => reference,
    }
}

/// Image layers served by a live registry
pub struct RegistryLayerSource {
    reference: Reference,
    auth: RegistryAuth,
    clients: Arc<TransportClients>,
}

impl RegistryLayerSource {
    pub fn new(
        reference: &str,
        credentials: &RegistryCredentials,
        clients: Arc<TransportClients>,
    ) -> Result<Self> {
        Ok(Self {
            reference: parse_reference(strip_oci_scheme(reference))?,
            auth: credentials.to_registry_auth(),
            clients,
        })
    }
}

#[async_trait]
impl LayerSource for RegistryLayerSource {
    async fn resolve(&self) -> Result<ResolvedImage> {
        self.clients.ensure_registry_trust()?;
        // Multi-platform indexes resolve to the client's platform
        let (manifest, digest) = self
            .clients
            .registry()
            .pull_image_manifest(&self.reference, &self.auth)
            .await
            .map_err(|e| registry_error(Stage::Resolve, e))?;

        let layers = manifest
            .layers
            .into_iter()
            .map(|l| LayerDescriptor {
                digest: l.digest,
                media_type: l.media_type,
                size: l.size,
            })
            .collect();

        Ok(ResolvedImage {
            reference: format!(
                "{}/{}@{}",
                self.reference.registry(),
                self.reference.repository(),
                digest
            ),
            digest,
            layers,
        })
    }

    async fn fetch_layer(
        &self,
        layer: &LayerDescriptor,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        self.clients.ensure_registry_trust()?;
        let descriptor = OciDescriptor {
            digest: layer.digest.clone(),
            media_type: layer.media_type.clone(),
            size: layer.size,
            ..Default::default()
        };

        self.clients
            .registry()
            .pull_blob(&self.reference, &descriptor, out)
            .await
            .map_err(|e| registry_error(Stage::FetchLayer, e))?;

        tracing::debug!(digest = %layer.digest, size = layer.size, "Fetched layer blob");
        Ok(())
    }
}
