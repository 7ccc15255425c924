//! Bundle unpack entry points
//!
//! [`Unpacker`] routes a [`BundleSource`] to the chart or image strategy.
//! Each strategy holds the bundle lock for the whole attempt: fetch, stage,
//! seal, then sweep older versions.

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::archive::ArchiveUnpacker;
use crate::bundle::{BundleSource, BundleType, UnpackResult, compute_digest, verify_digest};
use crate::cache::CacheManager;
use crate::config::UnpackerConfig;
use crate::credentials::RegistryCredentials;
use crate::download::Downloader;
use crate::error::Result;
use crate::layers::{LayerSource, LayerUnpacker};
use crate::oci::RegistryLayerSource;
use crate::tls::{ClientCache, TransportClients, TrustContext};

/// Unpacks one kind of bundle into the cache
#[async_trait]
pub trait BundleUnpacker: Send + Sync {
    /// Fetch and unpack `bundle`, replacing older versions of it.
    ///
    /// Errors name the bundle and carry a retryable/terminal classification.
    async fn unpack(&self, bundle: &BundleSource, cancel: &CancellationToken) -> Result<UnpackResult>;

    /// Remove every unpacked version of `bundle`
    async fn cleanup(&self, bundle: &str) -> Result<()>;
}

/// State shared by the unpack strategies
pub struct UnpackContext {
    config: UnpackerConfig,
    cache: CacheManager,
    clients: ClientCache,
    trust: RwLock<Option<TrustContext>>,
    credentials: RegistryCredentials,
}

impl UnpackContext {
    pub fn new(config: UnpackerConfig) -> Self {
        Self {
            cache: CacheManager::new(&config.cache_root),
            clients: ClientCache::new(config.clone()),
            trust: RwLock::new(None),
            credentials: RegistryCredentials::default(),
            config,
        }
    }

    /// Trust material for every endpoint
    pub fn with_trust(self, trust: TrustContext) -> Self {
        self.set_trust(Some(trust));
        self
    }

    pub fn with_credentials(mut self, credentials: RegistryCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Swap trust material; clients are rebuilt on next use if it changed
    pub fn set_trust(&self, trust: Option<TrustContext>) {
        *self.trust.write().unwrap_or_else(|e| e.into_inner()) = trust;
    }

    pub fn config(&self) -> &UnpackerConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn credentials(&self) -> &RegistryCredentials {
        &self.credentials
    }

    /// Clients for the current trust material
    pub fn transport(&self) -> Result<Arc<TransportClients>> {
        let trust = self.trust.read().unwrap_or_else(|e| e.into_inner());
        self.clients.get(trust.as_ref())
    }
}

/// Unpacks Helm charts fetched over HTTP(S) or from an OCI registry
pub struct ChartUnpacker {
    context: Arc<UnpackContext>,
    archive: ArchiveUnpacker,
}

impl ChartUnpacker {
    pub fn new(context: Arc<UnpackContext>) -> Self {
        let archive = ArchiveUnpacker::new(context.config().link_policy);
        Self { context, archive }
    }

    async fn unpack_chart(
        &self,
        bundle: &BundleSource,
        cancel: &CancellationToken,
    ) -> Result<UnpackResult> {
        bundle.validate()?;
        let downloader = Downloader::new(&bundle.reference, self.context.credentials().clone())?;
        let clients = self.context.transport()?;
        let cache = self.context.cache();

        let guard = cache.lock(&bundle.name).await;
        let pull = downloader.fetch(&clients, cancel).await?;

        if let Some(expected) = &bundle.digest {
            verify_digest(&pull.filename, expected, &pull.raw)?;
        }

        let digest = compute_digest(&pull.raw);
        let root = self
            .archive
            .unpack(pull.raw, cache, &guard, &pull.filename, cancel)
            .await?;
        let removed = cache.reconcile(&guard, &pull.filename)?;
        if !removed.is_empty() {
            tracing::info!(bundle = %bundle.name, removed = ?removed, "Removed superseded chart versions");
        }

        let resolved = bundle.clone().with_digest(digest);
        Ok(UnpackResult::unpacked(root, resolved))
    }
}

#[async_trait]
impl BundleUnpacker for ChartUnpacker {
    async fn unpack(&self, bundle: &BundleSource, cancel: &CancellationToken) -> Result<UnpackResult> {
        self.unpack_chart(bundle, cancel)
            .await
            .map_err(|e| e.for_bundle(&bundle.name))
    }

    async fn cleanup(&self, bundle: &str) -> Result<()> {
        self.context
            .cache()
            .cleanup(bundle)
            .await
            .map_err(|e| e.for_bundle(bundle))
    }
}

/// Unpacks layered OCI images
pub struct ImageUnpacker {
    context: Arc<UnpackContext>,
    layers: LayerUnpacker,
}

impl ImageUnpacker {
    pub fn new(context: Arc<UnpackContext>) -> Self {
        let layers = LayerUnpacker::new(context.config().link_policy);
        Self { context, layers }
    }

    /// Unpack `bundle` with layers from `source` instead of the live registry
    pub async fn unpack_from(
        &self,
        bundle: &BundleSource,
        source: &dyn LayerSource,
        cancel: &CancellationToken,
    ) -> Result<UnpackResult> {
        self.unpack_image(bundle, source, cancel)
            .await
            .map_err(|e| e.for_bundle(&bundle.name))
    }

    async fn unpack_image(
        &self,
        bundle: &BundleSource,
        source: &dyn LayerSource,
        cancel: &CancellationToken,
    ) -> Result<UnpackResult> {
        bundle.validate()?;
        let cache = self.context.cache();
        let timeout = self.context.config().fetch_timeout();

        let guard = cache.lock(&bundle.name).await;
        let (root, image) = self.layers.unpack(source, cache, &guard, cancel, timeout).await?;

        let removed = cache.reconcile(&guard, &image.digest)?;
        if !removed.is_empty() {
            tracing::info!(bundle = %bundle.name, removed = ?removed, "Removed superseded image digests");
        }

        let resolved = BundleSource {
            reference: image.reference,
            ..bundle.clone()
        };
        Ok(UnpackResult::unpacked(root, resolved))
    }
}

#[async_trait]
impl BundleUnpacker for ImageUnpacker {
    async fn unpack(&self, bundle: &BundleSource, cancel: &CancellationToken) -> Result<UnpackResult> {
        let source = self
            .context
            .transport()
            .and_then(|clients| {
                RegistryLayerSource::new(&bundle.reference, self.context.credentials(), clients)
            })
            .map_err(|e| e.for_bundle(&bundle.name))?;
        self.unpack_from(bundle, &source, cancel).await
    }

    async fn cleanup(&self, bundle: &str) -> Result<()> {
        self.context
            .cache()
            .cleanup(bundle)
            .await
            .map_err(|e| e.for_bundle(bundle))
    }
}

/// Routes bundles to the chart or image strategy by type
pub struct Unpacker {
    context: Arc<UnpackContext>,
    chart: ChartUnpacker,
    image: ImageUnpacker,
}

impl Unpacker {
    pub fn new(config: UnpackerConfig) -> Self {
        Self::with_context(Arc::new(UnpackContext::new(config)))
    }

    pub fn with_context(context: Arc<UnpackContext>) -> Self {
        Self {
            chart: ChartUnpacker::new(context.clone()),
            image: ImageUnpacker::new(context.clone()),
            context,
        }
    }

    pub fn context(&self) -> &UnpackContext {
        &self.context
    }

    /// Strategy for one bundle type
    pub fn backend(&self, bundle_type: BundleType) -> &dyn BundleUnpacker {
        match bundle_type {
            BundleType::Chart => &self.chart,
            BundleType::Image => &self.image,
        }
    }

    pub fn images(&self) -> &ImageUnpacker {
        &self.image
    }

    /// Unpack and fold any error into a `Failed` result
    pub async fn unpack_or_failed(&self, bundle: &BundleSource, cancel: &CancellationToken) -> UnpackResult {
        match self.unpack(bundle, cancel).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(bundle = %bundle.name, retryable = e.is_retryable(), "Unpack failed: {}", e);
                UnpackResult::failed(bundle, &e)
            }
        }
    }
}

#[async_trait]
impl BundleUnpacker for Unpacker {
    async fn unpack(&self, bundle: &BundleSource, cancel: &CancellationToken) -> Result<UnpackResult> {
        tracing::debug!(bundle = %bundle.name, bundle_type = ?bundle.bundle_type, reference = %bundle.reference, "Unpacking bundle");
        self.backend(bundle.bundle_type).unpack(bundle, cancel).await
    }

    async fn cleanup(&self, bundle: &str) -> Result<()> {
        self.context
            .cache()
            .cleanup(bundle)
            .await
            .map_err(|e| e.for_bundle(bundle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::UnpackState;
    use crate::error::{ErrorKind, UnpackError};
    use tempfile::TempDir;

    fn unpacker(temp: &TempDir) -> Unpacker {
        Unpacker::new(UnpackerConfig::with_cache_root(temp.path()))
    }

    #[tokio::test]
    async fn test_invalid_bundle_name_is_terminal() {
        let temp = TempDir::new().unwrap();
        let bundle = BundleSource::chart("../escape", "https://example.com/c-1.0.0.tgz");

        let err = unpacker(&temp)
            .unpack(&bundle, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(matches!(err, UnpackError::Bundle { .. }));
    }

    #[tokio::test]
    async fn test_malformed_reference_is_terminal() {
        let temp = TempDir::new().unwrap();
        let bundle = BundleSource::chart("app", "not a url");

        let result = unpacker(&temp)
            .unpack_or_failed(&bundle, &CancellationToken::new())
            .await;

        assert_eq!(result.state, UnpackState::Failed);
        assert!(result.message.contains("app"));
        assert!(!temp.path().join("app").exists());
    }

    #[tokio::test]
    async fn test_cleanup_missing_bundle_is_ok() {
        let temp = TempDir::new().unwrap();
        unpacker(&temp).cleanup("never-unpacked").await.unwrap();
    }
}
