//! Bundle fetching and unpacking
//!
//! This crate materializes deployable bundles as read-only directory trees:
//!
//! - **Helm charts**: `.tgz` archives over HTTP(S) or `oci://` registries
//! - **OCI images**: layers applied in order, whiteouts honored
//!
//! ## Key Features
//!
//! - **Custom trust**: extra CA certificates and mTLS, never skipping verification
//! - **Hardened extraction**: path traversal rejected, links contained or skipped
//! - **Atomic results**: trees are staged, sealed read-only, then renamed into place
//! - **Garbage collection**: one current version per bundle, swept under a per-bundle lock
//! - **Classified errors**: every failure says whether retrying can help
//!
//! ## Example
//!
//! ```rust,no_run
//! use bundle_unpack::{BundleSource, BundleUnpacker, TrustContext, UnpackContext, Unpacker, UnpackerConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = UnpackerConfig::load()?;
//! let trust = TrustContext::from_pem_file("/etc/bundle-unpack/ca.crt".as_ref())?;
//! let unpacker = Unpacker::with_context(Arc::new(UnpackContext::new(config).with_trust(trust)));
//!
//! let bundle = BundleSource::chart("metrics", "oci://localhost:5000/metrics-server-3.12.0.tgz");
//! let result = unpacker.unpack(&bundle, &CancellationToken::new()).await?;
//! println!("{}", result.filesystem_root.display());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod config;
pub mod credentials;
pub mod tls;
pub mod bundle;
pub mod http;
pub mod oci;
pub mod download;
pub mod archive;
pub mod layers;
pub mod cache;
pub mod unpacker;
mod fs;

// Re-exports for convenience
pub use error::{ErrorKind, Result, Stage, UnpackError};
pub use config::{LinkPolicy, UnpackerConfig};
pub use credentials::RegistryCredentials;
pub use tls::{ClientCache, TransportClients, TrustContext};
pub use bundle::{
    BundleSource, BundleType, ChartMetadata, DigestAlgorithm, PullResult, UnpackResult,
    UnpackState, compute_digest, verify_digest,
};
pub use http::HttpDownloader;
pub use oci::{OciDownloader, RegistryLayerSource, chart_name_converter, registry_host};
pub use download::{Downloader, Protocol};
pub use archive::{ArchiveUnpacker, ExtractStats};
pub use layers::{LayerDescriptor, LayerSource, LayerStats, LayerUnpacker, ResolvedImage, layer_reader};
pub use cache::{BundleGuard, CacheManager, Staging};
pub use unpacker::{BundleUnpacker, ChartUnpacker, ImageUnpacker, UnpackContext, Unpacker};
