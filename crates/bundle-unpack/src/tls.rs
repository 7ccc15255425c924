//! TLS trust handling and transport client construction
//!
//! Key security features:
//! - Cluster CA material is appended to the platform roots, never replaces them
//! - Missing or malformed trust material is an error, there is no insecure fallback
//! - A client certificate is never dropped silently: registry pulls refuse to run without it
//! - Clients are rebuilt only when the trust material version changes

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use oci_distribution::client::{Certificate, CertificateEncoding, ClientConfig, ClientProtocol};

use crate::config::UnpackerConfig;
use crate::error::{Result, UnpackError};

/// Secret key holding the CA bundle
pub const CA_CERT_KEY: &str = "ca.crt";
/// Secret key holding the client certificate
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Secret key holding the client private key
pub const TLS_KEY_KEY: &str = "tls.key";

/// Client certificate and key for mutual TLS
#[derive(Clone)]
pub struct ClientIdentity {
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity").finish_non_exhaustive()
    }
}

/// CA certificates plus optional client identity
#[derive(Debug, Clone)]
pub struct TrustContext {
    ca_pem: Vec<u8>,
    identity: Option<ClientIdentity>,
    version: String,
}

impl TrustContext {
    /// Trust the CA certificates in a PEM bundle
    pub fn from_pem(ca_pem: impl Into<Vec<u8>>) -> Result<Self> {
        let ca_pem = ca_pem.into();
        if ca_pem.iter().all(u8::is_ascii_whitespace) {
            return Err(UnpackError::InvalidTrust {
                message: format!("{} is empty", CA_CERT_KEY),
            });
        }
        let version = crate::bundle::compute_digest(&ca_pem);
        Ok(Self {
            ca_pem,
            identity: None,
            version,
        })
    }

    /// Read a CA bundle from a local PEM file
    pub fn from_pem_file(path: &Path) -> Result<Self> {
        let pem = std::fs::read(path).map_err(|e| UnpackError::InvalidTrust {
            message: format!("reading CA bundle {}: {}", path.display(), e),
        })?;
        Self::from_pem(pem)
    }

    /// Build from the data of a TLS secret.
    ///
    /// `ca.crt` is required; `tls.crt` and `tls.key` are optional but only as a pair.
    pub fn from_secret_data(data: &BTreeMap<String, Vec<u8>>) -> Result<Self> {
        let ca = data.get(CA_CERT_KEY).ok_or_else(|| UnpackError::InvalidTrust {
            message: format!("secret has no {} field", CA_CERT_KEY),
        })?;
        let trust = Self::from_pem(ca.clone())?;

        match (data.get(TLS_CERT_KEY), data.get(TLS_KEY_KEY)) {
            (Some(cert), Some(key)) => trust.with_client_identity(cert.clone(), key.clone()),
            (None, None) => Ok(trust),
            (Some(_), None) => Err(UnpackError::InvalidTrust {
                message: format!("secret has {} but no {}", TLS_CERT_KEY, TLS_KEY_KEY),
            }),
            (None, Some(_)) => Err(UnpackError::InvalidTrust {
                message: format!("secret has {} but no {}", TLS_KEY_KEY, TLS_CERT_KEY),
            }),
        }
    }

    /// Attach a client certificate and key for mutual TLS
    pub fn with_client_identity(
        mut self,
        cert_pem: impl Into<Vec<u8>>,
        key_pem: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        let identity = ClientIdentity {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        };
        let mut material = self.ca_pem.clone();
        material.extend_from_slice(&identity.cert_pem);
        material.extend_from_slice(&identity.key_pem);
        self.version = crate::bundle::compute_digest(&material);
        self.identity = Some(identity);

        // Parse now so a bad key surfaces where the secret is read
        self.reqwest_identity()?;
        Ok(self)
    }

    /// Use the secret's resource version instead of a content fingerprint
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Version of the backing trust material
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn has_client_identity(&self) -> bool {
        self.identity.is_some()
    }

    fn ca_certificates(&self) -> Result<Vec<reqwest::Certificate>> {
        let certs = reqwest::Certificate::from_pem_bundle(&self.ca_pem).map_err(|e| {
            UnpackError::InvalidTrust {
                message: format!("parsing {}: {}", CA_CERT_KEY, e),
            }
        })?;
        if certs.is_empty() {
            return Err(UnpackError::InvalidTrust {
                message: format!("{} contains no PEM certificates", CA_CERT_KEY),
            });
        }
        Ok(certs)
    }

    fn reqwest_identity(&self) -> Result<Option<reqwest::Identity>> {
        let Some(identity) = &self.identity else {
            return Ok(None);
        };
        let mut pem = identity.key_pem.clone();
        pem.push(b'\n');
        pem.extend_from_slice(&identity.cert_pem);
        reqwest::Identity::from_pem(&pem)
            .map(Some)
            .map_err(|e| UnpackError::InvalidTrust {
                message: format!("parsing client certificate: {}", e),
            })
    }
}

/// HTTP and registry clients sharing one trust configuration.
///
/// Safe to reuse across fetches.
#[derive(Clone)]
pub struct TransportClients {
    http: reqwest::Client,
    registry: oci_distribution::Client,
    timeout: Duration,
    client_identity: bool,
}

impl TransportClients {
    /// Build clients trusting the platform roots plus `trust`, if any
    pub fn build(config: &UnpackerConfig, trust: Option<&TrustContext>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(config.fetch_timeout())
            .tls_built_in_root_certs(true);

        let mut extra_root_certificates = Vec::new();
        if let Some(trust) = trust {
            for cert in trust.ca_certificates()? {
                builder = builder.add_root_certificate(cert);
            }
            if let Some(identity) = trust.reqwest_identity()? {
                builder = builder.identity(identity);
            }
            extra_root_certificates.push(Certificate {
                encoding: CertificateEncoding::Pem,
                data: trust.ca_pem.clone(),
            });
        }

        let http = builder.build().map_err(|e| UnpackError::InvalidTrust {
            message: format!("building HTTP client: {}", e),
        })?;

        let protocol = if config.insecure_registries.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(config.insecure_registries.clone())
        };
        let registry_config = ClientConfig {
            protocol,
            accept_invalid_certificates: false,
            extra_root_certificates,
            ..Default::default()
        };
        let registry = oci_distribution::Client::try_from(registry_config).map_err(|e| {
            UnpackError::InvalidTrust {
                message: format!("building registry client: {}", e),
            }
        })?;

        Ok(Self {
            http,
            registry,
            timeout: config.fetch_timeout(),
            client_identity: trust.is_some_and(TrustContext::has_client_identity),
        })
    }

    /// Client for direct HTTP(S) downloads
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Client for OCI registries
    pub fn registry(&self) -> &oci_distribution::Client {
        &self.registry
    }

    /// Fail when a client certificate is configured: the registry client
    /// cannot present one, and pulling without it would bypass mutual TLS.
    pub fn ensure_registry_trust(&self) -> Result<()> {
        if self.client_identity {
            return Err(UnpackError::InvalidTrust {
                message: "a client certificate is configured but OCI registry pulls cannot present it"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Upper bound for each network stage
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Caches [`TransportClients`] keyed by trust material version
pub struct ClientCache {
    config: UnpackerConfig,
    current: Mutex<Option<(String, Arc<TransportClients>)>>,
}

impl ClientCache {
    pub fn new(config: UnpackerConfig) -> Self {
        Self {
            config,
            current: Mutex::new(None),
        }
    }

    /// Reuse the cached clients unless the trust version changed
    pub fn get(&self, trust: Option<&TrustContext>) -> Result<Arc<TransportClients>> {
        let version = trust.map(|t| t.version().to_string()).unwrap_or_default();
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());

        if let Some((cached_version, clients)) = current.as_ref() {
            if *cached_version == version {
                return Ok(clients.clone());
            }
        }

        tracing::debug!(version = %version, "Building transport clients");
        let clients = Arc::new(TransportClients::build(&self.config, trust)?);
        *current = Some((version, clients.clone()));
        Ok(clients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CA: &[u8] = include_bytes!("../tests/fixtures/ca.crt");
    const TLS_CRT: &[u8] = include_bytes!("../tests/fixtures/tls.crt");
    const TLS_KEY: &[u8] = include_bytes!("../tests/fixtures/tls.key");

    fn secret(entries: &[(&str, &[u8])]) -> BTreeMap<String, Vec<u8>> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect()
    }

    #[test]
    fn test_from_secret_requires_ca() {
        let err = TrustContext::from_secret_data(&secret(&[(TLS_CERT_KEY, TLS_CRT)])).unwrap_err();
        assert!(matches!(err, UnpackError::InvalidTrust { .. }));
        assert!(err.to_string().contains("ca.crt"));
    }

    #[test]
    fn test_from_secret_requires_cert_and_key_pair() {
        let err = TrustContext::from_secret_data(&secret(&[
            (CA_CERT_KEY, CA),
            (TLS_CERT_KEY, TLS_CRT),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("tls.key"));

        let trust = TrustContext::from_secret_data(&secret(&[
            (CA_CERT_KEY, CA),
            (TLS_CERT_KEY, TLS_CRT),
            (TLS_KEY_KEY, TLS_KEY),
        ]))
        .unwrap();
        assert!(trust.has_client_identity());
    }

    #[test]
    fn test_build_with_ca() {
        let trust = TrustContext::from_pem(CA).unwrap();
        let clients = TransportClients::build(&UnpackerConfig::default(), Some(&trust));
        assert!(clients.is_ok());
    }

    #[test]
    fn test_build_with_client_identity() {
        let trust = TrustContext::from_pem(CA)
            .unwrap()
            .with_client_identity(TLS_CRT, TLS_KEY)
            .unwrap();
        let clients = TransportClients::build(&UnpackerConfig::default(), Some(&trust)).unwrap();
        assert!(matches!(
            clients.ensure_registry_trust(),
            Err(UnpackError::InvalidTrust { .. })
        ));

        let ca_only = TrustContext::from_pem(CA).unwrap();
        let clients = TransportClients::build(&UnpackerConfig::default(), Some(&ca_only)).unwrap();
        assert!(clients.ensure_registry_trust().is_ok());
    }

    #[test]
    fn test_malformed_ca_fails_closed() {
        let trust = TrustContext::from_pem(b"not a certificate".to_vec()).unwrap();
        let err = TransportClients::build(&UnpackerConfig::default(), Some(&trust))
            .err()
            .unwrap();
        assert!(matches!(err, UnpackError::InvalidTrust { .. }));
        assert!(err.is_terminal());
    }

    #[test]
    fn test_empty_ca_rejected() {
        assert!(TrustContext::from_pem(b"  \n".to_vec()).is_err());
    }

    #[test]
    fn test_malformed_identity_fails_closed() {
        let err = TrustContext::from_pem(CA)
            .unwrap()
            .with_client_identity(TLS_CRT, b"garbage".to_vec())
            .unwrap_err();
        assert!(matches!(err, UnpackError::InvalidTrust { .. }));
    }

    #[test]
    fn test_missing_pem_file() {
        let err = TrustContext::from_pem_file(Path::new("/nonexistent/ca.crt")).unwrap_err();
        assert!(matches!(err, UnpackError::InvalidTrust { .. }));
    }

    #[test]
    fn test_client_cache_rebuilds_on_version_change() {
        let cache = ClientCache::new(UnpackerConfig::default());
        let trust = TrustContext::from_pem(CA).unwrap().with_version("1");

        let a = cache.get(Some(&trust)).unwrap();
        let b = cache.get(Some(&trust)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let rotated = trust.clone().with_version("2");
        let c = cache.get(Some(&rotated)).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_fingerprint_changes_with_material() {
        let a = TrustContext::from_pem(CA).unwrap();
        let b = TrustContext::from_pem(CA)
            .unwrap()
            .with_client_identity(TLS_CRT, TLS_KEY)
            .unwrap();
        assert_ne!(a.version(), b.version());
    }
}
