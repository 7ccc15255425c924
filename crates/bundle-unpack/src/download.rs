//! Chart downloader selection
//!
//! A chart reference is classified once by scheme: `oci://` goes to the
//! registry, everything else is fetched over HTTP(S).

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::bundle::PullResult;
use crate::credentials::RegistryCredentials;
use crate::error::{Result, Stage, UnpackError};
use crate::http::HttpDownloader;
use crate::oci::OciDownloader;
use crate::tls::TransportClients;

/// Transport a chart reference is fetched with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Oci,
}

impl Protocol {
    /// Classify a reference by its scheme. Only `oci` selects the registry.
    pub fn classify(reference: &str) -> Self {
        match reference.split_once("://") {
            Some((scheme, _)) if scheme.eq_ignore_ascii_case("oci") => Protocol::Oci,
            _ => Protocol::Http,
        }
    }
}

/// Fetches a chart archive for one reference
#[derive(Debug, Clone)]
pub enum Downloader {
    Http(HttpDownloader),
    Oci(OciDownloader),
}

impl Downloader {
    /// Pick and configure the downloader for `reference`.
    ///
    /// Credentials only apply to registries.
    pub fn new(reference: &str, credentials: RegistryCredentials) -> Result<Self> {
        match Protocol::classify(reference) {
            Protocol::Http => Ok(Downloader::Http(HttpDownloader::new(reference)?)),
            Protocol::Oci => Ok(Downloader::Oci(OciDownloader::new(reference, credentials)?)),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Downloader::Http(_) => Protocol::Http,
            Downloader::Oci(_) => Protocol::Oci,
        }
    }

    /// Download the archive and check that it is a chart.
    ///
    /// Bounded by the client timeout and aborted when `cancel` fires.
    pub async fn fetch(
        &self,
        clients: &TransportClients,
        cancel: &CancellationToken,
    ) -> Result<PullResult> {
        let mut result = bounded(Stage::Fetch, clients.timeout(), cancel, async {
            match self {
                Downloader::Http(d) => d.fetch(clients).await,
                Downloader::Oci(d) => d.fetch(clients).await,
            }
        })
        .await?;

        if result.metadata.is_none() {
            result.load_chart_metadata()?;
        }
        Ok(result)
    }
}

/// Run one network stage, giving up on timeout or cancellation
pub(crate) async fn bounded<T, F>(
    stage: Stage,
    limit: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UnpackError::Cancelled),
        outcome = tokio::time::timeout(limit, fut) => match outcome {
            Ok(result) => result,
            Err(_) => Err(UnpackError::Timeout {
                stage,
                seconds: limit.as_secs(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(Protocol::classify("oci://ghcr.io/org/chart:1.0.0"), Protocol::Oci);
        assert_eq!(Protocol::classify("OCI://ghcr.io/org/chart:1.0.0"), Protocol::Oci);
        assert_eq!(Protocol::classify("https://charts.example.com/a-1.0.0.tgz"), Protocol::Http);
        assert_eq!(Protocol::classify("http://localhost/a-1.0.0.tgz"), Protocol::Http);
        assert_eq!(Protocol::classify("ghcr.io/org/chart:1.0.0"), Protocol::Http);
    }

    #[test]
    fn test_new_picks_downloader() {
        let oci = Downloader::new(
            "oci://localhost:5000/metrics-server-3.12.0.tgz",
            RegistryCredentials::default(),
        )
        .unwrap();
        assert_eq!(oci.protocol(), Protocol::Oci);

        let http = Downloader::new(
            "https://charts.example.com/metrics-server-3.12.0.tgz",
            RegistryCredentials::default(),
        )
        .unwrap();
        assert_eq!(http.protocol(), Protocol::Http);

        // No scheme means HTTP, which needs an absolute URL
        let err = Downloader::new("ghcr.io/org/chart:1.0.0", RegistryCredentials::default()).unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let err = bounded(
            Stage::Pull,
            Duration::from_millis(10),
            &CancellationToken::new(),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, UnpackError::Timeout { stage: Stage::Pull, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_bounded_cancelled() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = bounded(Stage::Fetch, Duration::from_secs(5), &cancel, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, UnpackError::Cancelled));
    }
}
