//! Chart download over plain HTTP(S)

use reqwest::header::ACCEPT;
use url::Url;

use crate::bundle::PullResult;
use crate::error::{Result, Stage, UnpackError};
use crate::tls::TransportClients;

/// Downloads a chart archive from an absolute `http(s)://` URL
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    url: Url,
    filename: String,
}

impl HttpDownloader {
    /// Parse the chart URL and derive the archive filename from its path
    pub fn new(reference: &str) -> Result<Self> {
        let url = Url::parse(reference).map_err(|e| UnpackError::InvalidReference {
            reference: reference.to_string(),
            reason: e.to_string(),
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(UnpackError::InvalidReference {
                reference: reference.to_string(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        let filename = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty() && *name != "." && *name != "..")
            .map(str::to_string)
            .ok_or_else(|| UnpackError::InvalidReference {
                reference: reference.to_string(),
                reason: "URL path has no archive filename".to_string(),
            })?;

        Ok(Self { url, filename })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Last path segment of the URL
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// GET the archive. A non-2xx status is a protocol error.
    pub async fn fetch(&self, clients: &TransportClients) -> Result<PullResult> {
        tracing::debug!(url = %self.url, "Downloading chart archive");

        let response = clients
            .http()
            .get(self.url.clone())
            .header(ACCEPT, "application/octet-stream")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UnpackError::HttpStatus {
                status: status.as_u16(),
                filename: self.filename.clone(),
            });
        }

        let raw = response
            .bytes()
            .await
            .map_err(|e| UnpackError::Transport {
                stage: Stage::Fetch,
                message: format!("reading response body: {}", e),
            })?
            .to_vec();

        tracing::debug!(url = %self.url, size = raw.len(), "Downloaded chart archive");

        Ok(PullResult {
            raw,
            metadata: None,
            filename: self.filename.clone(),
        })
    }
}
