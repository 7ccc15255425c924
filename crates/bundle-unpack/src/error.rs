//! Error types for fetch and unpack operations
//!
//! Every error maps onto one [`ErrorKind`], so a caller's control loop can
//! decide between retrying with backoff and giving up.

use std::path::PathBuf;

use thiserror::Error;

/// Failure class of an [`UnpackError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network, DNS or TLS handshake failure. Potentially transient.
    Transport,
    /// Non-success status or malformed registry response.
    Protocol,
    /// Malformed reference, corrupt archive, digest mismatch or bad trust material.
    Validation,
    /// Local disk failure.
    Io,
    /// The caller cancelled the operation.
    Cancelled,
}

impl ErrorKind {
    /// Whether the same input may succeed on a later attempt
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Transport | ErrorKind::Io | ErrorKind::Cancelled
        )
    }
}

/// Pipeline stage an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Resolve,
    Authenticate,
    Pull,
    FetchLayer,
    Extract,
    ApplyLayer,
    Seal,
    Sweep,
    Config,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Fetch => "fetch",
            Stage::Resolve => "resolve",
            Stage::Authenticate => "authenticate",
            Stage::Pull => "pull",
            Stage::FetchLayer => "fetch layer",
            Stage::Extract => "extract",
            Stage::ApplyLayer => "apply layer",
            Stage::Seal => "seal",
            Stage::Sweep => "sweep",
            Stage::Config => "config",
        };
        f.write_str(s)
    }
}

/// Fetch and unpack errors
#[derive(Debug, Error)]
pub enum UnpackError {
    // ============ Transport Errors ============
    #[error("Network error during {stage}: {message}")]
    Transport { stage: Stage, message: String },

    #[error("Timed out after {seconds}s during {stage}")]
    Timeout { stage: Stage, seconds: u64 },

    // ============ Protocol Errors ============
    #[error("Error downloading '{filename}': got status code {status}")]
    HttpStatus { status: u16, filename: String },

    #[error("Registry error during {stage}: {message}")]
    Registry {
        stage: Stage,
        status: Option<u16>,
        message: String,
    },

    #[error("Unsupported layer media type: {media_type}")]
    UnsupportedMediaType { media_type: String },

    // ============ Validation Errors ============
    #[error("Invalid reference {reference}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("Invalid bundle: {message}")]
    InvalidBundle { message: String },

    #[error("Invalid archive: {message}")]
    InvalidArchive { message: String },

    #[error("Archive entry escapes the destination root: {path}")]
    PathTraversal { path: String },

    #[error("Digest mismatch for {subject}: expected {expected}, got {actual}")]
    DigestMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("Unsupported digest algorithm: {digest}")]
    UnsupportedDigest { digest: String },

    #[error("Invalid trust material: {message}")]
    InvalidTrust { message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // ============ IO Errors ============
    #[error("IO error during {stage} at {}: {source}", path.display())]
    Io {
        stage: Stage,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ============ Other ============
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Bundle '{bundle}': {source}")]
    Bundle {
        bundle: String,
        #[source]
        source: Box<UnpackError>,
    },
}

/// Result type for fetch and unpack operations
pub type Result<T> = std::result::Result<T, UnpackError>;

impl UnpackError {
    /// Failure class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            UnpackError::Transport { .. } | UnpackError::Timeout { .. } => ErrorKind::Transport,
            UnpackError::HttpStatus { .. }
            | UnpackError::Registry { .. }
            | UnpackError::UnsupportedMediaType { .. } => ErrorKind::Protocol,
            UnpackError::InvalidReference { .. }
            | UnpackError::InvalidBundle { .. }
            | UnpackError::InvalidArchive { .. }
            | UnpackError::PathTraversal { .. }
            | UnpackError::DigestMismatch { .. }
            | UnpackError::UnsupportedDigest { .. }
            | UnpackError::InvalidTrust { .. }
            | UnpackError::InvalidConfig { .. } => ErrorKind::Validation,
            UnpackError::Io { .. } => ErrorKind::Io,
            UnpackError::Cancelled => ErrorKind::Cancelled,
            UnpackError::Bundle { source, .. } => source.kind(),
        }
    }

    /// Whether retrying with the same input may succeed
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Whether the caller should stop retrying until the input changes
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }

    /// Attach the bundle name, unless already attached
    pub fn for_bundle(self, bundle: &str) -> Self {
        match self {
            UnpackError::Bundle { .. } => self,
            other => UnpackError::Bundle {
                bundle: bundle.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Build an IO error with its stage and path
    pub fn io(stage: Stage, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        UnpackError::Io {
            stage,
            path: path.into(),
            source,
        }
    }
}

impl From<reqwest::Error> for UnpackError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UnpackError::Transport {
                stage: Stage::Fetch,
                message: format!("Request timed out: {}", e),
            }
        } else if e.is_connect() {
            UnpackError::Transport {
                stage: Stage::Fetch,
                message: format!("Connection failed: {}", e),
            }
        } else if let Some(status) = e.status() {
            UnpackError::HttpStatus {
                status: status.as_u16(),
                filename: e
                    .url()
                    .map(|u| u.to_string())
                    .unwrap_or_default(),
            }
        } else if e.is_builder() {
            UnpackError::InvalidReference {
                reference: e.url().map(|u| u.to_string()).unwrap_or_default(),
                reason: e.to_string(),
            }
        } else {
            UnpackError::Transport {
                stage: Stage::Fetch,
                message: e.to_string(),
            }
        }
    }
}

impl From<oci_distribution::ParseError> for UnpackError {
    fn from(e: oci_distribution::ParseError) -> Self {
        UnpackError::InvalidReference {
            reference: String::new(),
            reason: e.to_string(),
        }
    }
}

/// Classify a registry client error raised during `stage`
pub(crate) fn registry_error(
    stage: Stage,
    e: oci_distribution::errors::OciDistributionError,
) -> UnpackError {
    use oci_distribution::errors::OciDistributionError;

    match e {
        OciDistributionError::RequestError(inner) => match inner.status() {
            Some(status) => UnpackError::Registry {
                stage,
                status: Some(status.as_u16()),
                message: inner.to_string(),
            },
            None => UnpackError::Transport {
                stage,
                message: inner.to_string(),
            },
        },
        OciDistributionError::ServerError { code, url, message } => UnpackError::Registry {
            stage,
            status: Some(code),
            message: format!("{} returned {}: {}", url, code, message),
        },
        other => UnpackError::Registry {
            stage,
            status: None,
            message: other.to_string(),
        },
    }
}
