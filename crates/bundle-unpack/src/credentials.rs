//! Registry credentials
//!
//! Provisioning credentials is the caller's job; this module only carries
//! them to the registry client.

use oci_distribution::secrets::RegistryAuth;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Credentials presented to an OCI registry
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RegistryCredentials {
    /// No credentials, token exchange still happens anonymously
    #[default]
    Anonymous,

    /// Basic authentication (username/password)
    Basic { username: String, password: String },

    /// Pre-issued bearer token
    Bearer { token: String },
}

impl RegistryCredentials {
    /// Create basic auth credentials
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        RegistryCredentials::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Create bearer token credentials
    pub fn bearer(token: impl Into<String>) -> Self {
        RegistryCredentials::Bearer {
            token: token.into(),
        }
    }

    /// Registry client auth for these credentials
    pub fn to_registry_auth(&self) -> RegistryAuth {
        match self {
            RegistryCredentials::Anonymous => RegistryAuth::Anonymous,
            RegistryCredentials::Basic { username, password } => {
                RegistryAuth::Basic(username.clone(), password.clone())
            }
            // Registries exchange a token presented as the password
            RegistryCredentials::Bearer { token } => RegistryAuth::Basic(String::new(), token.clone()),
        }
    }
}

// Keep secrets out of logs
impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryCredentials::Anonymous => f.write_str("Anonymous"),
            RegistryCredentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            RegistryCredentials::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}
