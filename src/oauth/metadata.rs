//! Identity provider metadata discovery
//!
//! Fetches an OpenID Connect / RFC 8414 well-known document. Only the
//! fields the gateway needs are kept.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Subset of a provider's well-known document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderMetadata {
    /// Issuer identifier
    pub issuer: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// JWKS endpoint (optional)
    #[serde(default)]
    pub jwks_uri: Option<String>,
}

impl ProviderMetadata {
    /// Discover provider metadata from a full well-known URL
    ///
    /// # Errors
    ///
    /// Returns an error if the document is unreachable or lacks a token endpoint.
    pub async fn discover(client: &Client, well_known_url: &str) -> Result<Self> {
        debug!(url = %well_known_url, "Discovering identity provider metadata");

        let response = client
            .get(well_known_url)
            .send()
            .await
            .map_err(|e| Error::Exchange(format!("Failed to fetch provider metadata: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Exchange(format!(
                "Provider metadata discovery failed: HTTP {}",
                response.status()
            )));
        }

        let metadata: Self = response
            .json()
            .await
            .map_err(|e| Error::Exchange(format!("Failed to parse provider metadata: {e}")))?;

        debug!(
            issuer = %metadata.issuer,
            token_endpoint = %metadata.token_endpoint,
            "Discovered identity provider"
        );
        Ok(metadata)
    }
}
