//! Identity provider client
//!
//! Wraps one token endpoint: how to reach it (static or discovered), who we
//! are there (client id + signing key), and which audience our client
//! assertions carry.

use reqwest::Client;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::assertion::ClientAssertionSigner;
use super::grant::{Grant, TokenResponse};
use super::metadata::ProviderMetadata;
use crate::config::{AssertionAudience, ProviderConfig};
use crate::session::{TokenRecord, unix_now};
use crate::{Error, Result};

/// A configured identity provider
#[derive(Debug)]
pub struct IdentityProvider {
    name: String,
    http_client: Client,
    signer: ClientAssertionSigner,
    assertion_audience: AssertionAudience,
    issuer: Option<String>,
    token_endpoint: Option<String>,
    well_known_url: Option<String>,
    /// Endpoints, resolved once (eagerly when fully configured)
    metadata: OnceCell<ProviderMetadata>,
}

impl IdentityProvider {
    /// Build a provider from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the client id or signing key cannot be resolved,
    /// or the HTTP client cannot be built.
    pub fn from_config(name: &str, config: &ProviderConfig) -> Result<Self> {
        let client_id = config.resolve_client_id()?;
        let pem = config.signing_key.resolve_pem()?;
        let signer = ClientAssertionSigner::from_pem(
            client_id,
            &pem,
            config.signing_key.algorithm,
            config.signing_key.key_id.clone(),
        )
        .map_err(|e| Error::Config(format!("Provider '{name}': {e}")))?;

        let http_client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self::new(
            name,
            http_client,
            signer,
            config.assertion_audience,
            config.issuer.clone(),
            config.token_endpoint.clone(),
            config.well_known_url.clone(),
        ))
    }

    /// Assemble a provider from parts
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        http_client: Client,
        signer: ClientAssertionSigner,
        assertion_audience: AssertionAudience,
        issuer: Option<String>,
        token_endpoint: Option<String>,
        well_known_url: Option<String>,
    ) -> Self {
        // Skip discovery when everything the assertion needs is configured
        let resolved = match (&token_endpoint, &issuer, assertion_audience) {
            (Some(endpoint), Some(issuer), _) => Some(ProviderMetadata {
                issuer: issuer.clone(),
                token_endpoint: endpoint.clone(),
                jwks_uri: None,
            }),
            (Some(endpoint), None, AssertionAudience::TokenEndpoint) => Some(ProviderMetadata {
                issuer: String::new(),
                token_endpoint: endpoint.clone(),
                jwks_uri: None,
            }),
            _ => None,
        };

        Self {
            name: name.into(),
            http_client,
            signer,
            assertion_audience,
            issuer,
            token_endpoint,
            well_known_url,
            metadata: OnceCell::new_with(resolved),
        }
    }

    /// Provider name (config key)
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Token endpoint and issuer, discovering them on first use
    ///
    /// # Errors
    ///
    /// Returns an error if discovery is needed and fails. A failed discovery
    /// is retried on the next call.
    pub async fn metadata(&self) -> Result<&ProviderMetadata> {
        self.metadata
            .get_or_try_init(|| async {
                let url = self.well_known_url.as_deref().ok_or_else(|| {
                    Error::Config(format!(
                        "Provider '{}' has neither token_endpoint nor well_known_url",
                        self.name
                    ))
                })?;
                let mut discovered = ProviderMetadata::discover(&self.http_client, url).await?;
                // Explicit configuration wins over the document
                if let Some(ref endpoint) = self.token_endpoint {
                    discovered.token_endpoint.clone_from(endpoint);
                }
                if let Some(ref issuer) = self.issuer {
                    discovered.issuer.clone_from(issuer);
                }
                Ok(discovered)
            })
            .await
    }

    /// Perform a grant request for `scope`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Exchange`] on transport failures, non-success status
    /// or an unparsable body, and [`Error::Signing`] if the assertion cannot
    /// be signed.
    pub async fn request_token(&self, grant: Grant<'_>, scope: &str) -> Result<TokenRecord> {
        let metadata = self.metadata().await?;
        let audience = match self.assertion_audience {
            AssertionAudience::Issuer => metadata.issuer.as_str(),
            AssertionAudience::TokenEndpoint => metadata.token_endpoint.as_str(),
        };
        let client_assertion = self.signer.sign(audience)?;
        let params = grant.form(self.signer.client_id(), scope, &client_assertion);

        debug!(
            provider = %self.name,
            grant = grant.name(),
            scope = %scope,
            "Requesting token"
        );

        let response = self
            .http_client
            .post(&metadata.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::Exchange(format!("{} request failed: {e}", grant.name())))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                provider = %self.name,
                grant = grant.name(),
                status = %status,
                body = %body,
                "Token endpoint rejected grant"
            );
            return Err(Error::Exchange(format!(
                "{} failed: HTTP {status} - {body}",
                grant.name()
            )));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            Error::Exchange(format!("Failed to parse {} response: {e}", grant.name()))
        })?;

        Ok(token.into_record(unix_now()))
    }
}
