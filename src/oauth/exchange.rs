//! Exchange engine
//!
//! Per request and target scope, decides whether the cached token can be
//! reused, must be refreshed, or must be obtained through a fresh grant, and
//! writes the result back to the session cache. Identity provider failures
//! degrade the request instead of failing it: the caller proxies without a
//! downstream token and the upstream answers for itself.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::grant::Grant;
use super::provider::IdentityProvider;
use crate::session::{IdentityKey, SessionCache, unix_now};
use crate::{Error, Result};

/// Default window before expiry in which a token is no longer reused
pub const DEFAULT_DRIFT: Duration = Duration::from_secs(10);

/// Delegation flow bound to a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeFlow {
    /// OAuth2 on-behalf-of
    OnBehalfOf,
    /// OAuth2 client credentials
    ClientCredentials,
    /// RFC 8693 token exchange towards a fixed audience
    TokenExchange {
        /// Requested audience
        audience: String,
    },
}

impl ExchangeFlow {
    /// Short name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::OnBehalfOf => "on_behalf_of",
            Self::ClientCredentials => "client_credentials",
            Self::TokenExchange { .. } => "token_exchange",
        }
    }
}

/// Scope, flow and provider fixed for a route at startup
#[derive(Debug, Clone)]
pub struct FlowBinding {
    /// Scope requested for the downstream token
    pub scope: String,
    /// Delegation flow
    pub flow: ExchangeFlow,
    /// Identity provider issuing the token
    pub provider: Arc<IdentityProvider>,
}

impl FlowBinding {
    /// Cache key tokens for this binding are stored under
    ///
    /// Client-credentials tokens represent the gateway itself, so a request
    /// without a credential still has a slot: the service key.
    #[must_use]
    pub fn cache_key(&self, identity: Option<IdentityKey>) -> Option<IdentityKey> {
        match self.flow {
            ExchangeFlow::ClientCredentials => Some(identity.unwrap_or(IdentityKey::service())),
            ExchangeFlow::OnBehalfOf | ExchangeFlow::TokenExchange { .. } => identity,
        }
    }
}

/// What the engine did for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// A cached token was still valid
    Reused,
    /// The cached token was renewed with its refresh token
    Refreshed,
    /// A fresh grant produced a new token
    Exchanged,
    /// No new token could be obtained (logged)
    Failed,
}

/// Owned grant parameters, moved into the grant task
enum GrantJob {
    OnBehalfOf { assertion: String },
    ClientCredentials,
    RefreshToken { refresh_token: String },
    TokenExchange { subject_token: String, audience: String },
}

impl GrantJob {
    fn as_grant(&self) -> Grant<'_> {
        match self {
            Self::OnBehalfOf { assertion } => Grant::OnBehalfOf { assertion },
            Self::ClientCredentials => Grant::ClientCredentials,
            Self::RefreshToken { refresh_token } => Grant::RefreshToken { refresh_token },
            Self::TokenExchange {
                subject_token,
                audience,
            } => Grant::TokenExchange {
                subject_token,
                audience,
            },
        }
    }
}

/// Runs delegation flows against the shared session cache
#[derive(Clone)]
pub struct ExchangeEngine {
    cache: Arc<SessionCache>,
    drift: Duration,
}

impl ExchangeEngine {
    /// Create an engine writing to `cache`
    #[must_use]
    pub fn new(cache: Arc<SessionCache>, drift: Duration) -> Self {
        Self { cache, drift }
    }

    /// The session cache this engine writes to
    #[must_use]
    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    /// Make sure the cache holds a usable token for `binding`
    ///
    /// `identity` is the key derived from the inbound `Authorization` header
    /// and `subject_token` the bearer credential inside it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingSubjectToken`] when the flow acts on behalf of
    /// the caller and the request carries no credential. Provider failures
    /// are not errors: they yield [`ExchangeOutcome::Failed`].
    pub async fn exchange(
        &self,
        binding: &FlowBinding,
        identity: Option<IdentityKey>,
        subject_token: Option<&str>,
    ) -> Result<ExchangeOutcome> {
        match &binding.flow {
            ExchangeFlow::OnBehalfOf => {
                let (key, subject) = require_subject(binding, identity, subject_token)?;
                self.on_behalf_of(binding, key, subject).await
            }
            ExchangeFlow::ClientCredentials => {
                let key = identity.unwrap_or(IdentityKey::service());
                Ok(self.client_credentials(binding, key).await)
            }
            ExchangeFlow::TokenExchange { audience } => {
                let (key, subject) = require_subject(binding, identity, subject_token)?;
                Ok(self.token_exchange(binding, key, subject, audience).await)
            }
        }
    }

    async fn on_behalf_of(
        &self,
        binding: &FlowBinding,
        key: IdentityKey,
        subject: &str,
    ) -> Result<ExchangeOutcome> {
        let cached = self.cache.get(&key, &binding.scope);
        if let Some(ref record) = cached
            && record.is_reusable(unix_now(), self.drift)
        {
            debug!(identity = %key, scope = %binding.scope, "Reusing cached token");
            return Ok(ExchangeOutcome::Reused);
        }

        if let Some(refresh_token) = cached.and_then(|r| r.refresh_token) {
            return match self
                .run_grant(binding, key, GrantJob::RefreshToken { refresh_token })
                .await
            {
                Ok(()) => {
                    info!(identity = %key, scope = %binding.scope, "Token refreshed");
                    Ok(ExchangeOutcome::Refreshed)
                }
                Err(e) => {
                    warn!(
                        identity = %key,
                        scope = %binding.scope,
                        provider = %binding.provider.name(),
                        error = %e,
                        "Token refresh failed, proxying without downstream token"
                    );
                    Ok(ExchangeOutcome::Failed)
                }
            };
        }

        let job = GrantJob::OnBehalfOf {
            assertion: subject.to_string(),
        };
        Ok(self.settle(binding, key, job).await)
    }

    async fn client_credentials(&self, binding: &FlowBinding, key: IdentityKey) -> ExchangeOutcome {
        if let Some(record) = self.cache.get(&key, &binding.scope)
            && record.is_reusable(unix_now(), self.drift)
        {
            debug!(identity = %key, scope = %binding.scope, "Reusing cached token");
            return ExchangeOutcome::Reused;
        }
        self.settle(binding, key, GrantJob::ClientCredentials).await
    }

    async fn token_exchange(
        &self,
        binding: &FlowBinding,
        key: IdentityKey,
        subject: &str,
        audience: &str,
    ) -> ExchangeOutcome {
        if let Some(record) = self.cache.get(&key, &binding.scope)
            && record.is_reusable(unix_now(), self.drift)
        {
            debug!(identity = %key, scope = %binding.scope, "Reusing cached token");
            return ExchangeOutcome::Reused;
        }
        let job = GrantJob::TokenExchange {
            subject_token: subject.to_string(),
            audience: audience.to_string(),
        };
        self.settle(binding, key, job).await
    }

    /// Run a fresh grant and turn its result into an outcome
    async fn settle(&self, binding: &FlowBinding, key: IdentityKey, job: GrantJob) -> ExchangeOutcome {
        let grant = job.as_grant().name();
        match self.run_grant(binding, key, job).await {
            Ok(()) => {
                info!(
                    identity = %key,
                    scope = %binding.scope,
                    provider = %binding.provider.name(),
                    grant,
                    "Token obtained"
                );
                ExchangeOutcome::Exchanged
            }
            Err(e @ Error::Signing(_)) => {
                error!(provider = %binding.provider.name(), error = %e, "Cannot sign client assertion");
                ExchangeOutcome::Failed
            }
            Err(e) => {
                warn!(
                    identity = %key,
                    scope = %binding.scope,
                    provider = %binding.provider.name(),
                    grant,
                    error = %e,
                    "Token exchange failed, proxying without downstream token"
                );
                ExchangeOutcome::Failed
            }
        }
    }

    /// Request a token and store it
    ///
    /// The grant runs in its own task so an aborted inbound request does not
    /// cancel it half way; the token still lands in the cache.
    async fn run_grant(&self, binding: &FlowBinding, key: IdentityKey, job: GrantJob) -> Result<()> {
        let provider = Arc::clone(&binding.provider);
        let cache = Arc::clone(&self.cache);
        let scope = binding.scope.clone();

        let handle = tokio::spawn(async move {
            let record = provider.request_token(job.as_grant(), &scope).await?;
            cache.put(key, &scope, record);
            Ok::<_, Error>(())
        });

        handle
            .await
            .map_err(|e| Error::Internal(format!("Grant task failed: {e}")))?
    }
}

fn require_subject<'a>(
    binding: &FlowBinding,
    identity: Option<IdentityKey>,
    subject_token: Option<&'a str>,
) -> Result<(IdentityKey, &'a str)> {
    match (identity, subject_token) {
        (Some(key), Some(subject)) => Ok((key, subject)),
        _ => Err(Error::MissingSubjectToken(format!(
            "{} for scope {} needs a bearer credential",
            binding.flow.name(),
            binding.scope
        ))),
    }
}
