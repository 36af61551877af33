//! Inbound JWT verification
//!
//! # Verification flow
//!
//! 1. Extract the bearer token; requests without one are rejected.
//! 2. Decode the JWT header (no verification) to get `kid`.
//! 3. Fetch the issuer's JWKS (cached; refreshed once on unknown `kid`).
//! 4. Verify the RS256 signature, `exp`, `iss` and `aud`.
//!
//! Actuator paths bypass verification. In the local environment the
//! middleware is not installed at all.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header::WWW_AUTHENTICATE},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{
    Algorithm, DecodingKey, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::{Config, VerificationConfig, resolve_secret};
use crate::session::bearer_token;
use crate::{Error, Result};

/// Inbound verification failures (answered with 401)
#[derive(Debug, thiserror::Error)]
pub enum JwtVerifyError {
    /// JWT decode / signature / claim validation failed
    #[error("JWT verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// The JWT header contains no `kid`
    #[error("JWT missing 'kid' field in header")]
    MissingKeyId,

    /// The `kid` is not in the issuer's JWKS
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),

    /// Network or HTTP error while fetching the JWKS
    #[error("JWKS fetch error: {0}")]
    Jwks(#[from] reqwest::Error),
}

/// Caller identity attached to verified requests
#[derive(Debug, Clone)]
pub struct VerifiedCaller {
    /// `sub` claim
    pub subject: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InboundClaims {
    #[serde(default)]
    sub: Option<String>,
}

/// Cached JWKS
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// JWKS of a single issuer with a fixed TTL
pub struct JwksCache {
    http: reqwest::Client,
    jwks_uri: String,
    ttl: Duration,
    cached: RwLock<Option<CachedJwks>>,
}

impl JwksCache {
    /// Create an empty cache for `jwks_uri`
    #[must_use]
    pub fn new(http: reqwest::Client, jwks_uri: impl Into<String>, ttl: Duration) -> Self {
        Self {
            http,
            jwks_uri: jwks_uri.into(),
            ttl,
            cached: RwLock::new(None),
        }
    }

    /// Return the cached JWKS, or fetch it if stale or `force_refresh`
    ///
    /// # Errors
    ///
    /// Returns [`JwtVerifyError::Jwks`] if the JWKS cannot be fetched.
    pub async fn get_or_fetch(&self, force_refresh: bool) -> std::result::Result<JwkSet, JwtVerifyError> {
        if !force_refresh {
            let guard = self.cached.read().await;
            if let Some(cached) = guard.as_ref()
                && cached.fetched_at.elapsed() < self.ttl
            {
                return Ok(cached.keys.clone());
            }
        }

        debug!(jwks_uri = %self.jwks_uri, "Fetching JWKS");
        let keys: JwkSet = self
            .http
            .get(&self.jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        *self.cached.write().await = Some(CachedJwks {
            keys: keys.clone(),
            fetched_at: Instant::now(),
        });
        Ok(keys)
    }
}

/// Verifies inbound bearer tokens against one issuer
pub struct JwtVerifier {
    issuer: String,
    audience: String,
    leeway_secs: u64,
    jwks: JwksCache,
}

impl JwtVerifier {
    /// Build a verifier from configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if issuer, audience or JWKS URI is missing.
    pub fn from_config(config: &VerificationConfig) -> Result<Self> {
        let missing = |field: &str| Error::Config(format!("verification.{field} is required"));
        let issuer = config.issuer.clone().ok_or_else(|| missing("issuer"))?;
        let audience = config.audience.as_deref().ok_or_else(|| missing("audience"))?;
        let jwks_uri = config.jwks_uri.clone().ok_or_else(|| missing("jwks_uri"))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            issuer,
            audience: resolve_secret(audience, "verification.audience")?,
            leeway_secs: config.leeway_secs,
            jwks: JwksCache::new(http, jwks_uri, config.jwks_cache_ttl),
        })
    }

    /// Verify a token and return the caller it identifies
    ///
    /// # Errors
    ///
    /// Returns [`JwtVerifyError`] if the token is malformed, expired, signed
    /// with an unknown key, or issued by or for someone else.
    pub async fn verify(&self, token: &str) -> std::result::Result<VerifiedCaller, JwtVerifyError> {
        let header = jsonwebtoken::decode_header(token)?;
        let kid = header.kid.clone().ok_or(JwtVerifyError::MissingKeyId)?;
        let key = self.find_decoding_key(&kid).await?;

        let mut validation = build_validation(self.leeway_secs);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);

        let data = jsonwebtoken::decode::<InboundClaims>(token, &key, &validation)?;
        Ok(VerifiedCaller {
            subject: data.claims.sub,
        })
    }

    /// Find a decoding key by `kid`, refreshing the JWKS once if not found
    async fn find_decoding_key(&self, kid: &str) -> std::result::Result<DecodingKey, JwtVerifyError> {
        let jwks = self.jwks.get_or_fetch(false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.jwks.get_or_fetch(true).await?;
        find_key_in_jwks(&jwks, kid).ok_or_else(|| JwtVerifyError::UnknownKeyId(kid.to_string()))
    }
}

/// Find a JWK by `kid` and convert it to a `DecodingKey`
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    let jwk = jwks
        .keys
        .iter()
        .find(|jwk| jwk.common.key_id.as_deref() == Some(kid))?;

    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        _ => None,
    }
}

/// RS256 validation; tokens signed with anything else are rejected
fn build_validation(leeway_secs: u64) -> Validation {
    let mut v = Validation::new(Algorithm::RS256);
    v.leeway = leeway_secs;
    v
}

/// Verifier plus the paths that bypass it
pub struct AuthState {
    verifier: JwtVerifier,
    public_paths: Vec<String>,
}

impl AuthState {
    /// Build the verification state, `None` when verification is off
    ///
    /// # Errors
    ///
    /// Returns an error if verification is on but misconfigured.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        if config.environment.is_local() || !config.verification.enabled {
            return Ok(None);
        }
        Ok(Some(Self {
            verifier: JwtVerifier::from_config(&config.verification)?,
            public_paths: vec![
                config.prefixed(&config.actuators.liveness),
                config.prefixed(&config.actuators.readiness),
            ],
        }))
    }

    /// Assemble from parts
    #[must_use]
    pub fn new(verifier: JwtVerifier, public_paths: Vec<String>) -> Self {
        Self {
            verifier,
            public_paths,
        }
    }

    /// Check if a path is public (bypasses verification)
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| path == p)
    }
}

/// Verification middleware
pub async fn auth_middleware(
    State(auth): State<Arc<AuthState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    if auth.is_public_path(&path) {
        debug!(path = %path, "Public path, skipping verification");
        return next.run(request).await;
    }

    let Some(token) = bearer_token(request.headers()) else {
        warn!(path = %path, "Missing bearer token");
        return unauthorized_response("Missing Authorization header. Use: Authorization: Bearer <token>");
    };

    match auth.verifier.verify(token).await {
        Ok(caller) => {
            debug!(path = %path, subject = ?caller.subject, "Verified request");
            next.run(request).await
        }
        Err(e) => {
            warn!(path = %path, error = %e, "Rejected bearer token");
            unauthorized_response("Invalid token")
        }
    }
}

/// Create a 401 Unauthorized response
fn unauthorized_response(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(WWW_AUTHENTICATE, "Bearer")],
        Json(json!({ "error": message })),
    )
        .into_response()
}
