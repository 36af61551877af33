//! Client assertions (RFC 7523 private_key_jwt)
//!
//! Every grant request authenticates the gateway with a short-lived JWT
//! signed by the client's private key. Assertions are single-use and never
//! cached.

use std::fmt;

use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::unix_now;
use crate::{Error, Result};

/// `client_assertion_type` sent alongside every assertion
pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Backdating of `iat`/`nbf` to tolerate clock skew at the provider
const CLOCK_SKEW_SECS: u64 = 30;
/// Lifetime of an assertion
const ASSERTION_LIFETIME_SECS: u64 = 60 * 60;

/// Claims of a client assertion
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssertionClaims {
    /// Client id
    pub sub: String,
    /// Client id
    pub iss: String,
    /// Provider issuer or token endpoint
    pub aud: String,
    /// Issued at
    pub iat: u64,
    /// Not before
    pub nbf: u64,
    /// Expiry
    pub exp: u64,
    /// Unique token id
    pub jti: String,
}

impl AssertionClaims {
    fn new(client_id: &str, audience: &str, now: u64) -> Self {
        let backdated = now.saturating_sub(CLOCK_SKEW_SECS);
        Self {
            sub: client_id.to_string(),
            iss: client_id.to_string(),
            aud: audience.to_string(),
            iat: backdated,
            nbf: backdated,
            exp: now + ASSERTION_LIFETIME_SECS,
            jti: Uuid::new_v4().to_string(),
        }
    }
}

/// Signs client assertions with a fixed private key
pub struct ClientAssertionSigner {
    client_id: String,
    header: Header,
    key: EncodingKey,
}

impl ClientAssertionSigner {
    /// Build a signer from a PEM-encoded private key
    ///
    /// # Errors
    ///
    /// Returns [`Error::Signing`] if the key cannot be parsed for the algorithm,
    /// or if the algorithm is symmetric.
    pub fn from_pem(
        client_id: impl Into<String>,
        pem: &str,
        algorithm: Algorithm,
        key_id: Option<String>,
    ) -> Result<Self> {
        let key = match algorithm {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => EncodingKey::from_rsa_pem(pem.as_bytes())?,
            Algorithm::ES256 | Algorithm::ES384 => EncodingKey::from_ec_pem(pem.as_bytes())?,
            Algorithm::EdDSA => EncodingKey::from_ed_pem(pem.as_bytes())?,
            other => {
                return Err(Error::Signing(format!(
                    "Unsupported client assertion algorithm: {other:?}"
                )));
            }
        };

        let mut header = Header::new(algorithm);
        header.kid = key_id;

        Ok(Self {
            client_id: client_id.into(),
            header,
            key,
        })
    }

    /// Client id the assertions are issued for
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Sign a fresh assertion for `audience`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Signing`] if signing fails.
    pub fn sign(&self, audience: &str) -> Result<String> {
        let claims = AssertionClaims::new(&self.client_id, audience, unix_now());
        Ok(encode(&self.header, &claims, &self.key)?)
    }
}

impl fmt::Debug for ClientAssertionSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientAssertionSigner")
            .field("client_id", &self.client_id)
            .field("alg", &self.header.alg)
            .field("kid", &self.header.kid)
            .finish_non_exhaustive()
    }
}
