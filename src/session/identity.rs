//! Identity keys for the session cache
//!
//! A caller is identified by the SHA-256 digest of its raw `Authorization`
//! header. The digest is only an index into the cache: equal credentials map
//! to the same key and the credential itself is never stored.

use std::fmt;

use axum::http::{HeaderMap, header::AUTHORIZATION};
use sha2::{Digest, Sha256};

/// Opaque, fixed-length cache key derived from an inbound credential
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityKey([u8; 32]);

impl IdentityKey {
    /// Derive the key for a raw credential string
    #[must_use]
    pub fn derive(raw_credential: &str) -> Self {
        let digest = Sha256::digest(raw_credential.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(digest.as_slice());
        Self(bytes)
    }

    /// Key under which tokens representing the service itself are cached
    /// when a client-credentials route is called without a credential.
    #[must_use]
    pub const fn service() -> Self {
        Self([0u8; 32])
    }
}

// Only a short fingerprint ever reaches the logs
impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..6]))
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({self})")
    }
}

/// Derive the identity key for a request, `None` without an `Authorization` header
#[must_use]
pub fn derive_key(headers: &HeaderMap) -> Option<IdentityKey> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(IdentityKey::derive)
}

/// Extract the credential from an `Authorization: Bearer <credential>` header
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
