//! BFF Gateway Library
//!
//! Backend-for-frontend gateway: terminates user sessions, exchanges the
//! caller's bearer credential for downstream-scoped access tokens and
//! forwards requests to upstream APIs with those tokens attached.
//!
//! # Features
//!
//! - **Delegation flows**: OAuth2 on-behalf-of, client credentials and RFC 8693 token exchange
//! - **Session cache**: per-identity, per-scope token cache with sliding TTL
//! - **Client assertions**: `private_key_jwt` authentication against the identity provider
//! - **Reverse proxy**: streamed bodies, hop-by-hop header filtering, path rewriting
//! - **Inbound verification**: JWKS-backed JWT validation outside local environments
//! - **Production Ready**: actuators, structured logging, graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod oauth;
pub mod session;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
