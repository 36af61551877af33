//! OAuth 2.0 delegation for downstream APIs
//!
//! Features:
//! - Client assertions (RFC 7523, `private_key_jwt`)
//! - On-behalf-of, client-credentials, refresh and token-exchange (RFC 8693) grants
//! - Lazy provider metadata discovery (RFC 8414 / OpenID Connect)
//! - Exchange engine deciding between reuse, refresh and a fresh grant

mod assertion;
mod exchange;
mod grant;
mod metadata;
mod provider;

pub use assertion::{AssertionClaims, CLIENT_ASSERTION_TYPE, ClientAssertionSigner};
pub use exchange::{DEFAULT_DRIFT, ExchangeEngine, ExchangeFlow, ExchangeOutcome, FlowBinding};
pub use grant::{Grant, TokenResponse};
pub use metadata::ProviderMetadata;
pub use provider::IdentityProvider;
