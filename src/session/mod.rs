//! Session state: identity keys and the per-identity token cache

pub mod cache;
pub mod identity;

pub use cache::{CacheStatsSnapshot, DEFAULT_SESSION_TTL, SessionCache, TokenRecord, unix_now};
pub use identity::{IdentityKey, bearer_token, derive_key};
