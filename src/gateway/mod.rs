//! Gateway server implementation

pub mod auth;
pub mod proxy;
mod router;
mod server;

pub use auth::{AuthState, JwtVerifier, JwtVerifyError, auth_middleware};
pub use proxy::{ProxyInjector, ProxyRoute};
pub use router::{AppState, RoutePaths, create_router};
pub use server::Gateway;
