//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use super::auth::{AuthState, auth_middleware};
use super::proxy::ProxyInjector;
use crate::Error;
use crate::session::{SessionCache, derive_key};

/// Paths of the built-in endpoints, server prefix included
#[derive(Debug, Clone)]
pub struct RoutePaths {
    /// Liveness actuator
    pub liveness: String,
    /// Readiness actuator
    pub readiness: String,
    /// Session logout
    pub logout: String,
}

/// Shared application state
pub struct AppState {
    /// Session cache shared with the exchange engine
    pub cache: Arc<SessionCache>,
    /// Reverse proxy over the configured routes
    pub injector: Arc<ProxyInjector>,
    /// Inbound verification, `None` when disabled
    pub auth: Option<Arc<AuthState>>,
    /// Built-in endpoint paths
    pub paths: RoutePaths,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route(&state.paths.liveness, get(liveness_handler))
        .route(&state.paths.readiness, get(readiness_handler))
        .route(&state.paths.logout, post(logout_handler))
        .fallback(proxy_handler);

    // Verification runs before any handler, the proxy fallback included
    if let Some(ref auth) = state.auth {
        router = router.layer(middleware::from_fn_with_state(Arc::clone(auth), auth_middleware));
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::new()),
        )
        .with_state(state)
}

/// GET liveness
async fn liveness_handler() -> impl IntoResponse {
    Json(json!({ "status": "UP" }))
}

/// GET readiness, with session cache statistics
async fn readiness_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "UP",
        "sessions": state.cache.stats(),
    }))
}

/// POST logout: forget every token held for the caller
async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let deleted = derive_key(&headers).is_some_and(|key| state.cache.delete(&key));
    info!(deleted, "Session logout");
    Json(json!({ "deleted": deleted }))
}

/// Fallback: proxy to the route owning the path
async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let path = request.uri().path().to_string();

    let Some(route) = state.injector.match_route(&path) else {
        debug!(path = %path, "No route");
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response();
    };

    match state.injector.forward(&route, request).await {
        Ok(response) => response,
        Err(e) => {
            match e {
                Error::MissingSubjectToken(_) => {
                    warn!(path = %path, route = %route.ingress, "Request without bearer credential");
                }
                Error::InvalidPath(_) => {
                    warn!(path = %path, route = %route.ingress, "Rejected path outside upstream base path");
                }
                _ => {}
            }
            e.into_response()
        }
    }
}
