//! Authenticated reverse proxy
//!
//! For each request bound to a route: run the exchange engine, re-read the
//! session cache, attach the downstream token (or strip the inbound one),
//! rewrite `ingress + rest` to `upstream + rest` and stream the exchange
//! both ways.

use std::sync::Arc;

use axum::{
    body::{Body, HttpBody},
    http::{
        HeaderMap, HeaderName, HeaderValue, Request, Uri,
        header::{AUTHORIZATION, CONNECTION, HOST},
    },
    response::Response,
};
use tracing::{debug, warn};
use url::Url;

use crate::oauth::{ExchangeEngine, FlowBinding};
use crate::session::{bearer_token, derive_key, unix_now};
use crate::{Error, Result};

/// Headers that only apply to a single connection
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A proxied upstream bound to an ingress prefix
#[derive(Debug, Clone)]
pub struct ProxyRoute {
    /// Full ingress prefix (server prefix included), no trailing slash
    pub ingress: String,
    /// Upstream origin and optional base path
    pub upstream: Url,
    /// Scope, flow and provider
    pub binding: FlowBinding,
}

impl ProxyRoute {
    /// Whether `path` belongs to this route
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        path.strip_prefix(self.ingress.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }
}

/// Forwards requests with exchanged tokens attached
pub struct ProxyInjector {
    engine: ExchangeEngine,
    http_client: reqwest::Client,
    /// Longest ingress first
    routes: Vec<Arc<ProxyRoute>>,
}

impl ProxyInjector {
    /// Create an injector over `routes`
    #[must_use]
    pub fn new(engine: ExchangeEngine, http_client: reqwest::Client, routes: Vec<ProxyRoute>) -> Self {
        let mut routes: Vec<_> = routes.into_iter().map(Arc::new).collect();
        routes.sort_by(|a, b| b.ingress.len().cmp(&a.ingress.len()));
        Self {
            engine,
            http_client,
            routes,
        }
    }

    /// Configured routes, longest ingress first
    #[must_use]
    pub fn routes(&self) -> &[Arc<ProxyRoute>] {
        &self.routes
    }

    /// The route serving `path`, preferring the longest matching ingress
    #[must_use]
    pub fn match_route(&self, path: &str) -> Option<Arc<ProxyRoute>> {
        self.routes.iter().find(|r| r.matches(path)).cloned()
    }

    /// Exchange, attach and forward one request
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingSubjectToken`] if the route's flow needs a
    /// credential the request lacks, and [`Error::ProxyUpstreamUnreachable`]
    /// if the upstream cannot be reached.
    pub async fn forward(&self, route: &ProxyRoute, request: Request<Body>) -> Result<Response> {
        let (parts, body) = request.into_parts();
        let target = rewrite_target(&route.upstream, &route.ingress, &parts.uri)?;

        let identity = derive_key(&parts.headers);
        let subject = bearer_token(&parts.headers);
        let outcome = self
            .engine
            .exchange(&route.binding, identity, subject)
            .await?;

        // Re-read after the engine's write
        let token = route
            .binding
            .cache_key(identity)
            .and_then(|key| self.engine.cache().peek(&key, &route.binding.scope))
            .filter(|record| !record.is_expired(unix_now()));

        let mut headers = forwarded_headers(&parts.headers);
        match token {
            Some(record) => {
                let value = HeaderValue::from_str(&format!("Bearer {}", record.access_token))
                    .map_err(|e| Error::Internal(format!("Unusable access token: {e}")))?;
                headers.insert(AUTHORIZATION, value);
            }
            None => {
                warn!(
                    route = %route.ingress,
                    scope = %route.binding.scope,
                    outcome = ?outcome,
                    "No downstream token, forwarding without Authorization"
                );
            }
        }

        debug!(route = %route.ingress, method = %parts.method, target = %target, outcome = ?outcome, "Forwarding request");

        let mut outbound = self
            .http_client
            .request(parts.method, target.clone())
            .headers(headers);
        if !body.is_end_stream() {
            outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream = outbound.send().await.map_err(|e| {
            warn!(route = %route.ingress, target = %target, error = %e, "Upstream unreachable");
            Error::ProxyUpstreamUnreachable(format!("{}: {e}", route.ingress))
        })?;

        let mut response = Response::builder().status(upstream.status());
        if let Some(response_headers) = response.headers_mut() {
            *response_headers = forwarded_headers(upstream.headers());
        }
        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| Error::Internal(format!("Failed to build response: {e}")))
    }
}

/// Map `ingress + rest` onto `upstream + rest`, keeping the query string
///
/// # Errors
///
/// Returns [`Error::InvalidPath`] if `rest` holds dot segments (plain or
/// percent-encoded) or the target ends up outside the upstream base path,
/// and [`Error::Internal`] if the resulting URL does not parse.
pub fn rewrite_target(upstream: &Url, ingress: &str, uri: &Uri) -> Result<Url> {
    let rest = uri.path().strip_prefix(ingress).unwrap_or(uri.path());
    if rest.split(['/', '\\']).any(is_dot_segment) {
        return Err(Error::InvalidPath(format!("dot segment in {}", uri.path())));
    }

    let base = upstream.as_str().trim_end_matches('/');
    let mut target = format!("{base}{rest}");
    if let Some(query) = uri.query() {
        target.push('?');
        target.push_str(query);
    }
    let target = Url::parse(&target)
        .map_err(|e| Error::Internal(format!("Invalid upstream URL {target}: {e}")))?;

    let base_path = upstream.path().trim_end_matches('/');
    let inside = target
        .path()
        .strip_prefix(base_path)
        .is_some_and(|tail| tail.is_empty() || tail.starts_with('/'));
    if target.origin() != upstream.origin() || !inside {
        return Err(Error::InvalidPath(format!(
            "{} escapes upstream base path",
            uri.path()
        )));
    }
    Ok(target)
}

/// `.` or `..`, in any mix of literal and `%2e` spellings
fn is_dot_segment(segment: &str) -> bool {
    let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
    decoded == "." || decoded == ".."
}

/// Copy end-to-end headers, dropping hop-by-hop ones, `Host` and `Authorization`
///
/// Headers named in `Connection` are hop-by-hop as well.
#[must_use]
pub fn forwarded_headers(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.as_str())
            || *name == HOST
            || *name == AUTHORIZATION
            || listed.contains(name)
        {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}
