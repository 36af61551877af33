//! Gateway server

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, info};
use url::Url;

use super::auth::AuthState;
use super::proxy::{ProxyInjector, ProxyRoute};
use super::router::{AppState, RoutePaths, create_router};
use crate::config::{Config, FlowKind};
use crate::oauth::{ExchangeEngine, ExchangeFlow, FlowBinding, IdentityProvider};
use crate::session::SessionCache;
use crate::{Error, Result};

/// BFF gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Session cache, shared by the engine and the router
    cache: Arc<SessionCache>,
    /// Shared application state
    state: Arc<AppState>,
}

impl Gateway {
    /// Create a new gateway
    ///
    /// # Errors
    ///
    /// Returns an error if a provider's credentials cannot be loaded, a
    /// route references an unknown provider, or verification is misconfigured.
    pub fn new(config: Config) -> Result<Self> {
        let cache = Arc::new(SessionCache::with_ttl(config.session.ttl));
        let engine = ExchangeEngine::new(Arc::clone(&cache), config.session.drift);

        let mut providers = HashMap::new();
        for (name, provider_config) in &config.identity_providers {
            let provider = IdentityProvider::from_config(name, provider_config)?;
            info!(provider = %name, "Registered identity provider");
            providers.insert(name.clone(), Arc::new(provider));
        }

        let mut routes = Vec::with_capacity(config.proxies.len());
        for proxy in &config.proxies {
            let provider = providers.get(proxy.provider_name()).ok_or_else(|| {
                Error::Config(format!(
                    "Proxy '{}' uses unknown provider '{}'",
                    proxy.ingress,
                    proxy.provider_name()
                ))
            })?;
            let flow = match proxy.flow {
                FlowKind::OnBehalfOf => ExchangeFlow::OnBehalfOf,
                FlowKind::ClientCredentials => ExchangeFlow::ClientCredentials,
                FlowKind::TokenExchange => ExchangeFlow::TokenExchange {
                    audience: proxy.token_exchange_audience().to_string(),
                },
            };
            let upstream = Url::parse(&proxy.upstream)
                .map_err(|e| Error::Config(format!("Proxy '{}': {e}", proxy.ingress)))?;

            info!(
                route = %config.prefixed(&proxy.ingress),
                upstream = %upstream,
                flow = flow.name(),
                provider = %provider.name(),
                "Registered proxy route"
            );
            routes.push(ProxyRoute {
                ingress: config.prefixed(&proxy.ingress),
                upstream,
                binding: FlowBinding {
                    scope: proxy.scope.clone(),
                    flow,
                    provider: Arc::clone(provider),
                },
            });
        }

        let upstream_client = reqwest::Client::builder()
            .timeout(config.server.upstream_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let injector = ProxyInjector::new(engine, upstream_client, routes);

        let auth = AuthState::from_config(&config)?.map(Arc::new);
        if auth.is_none() {
            info!(environment = ?config.environment, "Inbound token verification disabled");
        }

        let state = Arc::new(AppState {
            cache: Arc::clone(&cache),
            injector: Arc::new(injector),
            auth,
            paths: RoutePaths {
                liveness: config.prefixed(&config.actuators.liveness),
                readiness: config.prefixed(&config.actuators.readiness),
                logout: config.prefixed(&config.server.logout_path),
            },
        });

        Ok(Self {
            config,
            cache,
            state,
        })
    }

    /// The router serving this gateway
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    /// Run the gateway
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound or the server fails.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        // Create shutdown channel
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!("BFF gateway listening on {addr}");
        info!(
            "  Routes: {} | Session TTL: {:?} | Drift: {:?}",
            self.state.injector.routes().len(),
            self.cache.ttl(),
            self.config.session.drift
        );
        for route in self.state.injector.routes() {
            info!("  {} -> {}", route.ingress, route.upstream);
        }

        // Start session sweep task
        let cache = Arc::clone(&self.cache);
        let sweep_interval = self.config.session.sweep_interval;
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let evicted = cache.evict_expired();
                        if evicted > 0 {
                            let stats = cache.stats();
                            debug!(evicted, sessions = stats.sessions, hits = stats.hits, misses = stats.misses, "Swept expired sessions");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        // Run server with graceful shutdown
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!(sessions = self.cache.len(), "Gateway stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
