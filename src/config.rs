//! Configuration management

use std::{collections::HashMap, env, fs, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use jsonwebtoken::Algorithm;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Provider used by on-behalf-of and client-credentials routes unless overridden
pub const DEFAULT_DELEGATION_PROVIDER: &str = "azure_ad";
/// Provider used by token-exchange routes unless overridden
pub const DEFAULT_TOKEN_EXCHANGE_PROVIDER: &str = "tokenx";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Deployment environment, decided once at startup
    pub environment: Environment,
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Session cache configuration
    pub session: SessionConfig,
    /// Identity providers by name (`azure_ad`, `tokenx`, ...)
    pub identity_providers: HashMap<String, ProviderConfig>,
    /// Inbound JWT verification
    pub verification: VerificationConfig,
    /// Proxied upstream APIs
    pub proxies: Vec<ProxyConfig>,
    /// Liveness/readiness endpoints
    pub actuators: ActuatorConfig,
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Running on a developer machine: inbound JWT verification is skipped
    Local,
    /// Running in a real cluster
    #[default]
    Deployed,
}

impl Environment {
    /// Whether this is a local developer environment
    #[must_use]
    pub fn is_local(self) -> bool {
        self == Self::Local
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Prefix prepended to every route (proxies, actuators, logout)
    pub path_prefix: String,
    /// Path of the logout endpoint, relative to `path_prefix`
    pub logout_path: String,
    /// Timeout for forwarded upstream requests
    #[serde(with = "humantime_serde")]
    pub upstream_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            path_prefix: String::new(),
            logout_path: "/logout".to_string(),
            upstream_timeout: Duration::from_secs(60),
        }
    }
}

/// Session cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sliding TTL of a session, measured from its last write
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Tokens expiring within this window are treated as expired
    #[serde(with = "humantime_serde")]
    pub drift: Duration,
    /// Interval of the background eviction sweep
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            drift: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Identity provider (token endpoint) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Our client id at the provider (supports `env:VAR_NAME`)
    pub client_id: String,
    /// Issuer URL; required when it is the assertion audience and no
    /// well-known URL is configured
    #[serde(default)]
    pub issuer: Option<String>,
    /// Token endpoint URL
    #[serde(default)]
    pub token_endpoint: Option<String>,
    /// OpenID discovery document, used when no token endpoint is given
    #[serde(default)]
    pub well_known_url: Option<String>,
    /// Key used to sign client assertions
    pub signing_key: SigningKeyConfig,
    /// Which identifier goes into the client assertion's `aud` claim
    #[serde(default)]
    pub assertion_audience: AssertionAudience,
    /// Timeout for token endpoint calls
    #[serde(default = "default_provider_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_provider_timeout() -> Duration {
    Duration::from_secs(10)
}

impl ProviderConfig {
    /// Resolve the client id (expand `env:VAR_NAME`)
    pub fn resolve_client_id(&self) -> Result<String> {
        resolve_secret(&self.client_id, "client_id")
    }
}

/// Audience of the client assertion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssertionAudience {
    /// The provider's issuer (Azure AD style)
    #[default]
    Issuer,
    /// The provider's token endpoint (TokenX style)
    TokenEndpoint,
}

/// Private key material for client assertions
#[derive(Clone, Serialize, Deserialize)]
pub struct SigningKeyConfig {
    /// PEM-encoded private key (supports `env:VAR_NAME`)
    #[serde(default)]
    pub pem: Option<String>,
    /// File containing the PEM-encoded private key
    #[serde(default)]
    pub pem_file: Option<PathBuf>,
    /// Key id placed in the assertion header
    #[serde(default)]
    pub key_id: Option<String>,
    /// Signature algorithm
    #[serde(default = "default_signing_algorithm")]
    pub algorithm: Algorithm,
}

fn default_signing_algorithm() -> Algorithm {
    Algorithm::RS256
}

impl std::fmt::Debug for SigningKeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyConfig")
            .field("pem", &self.pem.as_ref().map(|_| "<redacted>"))
            .field("pem_file", &self.pem_file)
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl SigningKeyConfig {
    /// Load the PEM key material from its configured source
    pub fn resolve_pem(&self) -> Result<String> {
        if let Some(ref pem) = self.pem {
            return resolve_secret(pem, "signing_key.pem");
        }
        if let Some(ref path) = self.pem_file {
            return fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("Cannot read signing key {}: {e}", path.display()))
            });
        }
        Err(Error::Config(
            "signing_key needs either `pem` or `pem_file`".to_string(),
        ))
    }
}

/// Delegation flow used by a proxy route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    /// OAuth2 on-behalf-of (jwt-bearer) grant
    OnBehalfOf,
    /// OAuth2 client-credentials grant
    ClientCredentials,
    /// RFC 8693 token exchange
    TokenExchange,
}

impl FlowKind {
    fn default_provider(self) -> &'static str {
        match self {
            Self::TokenExchange => DEFAULT_TOKEN_EXCHANGE_PROVIDER,
            Self::OnBehalfOf | Self::ClientCredentials => DEFAULT_DELEGATION_PROVIDER,
        }
    }
}

/// A proxied upstream API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Ingress path prefix, relative to `server.path_prefix`
    pub ingress: String,
    /// Upstream origin (and optional base path)
    pub upstream: String,
    /// Scope requested for the downstream token
    pub scope: String,
    /// Delegation flow
    pub flow: FlowKind,
    /// Identity provider name; defaults to `azure_ad`, or `tokenx` for token exchange
    #[serde(default)]
    pub provider: Option<String>,
    /// Token-exchange audience; defaults to `scope`
    #[serde(default)]
    pub audience: Option<String>,
}

impl ProxyConfig {
    /// Name of the identity provider serving this route
    #[must_use]
    pub fn provider_name(&self) -> &str {
        self.provider
            .as_deref()
            .unwrap_or_else(|| self.flow.default_provider())
    }

    /// Audience requested in a token exchange
    #[must_use]
    pub fn token_exchange_audience(&self) -> &str {
        self.audience.as_deref().unwrap_or(&self.scope)
    }
}

/// Inbound JWT verification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Verify inbound bearer tokens (always skipped in the local environment)
    pub enabled: bool,
    /// Expected `iss`
    pub issuer: Option<String>,
    /// Expected `aud` (usually our client id, supports `env:VAR_NAME`)
    pub audience: Option<String>,
    /// JWKS endpoint of the issuer
    pub jwks_uri: Option<String>,
    /// How long a fetched JWKS is trusted
    #[serde(with = "humantime_serde")]
    pub jwks_cache_ttl: Duration,
    /// Clock skew tolerance in seconds
    pub leeway_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            issuer: None,
            audience: None,
            jwks_uri: None,
            jwks_cache_ttl: Duration::from_secs(3600),
            leeway_secs: 60,
        }
    }
}

/// Liveness/readiness endpoint paths, relative to `server.path_prefix`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    /// Liveness path
    pub liveness: String,
    /// Readiness path
    pub readiness: String,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            liveness: "/internal/health/liveness".to_string(),
            readiness: "/internal/health/readiness".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// Call [`Config::validate`] once command-line overrides are applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (BFF_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("BFF_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();
        config.expand_env_vars();
        config.normalize_paths();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in URLs and scopes
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for proxy in &mut self.proxies {
            proxy.upstream = Self::expand_string(&re, &proxy.upstream);
            proxy.scope = Self::expand_string(&re, &proxy.scope);
            if let Some(ref mut audience) = proxy.audience {
                *audience = Self::expand_string(&re, audience);
            }
        }

        for provider in self.identity_providers.values_mut() {
            for url in [
                &mut provider.issuer,
                &mut provider.token_endpoint,
                &mut provider.well_known_url,
            ]
            .into_iter()
            .flatten()
            {
                *url = Self::expand_string(&re, url);
            }
        }

        for value in [
            &mut self.verification.issuer,
            &mut self.verification.jwks_uri,
        ]
        .into_iter()
        .flatten()
        {
            *value = Self::expand_string(&re, value);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Strip trailing slashes from route prefixes
    fn normalize_paths(&mut self) {
        self.server.path_prefix = normalize_prefix(&self.server.path_prefix);
        for proxy in &mut self.proxies {
            proxy.ingress = normalize_prefix(&proxy.ingress);
        }
    }

    /// Full path of a route relative to the server prefix
    #[must_use]
    pub fn prefixed(&self, path: &str) -> String {
        format!("{}{}", self.server.path_prefix, path)
    }

    /// Check that routes, providers and verification settings fit together
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        for (field, path) in [
            ("server.logout_path", &self.server.logout_path),
            ("actuators.liveness", &self.actuators.liveness),
            ("actuators.readiness", &self.actuators.readiness),
        ] {
            if !path.starts_with('/') {
                return Err(Error::Config(format!("{field} must start with '/'")));
            }
        }
        if self.session.sweep_interval.is_zero() {
            return Err(Error::Config(
                "session.sweep_interval must be greater than zero".to_string(),
            ));
        }

        for (name, provider) in &self.identity_providers {
            if provider.client_id.trim().is_empty() {
                return Err(Error::Config(format!("Provider '{name}': client_id is empty")));
            }
            if provider.token_endpoint.is_none() && provider.well_known_url.is_none() {
                return Err(Error::Config(format!(
                    "Provider '{name}': needs token_endpoint or well_known_url"
                )));
            }
            if provider.assertion_audience == AssertionAudience::Issuer
                && provider.issuer.is_none()
                && provider.well_known_url.is_none()
            {
                return Err(Error::Config(format!(
                    "Provider '{name}': assertion audience is the issuer but no issuer is configured"
                )));
            }
            if provider.signing_key.pem.is_none() && provider.signing_key.pem_file.is_none() {
                return Err(Error::Config(format!(
                    "Provider '{name}': signing_key needs either `pem` or `pem_file`"
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for proxy in &self.proxies {
            if !proxy.ingress.starts_with('/') {
                return Err(Error::Config(format!(
                    "Proxy ingress '{}' must start with '/'",
                    proxy.ingress
                )));
            }
            if !seen.insert(proxy.ingress.as_str()) {
                return Err(Error::Config(format!(
                    "Proxy ingress '{}' is configured twice",
                    proxy.ingress
                )));
            }
            let upstream = Url::parse(&proxy.upstream).map_err(|e| {
                Error::Config(format!("Proxy '{}': invalid upstream: {e}", proxy.ingress))
            })?;
            if !matches!(upstream.scheme(), "http" | "https") {
                return Err(Error::Config(format!(
                    "Proxy '{}': upstream must be http(s)",
                    proxy.ingress
                )));
            }
            if proxy.scope.trim().is_empty() {
                return Err(Error::Config(format!("Proxy '{}': scope is empty", proxy.ingress)));
            }
            let provider = proxy.provider_name();
            if !self.identity_providers.contains_key(provider) {
                return Err(Error::Config(format!(
                    "Proxy '{}' uses provider '{provider}', which is not configured",
                    proxy.ingress
                )));
            }
        }

        if self.verification.enabled && !self.environment.is_local() {
            let v = &self.verification;
            if v.issuer.is_none() || v.audience.is_none() || v.jwks_uri.is_none() {
                return Err(Error::Config(
                    "verification needs issuer, audience and jwks_uri".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Resolve `env:VAR_NAME` indirection; literal values pass through
///
/// # Errors
///
/// Returns [`Error::Config`] if the referenced variable is not set.
pub fn resolve_secret(value: &str, field: &str) -> Result<String> {
    match value.strip_prefix("env:") {
        Some(var_name) => env::var(var_name).map_err(|_| {
            Error::Config(format!(
                "Missing environment variable {var_name} (referenced by {field})"
            ))
        }),
        None => Ok(value.to_string()),
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "1h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "30s", "5m", "1h", "100ms" or a bare number of seconds
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" before "s"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
