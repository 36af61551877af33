//! End-to-end gateway tests
//!
//! Drives the real router against a mock identity provider and mock
//! upstream APIs:
//! - On-behalf-of exchange, caching and token injection
//! - Degraded forwarding when the identity provider fails
//! - Token exchange without a credential
//! - Paths escaping an upstream base path
//! - Logout, actuators and unknown paths
//! - Inbound JWT verification

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header::AUTHORIZATION},
};
use bff_gateway::config::Config;
use bff_gateway::gateway::Gateway;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;
use tracing_subscriber::fmt::MakeWriter;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const USER_TOKEN: &str = "user-token";

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Write a gateway config pointing at the mock servers and load it
fn load_config(dir: &TempDir, idp: &MockServer, upstream: &MockServer, extra: &str) -> Config {
    let yaml = format!(
        r#"
environment: deployed
server:
  path_prefix: /app
identity_providers:
  azure_ad:
    client_id: my-client
    issuer: https://login.example.com/tenant/v2.0
    token_endpoint: {idp}/token
    signing_key:
      pem_file: {key}
  tokenx:
    client_id: cluster:team:my-app
    token_endpoint: {idp}/tokenx
    assertion_audience: token_endpoint
    signing_key:
      pem_file: {key}
proxies:
  - ingress: /nom-api
    upstream: {upstream}
    scope: api://dev.nom.nom-api/.default
    flow: on_behalf_of
  - ingress: /skjerming
    upstream: {upstream}/skjerming
    scope: dev:team:skjerming
    flow: token_exchange
{extra}
"#,
        idp = idp.uri(),
        upstream = upstream.uri(),
        key = fixture("test_rsa_key.pem").display(),
    );
    let path = dir.path().join("gateway.yaml");
    std::fs::write(&path, yaml).unwrap();

    let config = Config::load(Some(&path)).unwrap();
    config.validate().unwrap();
    config
}

fn router(config: Config) -> Router {
    Gateway::new(config).unwrap().router()
}

fn get(uri: &str, credential: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(credential) = credential {
        builder = builder.header(AUTHORIZATION, format!("Bearer {credential}"));
    }
    builder.body(Body::empty()).unwrap()
}

/// Log sink for asserting on emitted diagnostics
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn token_response(access_token: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "access_token": access_token,
        "expires_in": 3600,
        "token_type": "Bearer",
    }))
}

#[tokio::test]
async fn on_behalf_of_token_is_exchanged_once_and_injected() {
    // GIVEN: an identity provider issuing on-behalf-of tokens
    let idp = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("requested_token_use=on_behalf_of"))
        .and(body_string_contains("assertion=user-token"))
        .respond_with(token_response("obo-token"))
        .expect(1)
        .mount(&idp)
        .await;

    // AND: an upstream expecting the exchanged token
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/person"))
        .and(header("authorization", "Bearer obo-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "Ola" })))
        .expect(2)
        .mount(&upstream)
        .await;

    let dir = TempDir::new().unwrap();
    let app = router(load_config(&dir, &idp, &upstream, ""));

    // WHEN: the same caller makes two requests
    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(get("/app/nom-api/v1/person", Some(USER_TOKEN)))
            .await
            .unwrap();

        // THEN: both are forwarded with the downstream token
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "name": "Ola" }));
    }
}

#[tokio::test]
async fn provider_failure_forwards_without_authorization() {
    // GIVEN: an identity provider that is down
    let idp = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
        .mount(&idp)
        .await;
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/person"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&upstream)
        .await;

    let dir = TempDir::new().unwrap();
    let app = router(load_config(&dir, &idp, &upstream, ""));

    // AND: warnings captured on this thread
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    // WHEN: a request arrives
    let response = app
        .oneshot(get("/app/nom-api/v1/person", Some(USER_TOKEN)))
        .await
        .unwrap();

    // THEN: it reaches the upstream without any credential
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(received[0].headers.get("authorization").is_none());

    // AND: the failed exchange is on record with the provider's status
    let output = logs.contents();
    assert!(output.contains("WARN"), "{output}");
    assert!(output.contains("Token exchange failed"), "{output}");
    assert!(output.contains("HTTP 500"), "{output}");
}

#[tokio::test]
async fn path_traversal_is_rejected_before_forwarding() {
    // GIVEN: a route bound to the upstream's /skjerming base path
    let idp = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(token_response("unexpected"))
        .expect(0)
        .mount(&idp)
        .await;
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let dir = TempDir::new().unwrap();
    let app = router(load_config(&dir, &idp, &upstream, ""));

    // WHEN: paths try to climb out of it
    for uri in ["/app/skjerming/../admin/secrets", "/app/skjerming/%2e%2e/admin"] {
        let response = app.clone().oneshot(get(uri, Some(USER_TOKEN))).await.unwrap();

        // THEN: refused without an exchange or an upstream call
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
    }
}

#[tokio::test]
async fn token_exchange_without_credential_is_rejected() {
    let idp = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(token_response("unexpected"))
        .expect(0)
        .mount(&idp)
        .await;
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let dir = TempDir::new().unwrap();
    let app = router(load_config(&dir, &idp, &upstream, ""));

    let response = app
        .oneshot(get("/app/skjerming/status", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("subject token"));
}

#[tokio::test]
async fn token_exchange_targets_upstream_base_path() {
    let idp = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tokenx"))
        .and(body_string_contains("subject_token=user-token"))
        .respond_with(token_response("tokenx-token"))
        .expect(1)
        .mount(&idp)
        .await;
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/skjerming/status"))
        .and(header("authorization", "Bearer tokenx-token"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&upstream)
        .await;

    let dir = TempDir::new().unwrap();
    let app = router(load_config(&dir, &idp, &upstream, ""));

    let response = app
        .oneshot(get("/app/skjerming/status", Some(USER_TOKEN)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn logout_forgets_the_session() {
    // GIVEN: a caller with a cached token
    let idp = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(token_response("obo-token"))
        .expect(2)
        .mount(&idp)
        .await;
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let dir = TempDir::new().unwrap();
    let app = router(load_config(&dir, &idp, &upstream, ""));
    app.clone()
        .oneshot(get("/app/nom-api/ping", Some(USER_TOKEN)))
        .await
        .unwrap();

    // WHEN: logging out twice
    let logout = || {
        Request::builder()
            .method("POST")
            .uri("/app/logout")
            .header(AUTHORIZATION, format!("Bearer {USER_TOKEN}"))
            .body(Body::empty())
            .unwrap()
    };
    let first = json_body(app.clone().oneshot(logout()).await.unwrap()).await;
    let second = json_body(app.clone().oneshot(logout()).await.unwrap()).await;

    // THEN: only the first one deleted anything
    assert_eq!(first, json!({ "deleted": true }));
    assert_eq!(second, json!({ "deleted": false }));

    // AND: the next request needs a fresh exchange
    app.oneshot(get("/app/nom-api/ping", Some(USER_TOKEN)))
        .await
        .unwrap();
}

#[tokio::test]
async fn actuators_report_up() {
    let idp = MockServer::start().await;
    let upstream = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let app = router(load_config(&dir, &idp, &upstream, ""));

    let liveness = app
        .clone()
        .oneshot(get("/app/internal/health/liveness", None))
        .await
        .unwrap();
    assert_eq!(liveness.status(), StatusCode::OK);
    assert_eq!(json_body(liveness).await, json!({ "status": "UP" }));

    let readiness = app
        .oneshot(get("/app/internal/health/readiness", None))
        .await
        .unwrap();
    assert_eq!(readiness.status(), StatusCode::OK);
    let body = json_body(readiness).await;
    assert_eq!(body["status"], "UP");
    assert_eq!(body["sessions"]["sessions"], 0);
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let idp = MockServer::start().await;
    let upstream = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let app = router(load_config(&dir, &idp, &upstream, ""));

    let response = app
        .oneshot(get("/app/unknown-api/x", Some(USER_TOKEN)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let idp = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(token_response("obo-token"))
        .mount(&idp)
        .await;
    let upstream = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let mut config = load_config(&dir, &idp, &upstream, "");
    config.proxies[0].upstream = "http://127.0.0.1:1".to_string();
    let app = router(config);

    let response = app
        .oneshot(get("/app/nom-api/ping", Some(USER_TOKEN)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

mod verification {
    use super::*;
    use pretty_assertions::assert_eq;

    const ISSUER: &str = "https://login.example.com/tenant/v2.0";

    fn signed_user_token(audience: &str) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some("test-key".to_string());
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let claims = json!({
            "iss": ISSUER,
            "aud": audience,
            "sub": "user-1",
            "iat": now,
            "exp": now + 600,
        });
        let pem = std::fs::read(fixture("test_rsa_key.pem")).unwrap();
        encode(&header, &claims, &EncodingKey::from_rsa_pem(&pem).unwrap()).unwrap()
    }

    async fn verifying_app(idp: &MockServer, upstream: &MockServer, dir: &TempDir) -> Router {
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(std::fs::read_to_string(fixture("test_jwks.json")).unwrap()),
            )
            .mount(idp)
            .await;
        let extra = format!(
            "verification:\n  enabled: true\n  issuer: {ISSUER}\n  audience: my-client\n  jwks_uri: {}/jwks\n",
            idp.uri()
        );
        router(load_config(dir, idp, upstream, &extra))
    }

    #[tokio::test]
    async fn unverified_requests_are_rejected() {
        let idp = MockServer::start().await;
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&upstream)
            .await;
        let dir = TempDir::new().unwrap();
        let app = verifying_app(&idp, &upstream, &dir).await;

        let missing = app
            .clone()
            .oneshot(get("/app/nom-api/ping", None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(missing.headers().get("www-authenticate").unwrap(), "Bearer");

        let forged = app
            .oneshot(get("/app/nom-api/ping", Some(signed_user_token("someone-else").as_str())))
            .await
            .unwrap();
        assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn actuators_bypass_verification() {
        let idp = MockServer::start().await;
        let upstream = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let app = verifying_app(&idp, &upstream, &dir).await;

        let response = app
            .oneshot(get("/app/internal/health/liveness", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn verified_requests_are_proxied() {
        let idp = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(token_response("obo-token"))
            .expect(1)
            .mount(&idp)
            .await;
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer obo-token"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&upstream)
            .await;
        let dir = TempDir::new().unwrap();
        let app = verifying_app(&idp, &upstream, &dir).await;

        let response = app
            .oneshot(get("/app/nom-api/ping", Some(signed_user_token("my-client").as_str())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
