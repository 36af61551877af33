//! Grant requests and token responses

use serde::Deserialize;

use super::assertion::CLIENT_ASSERTION_TYPE;
use crate::session::TokenRecord;

/// `grant_type` of the on-behalf-of flow
pub const GRANT_TYPE_JWT_BEARER: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// `grant_type` of RFC 8693 token exchange
pub const GRANT_TYPE_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
/// `subject_token_type` sent with token exchange
pub const SUBJECT_TOKEN_TYPE_JWT: &str = "urn:ietf:params:oauth:token-type:jwt";

/// One grant request against a token endpoint
#[derive(Clone, Copy)]
pub enum Grant<'a> {
    /// Exchange the caller's token for one scoped to a downstream API
    OnBehalfOf {
        /// Caller's bearer credential
        assertion: &'a str,
    },
    /// Obtain a token representing the gateway itself
    ClientCredentials,
    /// Renew a previously issued token
    RefreshToken {
        /// Refresh token from the cached record
        refresh_token: &'a str,
    },
    /// RFC 8693 token exchange
    TokenExchange {
        /// Caller's bearer credential
        subject_token: &'a str,
        /// Target audience
        audience: &'a str,
    },
}

impl<'a> Grant<'a> {
    /// Value of the `grant_type` form field
    #[must_use]
    pub fn grant_type(&self) -> &'static str {
        match self {
            Self::OnBehalfOf { .. } => GRANT_TYPE_JWT_BEARER,
            Self::ClientCredentials => "client_credentials",
            Self::RefreshToken { .. } => "refresh_token",
            Self::TokenExchange { .. } => GRANT_TYPE_TOKEN_EXCHANGE,
        }
    }

    /// Short name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::OnBehalfOf { .. } => "on_behalf_of",
            Self::ClientCredentials => "client_credentials",
            Self::RefreshToken { .. } => "refresh_token",
            Self::TokenExchange { .. } => "token_exchange",
        }
    }

    /// Form fields of the request, including client authentication
    #[must_use]
    pub fn form(
        &self,
        client_id: &'a str,
        scope: &'a str,
        client_assertion: &'a str,
    ) -> Vec<(&'static str, &'a str)> {
        let mut params = vec![
            ("grant_type", self.grant_type()),
            ("client_id", client_id),
            ("scope", scope),
            ("client_assertion_type", CLIENT_ASSERTION_TYPE),
            ("client_assertion", client_assertion),
        ];

        match *self {
            Self::OnBehalfOf { assertion } => {
                params.push(("assertion", assertion));
                params.push(("requested_token_use", "on_behalf_of"));
            }
            Self::RefreshToken { refresh_token } => {
                params.push(("refresh_token", refresh_token));
            }
            Self::TokenExchange {
                subject_token,
                audience,
            } => {
                params.push(("subject_token", subject_token));
                params.push(("subject_token_type", SUBJECT_TOKEN_TYPE_JWT));
                params.push(("audience", audience));
            }
            Self::ClientCredentials => {}
        }

        params
    }
}

// Credentials never reach Debug output
impl std::fmt::Debug for Grant<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TokenExchange { audience, .. } => f
                .debug_struct("TokenExchange")
                .field("audience", audience)
                .finish_non_exhaustive(),
            other => f.write_str(other.name()),
        }
    }
}

/// Successful token endpoint response
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    /// Issued access token
    pub access_token: String,
    /// Lifetime in seconds
    pub expires_in: u64,
    /// Refresh token, if the provider issued one
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl TokenResponse {
    /// Turn the response into a cache record issued at `now`
    #[must_use]
    pub fn into_record(self, now: u64) -> TokenRecord {
        TokenRecord::issued(self.access_token, self.refresh_token, self.expires_in, now)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn form_map(grant: Grant<'_>) -> HashMap<String, String> {
        let body = serde_urlencoded::to_string(grant.form("my-client", "api://x/.default", "signed.jwt"))
            .unwrap();
        serde_urlencoded::from_str(&body).unwrap()
    }

    #[test]
    fn common_fields_are_always_present() {
        for grant in [
            Grant::ClientCredentials,
            Grant::OnBehalfOf { assertion: "a" },
            Grant::RefreshToken { refresh_token: "r" },
            Grant::TokenExchange {
                subject_token: "s",
                audience: "aud",
            },
        ] {
            let form = form_map(grant);
            assert_eq!(form["grant_type"], grant.grant_type());
            assert_eq!(form["client_id"], "my-client");
            assert_eq!(form["scope"], "api://x/.default");
            assert_eq!(form["client_assertion_type"], CLIENT_ASSERTION_TYPE);
            assert_eq!(form["client_assertion"], "signed.jwt");
        }
    }

    #[test]
    fn on_behalf_of_fields() {
        let form = form_map(Grant::OnBehalfOf {
            assertion: "user.jwt",
        });
        assert_eq!(form["grant_type"], "urn:ietf:params:oauth:grant-type:jwt-bearer");
        assert_eq!(form["assertion"], "user.jwt");
        assert_eq!(form["requested_token_use"], "on_behalf_of");
    }

    #[test]
    fn refresh_fields() {
        let form = form_map(Grant::RefreshToken {
            refresh_token: "rt-1",
        });
        assert_eq!(form["grant_type"], "refresh_token");
        assert_eq!(form["refresh_token"], "rt-1");
        assert!(!form.contains_key("assertion"));
    }

    #[test]
    fn client_credentials_has_no_subject() {
        let form = form_map(Grant::ClientCredentials);
        assert_eq!(form["grant_type"], "client_credentials");
        assert_eq!(form.len(), 5);
    }

    #[test]
    fn token_exchange_fields() {
        let form = form_map(Grant::TokenExchange {
            subject_token: "user.jwt",
            audience: "dev:team:app",
        });
        assert_eq!(
            form["grant_type"],
            "urn:ietf:params:oauth:grant-type:token-exchange"
        );
        assert_eq!(form["subject_token"], "user.jwt");
        assert_eq!(form["subject_token_type"], SUBJECT_TOKEN_TYPE_JWT);
        assert_eq!(form["audience"], "dev:team:app");
    }

    #[test]
    fn debug_hides_credentials() {
        let debug = format!(
            "{:?}",
            Grant::TokenExchange {
                subject_token: "secret-user-token",
                audience: "aud",
            }
        );
        assert!(!debug.contains("secret"));
        assert_eq!(
            format!("{:?}", Grant::OnBehalfOf { assertion: "secret" }),
            "on_behalf_of"
        );
    }

    #[test]
    fn token_response_becomes_record() {
        let response: TokenResponse = serde_json::from_str(
            r#"{"access_token":"at","expires_in":3599,"refresh_token":"rt","token_type":"Bearer"}"#,
        )
        .unwrap();
        let record = response.into_record(1_000);
        assert_eq!(record.access_token, "at");
        assert_eq!(record.refresh_token.as_deref(), Some("rt"));
        assert_eq!(record.expires_at, 4_599);
    }

    #[test]
    fn token_response_without_refresh_token() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"at","expires_in":60}"#).unwrap();
        assert!(response.refresh_token.is_none());
    }
}
