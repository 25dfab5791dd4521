//! Registry authentication: challenge parsing, bearer-token exchange and
//! Basic fallback.

use std::sync::Mutex;

use base64::{engine::general_purpose::STANDARD, Engine};
use getset::Getters;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::{
    oci::coordinate::{AuthMethod, Credentials, ImageCoordinate},
    StrataError, StrataResult,
};

use super::transport::Transport;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A ready-to-send `Authorization` header value.
#[derive(Debug, Clone)]
pub enum AuthHeader {
    /// `Bearer <token>`.
    Bearer(String),
    /// `Basic <base64(user:pass)>`.
    Basic(String),
}

/// A parsed `WWW-Authenticate` challenge,
/// `<mode> realm="<url>",service="<svc>",scope="<scope>"` (quotes
/// optional).
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct AuthChallenge {
    /// The challenge mode, typically `Bearer`.
    mode: String,

    /// The token endpoint to exchange against.
    realm: String,

    /// The service parameter to forward.
    service: Option<String>,

    /// The scope parameter to forward.
    scope: Option<String>,
}

/// Per-coordinate authentication state: the configured method and
/// credentials, plus the cached bearer token once one has been exchanged.
#[derive(Debug)]
pub struct AuthSession {
    method: AuthMethod,
    credentials: Option<Credentials>,
    token: Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AuthHeader {
    /// Returns the header value.
    pub fn value(&self) -> String {
        match self {
            AuthHeader::Bearer(token) => format!("Bearer {token}"),
            AuthHeader::Basic(encoded) => format!("Basic {encoded}"),
        }
    }

    /// Encodes a Basic header from credentials.
    pub fn basic(credentials: &Credentials) -> Self {
        let pair = format!(
            "{}:{}",
            credentials.get_username(),
            credentials.get_password()
        );
        AuthHeader::Basic(STANDARD.encode(pair))
    }
}

impl AuthChallenge {
    /// Parses a `WWW-Authenticate` header value.
    pub fn parse(header: &str) -> StrataResult<Self> {
        let (mode, params) = header.trim().split_once(' ').ok_or_else(|| {
            StrataError::AuthFailed(format!("unparseable WWW-Authenticate header: {header}"))
        })?;

        let mut realm = None;
        let mut service = None;
        let mut scope = None;

        for item in params.split(',') {
            let Some((key, value)) = item.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        let realm = realm.ok_or_else(|| {
            StrataError::AuthFailed(format!("challenge carries no realm: {header}"))
        })?;

        Ok(Self {
            mode: mode.to_string(),
            realm,
            service,
            scope,
        })
    }

    /// Returns the token-endpoint URL with the challenge parameters
    /// attached.
    pub fn token_url(&self) -> String {
        let mut url = self.realm.clone();
        let mut separator = if self.realm.contains('?') { '&' } else { '?' };
        for (key, value) in [("service", &self.service), ("scope", &self.scope)] {
            if let Some(value) = value {
                url.push(separator);
                url.push_str(key);
                url.push('=');
                url.push_str(value);
                separator = '&';
            }
        }
        url
    }
}

impl AuthSession {
    /// Creates the session for a coordinate. No token is cached yet.
    pub fn for_coordinate(coordinate: &ImageCoordinate) -> Self {
        Self {
            method: *coordinate.get_auth_method(),
            credentials: coordinate.get_credentials().clone(),
            token: Mutex::new(None),
        }
    }

    /// Returns the `Authorization` header for the next registry request:
    /// the cached bearer token in token mode, the Basic pair in basic
    /// mode, or nothing.
    pub fn auth_header(&self) -> Option<AuthHeader> {
        match self.method {
            AuthMethod::Token => self
                .token
                .lock()
                .unwrap()
                .as_ref()
                .map(|token| AuthHeader::Bearer(token.clone())),
            AuthMethod::Basic => self.credentials.as_ref().map(AuthHeader::basic),
        }
    }

    /// Returns the configured method.
    pub fn method(&self) -> AuthMethod {
        self.method
    }

    /// Performs the bearer-token exchange named by a 401 challenge and
    /// caches the resulting token.
    ///
    /// Basic credentials, when configured, assist the exchange. Any
    /// deviation (non-200, non-JSON, missing token field) fails the call.
    pub async fn negotiate(
        &self,
        transport: &Transport,
        challenge_header: &str,
    ) -> StrataResult<()> {
        let challenge = AuthChallenge::parse(challenge_header)?;

        tracing::debug!(realm = %challenge.get_realm(), "exchanging bearer token");

        let basic = self.credentials.as_ref().map(AuthHeader::basic);
        let response = transport
            .get(&challenge.token_url(), basic.as_ref())
            .await?;

        if response.status() != StatusCode::OK {
            return Err(StrataError::AuthFailed(format!(
                "bad response getting token: {}",
                response.status()
            )));
        }

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("application/json"))
            .unwrap_or(false);
        if !is_json {
            return Err(StrataError::AuthFailed(
                "invalid response getting token, not json".into(),
            ));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|_| StrataError::AuthFailed("token response missing token".into()))?;

        *self.token.lock().unwrap() = Some(token_response.token);
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_parse_quoted() -> anyhow::Result<()> {
        let challenge = AuthChallenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/ubuntu:pull""#,
        )?;

        assert_eq!(challenge.get_mode(), "Bearer");
        assert_eq!(challenge.get_realm(), "https://auth.docker.io/token");
        assert_eq!(
            challenge.get_service().as_deref(),
            Some("registry.docker.io")
        );
        assert_eq!(
            challenge.get_scope().as_deref(),
            Some("repository:library/ubuntu:pull")
        );
        Ok(())
    }

    #[test]
    fn test_challenge_parse_unquoted() -> anyhow::Result<()> {
        let challenge =
            AuthChallenge::parse("Bearer realm=https://auth.example/token,service=registry")?;
        assert_eq!(challenge.get_realm(), "https://auth.example/token");
        assert_eq!(challenge.get_service().as_deref(), Some("registry"));
        assert_eq!(*challenge.get_scope(), None);
        Ok(())
    }

    #[test]
    fn test_challenge_requires_realm() {
        let result = AuthChallenge::parse("Bearer service=registry");
        assert!(matches!(result, Err(StrataError::AuthFailed(_))));
    }

    #[test]
    fn test_token_url_composition() -> anyhow::Result<()> {
        let challenge = AuthChallenge::parse(
            r#"Bearer realm="https://auth.example/token",service="svc",scope="repository:app:pull""#,
        )?;
        assert_eq!(
            challenge.token_url(),
            "https://auth.example/token?service=svc&scope=repository:app:pull"
        );
        Ok(())
    }

    #[test]
    fn test_basic_header_encoding() {
        // pair encodes as base64("user:pass")
        let credentials = Credentials::new("user", "pass");
        let header = AuthHeader::basic(&credentials);
        assert_eq!(header.value(), "Basic dXNlcjpwYXNz");
    }
}
