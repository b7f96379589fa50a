//! Pluggable authentication strategies.
//!
//! A strategy decorates outgoing requests with credentials and can drop a
//! cached token so the next request re-acquires one. Strategies are shared
//! across channels behind an `Arc`, and a channel's request executor calls
//! [`Authenticator::reset`] whenever the service answers 401/403, so the
//! retry that follows authenticates from scratch.
//!
//! Two strategies are built in:
//!
//! - [`BasicAuthenticator`]: username/password login against
//!   `/identity/v1/login`, returning a bearer token.
//! - [`ClientCredentialsAuthenticator`]: OAuth2 client-credentials grant
//!   against `/iam/v1.4/token`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::TlsOptions;
use crate::error::{Error, Result};
use crate::http::build_http_client;

const LOGIN_PATH: &str = "/identity/v1/login";
const TOKEN_PATH: &str = "/iam/v1.4/token";

/// Capability that attaches credentials to outgoing requests.
///
/// `apply` and `reset` must be safe for sequential reentry from multiple
/// channels; token caching is the strategy's responsibility.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Attach credentials to an outgoing request.
    async fn apply(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder>;

    /// Discard any cached credential so the next [`apply`](Self::apply)
    /// re-acquires one.
    async fn reset(&self);
}

fn classify_token_status(endpoint: &str, status: reqwest::StatusCode) -> Error {
    match status.as_u16() {
        401 | 403 => Error::AuthenticationPermanent(format!(
            "{endpoint} rejected the credentials with status {status}"
        )),
        _ => Error::AuthenticationTemporary(format!(
            "{endpoint} answered with unexpected status {status}"
        )),
    }
}

// ============================================================================
// Basic credential strategy
// ============================================================================

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "AuthorizationToken")]
    authorization_token: Option<String>,
}

/// Username/password strategy backed by the identity login endpoint.
///
/// The first `apply` performs a GET against `/identity/v1/login` with HTTP
/// basic auth and caches the returned `AuthorizationToken`; subsequent
/// calls attach it as a bearer token until [`reset`](Authenticator::reset).
pub struct BasicAuthenticator {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    token: Mutex<Option<String>>,
}

impl BasicAuthenticator {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        Self::with_tls(base_url, username, password, None)
    }

    pub fn with_tls(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        tls: Option<TlsOptions>,
    ) -> Result<Self> {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self {
            http: build_http_client(tls.as_ref(), Some(Duration::from_secs(30)))?,
            base_url,
            username: username.into(),
            password: password.into(),
            token: Mutex::new(None),
        })
    }

    async fn acquire_token(&self) -> Result<String> {
        let url = format!("{}{}", self.base_url, LOGIN_PATH);
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| Error::AuthenticationTemporary(format!("login request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() != 200 {
            return Err(classify_token_status("login endpoint", status));
        }

        let body: LoginResponse = response.json().await.map_err(|e| {
            Error::AuthenticationTemporary(format!("invalid login response: {e}"))
        })?;
        body.authorization_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                Error::AuthenticationPermanent(
                    "login response is missing AuthorizationToken".to_string(),
                )
            })
    }
}

#[async_trait]
impl Authenticator for BasicAuthenticator {
    async fn apply(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let mut cached = self.token.lock().await;
        let token = match cached.as_ref() {
            Some(token) => token.clone(),
            None => {
                let token = self.acquire_token().await?;
                debug!(user = %self.username, "login token acquired");
                *cached = Some(token.clone());
                token
            }
        };
        Ok(request.bearer_auth(token))
    }

    async fn reset(&self) {
        self.token.lock().await.take();
    }
}

// ============================================================================
// OAuth2 client-credentials strategy
// ============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

/// OAuth2 client-credentials strategy backed by the IAM token endpoint.
///
/// The first `apply` POSTs to `/iam/v1.4/token` with the client id/secret
/// as HTTP basic auth and `scope`, `grant_type`, `audience` as form
/// fields; the returned `access_token` is cached until
/// [`reset`](Authenticator::reset).
pub struct ClientCredentialsAuthenticator {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
    grant_type: String,
    audience: String,
    token: Mutex<Option<String>>,
}

impl ClientCredentialsAuthenticator {
    pub fn builder(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> ClientCredentialsBuilder {
        ClientCredentialsBuilder {
            base_url: base_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope: String::new(),
            grant_type: "client_credentials".to_string(),
            audience: String::new(),
            tls: None,
        }
    }

    async fn acquire_token(&self) -> Result<String> {
        let url = format!("{}{}", self.base_url, TOKEN_PATH);
        let form = [
            ("scope", self.scope.as_str()),
            ("grant_type", self.grant_type.as_str()),
            ("audience", self.audience.as_str()),
        ];
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::AuthenticationTemporary(format!("token request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() != 200 {
            return Err(classify_token_status("token endpoint", status));
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            Error::AuthenticationTemporary(format!("invalid token response: {e}"))
        })?;
        body.access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                Error::AuthenticationPermanent(
                    "token response is missing access_token".to_string(),
                )
            })
    }
}

#[async_trait]
impl Authenticator for ClientCredentialsAuthenticator {
    async fn apply(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let mut cached = self.token.lock().await;
        let token = match cached.as_ref() {
            Some(token) => token.clone(),
            None => {
                let token = self.acquire_token().await?;
                debug!(client_id = %self.client_id, "access token acquired");
                *cached = Some(token.clone());
                token
            }
        };
        Ok(request.bearer_auth(token))
    }

    async fn reset(&self) {
        self.token.lock().await.take();
    }
}

/// Builder for [`ClientCredentialsAuthenticator`].
pub struct ClientCredentialsBuilder {
    base_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
    grant_type: String,
    audience: String,
    tls: Option<TlsOptions>,
}

impl ClientCredentialsBuilder {
    /// Set the requested token scope.
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Override the grant type (default: `client_credentials`).
    pub fn grant_type(mut self, grant_type: impl Into<String>) -> Self {
        self.grant_type = grant_type.into();
        self
    }

    /// Set the token audience.
    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = audience.into();
        self
    }

    /// Set TLS options for the token endpoint client.
    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn build(self) -> Result<ClientCredentialsAuthenticator> {
        let mut base_url = self.base_url;
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(ClientCredentialsAuthenticator {
            http: build_http_client(self.tls.as_ref(), Some(Duration::from_secs(30)))?,
            base_url,
            client_id: self.client_id,
            client_secret: self.client_secret,
            scope: self.scope,
            grant_type: self.grant_type,
            audience: self.audience,
            token: Mutex::new(None),
        })
    }
}
