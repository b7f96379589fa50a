//! Request execution and response classification.
//!
//! The executor is stateless: it applies the authentication strategy to an
//! outgoing request, sends it, and maps the response status onto the error
//! taxonomy. All session state lives on the channel.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::auth::Authenticator;
use crate::config::TlsOptions;
use crate::error::{Error, Result};

/// Build a reqwest client from the channel-level TLS and timeout options.
pub(crate) fn build_http_client(
    tls: Option<&TlsOptions>,
    timeout: Option<Duration>,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(tls) = tls {
        if tls.accept_invalid_certs {
            warn!("TLS certificate validation disabled - use only for testing!");
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(path) = &tls.ca_cert_path {
            let pem = std::fs::read(path).map_err(|e| {
                Error::Permanent(format!(
                    "failed to read CA certificate {}: {e}",
                    path.display()
                ))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                Error::Permanent(format!(
                    "failed to parse CA certificate {}: {e}",
                    path.display()
                ))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(path) = &tls.client_identity_path {
            let pem = std::fs::read(path).map_err(|e| {
                Error::Permanent(format!(
                    "failed to read client identity {}: {e}",
                    path.display()
                ))
            })?;
            let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
                Error::Permanent(format!(
                    "failed to parse client identity {}: {e}",
                    path.display()
                ))
            })?;
            builder = builder.identity(identity);
        }
    }
    builder
        .build()
        .map_err(|e| Error::Permanent(format!("failed to build HTTP client: {e}")))
}

fn is_success(status: StatusCode) -> bool {
    matches!(status.as_u16(), 200 | 201 | 202 | 204)
}

/// Sends requests and classifies responses onto the error taxonomy.
pub(crate) struct RequestExecutor {
    http: reqwest::Client,
    auth: Option<Arc<dyn Authenticator>>,
}

impl RequestExecutor {
    pub fn new(http: reqwest::Client, auth: Option<Arc<dyn Authenticator>>) -> Self {
        Self { http, auth }
    }

    /// The underlying client, for composing requests.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Apply auth, send, and classify.
    ///
    /// `consumer_scoped` marks routes that embed a consumer instance id:
    /// a 404 there means the server dropped the consumer, which is
    /// reported as [`Error::ConsumerNotFound`] rather than a plain
    /// temporary failure.
    ///
    /// A 401/403 resets the cached credential and comes back as
    /// temporary, so the next retry re-authenticates with a fresh token.
    pub async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        consumer_scoped: bool,
    ) -> Result<reqwest::Response> {
        let request = match &self.auth {
            Some(auth) => auth.apply(request).await?,
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| Error::Temporary(format!("request failed: {e}")))?;

        let status = response.status();
        if is_success(status) {
            return Ok(response);
        }

        match status.as_u16() {
            401 | 403 => {
                if let Some(auth) = &self.auth {
                    auth.reset().await;
                }
                debug!(status = status.as_u16(), "authorization rejected, credential reset");
                Err(Error::Temporary(format!(
                    "authorization rejected with status {status}"
                )))
            }
            404 if consumer_scoped => {
                Err(Error::ConsumerNotFound(response.url().path().to_string()))
            }
            _ => Err(Error::Temporary(format!("unexpected status {status}"))),
        }
    }
}
