//! Channel configuration.
//!
//! [`ChannelConfig`] normalizes the caller-facing options into the shape
//! the service expects: path prefixes default to the databus service
//! routes, timeout durations are rendered as millisecond strings in the
//! server-side consumer config map, and the offset-reset policy is a
//! closed enum rather than a free-form string.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Authenticator;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Default route prefix for consumer operations.
pub const DEFAULT_CONSUMER_PATH_PREFIX: &str = "/databus/consumer-service/v1";

/// Default route prefix for produce operations.
pub const DEFAULT_PRODUCER_PATH_PREFIX: &str = "/databus/cloudproxy/v1";

/// Where a freshly created consumer starts reading when the group has no
/// committed offset (the server-side `auto.offset.reset` config).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OffsetReset {
    /// Start at the newest record.
    #[default]
    Latest,
    /// Start at the oldest retained record.
    Earliest,
    /// Fail when no committed offset exists.
    None,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Latest => "latest",
            OffsetReset::Earliest => "earliest",
            OffsetReset::None => "none",
        }
    }
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OffsetReset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "latest" => Ok(OffsetReset::Latest),
            "earliest" => Ok(OffsetReset::Earliest),
            "none" => Ok(OffsetReset::None),
            other => Err(Error::Permanent(format!(
                "invalid offset reset {other:?}: expected latest, earliest or none"
            ))),
        }
    }
}

/// TLS options applied to the HTTP transport.
///
/// Certificates and identities are unencrypted PEM files; an identity
/// bundle carries both the client certificate and its private key.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Extra root CA certificate to trust (PEM).
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate + private key for mutual TLS (PEM bundle).
    pub client_identity_path: Option<PathBuf>,
    /// Skip server certificate verification. Testing only.
    pub accept_invalid_certs: bool,
}

/// Configuration for a [`Channel`](crate::Channel).
#[derive(Clone)]
pub struct ChannelConfig {
    /// Service base URL, without a trailing slash.
    pub base_url: String,
    /// Route prefix for consumer operations.
    pub consumer_path_prefix: String,
    /// Route prefix for produce operations.
    pub producer_path_prefix: String,
    /// Consumer group identity; required for any consumer operation.
    pub consumer_group: Option<String>,
    /// Authentication strategy shared with the transport.
    pub auth: Option<Arc<dyn Authenticator>>,
    /// Offset reset policy for newly created consumers.
    pub offset_reset: OffsetReset,
    /// Server-side consumer session timeout.
    pub session_timeout: Option<Duration>,
    /// Server-side consumer request timeout.
    pub request_timeout: Option<Duration>,
    /// Whether the server auto-commits offsets (defaulted off; commits
    /// are driven explicitly by the channel).
    pub enable_auto_commit: bool,
    /// Whether temporary failures are retried with backoff.
    pub retry_on_fail: bool,
    /// Backoff parameters used by the retry driver.
    pub retry_policy: RetryPolicy,
    /// Extra server-side consumer configs, merged under the typed options.
    pub extra_configs: HashMap<String, String>,
    /// TLS options for the transport.
    pub tls: Option<TlsOptions>,
    /// Whole-request timeout on the HTTP client.
    pub http_timeout: Option<Duration>,
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("base_url", &self.base_url)
            .field("consumer_path_prefix", &self.consumer_path_prefix)
            .field("producer_path_prefix", &self.producer_path_prefix)
            .field("consumer_group", &self.consumer_group)
            .field("auth", &self.auth.as_ref().map(|_| "<strategy>"))
            .field("offset_reset", &self.offset_reset)
            .field("session_timeout", &self.session_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("enable_auto_commit", &self.enable_auto_commit)
            .field("retry_on_fail", &self.retry_on_fail)
            .field("retry_policy", &self.retry_policy)
            .field("extra_configs", &self.extra_configs)
            .field("tls", &self.tls)
            .field("http_timeout", &self.http_timeout)
            .finish()
    }
}

impl ChannelConfig {
    /// Create a new builder targeting `base_url`.
    pub fn builder(base_url: impl Into<String>) -> ChannelConfigBuilder {
        ChannelConfigBuilder::new(base_url)
    }

    /// Materialize the server-side consumer config map.
    ///
    /// Extras are applied first so the typed options always win.
    pub fn consumer_configs(&self) -> HashMap<String, String> {
        let mut configs = self.extra_configs.clone();
        configs.insert(
            "auto.offset.reset".to_string(),
            self.offset_reset.as_str().to_string(),
        );
        configs.insert(
            "enable.auto.commit".to_string(),
            self.enable_auto_commit.to_string(),
        );
        if let Some(timeout) = self.session_timeout {
            configs.insert(
                "session.timeout.ms".to_string(),
                timeout.as_millis().to_string(),
            );
        }
        if let Some(timeout) = self.request_timeout {
            configs.insert(
                "request.timeout.ms".to_string(),
                timeout.as_millis().to_string(),
            );
        }
        configs
    }
}

/// Builder for [`ChannelConfig`].
pub struct ChannelConfigBuilder {
    config: ChannelConfig,
}

impl ChannelConfigBuilder {
    fn new(base_url: impl Into<String>) -> Self {
        Self {
            config: ChannelConfig {
                base_url: base_url.into(),
                consumer_path_prefix: DEFAULT_CONSUMER_PATH_PREFIX.to_string(),
                producer_path_prefix: DEFAULT_PRODUCER_PATH_PREFIX.to_string(),
                consumer_group: None,
                auth: None,
                offset_reset: OffsetReset::default(),
                session_timeout: None,
                request_timeout: None,
                enable_auto_commit: false,
                retry_on_fail: true,
                retry_policy: RetryPolicy::default(),
                extra_configs: HashMap::new(),
                tls: None,
                http_timeout: None,
            },
        }
    }

    /// Set the authentication strategy.
    pub fn auth(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.config.auth = Some(auth);
        self
    }

    /// Set the consumer group identity.
    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.config.consumer_group = Some(group.into());
        self
    }

    /// Override both the consumer and the producer route prefix.
    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.config.consumer_path_prefix = prefix.clone();
        self.config.producer_path_prefix = prefix;
        self
    }

    /// Override the consumer route prefix.
    pub fn consumer_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.consumer_path_prefix = prefix.into();
        self
    }

    /// Override the producer route prefix.
    pub fn producer_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.producer_path_prefix = prefix.into();
        self
    }

    /// Set the offset reset policy.
    pub fn offset_reset(mut self, offset_reset: OffsetReset) -> Self {
        self.config.offset_reset = offset_reset;
        self
    }

    /// Set the server-side consumer session timeout.
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout = Some(timeout);
        self
    }

    /// Set the server-side consumer request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    /// Enable or disable server-side auto-commit (default: disabled).
    pub fn enable_auto_commit(mut self, enabled: bool) -> Self {
        self.config.enable_auto_commit = enabled;
        self
    }

    /// Enable or disable retries of temporary failures (default: enabled).
    pub fn retry_on_fail(mut self, enabled: bool) -> Self {
        self.config.retry_on_fail = enabled;
        self
    }

    /// Set the backoff parameters for the retry driver.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// Add an extra server-side consumer config entry.
    pub fn extra_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.extra_configs.insert(key.into(), value.into());
        self
    }

    /// Set TLS options for the transport.
    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.config.tls = Some(tls);
        self
    }

    /// Set the whole-request timeout on the HTTP client.
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.config.http_timeout = Some(timeout);
        self
    }

    /// Validate and build the configuration.
    pub fn build(mut self) -> Result<ChannelConfig> {
        while self.config.base_url.ends_with('/') {
            self.config.base_url.pop();
        }
        if self.config.base_url.is_empty() {
            return Err(Error::Permanent("base URL must not be empty".to_string()));
        }
        Ok(self.config)
    }
}
