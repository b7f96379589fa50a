//! # databus-client
//!
//! Native async Rust client for REST-fronted streaming databus services:
//! Kafka/Kinesis-style back-ends that broker records on named topics
//! behind an HTTP gateway.
//!
//! ## Features
//!
//! - **Channel sessions**: one [`Channel`] binds a consumer group to a
//!   server-side consumer instance and drives its whole lifecycle
//!   (create → subscribe → consume → commit → delete)
//! - **Run loop**: long-running consume loop with cooperative stop via
//!   [`StopHandle`]
//! - **Automatic retries**: exponential backoff for temporary failures,
//!   configurable through [`RetryPolicy`]
//! - **Consumer-loss recovery**: a vanished server-side consumer is
//!   re-created and re-subscribed transparently inside the run loop
//! - **Pluggable authentication**: [`BasicAuthenticator`] (identity
//!   login) and [`ClientCredentialsAuthenticator`] (OAuth2), or any
//!   [`Authenticator`] implementation
//! - **TLS support**: custom CA, client identity, test-only insecure mode
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use databus_client::{Channel, ChannelConfig, RunOptions};
//!
//! # async fn example() -> databus_client::Result<()> {
//! let config = ChannelConfig::builder("https://databus.example.com")
//!     .consumer_group("analytics")
//!     .build()?;
//! let mut channel = Channel::new(config)?;
//!
//! channel
//!     .run(
//!         |records| async move {
//!             for record in &records {
//!                 println!("{}: {}", record.topic, record.payload);
//!             }
//!             Ok(true)
//!         },
//!         RunOptions::new().topic("case-events"),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Authentication
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use databus_client::{BasicAuthenticator, ChannelConfig};
//!
//! let auth = Arc::new(BasicAuthenticator::new(
//!     "https://databus.example.com",
//!     "svc-user",
//!     "secret",
//! )?);
//! let config = ChannelConfig::builder("https://databus.example.com")
//!     .consumer_group("analytics")
//!     .auth(auth)
//!     .build()?;
//! ```
//!
//! The strategy acquires a token on first use and caches it; when the
//! service answers 401/403 the channel resets the cache and the retry
//! that follows re-authenticates from scratch.
//!
//! ## Producing
//!
//! ```rust,ignore
//! use databus_client::{ProduceRecord, ProduceRecords};
//!
//! let body = ProduceRecords::single(
//!     ProduceRecord::new("case-events", &serde_json::json!({"message": "Hello"}))?
//!         .sharding_key("case-1"),
//! );
//! channel.produce(&body).await?;
//! ```

pub mod auth;
pub mod channel;
pub mod config;
pub mod error;
pub mod records;
pub mod retry;

mod http;
mod state;

pub use auth::{
    Authenticator, BasicAuthenticator, ClientCredentialsAuthenticator, ClientCredentialsBuilder,
};
pub use channel::{Channel, ChannelStatsSnapshot, RunOptions, StopHandle};
pub use config::{
    ChannelConfig, ChannelConfigBuilder, OffsetReset, TlsOptions, DEFAULT_CONSUMER_PATH_PREFIX,
    DEFAULT_PRODUCER_PATH_PREFIX,
};
pub use error::{Error, Result};
pub use records::{
    ConsumerRecord, ProduceRecord, ProduceRecords, RecordMessage, RoutingData,
    RECORDS_CONTENT_TYPE,
};
pub use retry::RetryPolicy;
pub use state::CommitEntry;
