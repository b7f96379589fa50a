//! The channel: a stateful session against the databus service.
//!
//! A [`Channel`] binds one consumer group to one server-side consumer
//! instance and drives its lifecycle: create → subscribe → consume →
//! commit → delete. On top of the single operations it offers
//! [`run`](Channel::run), a long-running consume loop with cooperative
//! cancellation, exponential-backoff retries, and transparent recovery
//! from server-side consumer loss.
//!
//! # Example
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
//! let stop = channel.stop_handle();
//! channel
//!     .run(
//!         |records| async move {
//!             for record in &records {
//!                 println!("{}/{}@{}: {}", record.topic, record.partition,
//!                     record.offset, record.payload);
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
//! Operations take `&mut self`, so at most one is in flight per channel
//! and the run loop is the serial driver. The only cross-task surface is
//! the [`StopHandle`], which touches lifecycle flags and wakers, never
//! the consumer state.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::error::{Error, Result};
use crate::http::{build_http_client, RequestExecutor};
use crate::records::{ConsumerRecord, RecordsPage, RECORDS_CONTENT_TYPE};
use crate::state::{CommitEntry, ConsumerState};

// ============================================================================
// Lifecycle
// ============================================================================

/// Cross-task lifecycle flags and wakers.
///
/// `active` is true until destroy completes; `running` while a run loop
/// is executing; `stop_requested` between a stop request and the loop's
/// observation of it. The `wake` notifier cancels backoff and
/// between-queries sleeps; the watch broadcasts `running` so stop
/// waiters can observe the halt.
#[derive(Debug)]
struct Lifecycle {
    active: AtomicBool,
    running: AtomicBool,
    stop_requested: AtomicBool,
    wake: Notify,
    running_tx: watch::Sender<bool>,
}

impl Lifecycle {
    fn new() -> Self {
        let (running_tx, _) = watch::channel(false);
        Self {
            active: AtomicBool::new(true),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            wake: Notify::new(),
            running_tx,
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether a stop request is pending against a running loop.
    fn stop_observed(&self) -> bool {
        self.is_running() && self.stop_requested.load(Ordering::SeqCst)
    }

    fn begin_run(&self) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.running_tx.send_replace(true);
        true
    }

    fn finish_run(&self) {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.running_tx.send_replace(false);
    }

    /// Request a stop. Returns false when no loop is running.
    fn request_stop(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
        true
    }

    /// Wait until the run loop has halted.
    async fn wait_halted(&self) {
        let mut rx = self.running_tx.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Sleep for `delay`; returns false if a stop was observed first.
    async fn sleep_unless_stopped(&self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            if self.stop_observed() {
                return false;
            }
            tokio::select! {
                _ = &mut sleep => return true,
                _ = self.wake.notified() => {}
            }
        }
    }
}

/// Cloneable handle that requests cooperative stop of a running loop.
///
/// Stop is advisory: it is observed at suspension points (waits, retry
/// backoffs, attempt boundaries), not in the middle of an HTTP
/// transmission.
#[derive(Clone)]
pub struct StopHandle {
    lifecycle: Arc<Lifecycle>,
}

impl StopHandle {
    /// Request a stop and wait for the run loop to halt.
    ///
    /// Returns immediately when no loop is running. Every concurrent
    /// caller resolves exactly once, when the loop has exited.
    pub async fn stop(&self) {
        if self.lifecycle.request_stop() {
            self.lifecycle.wait_halted().await;
        }
    }

    /// Whether a run loop is currently executing.
    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Atomic counters for channel activity.
#[derive(Debug, Default)]
struct ChannelStats {
    records_consumed: AtomicU64,
    commits: AtomicU64,
    produces: AtomicU64,
    retries: AtomicU64,
    consumer_resets: AtomicU64,
}

/// Point-in-time snapshot of the channel counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatsSnapshot {
    /// Records delivered to the caller.
    pub records_consumed: u64,
    /// Successful offset commits.
    pub commits: u64,
    /// Successful produce calls.
    pub produces: u64,
    /// Retry attempts scheduled by the retry driver.
    pub retries: u64,
    /// Consumer-loss recoveries.
    pub consumer_resets: u64,
}

impl ChannelStats {
    fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            records_consumed: self.records_consumed.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            produces: self.produces.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            consumer_resets: self.consumer_resets.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Run options
// ============================================================================

/// Options for [`Channel::run`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Pause between consume cycles that should continue.
    pub wait_between_queries: Duration,
    /// Topics to subscribe to on entry. When empty, the channel's
    /// existing subscription is reused.
    pub topics: Vec<String>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pause between consume cycles.
    pub fn wait_between_queries(mut self, wait: Duration) -> Self {
        self.wait_between_queries = wait;
        self
    }

    /// Set the topics to subscribe to.
    pub fn topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    /// Add one topic to subscribe to.
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            wait_between_queries: Duration::from_secs(30),
            topics: Vec::new(),
        }
    }
}

// ============================================================================
// Channel
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateConsumerResponse {
    #[serde(rename = "consumerInstanceId")]
    consumer_instance_id: Option<String>,
}

/// A session binding one consumer group to one server-side consumer.
pub struct Channel {
    config: ChannelConfig,
    executor: RequestExecutor,
    state: ConsumerState,
    lifecycle: Arc<Lifecycle>,
    stats: ChannelStats,
}

impl Channel {
    /// Build a channel from its configuration.
    pub fn new(config: ChannelConfig) -> Result<Self> {
        let http = build_http_client(config.tls.as_ref(), config.http_timeout)?;
        let executor = RequestExecutor::new(http, config.auth.clone());
        Ok(Self {
            config,
            executor,
            state: ConsumerState::default(),
            lifecycle: Arc::new(Lifecycle::new()),
            stats: ChannelStats::default(),
        })
    }

    /// Handle for stopping a running loop from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            lifecycle: Arc::clone(&self.lifecycle),
        }
    }

    /// Current counters.
    pub fn stats(&self) -> ChannelStatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether the channel accepts operations (true until destroy).
    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    /// The server-side consumer instance id, if one exists.
    pub fn consumer_id(&self) -> Option<&str> {
        self.state.consumer_id.as_deref()
    }

    /// The last acknowledged subscription set.
    pub fn active_subscriptions(&self) -> &[String] {
        &self.state.active_subscriptions
    }

    /// Offsets delivered to the caller but not yet committed.
    pub fn pending_commits(&self) -> usize {
        self.state.commit_log.len()
    }

    fn consumer_url(&self, suffix: &str) -> String {
        format!(
            "{}{}/consumers{}",
            self.config.base_url, self.config.consumer_path_prefix, suffix
        )
    }

    fn producer_url(&self) -> String {
        format!(
            "{}{}/produce",
            self.config.base_url, self.config.producer_path_prefix
        )
    }

    fn require_consumer_id(&self) -> Result<String> {
        self.state
            .consumer_id
            .clone()
            .ok_or_else(|| Error::Permanent("no consumer instance exists".to_string()))
    }

    fn ensure_active(&self) -> Result<()> {
        if self.lifecycle.is_active() {
            Ok(())
        } else {
            Err(Error::Permanent("channel has been destroyed".to_string()))
        }
    }

    // ------------------------------------------------------------------------
    // Retry driver
    // ------------------------------------------------------------------------

    /// Re-invoke `attempt_fn` with exponential backoff until it succeeds
    /// or fails in a way that must surface.
    ///
    /// Consumer loss escapes immediately so the run loop can reset and
    /// re-create instead of looping against a dead consumer id. Stop is
    /// checked at every attempt boundary, and the backoff sleep itself is
    /// cancellable by stop.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            self.ensure_active()?;
            if self.lifecycle.stop_observed() {
                return Err(Error::Stopped);
            }
            let err = match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !self.config.retry_on_fail || !err.is_retryable() {
                return Err(err);
            }
            let delay = self.config.retry_policy.delay_for_attempt(attempt);
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                error = %err,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "{what} failed, retrying"
            );
            if !self.lifecycle.sleep_unless_stopped(delay).await {
                return Err(Error::Stopped);
            }
            attempt = attempt.saturating_add(1);
        }
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Create a server-side consumer instance for the configured group.
    ///
    /// Any previous local consumer session is dropped first.
    pub async fn create(&mut self) -> Result<()> {
        self.ensure_active()?;
        let group = self.config.consumer_group.clone().ok_or_else(|| {
            Error::Permanent("a consumer group is required for consumer operations".to_string())
        })?;
        self.state.reset();

        let url = self.consumer_url("");
        let body = json!({
            "consumerGroup": &group,
            "configs": self.config.consumer_configs(),
        });

        let executor = &self.executor;
        let response = self
            .with_retry("create consumer", || {
                executor.execute(executor.http().post(&url).json(&body), false)
            })
            .await?;

        let body: CreateConsumerResponse = response
            .json()
            .await
            .map_err(|e| Error::Temporary(format!("invalid create response: {e}")))?;
        let id = body
            .consumer_instance_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                Error::Permanent("create response is missing consumerInstanceId".to_string())
            })?;

        info!(group = %group, consumer_id = %id, "consumer created");
        self.state.set_consumer(id);
        Ok(())
    }

    /// Install a subscription for `topics`, creating a consumer first if
    /// none exists.
    ///
    /// Subscribing to the already-acknowledged sequence is a no-op that
    /// performs zero HTTP requests.
    pub async fn subscribe<S: Into<String>>(&mut self, topics: Vec<S>) -> Result<()> {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        if topics.is_empty() {
            return Err(Error::Permanent("at least one topic is required".to_string()));
        }
        if self.state.is_subscribed_to(&topics) {
            debug!(?topics, "already subscribed");
            return Ok(());
        }
        self.state.requested_subscriptions = topics.clone();
        if self.state.consumer_id.is_none() {
            self.create().await?;
        }

        let consumer_id = self.require_consumer_id()?;
        let url = self.consumer_url(&format!("/{consumer_id}/subscription"));
        let body = json!({ "topics": &topics });

        let executor = &self.executor;
        self.with_retry("subscribe", || {
            executor.execute(executor.http().post(&url).json(&body), true)
        })
        .await?;

        info!(consumer_id = %consumer_id, ?topics, "subscription installed");
        self.state.set_subscriptions(topics);
        Ok(())
    }

    /// Fetch the next batch of records for the active subscription.
    ///
    /// Every returned record's position is appended to the pending commit
    /// log before its payload is decoded.
    pub async fn consume(&mut self) -> Result<Vec<ConsumerRecord>> {
        if self.state.active_subscriptions.is_empty() {
            return Err(Error::Permanent(
                "consume requires an active subscription".to_string(),
            ));
        }
        let consumer_id = self.require_consumer_id()?;
        let url = self.consumer_url(&format!("/{consumer_id}/records"));

        let executor = &self.executor;
        let response = self
            .with_retry("consume", || {
                executor.execute(executor.http().get(&url), true)
            })
            .await?;

        let page: RecordsPage = response
            .json()
            .await
            .map_err(|e| Error::Temporary(format!("invalid records response: {e}")))?;

        let mut records = Vec::with_capacity(page.records.len());
        for wire in page.records {
            self.state.record_delivery(CommitEntry {
                topic: wire.routing_data.topic.clone(),
                partition: wire.partition,
                offset: wire.offset,
            });
            records.push(wire.decode()?);
        }
        self.stats
            .records_consumed
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        debug!(consumer_id = %consumer_id, count = records.len(), "records fetched");
        Ok(records)
    }

    /// Acknowledge every pending offset to the server.
    ///
    /// With an empty commit log this is a no-op. The log is cleared only
    /// after the server accepts the commit; on failure the entries stay
    /// and are retried on the next cycle.
    pub async fn commit(&mut self) -> Result<()> {
        if self.state.commit_log.is_empty() {
            return Ok(());
        }
        let consumer_id = self.require_consumer_id()?;
        let url = self.consumer_url(&format!("/{consumer_id}/offsets"));
        let body = json!({ "offsets": &self.state.commit_log });

        let executor = &self.executor;
        self.with_retry("commit", || {
            executor.execute(executor.http().post(&url).json(&body), true)
        })
        .await?;

        debug!(
            consumer_id = %consumer_id,
            offsets = self.state.commit_log.len(),
            "offsets committed"
        );
        self.state.clear_commit_log();
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Publish `payload` verbatim on the produce route.
    ///
    /// Produce is never retried by the channel; temporary failures
    /// surface directly. Use [`ProduceRecords`](crate::ProduceRecords) to
    /// build the expected body shape.
    pub async fn produce<P: Serialize + ?Sized>(&self, payload: &P) -> Result<()> {
        self.ensure_active()?;
        let body = serde_json::to_vec(payload)
            .map_err(|e| Error::Permanent(format!("payload serialization failed: {e}")))?;
        let request = self
            .executor
            .http()
            .post(self.producer_url())
            .header(reqwest::header::CONTENT_TYPE, RECORDS_CONTENT_TYPE)
            .body(body);

        self.executor.execute(request, false).await?;
        self.stats.produces.fetch_add(1, Ordering::Relaxed);
        debug!("records produced");
        Ok(())
    }

    /// Delete the server-side consumer instance.
    ///
    /// Local consumer state is cleared once the response is classified:
    /// on success and also on 404, where the server already lost the
    /// consumer. The 404 case additionally surfaces as
    /// [`Error::ConsumerNotFound`] so the caller can observe it.
    pub async fn delete(&mut self) -> Result<()> {
        self.ensure_active()?;
        let Some(consumer_id) = self.state.consumer_id.clone() else {
            return Ok(());
        };
        let url = self.consumer_url(&format!("/{consumer_id}"));
        let request = self.executor.http().delete(&url);

        match self.executor.execute(request, true).await {
            Ok(_) => {
                info!(consumer_id = %consumer_id, "consumer deleted");
                self.state.reset();
                Ok(())
            }
            Err(err) if err.is_consumer_loss() => {
                warn!(consumer_id = %consumer_id, "consumer already gone, local state reset");
                self.state.reset();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Drop the local consumer session: id, acknowledged subscriptions,
    /// and pending commits. No HTTP is performed.
    pub fn reset(&mut self) {
        self.state.reset();
    }

    /// Tear the channel down: delete the server-side consumer and mark
    /// the channel inactive. Every operation afterwards fails with a
    /// permanent error.
    ///
    /// A running loop must have been stopped first; holding the channel
    /// by value here guarantees that.
    pub async fn destroy(&mut self) -> Result<()> {
        if !self.lifecycle.is_active() {
            return Ok(());
        }
        debug_assert!(!self.lifecycle.is_running());
        match self.delete().await {
            Ok(()) => {}
            Err(err) if err.is_consumer_loss() => {}
            Err(err) => return Err(err),
        }
        self.lifecycle.deactivate();
        info!("channel destroyed");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------------

    /// Run the consume loop: subscribe → consume → process → commit →
    /// wait, until `process` returns `Ok(false)`, fails, or a stop is
    /// requested through the [`StopHandle`].
    ///
    /// `process` receives each batch of decoded records and answers
    /// whether the loop should continue; an `Err` is treated as a
    /// non-recoverable loop error and propagated. A stop request resolves
    /// the loop cleanly: `run` returns `Ok(())`.
    ///
    /// Consumer loss inside the loop resets the local consumer state and
    /// restarts at the subscribe phase with the most recently requested
    /// topics. Offsets not yet committed at that point are discarded,
    /// since the server no longer recognises the consumer they belong to.
    pub async fn run<F, Fut>(&mut self, mut process: F, options: RunOptions) -> Result<()>
    where
        F: FnMut(Vec<ConsumerRecord>) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        self.ensure_active()?;
        if self.config.consumer_group.is_none() {
            return Err(Error::Permanent(
                "a consumer group is required for consumer operations".to_string(),
            ));
        }
        if options.topics.is_empty() && self.state.active_subscriptions.is_empty() {
            return Err(Error::Permanent(
                "no topics to consume: pass topics in RunOptions or subscribe first".to_string(),
            ));
        }
        if !self.lifecycle.begin_run() {
            return Err(Error::Permanent("run loop is already executing".to_string()));
        }
        if !options.topics.is_empty() {
            self.state.requested_subscriptions = options.topics.clone();
        }

        info!(
            group = self.config.consumer_group.as_deref().unwrap_or_default(),
            topics = ?self.state.requested_subscriptions,
            "run loop started"
        );
        let result = self.run_loop(&mut process, &options).await;
        self.lifecycle.finish_run();

        match result {
            Ok(()) => {
                info!("run loop finished");
                Ok(())
            }
            Err(Error::Stopped) => {
                info!("run loop stopped");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "run loop failed");
                Err(err)
            }
        }
    }

    async fn run_loop<F, Fut>(&mut self, process: &mut F, options: &RunOptions) -> Result<()>
    where
        F: FnMut(Vec<ConsumerRecord>) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        'session: loop {
            // Subscribe phase. Re-read the requested set on every cycle so
            // recovery always installs the latest topics.
            let topics = self.state.requested_subscriptions.clone();
            if let Err(err) = self.subscribe(topics).await {
                if err.is_consumer_loss() {
                    self.recover_consumer(&err);
                    continue 'session;
                }
                return Err(err);
            }

            loop {
                // Consume phase.
                let records = match self.consume().await {
                    Ok(records) => records,
                    Err(err) if err.is_consumer_loss() => {
                        self.recover_consumer(&err);
                        continue 'session;
                    }
                    Err(err) => return Err(err),
                };

                // Process phase.
                let mut keep_going = process(records).await?;

                // Commit + wait phase. A pending stop forces the loop to
                // wind down, but the commit still happens first.
                if self.lifecycle.stop_observed() {
                    keep_going = false;
                }
                if let Err(err) = self.commit().await {
                    if err.is_consumer_loss() {
                        self.recover_consumer(&err);
                        continue 'session;
                    }
                    return Err(err);
                }
                if !keep_going {
                    return Ok(());
                }
                if !self
                    .lifecycle
                    .sleep_unless_stopped(options.wait_between_queries)
                    .await
                {
                    return Err(Error::Stopped);
                }
            }
        }
    }

    fn recover_consumer(&mut self, err: &Error) {
        warn!(error = %err, "server consumer lost, resetting local state");
        self.stats.consumer_resets.fetch_add(1, Ordering::Relaxed);
        self.state.reset();
    }
}
