//! Mailbox processor: the consumer-group poll loop
//!
//! One poll task reads entries in stream order and dispatches each one to a
//! spawned handler task. Slots are acquired in the poll task, so a full gate
//! stops reading until a handler finishes.
//!
//! Per entry the processor either publishes a response and acknowledges, or
//! leaves the entry pending for the next startup to reclaim:
//!
//! | Entry | Response | Ack |
//! |-------|----------|-----|
//! | undecodable, no sender | none | yes |
//! | undecodable or invalid payload | `invalid_payload` error | yes, after publish |
//! | success / fatal / retries exhausted | success or error | yes, after publish |
//! | publish failed | none | no |
//!
//! Publishes that fail on connectivity are retried with the stream backoff
//! until they land or shutdown arrives.
//! | abandoned at shutdown | none | no |

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use beast_observability::{ComponentHealth, MetricsSink, OutcomeEvent, OutcomeStatus};
use beast_stream::{EntryId, MailboxStream, StreamEntry, StreamError, Subscription};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::context::ContextStore;
use crate::envelope::ResponseEnvelope;
use crate::error::{AgentResult, ProviderError};
use crate::handler::{ConcurrencySlot, PromptHandler, panic_message, wait_for_shutdown};
use crate::message::{INVALID_PAYLOAD, InboundMessage};
use crate::outcome::{HandledMessage, ProcessingOutcome};
use crate::provider::ProviderAdapter;

/// Counters accumulated over one processor run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    /// Pending entries reclaimed at startup
    pub recovered: u64,
    /// Valid messages handed to the handler
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub invalid: u64,
    pub undecodable: u64,
    /// Left pending by shutdown
    pub abandoned: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub acked: u64,
    pub ack_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    recovered: AtomicU64,
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    invalid: AtomicU64,
    undecodable: AtomicU64,
    abandoned: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    acked: AtomicU64,
    ack_failures: AtomicU64,
}

impl Counters {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ProcessorStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ProcessorStats {
            recovered: get(&self.recovered),
            dispatched: get(&self.dispatched),
            succeeded: get(&self.succeeded),
            failed: get(&self.failed),
            invalid: get(&self.invalid),
            undecodable: get(&self.undecodable),
            abandoned: get(&self.abandoned),
            published: get(&self.published),
            publish_failures: get(&self.publish_failures),
            acked: get(&self.acked),
            ack_failures: get(&self.ack_failures),
        }
    }
}

/// State shared between the poll task and handler tasks
struct Shared {
    config: Arc<AgentConfig>,
    stream: Arc<dyn MailboxStream>,
    handler: PromptHandler,
    metrics: Arc<dyn MetricsSink>,
    subscription: Subscription,
    counters: Counters,
    shutdown: watch::Receiver<bool>,
}

/// Reads the agent's mailbox and answers every request on it
pub struct MailboxProcessor {
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
}

impl MailboxProcessor {
    pub fn new(
        config: Arc<AgentConfig>,
        stream: Arc<dyn MailboxStream>,
        provider: Arc<dyn ProviderAdapter>,
        context: Arc<dyn ContextStore>,
        metrics: Arc<dyn MetricsSink>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let handler = PromptHandler::new(
            Arc::clone(&config),
            provider,
            context,
            Arc::clone(&metrics),
            shutdown.clone(),
        );
        let subscription = config.subscription();

        Self {
            shared: Arc::new(Shared {
                config,
                stream,
                handler,
                metrics,
                subscription,
                counters: Counters::default(),
                shutdown: shutdown.clone(),
            }),
            shutdown,
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.shared.subscription
    }

    pub fn stats(&self) -> ProcessorStats {
        self.shared.counters.snapshot()
    }

    /// Check that the stream answers, without consuming anything
    pub async fn health_check(&self) -> ComponentHealth {
        stream_health(self.shared.stream.as_ref(), &self.shared.subscription).await
    }

    /// Run until shutdown is signalled, then drain in-flight work
    ///
    /// # Errors
    ///
    /// Returns an error only if the concurrency gate is closed underneath
    /// the processor; stream and provider failures are handled internally.
    pub async fn run(mut self) -> AgentResult<ProcessorStats> {
        info!(
            subscription = %self.shared.subscription,
            concurrency = self.shared.config.concurrency,
            provider = self.shared.handler.provider_name(),
            "Mailbox processor starting"
        );

        let mut tasks = JoinSet::new();
        let result = self.consume(&mut tasks).await;
        self.drain(tasks).await;

        let stats = self.stats();
        info!(?stats, "Mailbox processor stopped");
        result.map(|()| stats)
    }

    async fn consume(&mut self, tasks: &mut JoinSet<()>) -> AgentResult<()> {
        if !self.ensure_group().await {
            return Ok(());
        }
        self.recover_pending(tasks).await?;
        self.poll(tasks).await
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `delay`; true if shutdown arrived first
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(delay) => false,
            () = wait_for_shutdown(&mut self.shutdown) => true,
        }
    }

    /// Create the consumer group, retrying until it exists or shutdown
    async fn ensure_group(&mut self) -> bool {
        let shared = Arc::clone(&self.shared);
        let mut backoff = shared.config.stream_backoff.backoff();

        loop {
            if self.shutting_down() {
                return false;
            }
            match shared.stream.ensure_group(&shared.subscription).await {
                Ok(()) => {
                    debug!(subscription = %shared.subscription, "Consumer group ready");
                    return true;
                }
                Err(e) => {
                    let delay = backoff
                        .next_delay(None)
                        .unwrap_or(shared.config.stream_backoff.max_delay);
                    error!(
                        error = %e,
                        failures = backoff.failures(),
                        delay_ms = millis(delay),
                        "Could not create consumer group, retrying"
                    );
                    if self.sleep_or_shutdown(delay).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Claim entries left pending by an earlier run and dispatch them first
    async fn recover_pending(&mut self, tasks: &mut JoinSet<()>) -> AgentResult<()> {
        let shared = Arc::clone(&self.shared);
        let mut backoff = shared.config.stream_backoff.backoff();

        let entries = loop {
            if self.shutting_down() {
                return Ok(());
            }
            match shared
                .stream
                .claim_pending(
                    &shared.subscription,
                    shared.config.claim_min_idle,
                    shared.config.read_batch_size,
                )
                .await
            {
                Ok(entries) => break entries,
                Err(e) => {
                    let delay = backoff
                        .next_delay(None)
                        .unwrap_or(shared.config.stream_backoff.max_delay);
                    warn!(error = %e, delay_ms = millis(delay), "Pending entry claim failed, retrying");
                    if self.sleep_or_shutdown(delay).await {
                        return Ok(());
                    }
                }
            }
        };

        if !entries.is_empty() {
            info!(count = entries.len(), "Recovering pending entries");
        }
        for entry in entries {
            if self.shutting_down() {
                break;
            }
            Counters::incr(&shared.counters.recovered);
            self.dispatch(entry, tasks).await?;
        }
        Ok(())
    }

    async fn poll(&mut self, tasks: &mut JoinSet<()>) -> AgentResult<()> {
        let shared = Arc::clone(&self.shared);
        let mut backoff = shared.config.stream_backoff.backoff();

        loop {
            while let Some(result) = tasks.try_join_next() {
                reap(result);
            }
            if self.shutting_down() {
                return Ok(());
            }

            let read = tokio::select! {
                result = shared.stream.read_group(
                    &shared.subscription,
                    shared.config.read_batch_size,
                    shared.config.poll_interval,
                ) => Some(result),
                () = wait_for_shutdown(&mut self.shutdown) => None,
            };
            let Some(read) = read else {
                return Ok(());
            };

            match read {
                Ok(entries) => {
                    if backoff.failures() > 0 {
                        info!("Stream connection restored");
                        backoff.reset();
                    }
                    for entry in entries {
                        if self.shutting_down() {
                            break;
                        }
                        self.dispatch(entry, tasks).await?;
                    }
                }
                Err(StreamError::GroupMissing { stream, group }) => {
                    warn!(%stream, %group, "Consumer group disappeared, recreating");
                    if !self.ensure_group().await {
                        return Ok(());
                    }
                }
                Err(e) => {
                    let delay = backoff
                        .next_delay(None)
                        .unwrap_or(shared.config.stream_backoff.max_delay);
                    error!(
                        error = %e,
                        connectivity = e.is_connectivity(),
                        failures = backoff.failures(),
                        delay_ms = millis(delay),
                        "Stream read failed, backing off"
                    );
                    if self.sleep_or_shutdown(delay).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Validate one entry and either answer it inline or spawn its handler
    async fn dispatch(&mut self, entry: StreamEntry, tasks: &mut JoinSet<()>) -> AgentResult<()> {
        let shared = Arc::clone(&self.shared);

        let mailbox = match entry.decode() {
            Ok(message) => message,
            Err(e) => {
                let Some(sender) = entry.sender() else {
                    warn!(entry_id = %entry.id, error = %e, "Dropping entry without sender");
                    Counters::incr(&shared.counters.undecodable);
                    shared.ack(&entry.id).await;
                    return Ok(());
                };

                let reason = match e {
                    StreamError::MalformedEntry { reason, .. } => reason,
                    other => other.to_string(),
                };
                warn!(message_id = %entry.id, %sender, %reason, "Rejecting undecodable request");
                Counters::incr(&shared.counters.invalid);
                shared.record_rejection(&entry.id, sender);
                let envelope = ResponseEnvelope::undecodable(&entry.id, sender, reason);
                shared.publish_and_ack(&entry.id, &envelope).await;
                return Ok(());
            }
        };

        let message = match InboundMessage::parse(entry.id.clone(), &mailbox) {
            Ok(message) => message,
            Err(invalid) => {
                warn!(
                    message_id = %entry.id,
                    sender = %mailbox.sender,
                    error = %invalid,
                    "Rejecting invalid request"
                );
                Counters::incr(&shared.counters.invalid);
                shared.record_rejection(&entry.id, &mailbox.sender);
                let envelope = ResponseEnvelope::invalid(&entry.id, &mailbox, &invalid);
                shared.publish_and_ack(&entry.id, &envelope).await;
                return Ok(());
            }
        };

        let slot = tokio::select! {
            slot = shared.handler.acquire_slot() => slot?,
            () = wait_for_shutdown(&mut self.shutdown) => {
                debug!(message_id = %message.id, "Shutdown while waiting for a slot, leaving entry pending");
                return Ok(());
            }
        };

        debug!(message_id = %message.id, sender = %message.sender, "Dispatching");
        Counters::incr(&shared.counters.dispatched);
        tasks.spawn(async move { shared.process(slot, message).await });
        Ok(())
    }

    /// Wait up to the shutdown grace for handler tasks, then abort the rest
    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }

        let grace = self.shared.config.shutdown_grace;
        info!(in_flight = tasks.len(), grace_ms = millis(grace), "Draining in-flight messages");
        let deadline = Instant::now() + grace;

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(result)) => reap(result),
                Ok(None) => return,
                Err(_) => {
                    let remaining = tasks.len() as u64;
                    warn!(remaining, "Shutdown grace elapsed, abandoning in-flight messages");
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    self.shared
                        .counters
                        .abandoned
                        .fetch_add(remaining, Ordering::Relaxed);
                    return;
                }
            }
        }
    }
}

impl Shared {
    /// Run the handler for one message and settle the entry
    async fn process(&self, slot: ConcurrencySlot, message: InboundMessage) {
        let handled = AssertUnwindSafe(self.handler.handle_with_slot(slot, &message))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let error = ProviderError::unhandled(format!(
                    "Unexpected failure while handling message: {}",
                    panic_message(panic.as_ref())
                ));
                error!(message_id = %message.id, error = %error.message, "Handler panicked");
                let envelope = ResponseEnvelope::failure(&message, &error);
                HandledMessage {
                    outcome: ProcessingOutcome::FatalFailure { error, attempts: 0 },
                    envelope: Some(envelope),
                }
            });

        match &handled.outcome {
            ProcessingOutcome::Success { .. } => Counters::incr(&self.counters.succeeded),
            outcome if outcome.is_terminal() => Counters::incr(&self.counters.failed),
            _ => Counters::incr(&self.counters.abandoned),
        }

        match handled.envelope {
            Some(envelope) => self.publish_and_ack(&message.id, &envelope).await,
            None => info!(message_id = %message.id, "Entry left pending for redelivery"),
        }
    }

    /// Publish the response, then acknowledge
    ///
    /// Connectivity failures are retried with stream backoff until the
    /// publish lands or shutdown; any other failure leaves the entry pending.
    async fn publish_and_ack(&self, id: &EntryId, envelope: &ResponseEnvelope) {
        let sender = &envelope.correlation.sender;
        let target = match self.config.reply_target(sender) {
            Ok(target) => target,
            Err(e) => {
                // No stream can be named after this sender; the request can never be answered
                error!(message_id = %id, %sender, error = %e, "Unroutable sender, dropping entry");
                Counters::incr(&self.counters.publish_failures);
                self.ack(id).await;
                return;
            }
        };

        let reply = match envelope.to_mailbox_message(&self.config.agent_id) {
            Ok(reply) => reply,
            Err(e) => {
                Counters::incr(&self.counters.publish_failures);
                error!(message_id = %id, error = %e, "Could not encode response, entry left pending");
                return;
            }
        };

        // The same reply message is resent, so receivers see one message_id
        let mut backoff = self.config.stream_backoff.backoff();
        let mut shutdown = self.shutdown.clone();
        loop {
            let error = match self.stream.publish(&target, &reply).await {
                Ok(reply_id) => {
                    Counters::incr(&self.counters.published);
                    debug!(message_id = %id, %target, %reply_id, "Response published");
                    self.ack(id).await;
                    return;
                }
                Err(e) => e,
            };

            if !error.is_connectivity() || *shutdown.borrow() {
                Counters::incr(&self.counters.publish_failures);
                error!(
                    message_id = %id,
                    %target,
                    error = %error,
                    "Failed to publish response, entry left pending"
                );
                return;
            }

            let delay = backoff
                .next_delay(None)
                .unwrap_or(self.config.stream_backoff.max_delay);
            warn!(
                message_id = %id,
                %target,
                error = %error,
                failures = backoff.failures(),
                delay_ms = millis(delay),
                "Stream unavailable while publishing response, retrying"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = wait_for_shutdown(&mut shutdown) => {
                    Counters::incr(&self.counters.publish_failures);
                    info!(message_id = %id, "Shutdown before response could be published, entry left pending");
                    return;
                }
            }
        }
    }

    fn record_rejection(&self, id: &EntryId, sender: &str) {
        self.metrics.record_outcome(&OutcomeEvent {
            message_id: id.to_string(),
            sender: sender.to_string(),
            status: OutcomeStatus::Error,
            provider: self.handler.provider_name().to_string(),
            attempts: 0,
            retryable: false,
            error_code: Some(INVALID_PAYLOAD.to_string()),
            duration: Duration::ZERO,
        });
    }

    async fn ack(&self, id: &EntryId) {
        match self.stream.ack(&self.subscription, id).await {
            Ok(()) => Counters::incr(&self.counters.acked),
            Err(e) => {
                Counters::incr(&self.counters.ack_failures);
                warn!(message_id = %id, error = %e, "Ack failed, entry may be redelivered");
            }
        }
    }
}

fn reap(result: Result<(), JoinError>) {
    match result {
        Err(e) if e.is_panic() => error!(error = %e, "Message task panicked"),
        _ => {}
    }
}

/// Ping the stream and report how long it took
pub(crate) async fn stream_health(
    stream: &dyn MailboxStream,
    subscription: &Subscription,
) -> ComponentHealth {
    let started = std::time::Instant::now();
    let health = match stream.ping().await {
        Ok(()) => ComponentHealth::healthy("mailbox_stream", started.elapsed()),
        Err(e) => ComponentHealth::unhealthy("mailbox_stream", e.to_string(), started.elapsed()),
    };
    health
        .with_metadata("stream", subscription.stream.as_str())
        .with_metadata("group", subscription.group.clone())
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NullContextStore;
    use crate::provider::{Completion, PromptRequest, Usage};
    use async_trait::async_trait;
    use beast_observability::NoopMetrics;
    use beast_stream::{DEFAULT_MESSAGE_TYPE, InMemoryMailboxStream, MailboxMessage, StreamKey};
    use serde_json::json;

    struct EchoProvider;

    #[async_trait]
    impl ProviderAdapter for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate(&self, request: &PromptRequest) -> Result<Completion, ProviderError> {
            Ok(Completion {
                content: request.prompt.to_uppercase(),
                model: request.options.model.clone(),
                usage: Usage::default(),
                provider: "echo".into(),
                request_id: None,
            })
        }
    }

    fn config() -> Arc<AgentConfig> {
        Arc::new(
            AgentConfig::builder("agent-1", "redis://localhost:6379")
                .poll_interval(Duration::from_millis(20))
                .stream_backoff(Duration::from_millis(10), Duration::from_millis(50))
                .build()
                .unwrap(),
        )
    }

    fn processor(
        config: Arc<AgentConfig>,
        stream: &InMemoryMailboxStream,
    ) -> (MailboxProcessor, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let processor = MailboxProcessor::new(
            config,
            Arc::new(stream.clone()),
            Arc::new(EchoProvider),
            Arc::new(NullContextStore),
            Arc::new(NoopMetrics),
            rx,
        );
        (processor, tx)
    }

    async fn send(stream: &InMemoryMailboxStream, inbox: &StreamKey, payload: serde_json::Value) {
        let serde_json::Value::Object(payload) = payload else {
            unreachable!()
        };
        let message = MailboxMessage::new("svc-a", "agent-1", DEFAULT_MESSAGE_TYPE, payload);
        stream.publish(inbox, &message).await.unwrap();
    }

    async fn wait_for_replies(stream: &InMemoryMailboxStream, outbox: &StreamKey, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while stream.entries(outbox).await.len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("replies did not arrive in time");
    }

    #[tokio::test]
    async fn test_answers_and_acks() {
        let stream = InMemoryMailboxStream::new();
        let config = config();
        let (processor, tx) = processor(Arc::clone(&config), &stream);
        let outbox = config.reply_target("svc-a").unwrap();

        send(&stream, &config.mailbox_stream, json!({"prompt": "hi"})).await;
        let handle = tokio::spawn(processor.run());

        wait_for_replies(&stream, &outbox, 1).await;
        tx.send(true).unwrap();
        let stats = handle.await.unwrap().unwrap();

        let envelope = ResponseEnvelope::from_mailbox_message(&stream.messages(&outbox).await[0]).unwrap();
        assert_eq!(envelope.response.unwrap().content, "HI");
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.acked, 1);
        assert!(
            stream
                .pending(&config.mailbox_stream, &config.mailbox_group)
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_acked_without_reply() {
        let stream = InMemoryMailboxStream::new();
        let config = config();
        let (processor, tx) = processor(Arc::clone(&config), &stream);

        let id = stream
            .append_raw(&config.mailbox_stream, &[("payload", "{}")])
            .await;
        let handle = tokio::spawn(processor.run());

        tokio::time::timeout(Duration::from_secs(5), async {
            while stream
                .acked(&config.mailbox_stream, &config.mailbox_group)
                .await
                .is_empty()
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tx.send(true).unwrap();
        let stats = handle.await.unwrap().unwrap();

        assert_eq!(stats.undecodable, 1);
        assert_eq!(stats.published, 0);
        assert_eq!(
            stream.acked(&config.mailbox_stream, &config.mailbox_group).await,
            vec![id]
        );
    }

    #[tokio::test]
    async fn test_stream_outage_backs_off_and_recovers() {
        let stream = InMemoryMailboxStream::new();
        let config = config();
        let (processor, tx) = processor(Arc::clone(&config), &stream);
        let outbox = config.reply_target("svc-a").unwrap();

        stream.set_unavailable(true).await;
        let handle = tokio::spawn(processor.run());
        tokio::time::sleep(Duration::from_millis(100)).await;

        stream.set_unavailable(false).await;
        send(&stream, &config.mailbox_stream, json!({"prompt": "back"})).await;
        wait_for_replies(&stream, &outbox, 1).await;

        tx.send(true).unwrap();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.succeeded, 1);
    }

    #[tokio::test]
    async fn test_health_check_reflects_stream() {
        let stream = InMemoryMailboxStream::new();
        let (processor, _tx) = processor(config(), &stream);

        assert!(processor.health_check().await.is_healthy());
        stream.set_unavailable(true).await;
        let health = processor.health_check().await;
        assert!(!health.is_healthy());
        assert_eq!(health.metadata["group"], "agent:agent-1");
    }

    #[tokio::test]
    async fn test_shutdown_before_start_returns_immediately() {
        let stream = InMemoryMailboxStream::new();
        let (processor, tx) = processor(config(), &stream);
        tx.send(true).unwrap();

        let stats = processor.run().await.unwrap();
        assert_eq!(stats, ProcessorStats::default());
    }
}
