//! Shared fixtures for agent integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use beast_agent::{
    AgentConfig, AgentConfigBuilder, AgentRuntime, Completion, ContextStore, NullContextStore,
    PromptRequest, ProviderAdapter, ProviderError, ResponseEnvelope, Usage,
};
use beast_observability::{AttemptEvent, MetricsSink, OutcomeEvent};
use beast_stream::{
    DEFAULT_MESSAGE_TYPE, EntryId, InMemoryMailboxStream, MailboxMessage, MailboxStream,
    StreamEntry, StreamError, StreamKey, StreamResult, Subscription,
};
use serde_json::Value;
use tokio::time::Instant;

pub const AGENT_ID: &str = "agent-1";

/// Builder tuned for fast tests: short polls and millisecond backoff
pub fn test_config() -> AgentConfigBuilder {
    AgentConfig::builder(AGENT_ID, "redis://localhost:6379")
        .openai_api_key("sk-test")
        .poll_interval(Duration::from_millis(20))
        .retry_backoff_base(Duration::from_millis(1))
        .retry_backoff_max(Duration::from_millis(5))
        .retry_jitter(0.0)
        .stream_backoff(Duration::from_millis(10), Duration::from_millis(50))
        .shutdown_grace(Duration::from_secs(2))
}

/// Provider that plays back a script, then answers with a fixed completion
pub struct FakeProvider {
    script: Mutex<VecDeque<Result<Completion, ProviderError>>>,
    fallback: Mutex<Result<Completion, ProviderError>>,
    delay: Duration,
    requests: Mutex<Vec<PromptRequest>>,
    call_times: Mutex<Vec<Instant>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    closed: AtomicBool,
}

impl FakeProvider {
    pub fn answering(content: &str) -> Arc<Self> {
        Self::build(Vec::new(), Ok(completion(content)), Duration::ZERO)
    }

    pub fn scripted(
        script: Vec<Result<Completion, ProviderError>>,
        fallback: Result<Completion, ProviderError>,
    ) -> Arc<Self> {
        Self::build(script, fallback, Duration::ZERO)
    }

    pub fn failing(error: ProviderError) -> Arc<Self> {
        Self::build(Vec::new(), Err(error), Duration::ZERO)
    }

    pub fn slow(content: &str, delay: Duration) -> Arc<Self> {
        Self::build(Vec::new(), Ok(completion(content)), delay)
    }

    fn build(
        script: Vec<Result<Completion, ProviderError>>,
        fallback: Result<Completion, ProviderError>,
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback: Mutex::new(fallback),
            delay,
            requests: Mutex::new(Vec::new()),
            call_times: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.prompt.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<PromptRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn generate(&self, request: &PromptRequest) -> Result<Completion, ProviderError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        self.call_times.lock().unwrap().push(Instant::now());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        let result = next.unwrap_or_else(|| self.fallback.lock().unwrap().clone());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub fn completion(content: &str) -> Completion {
    Completion {
        content: content.to_string(),
        model: "fake-model".to_string(),
        usage: Usage {
            prompt_tokens: 3,
            completion_tokens: 2,
            total_tokens: 5,
        },
        provider: "fake".to_string(),
        request_id: Some("req-fake".to_string()),
    }
}

/// Metrics sink that keeps every event
#[derive(Default)]
pub struct RecordingMetrics {
    attempts: Mutex<Vec<AttemptEvent>>,
    outcomes: Mutex<Vec<OutcomeEvent>>,
}

impl RecordingMetrics {
    pub fn attempts(&self) -> Vec<AttemptEvent> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn outcomes(&self) -> Vec<OutcomeEvent> {
        self.outcomes.lock().unwrap().clone()
    }
}

impl MetricsSink for RecordingMetrics {
    fn record_attempt(&self, event: &AttemptEvent) {
        self.attempts.lock().unwrap().push(event.clone());
    }

    fn record_outcome(&self, event: &OutcomeEvent) {
        self.outcomes.lock().unwrap().push(event.clone());
    }
}

/// In-memory stream whose acks can be made to fail
#[derive(Clone, Default)]
pub struct FlakyAckStream {
    pub inner: InMemoryMailboxStream,
    fail_acks: Arc<AtomicBool>,
}

impl FlakyAckStream {
    pub fn new(inner: InMemoryMailboxStream) -> Self {
        Self {
            inner,
            fail_acks: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_fail_acks(&self, fail: bool) {
        self.fail_acks.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MailboxStream for FlakyAckStream {
    async fn ensure_group(&self, sub: &Subscription) -> StreamResult<()> {
        self.inner.ensure_group(sub).await
    }

    async fn read_group(
        &self,
        sub: &Subscription,
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<StreamEntry>> {
        self.inner.read_group(sub, count, block).await
    }

    async fn claim_pending(
        &self,
        sub: &Subscription,
        min_idle: Duration,
        page_size: usize,
    ) -> StreamResult<Vec<StreamEntry>> {
        self.inner.claim_pending(sub, min_idle, page_size).await
    }

    async fn ack(&self, sub: &Subscription, id: &EntryId) -> StreamResult<()> {
        if self.fail_acks.load(Ordering::SeqCst) {
            return Err(StreamError::AckFailed {
                id: id.to_string(),
                message: "injected failure".to_string(),
            });
        }
        self.inner.ack(sub, id).await
    }

    async fn publish(&self, target: &StreamKey, message: &MailboxMessage) -> StreamResult<EntryId> {
        self.inner.publish(target, message).await
    }

    async fn ping(&self) -> StreamResult<()> {
        self.inner.ping().await
    }
}

pub fn runtime(
    config: AgentConfig,
    stream: Arc<dyn MailboxStream>,
    provider: Arc<FakeProvider>,
    metrics: Arc<RecordingMetrics>,
) -> AgentRuntime {
    runtime_with_context(config, stream, provider, metrics, Arc::new(NullContextStore))
}

pub fn runtime_with_context(
    config: AgentConfig,
    stream: Arc<dyn MailboxStream>,
    provider: Arc<FakeProvider>,
    metrics: Arc<RecordingMetrics>,
    context: Arc<dyn ContextStore>,
) -> AgentRuntime {
    AgentRuntime::builder(config)
        .with_stream(stream)
        .with_provider(provider)
        .with_metrics(metrics)
        .with_context_store(context)
        .build()
        .expect("runtime should build")
}

/// Publish a request from `sender` to the agent's mailbox
pub async fn send(
    stream: &InMemoryMailboxStream,
    config: &AgentConfig,
    sender: &str,
    payload: Value,
) -> EntryId {
    let Value::Object(payload) = payload else {
        panic!("payload must be a JSON object");
    };
    let message = MailboxMessage::new(sender, AGENT_ID, DEFAULT_MESSAGE_TYPE, payload);
    stream
        .publish(&config.mailbox_stream, &message)
        .await
        .expect("publish to mailbox")
}

/// Decoded responses on `sender`'s reply stream
pub async fn replies(
    stream: &InMemoryMailboxStream,
    config: &AgentConfig,
    sender: &str,
) -> Vec<ResponseEnvelope> {
    let outbox = config.reply_target(sender).expect("routable sender");
    stream
        .messages(&outbox)
        .await
        .iter()
        .map(|m| ResponseEnvelope::from_mailbox_message(m).expect("valid envelope"))
        .collect()
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

pub async fn wait_for_replies(
    stream: &InMemoryMailboxStream,
    config: &AgentConfig,
    sender: &str,
    count: usize,
) -> Vec<ResponseEnvelope> {
    wait_until("replies", || async move {
        replies(stream, config, sender).await.len() >= count
    })
    .await;
    replies(stream, config, sender).await
}

pub async fn wait_for_calls(provider: &FakeProvider, count: usize) {
    wait_until("provider calls", || async move { provider.calls() >= count }).await;
}
