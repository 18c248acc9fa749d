//! Prompt handling: one validated message in, one outcome out
//!
//! The handler owns the concurrency gate. A [`ConcurrencySlot`] is taken
//! before the first provider call and dropped when the handler returns, so
//! retries and backoff sleeps count against the budget and every exit path
//! releases it.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use beast_observability::{AttemptEvent, MetricsSink, OutcomeEvent};
use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::context::ContextStore;
use crate::envelope::ResponseEnvelope;
use crate::error::{AgentError, AgentResult, ProviderError};
use crate::message::{ChatMessage, ConversationHistory, InboundMessage};
use crate::outcome::{HandledMessage, ProcessingOutcome};
use crate::provider::{Completion, PromptRequest, ProviderAdapter};

/// One unit of the dispatch budget, released on drop
#[derive(Debug)]
pub struct ConcurrencySlot {
    _permit: OwnedSemaphorePermit,
}

/// Turns validated messages into outcomes
pub struct PromptHandler {
    config: Arc<AgentConfig>,
    provider: Arc<dyn ProviderAdapter>,
    context: Arc<dyn ContextStore>,
    metrics: Arc<dyn MetricsSink>,
    slots: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
}

impl PromptHandler {
    pub fn new(
        config: Arc<AgentConfig>,
        provider: Arc<dyn ProviderAdapter>,
        context: Arc<dyn ContextStore>,
        metrics: Arc<dyn MetricsSink>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            config,
            provider,
            context,
            metrics,
            slots,
            shutdown,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Wait for a free slot
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::GateClosed`] if the semaphore was closed.
    pub async fn acquire_slot(&self) -> AgentResult<ConcurrencySlot> {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .map(|permit| ConcurrencySlot { _permit: permit })
            .map_err(|_| AgentError::GateClosed)
    }

    /// Acquire a slot, then handle `message`
    ///
    /// # Errors
    ///
    /// Only fails if the concurrency gate is closed; message-level failures
    /// are reported through the returned outcome.
    pub async fn handle(&self, message: &InboundMessage) -> AgentResult<HandledMessage> {
        let slot = self.acquire_slot().await?;
        Ok(self.handle_with_slot(slot, message).await)
    }

    /// Handle `message` while holding `slot`
    pub async fn handle_with_slot(
        &self,
        slot: ConcurrencySlot,
        message: &InboundMessage,
    ) -> HandledMessage {
        let started = Instant::now();
        let options = self.config.merged_options(&message.options);
        let context_key = message
            .thread_id
            .as_deref()
            .filter(|_| self.config.context.enabled)
            .map(|thread| self.config.context_key(thread));

        let stored = match &context_key {
            Some(key) => self.load_context(key).await,
            None => ConversationHistory::default(),
        };
        let history = ConversationHistory::merge(stored, message.context.clone());

        let request = PromptRequest {
            prompt: message.prompt.clone(),
            history: history.messages.clone(),
            options,
        };

        let outcome = self.generate_with_retry(message, &request).await;
        drop(slot);

        if let (ProcessingOutcome::Success { completion, .. }, Some(key)) = (&outcome, &context_key)
        {
            self.save_context(key, history, &message.prompt, completion)
                .await;
        }

        self.record_outcome(message, &outcome, started.elapsed());

        let envelope = match &outcome {
            ProcessingOutcome::Success { completion, .. } => {
                Some(ResponseEnvelope::success(message, completion))
            }
            other if other.is_terminal() => other
                .error()
                .map(|error| ResponseEnvelope::failure(message, error)),
            _ => None,
        };

        HandledMessage { outcome, envelope }
    }

    async fn generate_with_retry(
        &self,
        message: &InboundMessage,
        request: &PromptRequest,
    ) -> ProcessingOutcome {
        let mut shutdown = self.shutdown.clone();
        let mut backoff = self.config.retry.backoff();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let call_started = Instant::now();
            let result = self.call_provider(request).await;
            self.record_attempt(message, attempt, &result, call_started.elapsed());

            let error = match result {
                Ok(completion) => {
                    return ProcessingOutcome::Success {
                        completion,
                        attempts: attempt,
                    };
                }
                Err(error) if !error.is_retryable() => {
                    return ProcessingOutcome::FatalFailure {
                        error,
                        attempts: attempt,
                    };
                }
                Err(error) => error,
            };

            let Some(delay) = backoff.next_delay(error.retry_after) else {
                return ProcessingOutcome::RetryableFailure {
                    error,
                    attempts: attempt,
                    exhausted: true,
                };
            };

            if *shutdown.borrow() {
                return ProcessingOutcome::RetryableFailure {
                    error,
                    attempts: attempt,
                    exhausted: false,
                };
            }

            warn!(
                message_id = %message.id,
                sender = %message.sender,
                attempt,
                error_code = %error.code,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Retryable provider error, backing off"
            );

            let interrupted = tokio::select! {
                () = tokio::time::sleep(delay) => false,
                () = wait_for_shutdown(&mut shutdown) => true,
            };
            if interrupted {
                info!(message_id = %message.id, attempt, "Shutdown during backoff, abandoning message");
                return ProcessingOutcome::RetryableFailure {
                    error,
                    attempts: attempt,
                    exhausted: false,
                };
            }
        }
    }

    async fn call_provider(&self, request: &PromptRequest) -> Result<Completion, ProviderError> {
        let timeout = request.options.timeout;
        let call = AssertUnwindSafe(self.provider.generate(request)).catch_unwind();

        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(ProviderError::unhandled(format!(
                "Provider panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Err(_) => Err(ProviderError::retryable(
                "timeout",
                format!("Provider call exceeded {:.1}s", timeout.as_secs_f64()),
            )),
        }
    }

    async fn load_context(&self, key: &str) -> ConversationHistory {
        match self.context.load(key).await {
            Ok(Some(history)) => {
                debug!(key, turns = history.len(), "Loaded context");
                history
            }
            Ok(None) => ConversationHistory::default(),
            Err(e) => {
                warn!(key, error = %e, "Context load failed, continuing without history");
                ConversationHistory::default()
            }
        }
    }

    async fn save_context(
        &self,
        key: &str,
        mut history: ConversationHistory,
        prompt: &str,
        completion: &Completion,
    ) {
        history.push(ChatMessage::user(prompt));
        history.push(ChatMessage::assistant(completion.content.clone()));
        history.truncate_to_last(self.config.context.max_messages);

        if let Err(e) = self
            .context
            .save(key, &history, self.config.context.ttl)
            .await
        {
            warn!(key, error = %e, "Context save failed, keeping successful response");
        }
    }

    fn record_attempt(
        &self,
        message: &InboundMessage,
        attempt: u32,
        result: &Result<Completion, ProviderError>,
        duration: Duration,
    ) {
        let error = result.as_ref().err();
        self.metrics.record_attempt(&AttemptEvent {
            message_id: message.id.to_string(),
            sender: message.sender.clone(),
            provider: self.provider.name().to_string(),
            attempt,
            succeeded: error.is_none(),
            retryable: error.is_some_and(ProviderError::is_retryable),
            error_code: error.map(|e| e.code.clone()),
            duration,
        });
    }

    fn record_outcome(&self, message: &InboundMessage, outcome: &ProcessingOutcome, duration: Duration) {
        let error = outcome.error();
        match error {
            None => info!(
                message_id = %message.id,
                sender = %message.sender,
                attempts = outcome.attempts(),
                "Prompt answered"
            ),
            Some(e) => warn!(
                message_id = %message.id,
                sender = %message.sender,
                attempts = outcome.attempts(),
                status = %outcome.status(),
                error_code = %e.code,
                error = %e.message,
                "Prompt failed"
            ),
        }

        self.metrics.record_outcome(&OutcomeEvent {
            message_id: message.id.to_string(),
            sender: message.sender.clone(),
            status: outcome.status(),
            provider: self.provider.name().to_string(),
            attempts: outcome.attempts(),
            retryable: error.is_some_and(ProviderError::is_retryable),
            error_code: error.map(|e| e.code.clone()),
            duration,
        });
    }
}

/// Resolves once shutdown is requested; never if the sender is gone
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InMemoryContextStore;
    use crate::message::RequestOptions;
    use crate::provider::Usage;
    use async_trait::async_trait;
    use beast_observability::{NoopMetrics, OutcomeStatus};
    use beast_stream::EntryId;
    use serde_json::Map;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Plays back a fixed script of results, then succeeds with "ok"
    struct ScriptedProvider {
        script: Mutex<VecDeque<Result<Completion, ProviderError>>>,
        calls: Mutex<Vec<(Instant, PromptRequest)>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<Completion, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().iter().map(|(t, _)| *t).collect()
        }

        fn last_request(&self) -> PromptRequest {
            self.calls.lock().unwrap().last().unwrap().1.clone()
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, request: &PromptRequest) -> Result<Completion, ProviderError> {
            self.calls
                .lock()
                .unwrap()
                .push((Instant::now(), request.clone()));
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(completion("ok")))
        }
    }

    struct PanickingProvider;

    #[async_trait]
    impl ProviderAdapter for PanickingProvider {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn generate(&self, _request: &PromptRequest) -> Result<Completion, ProviderError> {
            panic!("provider exploded");
        }
    }

    #[derive(Default)]
    struct RecordingMetrics {
        attempts: Mutex<Vec<AttemptEvent>>,
        outcomes: Mutex<Vec<OutcomeEvent>>,
    }

    impl MetricsSink for RecordingMetrics {
        fn record_attempt(&self, event: &AttemptEvent) {
            self.attempts.lock().unwrap().push(event.clone());
        }

        fn record_outcome(&self, event: &OutcomeEvent) {
            self.outcomes.lock().unwrap().push(event.clone());
        }
    }

    fn completion(content: &str) -> Completion {
        Completion {
            content: content.to_string(),
            model: "fake-model".to_string(),
            usage: Usage {
                prompt_tokens: 3,
                completion_tokens: 2,
                total_tokens: 5,
            },
            provider: "scripted".to_string(),
            request_id: None,
        }
    }

    /// Paused-clock sleeps land on millisecond ticks
    fn close_to(actual: Duration, expected: Duration) -> bool {
        actual >= expected && actual <= expected + Duration::from_millis(2)
    }

    fn retryable() -> Result<Completion, ProviderError> {
        Err(ProviderError::retryable("server_error", "upstream 503"))
    }

    fn config(max_attempts: u32) -> Arc<AgentConfig> {
        Arc::new(
            AgentConfig::builder("agent-1", "redis://localhost:6379")
                .openai_api_key("sk-test")
                .retry_max(max_attempts)
                .retry_backoff_base(Duration::from_millis(100))
                .retry_backoff_max(Duration::from_millis(250))
                .retry_jitter(0.0)
                .context_enabled(true)
                .context_max_messages(4)
                .build()
                .unwrap(),
        )
    }

    fn inbound(prompt: &str, thread_id: Option<&str>) -> InboundMessage {
        InboundMessage {
            id: EntryId::parse("1-0").unwrap(),
            sender: "svc-a".to_string(),
            prompt: prompt.to_string(),
            thread_id: thread_id.map(str::to_string),
            options: RequestOptions::default(),
            context: ConversationHistory::default(),
            metadata: Map::new(),
        }
    }

    fn handler(
        config: Arc<AgentConfig>,
        provider: Arc<dyn ProviderAdapter>,
        context: Arc<dyn ContextStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> (PromptHandler, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (PromptHandler::new(config, provider, context, metrics, rx), tx)
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let provider = ScriptedProvider::new(vec![Ok(completion("4"))]);
        let metrics = Arc::new(RecordingMetrics::default());
        let (handler, _tx) = handler(
            config(3),
            provider.clone(),
            Arc::new(InMemoryContextStore::new()),
            metrics.clone(),
        );

        let handled = handler.handle(&inbound("2+2?", None)).await.unwrap();

        assert!(matches!(
            handled.outcome,
            ProcessingOutcome::Success { attempts: 1, .. }
        ));
        let envelope = handled.envelope.unwrap();
        assert_eq!(envelope.response.unwrap().content, "4");
        assert_eq!(envelope.message_id, "1-0");
        assert_eq!(provider.call_count(), 1);
        assert_eq!(metrics.attempts.lock().unwrap().len(), 1);
        let outcomes = metrics.outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, OutcomeStatus::Success);
        assert_eq!(outcomes[0].sender, "svc-a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds_with_growing_delays() {
        let provider = ScriptedProvider::new(vec![retryable(), retryable(), retryable()]);
        let (handler, _tx) = handler(
            config(4),
            provider.clone(),
            Arc::new(InMemoryContextStore::new()),
            Arc::new(NoopMetrics),
        );

        let handled = handler.handle(&inbound("x", None)).await.unwrap();
        assert!(matches!(
            handled.outcome,
            ProcessingOutcome::Success { attempts: 4, .. }
        ));

        let times = provider.call_times();
        let delays: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        let expected = [100, 200, 250].map(Duration::from_millis);
        assert_eq!(delays.len(), expected.len());
        for (delay, expected) in delays.iter().zip(expected) {
            assert!(close_to(*delay, expected), "{delay:?} vs {expected:?}");
        }
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_stops_at_max_attempts() {
        let provider = ScriptedProvider::new(vec![retryable(); 10]);
        let (handler, _tx) = handler(
            config(3),
            provider.clone(),
            Arc::new(InMemoryContextStore::new()),
            Arc::new(NoopMetrics),
        );

        let handled = handler.handle(&inbound("x", None)).await.unwrap();
        match handled.outcome {
            ProcessingOutcome::RetryableFailure {
                attempts,
                exhausted,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert!(exhausted);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(provider.call_count(), 3);
        let error = handled.envelope.unwrap().error.unwrap();
        assert_eq!(error.code, "server_error");
        assert!(error.retryable);
    }

    #[tokio::test]
    async fn test_fatal_error_short_circuits() {
        let provider = ScriptedProvider::new(vec![Err(ProviderError::fatal(
            "authentication_failed",
            "bad key",
        ))]);
        let (handler, _tx) = handler(
            config(5),
            provider.clone(),
            Arc::new(InMemoryContextStore::new()),
            Arc::new(NoopMetrics),
        );

        let handled = handler.handle(&inbound("x", None)).await.unwrap();
        assert!(matches!(
            handled.outcome,
            ProcessingOutcome::FatalFailure { attempts: 1, .. }
        ));
        assert_eq!(provider.call_count(), 1);
        assert_eq!(handler.available_slots(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_overrides_backoff() {
        let provider = ScriptedProvider::new(vec![Err(ProviderError::retryable(
            "rate_limited",
            "slow down",
        )
        .with_retry_after(Duration::from_millis(180)))]);
        let (handler, _tx) = handler(
            config(3),
            provider.clone(),
            Arc::new(InMemoryContextStore::new()),
            Arc::new(NoopMetrics),
        );

        handler.handle(&inbound("x", None)).await.unwrap();
        let times = provider.call_times();
        assert!(close_to(times[1] - times[0], Duration::from_millis(180)));
    }

    #[tokio::test]
    async fn test_panic_becomes_fatal_and_releases_slot() {
        let (handler, _tx) = handler(
            config(3),
            Arc::new(PanickingProvider),
            Arc::new(InMemoryContextStore::new()),
            Arc::new(NoopMetrics),
        );

        let handled = handler.handle(&inbound("x", None)).await.unwrap();
        match &handled.outcome {
            ProcessingOutcome::FatalFailure { error, attempts } => {
                assert_eq!(error.code, "unhandled_error");
                assert!(error.message.contains("provider exploded"));
                assert_eq!(*attempts, 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(handler.available_slots(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let provider = ScriptedProvider::new(vec![retryable(); 10]);
        let config = Arc::new(
            AgentConfig::builder("agent-1", "redis://localhost:6379")
                .retry_max(5)
                .retry_backoff_base(Duration::from_secs(10))
                .retry_backoff_max(Duration::from_secs(10))
                .retry_jitter(0.0)
                .build()
                .unwrap(),
        );
        let (handler, tx) = handler(
            config,
            provider.clone(),
            Arc::new(InMemoryContextStore::new()),
            Arc::new(NoopMetrics),
        );

        let message = inbound("x", None);
        let task = handler.handle(&message);
        tokio::pin!(task);

        tokio::select! {
            _ = &mut task => panic!("handler finished before shutdown"),
            () = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        tx.send(true).unwrap();

        let handled = task.await.unwrap();
        assert!(matches!(
            handled.outcome,
            ProcessingOutcome::RetryableFailure {
                attempts: 1,
                exhausted: false,
                ..
            }
        ));
        assert!(handled.envelope.is_none());
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_context_is_loaded_merged_and_saved() {
        let store = Arc::new(InMemoryContextStore::new());
        store
            .save(
                "agent-1:t-1",
                &ConversationHistory::new(vec![
                    ChatMessage::user("earlier"),
                    ChatMessage::assistant("reply"),
                ]),
                None,
            )
            .await
            .unwrap();

        let provider = ScriptedProvider::new(vec![Ok(completion("now"))]);
        let (handler, _tx) = handler(
            config(3),
            provider.clone(),
            store.clone(),
            Arc::new(NoopMetrics),
        );

        let mut message = inbound("next", Some("t-1"));
        message.context = ConversationHistory::new(vec![ChatMessage::assistant("reply")]);
        handler.handle(&message).await.unwrap();

        assert_eq!(
            provider.last_request().history,
            vec![ChatMessage::user("earlier"), ChatMessage::assistant("reply")]
        );

        // max_messages = 4 keeps the latest four turns
        let saved = store.load("agent-1:t-1").await.unwrap().unwrap();
        assert_eq!(
            saved.messages,
            vec![
                ChatMessage::user("earlier"),
                ChatMessage::assistant("reply"),
                ChatMessage::user("next"),
                ChatMessage::assistant("now"),
            ]
        );
    }

    #[tokio::test]
    async fn test_context_skipped_without_thread() {
        let store = Arc::new(InMemoryContextStore::new());
        let (handler, _tx) = handler(
            config(3),
            ScriptedProvider::new(vec![]),
            store.clone(),
            Arc::new(NoopMetrics),
        );

        handler.handle(&inbound("x", None)).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
