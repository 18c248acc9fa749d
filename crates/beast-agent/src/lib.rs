//! # Beast Agent
//!
//! A mailbox-driven LLM agent. Requests arrive on a Redis Streams consumer
//! group, each prompt goes to a text-generation provider with retry and
//! backoff, and a correlated response is published to the requester's inbox.
//!
//! Delivery is at least once: an entry is acknowledged only after its
//! response has been published, and entries left pending by a crash are
//! reclaimed and answered on the next startup. Receivers deduplicate by
//! `message_id`.
//!
//! ## Components
//!
//! - [`ProviderAdapter`]: one completion call, failures classified as
//!   retryable or fatal
//! - [`ContextStore`]: optional per-thread conversation history
//! - [`PromptHandler`]: concurrency gate, retry loop, context handling
//! - [`MailboxProcessor`]: poll loop, pending recovery, publish and ack
//! - [`AgentRuntime`]: wiring and lifecycle
//!
//! ## Example
//!
//! ```rust,no_run
//! use beast_agent::{AgentConfig, AgentRuntime, shutdown_signal};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AgentConfig::builder("agent-1", "redis://localhost:6379")
//!         .openai_api_key("sk-...")
//!         .concurrency(4)
//!         .build()?;
//!
//!     let mut runtime = AgentRuntime::builder(config).build()?;
//!     let stats = runtime.run_until(shutdown_signal()).await?;
//!     println!("answered {} prompts", stats.succeeded);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod message;
pub mod outcome;
pub mod processor;
pub mod provider;
pub mod retry;
pub mod runtime;
pub mod shutdown;

pub use config::{AgentConfig, AgentConfigBuilder, ApiKey, ConfigError};
pub use context::{
    ContextStore, InMemoryContextStore, NullContextStore, RedisContextStore, create_context_store,
};
pub use envelope::{
    Correlation, EnvelopeStatus, ErrorBody, RESPONSE_MESSAGE_TYPE, ResponseBody, ResponseEnvelope,
};
pub use error::{AgentError, AgentResult, ContextError, ProviderError, ProviderErrorKind};
pub use handler::{ConcurrencySlot, PromptHandler};
pub use message::{
    ChatMessage, ConversationHistory, GenerationOptions, INVALID_PAYLOAD, InboundMessage,
    RequestOptions, Role, ValidationError,
};
pub use outcome::{HandledMessage, ProcessingOutcome};
pub use processor::{MailboxProcessor, ProcessorStats};
pub use provider::{
    Completion, OpenAiChatProvider, PromptRequest, ProviderAdapter, Usage, create_provider,
};
pub use retry::{Backoff, RetryPolicy};
pub use runtime::{AgentRuntime, AgentRuntimeBuilder, perform_healthcheck};
pub use shutdown::shutdown_signal;
