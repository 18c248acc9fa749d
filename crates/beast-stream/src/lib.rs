//! # Beast Stream
//!
//! Consumer-group mailbox streams for Beast agents.
//!
//! A mailbox is a durable, append-only stream read through a consumer group.
//! Entries handed to a consumer stay pending until acknowledged, so a crashed
//! consumer's work can be claimed and redone by the next one.
//!
//! ## Example
//!
//! ```rust,no_run
//! use beast_stream::{MailboxMessage, MailboxStream, StreamKey, Subscription};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     # #[cfg(feature = "redis")]
//!     # {
//!     let stream = beast_stream::RedisMailboxStream::new("redis://localhost:6379").await?;
//!     let inbox = StreamKey::inbox("beast:mailbox", "agent-1")?;
//!     let sub = Subscription::new(inbox, "agent:agent-1", "agent-1")?;
//!
//!     stream.ensure_group(&sub).await?;
//!     for entry in stream.read_group(&sub, 10, Duration::from_secs(1)).await? {
//!         let message = entry.decode()?;
//!         println!("{} says {:?}", message.sender, message.payload);
//!         stream.ack(&sub, &entry.id).await?;
//!     }
//!     # }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod memory;
pub mod message;
pub mod stream;
pub mod types;

#[cfg(feature = "redis")]
pub mod redis;

pub use error::{StreamError, StreamResult};
pub use memory::InMemoryMailboxStream;
pub use message::{DEFAULT_MESSAGE_TYPE, MailboxMessage, StreamEntry};
pub use stream::MailboxStream;
pub use types::{EntryId, IdValidationError, StreamKey, Subscription};

#[cfg(feature = "redis")]
pub use redis::{RedisMailboxStream, RedisStreamConfig};
