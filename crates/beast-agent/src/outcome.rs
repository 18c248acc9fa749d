//! Result of handling one message

use beast_observability::OutcomeStatus;

use crate::envelope::ResponseEnvelope;
use crate::error::ProviderError;
use crate::provider::Completion;

/// Exactly one per handled message; drives both the reply and the ack
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    Success {
        completion: Completion,
        attempts: u32,
    },
    /// Last error was retryable. `exhausted` is false only when shutdown
    /// stopped the retry loop early.
    RetryableFailure {
        error: ProviderError,
        attempts: u32,
        exhausted: bool,
    },
    FatalFailure {
        error: ProviderError,
        attempts: u32,
    },
}

impl ProcessingOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            ProcessingOutcome::Success { attempts, .. }
            | ProcessingOutcome::RetryableFailure { attempts, .. }
            | ProcessingOutcome::FatalFailure { attempts, .. } => *attempts,
        }
    }

    /// Whether the entry should be answered and acknowledged
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ProcessingOutcome::RetryableFailure {
                exhausted: false,
                ..
            }
        )
    }

    pub fn status(&self) -> OutcomeStatus {
        match self {
            ProcessingOutcome::Success { .. } => OutcomeStatus::Success,
            ProcessingOutcome::RetryableFailure {
                exhausted: false, ..
            } => OutcomeStatus::Abandoned,
            ProcessingOutcome::RetryableFailure { .. } | ProcessingOutcome::FatalFailure { .. } => {
                OutcomeStatus::Error
            }
        }
    }

    pub fn error(&self) -> Option<&ProviderError> {
        match self {
            ProcessingOutcome::Success { .. } => None,
            ProcessingOutcome::RetryableFailure { error, .. }
            | ProcessingOutcome::FatalFailure { error, .. } => Some(error),
        }
    }
}

/// Outcome plus the envelope to publish, if any
#[derive(Debug, Clone, PartialEq)]
pub struct HandledMessage {
    pub outcome: ProcessingOutcome,
    /// `None` when the outcome is not terminal
    pub envelope: Option<ResponseEnvelope>,
}
