//! Error types for the diagnostic server

use thiserror::Error;

use crate::config::ConfigError;
use crate::conversation::{AccessError, ConversationState};
use crate::pool::PoolError;
use crate::udstransport::{Address, HandlerId};

/// Protocol or programming violations detected by a conversation
///
/// These are never sent to the tester; they indicate a caller that broke
/// the conversation's state contract or an unrecoverable per-message fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationError {
    #[error("{operation} called in state {state}")]
    InvalidState {
        operation: &'static str,
        state: ConversationState,
    },

    #[error("Message payload is empty")]
    EmptyPayload,

    #[error("No request SID recorded for this conversation")]
    NoRequestSid,

    #[error("Transport protocol handler {0} cannot be found")]
    TransportHandlerNotFound(HandlerId),

    #[error("Message handler is shut down")]
    MessageHandlerClosed,
}

/// Errors while wiring up or running the diagnostic server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport protocol handler {0} already registered")]
    DuplicateHandler(HandlerId),

    #[error("Conversation manager for target address 0x{0:04X} already registered")]
    DuplicateTargetAddress(Address),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Access state error: {0}")]
    Access(#[from] AccessError),
}

/// Result type for server wiring
pub type ServerResult<T> = Result<T, ServerError>;
