//! UDS service layer
//!
//! A [`ServiceDispatcher`] maps an incoming request to a [`ServiceProcessor`].
//! The conversation's message handler drives the processor until it reports
//! [`ProcessingStatus::Done`]; the processor answers through the
//! [`ServiceProcessingContext`] it was created with.

mod dispatcher;
mod preconditions;
pub mod processor;
#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use thiserror::Error;
use tokio::runtime::Handle;

use crate::conversation::{AccessState, SessionTiming};
use crate::error::ConversationError;
use crate::udstransport::{NegativeResponseCode, UdsMessage};

pub use dispatcher::ServiceTable;
pub use preconditions::Preconditions;

/// Service identifiers handled by the built-in processors
pub mod sid {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const READ_DATA_BY_IDENTIFIER: u8 = 0x22;
    pub const WRITE_DATA_BY_IDENTIFIER: u8 = 0x2E;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const TESTER_PRESENT: u8 = 0x3E;

    /// Negative response service id
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
    /// Added to the request SID to form the positive response SID
    pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;
    /// Suppress positive response message indication bit
    pub const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;
}

/// Progress reported by [`ServiceProcessor::handle_message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    /// Call again after the poll interval
    NotDone,
    /// The processor finished the conversation's request
    Done,
}

/// Failures inside a service processor
///
/// Any of these aborts the request with a GeneralReject response.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Conversation rejected the call: {0}")]
    Conversation(#[from] ConversationError),

    #[error("Data provider task failed: {0}")]
    ProviderTask(String),
}

/// Callbacks a processor uses to answer its request
///
/// Implemented by [`Conversation`](crate::conversation::Conversation).
pub trait ServiceProcessingContext: Send + Sync {
    /// Send a positive response (dropped when the suppress bit is set)
    fn finish_processing(&self, response: UdsMessage) -> Result<(), ConversationError>;

    /// Send `[0x7F, request SID, nrc]`
    fn finish_processing_with_nrc(&self, nrc: NegativeResponseCode)
        -> Result<(), ConversationError>;

    /// Buffer addressed back to the tester, `None` when the pool is exhausted
    fn acquire_response_buffer(&self, size: usize) -> Option<UdsMessage>;

    /// Suppress the positive response of the current request
    fn set_suppress_bit(&self, suppress: bool);

    fn access_state(&self) -> AccessState;

    fn set_session_id(&self, session: u8);

    fn set_security_level(&self, level: u8);

    /// Timing of a configured session
    fn session_timing(&self, session: u8) -> Option<SessionTiming>;

    /// Runtime for spawning asynchronous work
    fn runtime(&self) -> Handle;
}

/// A request being worked on
pub trait ServiceProcessor: Send {
    /// Advance processing; must not block
    fn handle_message(&mut self) -> Result<ProcessingStatus, ProcessingError>;
}

/// Creates processors for one service
pub trait ServiceHandler: Send + Sync {
    fn create_processor(
        &self,
        request: UdsMessage,
        context: Arc<dyn ServiceProcessingContext>,
    ) -> Box<dyn ServiceProcessor>;
}

/// Finds the processor for a request or the NRC rejecting it
pub trait ServiceDispatcher: Send + Sync {
    fn find_service_processor(
        &self,
        request: UdsMessage,
        context: Arc<dyn ServiceProcessingContext>,
    ) -> Result<Box<dyn ServiceProcessor>, NegativeResponseCode>;
}

/// Positive response SID for a request SID
pub fn positive_response_sid(request_sid: u8) -> u8 {
    request_sid.wrapping_add(sid::POSITIVE_RESPONSE_OFFSET)
}
