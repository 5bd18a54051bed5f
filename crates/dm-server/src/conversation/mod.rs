//! Diagnostic conversations
//!
//! A [`Conversation`] is the UDS server side of one tester's dialog. The
//! [`ConversationManager`] owns a bounded pool of them per server address,
//! together with the shared [`UdsMessageProvider`], the session timing
//! table and the access state notifier.

mod access;
mod machine;
mod manager;
mod message_handler;
mod provider;
mod state_manager;

pub use access::{
    AccessCategory, AccessError, AccessState, AccessStateChange, AccessStateNotifier,
    AccessStateObserver, CategoryMask, SubscriptionId,
};
pub use machine::{Conversation, ConversationContext, ConversationState};
pub use manager::{ConversationManager, MAX_ACCESS_STATE_SUBSCRIBERS, NUMBER_UDS_BUFFERS};
pub use message_handler::POLL_INTERVAL;
pub use provider::UdsMessageProvider;
pub use state_manager::{session_id, SessionTiming, StateManager};
