//! Conversation pool for one server address

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::config::DextConfiguration;
use crate::error::ServerResult;
use crate::service::ServiceDispatcher;
use crate::udstransport::{Address, GlobalChannelId, TransportHandlerRegistry};

use super::access::AccessStateNotifier;
use super::machine::{Conversation, ConversationContext, ConversationState};
use super::provider::UdsMessageProvider;
use super::state_manager::StateManager;

/// UDS message buffers shared by all conversations of one manager
pub const NUMBER_UDS_BUFFERS: usize = 5;

/// Access state observers per manager
pub const MAX_ACCESS_STATE_SUBSCRIBERS: usize = 10;

/// Owns the conversations talking to one target address
pub struct ConversationManager {
    context: Arc<ConversationContext>,
    max_conversations: usize,
    conversations: Mutex<Vec<Arc<Conversation>>>,
}

impl ConversationManager {
    pub fn new(
        config: &DextConfiguration,
        dispatcher: Arc<dyn ServiceDispatcher>,
        transport_handlers: Arc<TransportHandlerRegistry>,
        runtime: Handle,
    ) -> ServerResult<Self> {
        let provider =
            UdsMessageProvider::new(NUMBER_UDS_BUFFERS, config.uds_message_length as usize)?;
        let max_conversations = usize::from(config.number_conversations);
        info!(
            target_address = format!("0x{:04X}", config.target_address),
            max_conversations,
            buffers = NUMBER_UDS_BUFFERS,
            "Conversation manager created"
        );

        Ok(Self {
            context: Arc::new(ConversationContext {
                target_address: config.target_address,
                provider: Arc::new(provider),
                state_manager: Arc::new(StateManager::new(&config.sessions)),
                transport_handlers,
                dispatcher,
                access_notifier: Arc::new(AccessStateNotifier::new(MAX_ACCESS_STATE_SUBSCRIBERS)),
                runtime,
                response_pending_limit: config.max_number_of_response_pending_responses,
                s3_time: config.s3_time(),
                log_max_payload_bytes: config.log_max_payload_bytes,
            }),
            max_conversations,
            conversations: Mutex::new(Vec::with_capacity(max_conversations)),
        })
    }

    pub fn target_address(&self) -> Address {
        self.context.target_address
    }

    pub fn provider(&self) -> &Arc<UdsMessageProvider> {
        &self.context.provider
    }

    pub fn access_notifier(&self) -> &Arc<AccessStateNotifier> {
        &self.context.access_notifier
    }

    pub fn max_conversations(&self) -> usize {
        self.max_conversations
    }

    /// Conversation for a tester, allocating or recycling a slot if needed
    ///
    /// Returns `None` when every slot is busy with another tester.
    pub fn get_or_create_conversation(
        &self,
        channel: GlobalChannelId,
        source_address: Address,
    ) -> Option<Arc<Conversation>> {
        let mut conversations = self.conversations.lock();
        if let Some(existing) = conversations
            .iter()
            .find(|c| c.matches(channel, source_address))
        {
            return Some(Arc::clone(existing));
        }

        if conversations.len() >= self.max_conversations {
            let Some(index) = conversations
                .iter()
                .position(|c| c.state() == ConversationState::Free)
            else {
                warn!(
                    channel = %channel,
                    tester = format!("0x{:04X}", source_address),
                    "No free conversation available"
                );
                return None;
            };
            let recycled = conversations.swap_remove(index);
            debug!(
                old_channel = %recycled.channel(),
                old_tester = format!("0x{:04X}", recycled.source_address()),
                "Recycling free conversation"
            );
            recycled.shutdown();
        }

        let conversation = Conversation::new(channel, source_address, Arc::clone(&self.context));
        conversations.push(Arc::clone(&conversation));
        Some(conversation)
    }

    /// Existing conversation for a tester
    pub fn find_conversation(
        &self,
        channel: GlobalChannelId,
        source_address: Address,
    ) -> Option<Arc<Conversation>> {
        self.conversations
            .lock()
            .iter()
            .find(|c| c.matches(channel, source_address))
            .cloned()
    }

    pub fn conversations(&self) -> Vec<Arc<Conversation>> {
        self.conversations.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.conversations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.lock().is_empty()
    }

    /// Shut down every conversation and wait for their message handlers
    pub async fn shutdown(&self) {
        let conversations = std::mem::take(&mut *self.conversations.lock());
        for conversation in &conversations {
            conversation.shutdown();
        }
        for conversation in &conversations {
            conversation.join_message_handler().await;
        }
        info!(
            target_address = format!("0x{:04X}", self.context.target_address),
            count = conversations.len(),
            "Conversations shut down"
        );
    }
}
