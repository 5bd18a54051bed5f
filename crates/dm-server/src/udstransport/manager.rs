//! Routes transport indications to conversation managers

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::conversation::ConversationManager;
use crate::error::{ServerError, ServerResult};

use super::{
    Address, GlobalChannelId, HandlerId, IndicationResult, MetaInfoMap, TargetAddressType,
    TransmissionResult, TransportHandlerRegistry, UdsMessage, UdsTransportProtocolHandler,
};

/// Outcome of an indication and the buffer to receive into
pub type IndicationPair = (IndicationResult, Option<UdsMessage>);

/// Entry point for transport protocol handlers
///
/// Physical requests are routed by target address; functional requests go
/// to the first registered conversation manager.
pub struct UdsTransportProtocolMgr {
    handlers: Arc<TransportHandlerRegistry>,
    managers: RwLock<Vec<Arc<ConversationManager>>>,
}

impl UdsTransportProtocolMgr {
    pub fn new(handlers: Arc<TransportHandlerRegistry>) -> Self {
        Self {
            handlers,
            managers: RwLock::new(Vec::new()),
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn UdsTransportProtocolHandler>) -> ServerResult<()> {
        self.handlers.add(handler)
    }

    pub fn handler(&self, handler_id: HandlerId) -> Option<Arc<dyn UdsTransportProtocolHandler>> {
        self.handlers.get(handler_id)
    }

    /// Serve a server address; addresses must be unique
    pub fn register(&self, manager: Arc<ConversationManager>) -> ServerResult<()> {
        let mut managers = self.managers.write();
        let target_address = manager.target_address();
        if managers.iter().any(|m| m.target_address() == target_address) {
            return Err(ServerError::DuplicateTargetAddress(target_address));
        }
        info!(
            target_address = format!("0x{:04X}", target_address),
            "Conversation manager registered"
        );
        managers.push(manager);
        Ok(())
    }

    pub fn unregister(&self, target_address: Address) -> Option<Arc<ConversationManager>> {
        let mut managers = self.managers.write();
        let index = managers
            .iter()
            .position(|m| m.target_address() == target_address)?;
        Some(managers.remove(index))
    }

    /// Start all transport handlers
    pub fn run(&self) {
        self.handlers.start_all();
    }

    /// Stop all transport handlers
    pub fn shutdown(&self) {
        self.handlers.stop_all();
    }

    /// A request of `size` bytes is arriving; returns the buffer to fill
    pub fn indicate_message(
        &self,
        source_address: Address,
        target_address: Address,
        target_address_type: TargetAddressType,
        channel: GlobalChannelId,
        size: usize,
        meta_info: Option<Arc<MetaInfoMap>>,
    ) -> IndicationPair {
        let Some(manager) = self.find_manager(target_address, target_address_type) else {
            warn!(
                target_address = format!("0x{:04X}", target_address),
                "No conversation manager for target address"
            );
            return (IndicationResult::Overflow, None);
        };
        let Some(conversation) = manager.get_or_create_conversation(channel, source_address)
        else {
            return (IndicationResult::Overflow, None);
        };

        let (result, message) = conversation.indicate_message(size, target_address_type);
        let message = match (message, meta_info) {
            (Some(mut message), Some(meta_info)) => {
                if !message.add_meta_info(meta_info) {
                    warn!("Meta info dropped, no free slot");
                }
                Some(message)
            }
            (message, _) => message,
        };
        debug!(
            tester = format!("0x{:04X}", source_address),
            channel = %channel,
            size,
            result = ?result,
            "Message indicated"
        );
        (result, message)
    }

    /// A previously indicated request is complete
    pub fn handle_message(&self, message: UdsMessage) {
        let Some(manager) =
            self.find_manager(message.target_address(), message.target_address_type())
        else {
            warn!(
                target_address = format!("0x{:04X}", message.target_address()),
                "No conversation manager for received message"
            );
            return;
        };
        let Some(conversation) =
            manager.find_conversation(message.channel(), message.source_address())
        else {
            warn!(channel = %message.channel(), "No conversation for received message");
            return;
        };
        if let Err(e) = conversation.handle_message(message) {
            error!(error = %e, "Conversation rejected message");
        }
    }

    /// The transport finished sending `message`
    pub fn transmit_confirmation(&self, message: UdsMessage, result: TransmissionResult) {
        let Some(manager) = self.find_manager(message.source_address(), TargetAddressType::Physical)
        else {
            warn!(
                source_address = format!("0x{:04X}", message.source_address()),
                "No conversation manager for confirmed message"
            );
            return;
        };
        let Some(conversation) =
            manager.find_conversation(message.channel(), message.target_address())
        else {
            warn!(channel = %message.channel(), "No conversation for confirmed message");
            return;
        };
        if let Err(e) = conversation.transmit_confirmation(&message, result) {
            error!(error = %e, "Transmit confirmation rejected");
        }
    }

    /// The transport gave up receiving `message`
    pub fn notify_message_failure(&self, message: UdsMessage) {
        warn!(
            message = %message.to_log_string(usize::MAX),
            "Message reception failed"
        );
        let conversation = self
            .find_manager(message.target_address(), message.target_address_type())
            .and_then(|m| m.find_conversation(message.channel(), message.source_address()));
        drop(message);
        if let Some(conversation) = conversation {
            conversation.abort_reception();
        }
    }

    pub fn channel_reestablished(&self, channel: GlobalChannelId) {
        info!(channel = %channel, "Channel reestablished");
    }

    pub fn handler_stopped(&self, handler_id: HandlerId) {
        info!(handler_id, "Transport protocol handler stopped");
    }

    fn find_manager(
        &self,
        target_address: Address,
        target_address_type: TargetAddressType,
    ) -> Option<Arc<ConversationManager>> {
        let managers = self.managers.read();
        match target_address_type {
            TargetAddressType::Functional => managers.first().cloned(),
            TargetAddressType::Physical => managers
                .iter()
                .find(|m| m.target_address() == target_address)
                .cloned(),
        }
    }
}
