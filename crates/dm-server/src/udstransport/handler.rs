//! Transport protocol handler trait and registry

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::ServerError;

use super::{ChannelId, HandlerId, UdsMessage};

/// A transport protocol (DoIP, CAN/ISO-TP, ...) able to carry UDS messages
///
/// `transmit` hands a response over to the transport; the handler reports
/// the outcome later through
/// [`UdsTransportProtocolMgr::transmit_confirmation`](super::UdsTransportProtocolMgr::transmit_confirmation),
/// possibly from within `transmit` itself.
pub trait UdsTransportProtocolHandler: Send + Sync {
    /// Identifier used in [`GlobalChannelId`](super::GlobalChannelId)
    fn handler_id(&self) -> HandlerId;

    /// Start accepting testers
    fn start(&self);

    /// Stop the transport and drop all channels
    fn stop(&self);

    /// Ask the transport to reestablish a lost channel
    fn notify_reestablishment(&self, _channel_id: ChannelId) -> bool {
        false
    }

    /// Send a message on a channel
    fn transmit(&self, message: UdsMessage, channel_id: ChannelId);
}

/// Registered transport handlers, looked up by handler id
#[derive(Default)]
pub struct TransportHandlerRegistry {
    handlers: RwLock<Vec<Arc<dyn UdsTransportProtocolHandler>>>,
}

impl TransportHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; handler ids must be unique
    pub fn add(&self, handler: Arc<dyn UdsTransportProtocolHandler>) -> Result<(), ServerError> {
        let mut handlers = self.handlers.write();
        let handler_id = handler.handler_id();
        if handlers.iter().any(|h| h.handler_id() == handler_id) {
            return Err(ServerError::DuplicateHandler(handler_id));
        }
        info!(handler_id, "Registered transport protocol handler");
        handlers.push(handler);
        Ok(())
    }

    pub fn get(&self, handler_id: HandlerId) -> Option<Arc<dyn UdsTransportProtocolHandler>> {
        self.handlers
            .read()
            .iter()
            .find(|h| h.handler_id() == handler_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    pub(crate) fn start_all(&self) {
        // Clone out so a handler calling back into the registry cannot deadlock
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            debug!(handler_id = handler.handler_id(), "Starting transport handler");
            handler.start();
        }
    }

    pub(crate) fn stop_all(&self) {
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            debug!(handler_id = handler.handler_id(), "Stopping transport handler");
            handler.stop();
        }
    }
}
