//! UDS transport layer abstraction
//!
//! Transport protocol handlers (DoIP, CAN/ISO-TP, test doubles) deliver
//! requests through the [`UdsTransportProtocolMgr`] and receive responses
//! through [`UdsTransportProtocolHandler::transmit`].

pub mod doip;
mod handler;
mod manager;
mod message;
mod mock;
mod nrc;

use std::fmt;

pub use handler::{TransportHandlerRegistry, UdsTransportProtocolHandler};
pub use manager::{IndicationPair, UdsTransportProtocolMgr};
pub use message::{
    MetaInfoMap, TargetAddressType, UdsMessage, UdsMessageParameter, MAX_META_INFO_MAPS,
};
pub use mock::{MockTransportHandler, TransmittedMessage};
pub use nrc::NegativeResponseCode;

/// Logical UDS address (tester or server)
pub type Address = u16;

/// Channel identifier, unique within one transport handler
pub type ChannelId = u32;

/// Transport protocol handler identifier
pub type HandlerId = u8;

/// Identifies a channel across all transport handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalChannelId {
    pub handler_id: HandlerId,
    pub channel_id: ChannelId,
}

impl GlobalChannelId {
    pub fn new(handler_id: HandlerId, channel_id: ChannelId) -> Self {
        Self {
            handler_id,
            channel_id,
        }
    }
}

impl fmt::Display for GlobalChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.handler_id, self.channel_id)
    }
}

/// Result of announcing an incoming message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicationResult {
    /// A buffer was reserved for the message
    Ok,
    /// The conversation is still handling another request
    Busy,
    /// No resources (buffer, conversation or target) for the message
    Overflow,
}

/// Outcome of a transmission reported by the transport handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionResult {
    Ok,
    Failed,
}
