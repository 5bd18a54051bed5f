//! UDS message exchanged between transport layer and conversations

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::pool::Pooled;

use super::{Address, GlobalChannelId};

/// Key/value meta information a transport attaches to a message
pub type MetaInfoMap = HashMap<String, String>;

/// Maximum number of meta-info maps one message can carry
pub const MAX_META_INFO_MAPS: usize = 3;

/// Addressing mode of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetAddressType {
    /// Point-to-point request to one server
    Physical,
    /// Broadcast request to every server on the network
    Functional,
}

impl fmt::Display for TargetAddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Physical => write!(f, "physical"),
            Self::Functional => write!(f, "functional"),
        }
    }
}

/// Addressing parameters for a message taken from the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdsMessageParameter {
    pub source_address: Address,
    pub target_address: Address,
    pub target_address_type: TargetAddressType,
    pub channel: GlobalChannelId,
}

/// A UDS request or response backed by a pooled buffer
///
/// Dropping the message returns its buffer to the pool it came from.
pub struct UdsMessage {
    parameter: UdsMessageParameter,
    payload: Pooled<Vec<u8>>,
    meta_info: [Option<Arc<MetaInfoMap>>; MAX_META_INFO_MAPS],
}

impl UdsMessage {
    pub(crate) fn new(parameter: UdsMessageParameter, payload: Pooled<Vec<u8>>) -> Self {
        Self {
            parameter,
            payload,
            meta_info: Default::default(),
        }
    }

    pub fn source_address(&self) -> Address {
        self.parameter.source_address
    }

    pub fn target_address(&self) -> Address {
        self.parameter.target_address
    }

    pub fn target_address_type(&self) -> TargetAddressType {
        self.parameter.target_address_type
    }

    pub fn channel(&self) -> GlobalChannelId {
        self.parameter.channel
    }

    pub fn payload(&self) -> &[u8] {
        self.payload.as_slice()
    }

    /// Writable view on the payload; its length is fixed at acquisition
    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.payload.as_mut_slice()
    }

    /// Shorten the payload, e.g. when fewer bytes were produced than reserved
    pub fn truncate(&mut self, len: usize) {
        self.payload.truncate(len);
    }

    /// Service identifier (first payload byte)
    pub fn sid(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Attach a meta-info map. Returns `false` when all slots are taken.
    pub fn add_meta_info(&mut self, meta_info: Arc<MetaInfoMap>) -> bool {
        match self.meta_info.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(meta_info);
                true
            }
            None => false,
        }
    }

    pub fn meta_info(&self) -> impl Iterator<Item = &MetaInfoMap> {
        self.meta_info.iter().flatten().map(|map| map.as_ref())
    }

    /// Render addressing and at most `max_payload_bytes` of payload for logging
    pub fn to_log_string(&self, max_payload_bytes: usize) -> String {
        let payload = self.payload();
        let shown = &payload[..payload.len().min(max_payload_bytes)];
        let ellipsis = if shown.len() < payload.len() { "..." } else { "" };
        format!(
            "UdsMessage[SA=0x{:04X}, TA=0x{:04X}, {}, channel={}, len={}, payload={}{}]",
            self.parameter.source_address,
            self.parameter.target_address,
            self.parameter.target_address_type,
            self.parameter.channel,
            payload.len(),
            hex::encode_upper(shown),
            ellipsis
        )
    }
}

impl fmt::Debug for UdsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_log_string(usize::MAX))
    }
}
