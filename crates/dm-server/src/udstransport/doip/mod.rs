//! DoIP (Diagnostics over IP) transport handler
//!
//! Server side of ISO 13400-2 over TCP: testers connect, activate routing
//! for their logical address and exchange diagnostic messages. Each
//! activated tester gets a channel whose id is its source address.
//!
//! # Example Configuration
//!
//! ```toml
//! [doip]
//! bind_address = "0.0.0.0"
//! port = 13400
//! max_connections = 4
//! logical_address = 0x0010
//! ```

mod handler;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Address;

pub use handler::DoIpHandler;

/// Standard DoIP TCP data port
pub const DOIP_PORT: u16 = 13400;

/// Functional target addresses reserved by ISO 13400-2
pub const FUNCTIONAL_ADDRESS_RANGE: std::ops::RangeInclusive<Address> = 0xE400..=0xEFFF;

#[derive(Debug, Error)]
pub enum DoIpError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoIpConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Logical address of this DoIP entity
    pub logical_address: Address,

    /// Largest accepted payload; bigger frames are refused with a generic NACK
    #[serde(default = "default_max_payload_length")]
    pub max_payload_length: u32,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DOIP_PORT
}

fn default_max_connections() -> usize {
    4
}

fn default_max_payload_length() -> u32 {
    0x1_0004
}

impl DoIpConfig {
    pub fn new(logical_address: Address) -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_connections: default_max_connections(),
            logical_address,
            max_payload_length: default_max_payload_length(),
        }
    }

    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Addressing mode implied by a DoIP target address
pub fn target_address_type(target_address: Address) -> super::TargetAddressType {
    if FUNCTIONAL_ADDRESS_RANGE.contains(&target_address) {
        super::TargetAddressType::Functional
    } else {
        super::TargetAddressType::Physical
    }
}
