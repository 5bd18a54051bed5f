//! Pooled UDS message buffers

use tracing::{trace, warn};

use crate::pool::{ObjectPool, PoolError};
use crate::udstransport::{UdsMessage, UdsMessageParameter};

/// Hands out [`UdsMessage`]s backed by a fixed number of buffers
///
/// Buffers are allocated once with the maximum message length; acquiring
/// only resizes within that capacity and returns `None` when every buffer
/// is in use or the requested size exceeds the maximum.
pub struct UdsMessageProvider {
    buffers: ObjectPool<Vec<u8>>,
    max_payload_size: usize,
}

impl UdsMessageProvider {
    pub fn new(number_of_buffers: usize, max_payload_size: usize) -> Result<Self, PoolError> {
        let buffers = ObjectPool::new();
        buffers.reserve(number_of_buffers, || Vec::with_capacity(max_payload_size))?;
        Ok(Self {
            buffers,
            max_payload_size,
        })
    }

    /// Take a zero-filled message of `payload_size` bytes
    pub fn acquire(
        &self,
        payload_size: usize,
        parameter: UdsMessageParameter,
    ) -> Option<UdsMessage> {
        if payload_size > self.max_payload_size {
            warn!(
                payload_size,
                max = self.max_payload_size,
                "Requested UDS message exceeds maximum length"
            );
            return None;
        }
        let Some(mut buffer) = self.buffers.acquire() else {
            warn!(payload_size, "No UDS message buffer available");
            return None;
        };
        buffer.clear();
        buffer.resize(payload_size, 0);
        trace!(payload_size, available = self.buffers.available(), "UDS buffer acquired");
        Some(UdsMessage::new(parameter, buffer))
    }

    /// Buffers currently free
    pub fn available(&self) -> usize {
        self.buffers.available()
    }

    pub fn capacity(&self) -> usize {
        self.buffers.capacity()
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }
}
