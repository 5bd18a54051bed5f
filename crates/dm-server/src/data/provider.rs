//! DID value providers

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::config::{ConfigError, DidTableConfiguration};
use crate::udstransport::NegativeResponseCode;

/// Application side of ReadDataByIdentifier / WriteDataByIdentifier
#[async_trait]
pub trait DataIdentifierProvider: Send + Sync {
    async fn read(&self, did: u16) -> Result<Vec<u8>, NegativeResponseCode>;

    async fn write(&self, did: u16, data: &[u8]) -> Result<(), NegativeResponseCode>;
}

/// DID values held in memory, seeded from the configuration
#[derive(Debug, Default)]
pub struct InMemoryDataProvider {
    values: RwLock<HashMap<u16, Vec<u8>>>,
    latency: Duration,
}

impl InMemoryDataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider holding every `value` of the DID table
    pub fn from_config(config: &DidTableConfiguration) -> Result<Self, ConfigError> {
        let mut values = HashMap::new();
        for did in &config.dids {
            if let Some(value) = &did.value {
                let bytes = hex::decode(value).map_err(|e| {
                    ConfigError::Invalid(format!("DID 0x{:04X}: invalid hex value: {}", did.id, e))
                })?;
                values.insert(did.id, bytes);
            }
        }
        Ok(Self {
            values: RwLock::new(values),
            latency: Duration::ZERO,
        })
    }

    /// Delay every access, e.g. to provoke response-pending messages
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set(&self, did: u16, value: impl Into<Vec<u8>>) {
        self.values.write().insert(did, value.into());
    }

    pub fn get(&self, did: u16) -> Option<Vec<u8>> {
        self.values.read().get(&did).cloned()
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl DataIdentifierProvider for InMemoryDataProvider {
    async fn read(&self, did: u16) -> Result<Vec<u8>, NegativeResponseCode> {
        self.simulate_latency().await;
        self.get(did).ok_or_else(|| {
            debug!(did = format!("0x{:04X}", did), "No value stored for DID");
            NegativeResponseCode::RequestOutOfRange
        })
    }

    async fn write(&self, did: u16, data: &[u8]) -> Result<(), NegativeResponseCode> {
        self.simulate_latency().await;
        self.set(did, data);
        Ok(())
    }
}
