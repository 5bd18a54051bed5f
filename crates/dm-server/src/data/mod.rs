//! Data identifier (DID) table and data access

mod provider;

use std::collections::HashMap;

use tracing::debug;

use crate::config::DidTableConfiguration;
use crate::service::Preconditions;

pub use provider::{DataIdentifierProvider, InMemoryDataProvider};

/// Static description of one DID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DidInfo {
    pub id: u16,
    pub min_length: usize,
    pub max_length: usize,
    /// `None` when the DID cannot be read
    pub read: Option<Preconditions>,
    /// `None` when the DID cannot be written
    pub write: Option<Preconditions>,
}

/// DID lookup built from the DID table
#[derive(Debug, Clone, Default)]
pub struct DidManager {
    dids: HashMap<u16, DidInfo>,
    max_number_dids_to_read: usize,
}

impl DidManager {
    pub fn new(config: &DidTableConfiguration) -> Self {
        let dids: HashMap<_, _> = config
            .dids
            .iter()
            .map(|did| {
                let info = DidInfo {
                    id: did.id,
                    min_length: did.min_length,
                    max_length: did.max_length,
                    read: did
                        .read
                        .as_ref()
                        .map(|op| Preconditions::from(op.preconditions.as_ref())),
                    write: did
                        .write
                        .as_ref()
                        .map(|op| Preconditions::from(op.preconditions.as_ref())),
                };
                (did.id, info)
            })
            .collect();
        debug!(count = dids.len(), "DID table loaded");
        Self {
            dids,
            max_number_dids_to_read: usize::from(config.max_number_dids_to_read),
        }
    }

    pub fn info(&self, did: u16) -> Option<&DidInfo> {
        self.dids.get(&did)
    }

    /// DID if it is readable
    pub fn read_info(&self, did: u16) -> Option<&DidInfo> {
        self.info(did).filter(|info| info.read.is_some())
    }

    /// DID if it is writable
    pub fn write_info(&self, did: u16) -> Option<&DidInfo> {
        self.info(did).filter(|info| info.write.is_some())
    }

    pub fn max_number_dids_to_read(&self) -> usize {
        self.max_number_dids_to_read
    }

    pub fn len(&self) -> usize {
        self.dids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dids.is_empty()
    }
}
