//! Routine identifier (RID) table and routine execution

mod provider;

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::config::{RidConfiguration, RidDataConfiguration, RidOperationConfiguration};
use crate::service::Preconditions;

pub use provider::{InMemoryRoutineProvider, RoutineProvider};

/// Routine control type (sub-function without the suppress bit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutineOperationType {
    Start,
    Stop,
    RequestResults,
}

impl RoutineOperationType {
    pub fn from_sub_function(sub_function: u8) -> Option<Self> {
        match sub_function {
            0x01 => Some(Self::Start),
            0x02 => Some(Self::Stop),
            0x03 => Some(Self::RequestResults),
            _ => None,
        }
    }

    pub fn sub_function(self) -> u8 {
        match self {
            Self::Start => 0x01,
            Self::Stop => 0x02,
            Self::RequestResults => 0x03,
        }
    }
}

impl fmt::Display for RoutineOperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::RequestResults => "request results",
        };
        f.write_str(name)
    }
}

/// Static description of one operation of a routine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutineOperation {
    /// Option record bounds; `None` when the request carries no data
    pub request_data: Option<RidDataConfiguration>,
    /// Status record bounds; `None` when the response carries no data
    pub response_data: Option<RidDataConfiguration>,
    pub preconditions: Preconditions,
}

impl RoutineOperation {
    fn new(config: &RidOperationConfiguration) -> Self {
        Self {
            request_data: config.request_data,
            response_data: config.response_data,
            preconditions: Preconditions::from(config.preconditions.as_ref()),
        }
    }

    /// Whether an option record of `length` bytes fits
    pub fn accepts_request_length(&self, length: usize) -> bool {
        match self.request_data {
            Some(bounds) => (bounds.min_length..=bounds.max_length).contains(&length),
            None => length == 0,
        }
    }

    pub fn max_response_length(&self) -> usize {
        self.response_data.map_or(0, |bounds| bounds.max_length)
    }

    pub fn min_response_length(&self) -> usize {
        self.response_data.map_or(0, |bounds| bounds.min_length)
    }
}

/// Static description of one routine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutineInfo {
    pub id: u16,
    pub preconditions: Preconditions,
    operations: HashMap<RoutineOperationType, RoutineOperation>,
}

impl RoutineInfo {
    fn new(config: &RidConfiguration) -> Self {
        let operations = [
            (RoutineOperationType::Start, &config.start),
            (RoutineOperationType::Stop, &config.stop),
            (RoutineOperationType::RequestResults, &config.request_results),
        ]
        .into_iter()
        .filter_map(|(kind, op)| op.as_ref().map(|op| (kind, RoutineOperation::new(op))))
        .collect();
        Self {
            id: config.id,
            preconditions: Preconditions::from(config.preconditions.as_ref()),
            operations,
        }
    }

    /// `None` when the routine does not support the operation
    pub fn operation(&self, kind: RoutineOperationType) -> Option<&RoutineOperation> {
        self.operations.get(&kind)
    }
}

/// RID lookup built from the routine table
#[derive(Debug, Clone, Default)]
pub struct RidManager {
    routines: HashMap<u16, RoutineInfo>,
}

impl RidManager {
    pub fn new(config: &[RidConfiguration]) -> Self {
        let routines: HashMap<_, _> = config
            .iter()
            .map(|rid| (rid.id, RoutineInfo::new(rid)))
            .collect();
        debug!(count = routines.len(), "RID table loaded");
        Self { routines }
    }

    pub fn info(&self, rid: u16) -> Option<&RoutineInfo> {
        self.routines.get(&rid)
    }

    pub fn len(&self) -> usize {
        self.routines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }
}
