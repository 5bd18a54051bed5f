//! Routine execution providers

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::udstransport::NegativeResponseCode;

use super::RoutineOperationType;

/// Application side of RoutineControl
///
/// `input` is the option record of the request; the returned bytes form the
/// status record of the positive response.
#[async_trait]
pub trait RoutineProvider: Send + Sync {
    async fn execute(
        &self,
        rid: u16,
        operation: RoutineOperationType,
        input: Vec<u8>,
    ) -> Result<Vec<u8>, NegativeResponseCode>;
}

#[derive(Debug, Default)]
struct RoutineState {
    running: bool,
    started: bool,
    last_input: Vec<u8>,
}

/// Routines tracked in memory with canned status records
///
/// Stopping a routine that is not running, or asking for results of one that
/// never ran, is a sequence error.
#[derive(Debug, Default)]
pub struct InMemoryRoutineProvider {
    states: Mutex<HashMap<u16, RoutineState>>,
    responses: Mutex<HashMap<(u16, RoutineOperationType), Vec<u8>>>,
    latency: Duration,
}

impl InMemoryRoutineProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every operation, e.g. to provoke response-pending messages
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Status record returned by `operation` of `rid`
    pub fn set_response(&self, rid: u16, operation: RoutineOperationType, record: Vec<u8>) {
        self.responses.lock().insert((rid, operation), record);
    }

    pub fn is_running(&self, rid: u16) -> bool {
        self.states.lock().get(&rid).is_some_and(|state| state.running)
    }

    /// Option record of the last start request
    pub fn last_input(&self, rid: u16) -> Option<Vec<u8>> {
        self.states
            .lock()
            .get(&rid)
            .map(|state| state.last_input.clone())
    }
}

#[async_trait]
impl RoutineProvider for InMemoryRoutineProvider {
    async fn execute(
        &self,
        rid: u16,
        operation: RoutineOperationType,
        input: Vec<u8>,
    ) -> Result<Vec<u8>, NegativeResponseCode> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        {
            let mut states = self.states.lock();
            let state = states.entry(rid).or_default();
            match operation {
                RoutineOperationType::Start => {
                    state.running = true;
                    state.started = true;
                    state.last_input = input;
                }
                RoutineOperationType::Stop if state.running => state.running = false,
                RoutineOperationType::RequestResults if state.started => {}
                _ => {
                    debug!(
                        rid = format!("0x{:04X}", rid),
                        operation = %operation,
                        "Routine operation out of sequence"
                    );
                    return Err(NegativeResponseCode::RequestSequenceError);
                }
            }
        }

        Ok(self
            .responses
            .lock()
            .get(&(rid, operation))
            .cloned()
            .unwrap_or_default())
    }
}
