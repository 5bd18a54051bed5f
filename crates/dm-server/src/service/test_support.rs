//! Recording processing context for processor tests

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::config::SessionConfiguration;
use crate::conversation::{session_id, AccessState, SessionTiming, StateManager, UdsMessageProvider};
use crate::error::ConversationError;
use crate::udstransport::{
    GlobalChannelId, NegativeResponseCode, TargetAddressType, UdsMessage, UdsMessageParameter,
};

use super::{ProcessingError, ProcessingStatus, ServiceProcessingContext, ServiceProcessor};

pub(crate) struct RecordingContext {
    provider: UdsMessageProvider,
    timings: StateManager,
    runtime: Handle,
    pub access: Mutex<AccessState>,
    pub suppress: Mutex<bool>,
    pub responses: Mutex<Vec<Vec<u8>>>,
    pub nrcs: Mutex<Vec<NegativeResponseCode>>,
}

impl RecordingContext {
    pub fn new() -> Arc<Self> {
        Self::with_buffers(4, 64)
    }

    pub fn with_buffers(count: usize, size: usize) -> Arc<Self> {
        Arc::new(Self {
            provider: UdsMessageProvider::new(count, size).unwrap(),
            timings: StateManager::new(&[
                SessionConfiguration {
                    id: session_id::DEFAULT,
                    p2_time_ms: 50,
                    p2_star_time_ms: 5000,
                },
                SessionConfiguration {
                    id: session_id::EXTENDED,
                    p2_time_ms: 25,
                    p2_star_time_ms: 2500,
                },
            ]),
            runtime: Handle::current(),
            access: Mutex::new(AccessState {
                session: session_id::DEFAULT,
                security_level: 0,
            }),
            suppress: Mutex::new(false),
            responses: Mutex::new(Vec::new()),
            nrcs: Mutex::new(Vec::new()),
        })
    }

    /// Request message carrying `payload`
    pub fn request(&self, payload: &[u8]) -> UdsMessage {
        let mut message = self
            .provider
            .acquire(
                payload.len(),
                UdsMessageParameter {
                    source_address: 0x0E80,
                    target_address: 0xF190,
                    target_address_type: TargetAddressType::Physical,
                    channel: GlobalChannelId::new(0, 1),
                },
            )
            .unwrap();
        message.payload_mut().copy_from_slice(payload);
        message
    }

    pub fn responses(&self) -> Vec<Vec<u8>> {
        self.responses.lock().clone()
    }

    pub fn nrcs(&self) -> Vec<NegativeResponseCode> {
        self.nrcs.lock().clone()
    }
}

impl ServiceProcessingContext for RecordingContext {
    fn finish_processing(&self, response: UdsMessage) -> Result<(), ConversationError> {
        self.responses.lock().push(response.payload().to_vec());
        Ok(())
    }

    fn finish_processing_with_nrc(
        &self,
        nrc: NegativeResponseCode,
    ) -> Result<(), ConversationError> {
        self.nrcs.lock().push(nrc);
        Ok(())
    }

    fn acquire_response_buffer(&self, size: usize) -> Option<UdsMessage> {
        self.provider.acquire(
            size,
            UdsMessageParameter {
                source_address: 0xF190,
                target_address: 0x0E80,
                target_address_type: TargetAddressType::Physical,
                channel: GlobalChannelId::new(0, 1),
            },
        )
    }

    fn set_suppress_bit(&self, suppress: bool) {
        *self.suppress.lock() = suppress;
    }

    fn access_state(&self) -> AccessState {
        *self.access.lock()
    }

    fn set_session_id(&self, session: u8) {
        self.access.lock().session = session;
    }

    fn set_security_level(&self, level: u8) {
        self.access.lock().security_level = level;
    }

    fn session_timing(&self, session: u8) -> Option<SessionTiming> {
        self.timings.timing(session)
    }

    fn runtime(&self) -> Handle {
        self.runtime.clone()
    }
}

/// Poll a processor the way the message handler does
pub(crate) async fn drive(
    processor: &mut dyn ServiceProcessor,
) -> Result<ProcessingStatus, ProcessingError> {
    for _ in 0..200 {
        if processor.handle_message()? == ProcessingStatus::Done {
            return Ok(ProcessingStatus::Done);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    Ok(ProcessingStatus::NotDone)
}
