//! WriteDataByIdentifier (0x2E)

use std::sync::Arc;

use tracing::debug;

use crate::data::{DataIdentifierProvider, DidManager};
use crate::service::{
    positive_response_sid, sid, ProcessingError, ProcessingStatus, ServiceHandler,
    ServiceProcessingContext, ServiceProcessor,
};
use crate::udstransport::{NegativeResponseCode, UdsMessage};

use super::{reject, respond, PendingTask};

/// SID, two DID bytes and at least one data byte
const MIN_REQUEST_LENGTH: usize = 4;
const DATA_OFFSET: usize = 3;

pub struct WriteDidHandler {
    dids: Arc<DidManager>,
    provider: Arc<dyn DataIdentifierProvider>,
}

impl WriteDidHandler {
    pub fn new(dids: Arc<DidManager>, provider: Arc<dyn DataIdentifierProvider>) -> Self {
        Self { dids, provider }
    }
}

impl ServiceHandler for WriteDidHandler {
    fn create_processor(
        &self,
        request: UdsMessage,
        context: Arc<dyn ServiceProcessingContext>,
    ) -> Box<dyn ServiceProcessor> {
        Box::new(WriteDidProcessor {
            request,
            context,
            dids: Arc::clone(&self.dids),
            provider: Arc::clone(&self.provider),
            writing: None,
        })
    }
}

struct WriteDidProcessor {
    request: UdsMessage,
    context: Arc<dyn ServiceProcessingContext>,
    dids: Arc<DidManager>,
    provider: Arc<dyn DataIdentifierProvider>,
    writing: Option<(u16, PendingTask<Result<(), NegativeResponseCode>>)>,
}

impl WriteDidProcessor {
    fn start(
        &self,
    ) -> Result<(u16, PendingTask<Result<(), NegativeResponseCode>>), NegativeResponseCode> {
        let payload = self.request.payload();
        if payload.len() < MIN_REQUEST_LENGTH {
            return Err(NegativeResponseCode::IncorrectMessageLengthOrFormat);
        }
        let did = u16::from_be_bytes([payload[1], payload[2]]);
        let Some(info) = self.dids.write_info(did) else {
            debug!(did = format!("0x{:04X}", did), "DID not writable");
            return Err(NegativeResponseCode::RequestOutOfRange);
        };
        let access = self.context.access_state();
        if let Some(preconditions) = &info.write {
            if !preconditions.session_allowed(&access) {
                return Err(NegativeResponseCode::RequestOutOfRange);
            }
            if !preconditions.security_allowed(&access) {
                return Err(NegativeResponseCode::SecurityAccessDenied);
            }
        }

        let data = payload[DATA_OFFSET..].to_vec();
        if data.len() < info.min_length || data.len() > info.max_length {
            return Err(NegativeResponseCode::IncorrectMessageLengthOrFormat);
        }

        let provider = Arc::clone(&self.provider);
        let handle = self
            .context
            .runtime()
            .spawn(async move { provider.write(did, &data).await });
        Ok((did, PendingTask::new(handle)))
    }
}

impl ServiceProcessor for WriteDidProcessor {
    fn handle_message(&mut self) -> Result<ProcessingStatus, ProcessingError> {
        if self.writing.is_none() {
            match self.start() {
                Ok(writing) => self.writing = Some(writing),
                Err(nrc) => return reject(self.context.as_ref(), nrc),
            }
        }

        let Some((did, task)) = self.writing.as_mut() else {
            return Ok(ProcessingStatus::NotDone);
        };
        let did = *did;
        match task.poll()? {
            None => Ok(ProcessingStatus::NotDone),
            Some(Ok(())) => {
                let [hi, lo] = did.to_be_bytes();
                respond(
                    self.context.as_ref(),
                    &[positive_response_sid(sid::WRITE_DATA_BY_IDENTIFIER), hi, lo],
                )
            }
            Some(Err(nrc)) => reject(self.context.as_ref(), nrc),
        }
    }
}
