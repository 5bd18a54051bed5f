//! ReadDataByIdentifier (0x22)

use std::sync::Arc;

use tracing::{debug, warn};

use crate::data::{DataIdentifierProvider, DidManager};
use crate::service::{
    positive_response_sid, sid, ProcessingError, ProcessingStatus, ServiceHandler,
    ServiceProcessingContext, ServiceProcessor,
};
use crate::udstransport::{NegativeResponseCode, UdsMessage};

use super::{reject, PendingTask};

const DID_LENGTH: usize = 2;

type ReadResult = Result<Vec<(u16, Vec<u8>)>, NegativeResponseCode>;

pub struct ReadDidHandler {
    dids: Arc<DidManager>,
    provider: Arc<dyn DataIdentifierProvider>,
}

impl ReadDidHandler {
    pub fn new(dids: Arc<DidManager>, provider: Arc<dyn DataIdentifierProvider>) -> Self {
        Self { dids, provider }
    }
}

impl ServiceHandler for ReadDidHandler {
    fn create_processor(
        &self,
        request: UdsMessage,
        context: Arc<dyn ServiceProcessingContext>,
    ) -> Box<dyn ServiceProcessor> {
        Box::new(ReadDidProcessor {
            request,
            context,
            dids: Arc::clone(&self.dids),
            provider: Arc::clone(&self.provider),
            reading: None,
        })
    }
}

struct ReadDidProcessor {
    request: UdsMessage,
    context: Arc<dyn ServiceProcessingContext>,
    dids: Arc<DidManager>,
    provider: Arc<dyn DataIdentifierProvider>,
    reading: Option<PendingTask<ReadResult>>,
}

impl ReadDidProcessor {
    /// Validate the request and start reading; `Err` carries the NRC
    fn start(&self) -> Result<PendingTask<ReadResult>, NegativeResponseCode> {
        let identifiers = &self.request.payload()[1..];
        let count = identifiers.len() / DID_LENGTH;
        if identifiers.is_empty()
            || identifiers.len() % DID_LENGTH != 0
            || count > self.dids.max_number_dids_to_read()
        {
            return Err(NegativeResponseCode::IncorrectMessageLengthOrFormat);
        }

        let access = self.context.access_state();
        let mut readable = Vec::with_capacity(count);
        for chunk in identifiers.chunks_exact(DID_LENGTH) {
            let did = u16::from_be_bytes([chunk[0], chunk[1]]);
            let Some(preconditions) = self.dids.read_info(did).and_then(|info| info.read.as_ref())
            else {
                debug!(did = format!("0x{:04X}", did), "DID not readable, skipped");
                continue;
            };
            if !preconditions.session_allowed(&access) {
                debug!(did = format!("0x{:04X}", did), "DID not readable in session, skipped");
                continue;
            }
            if !preconditions.security_allowed(&access) {
                return Err(NegativeResponseCode::SecurityAccessDenied);
            }
            readable.push(did);
        }
        if readable.is_empty() {
            return Err(NegativeResponseCode::RequestOutOfRange);
        }

        let provider = Arc::clone(&self.provider);
        let handle = self.context.runtime().spawn(async move {
            let mut values = Vec::with_capacity(readable.len());
            for did in readable {
                values.push((did, provider.read(did).await?));
            }
            Ok::<_, NegativeResponseCode>(values)
        });
        Ok(PendingTask::new(handle))
    }

    fn finish(&self, values: Vec<(u16, Vec<u8>)>) -> Result<ProcessingStatus, ProcessingError> {
        let context = self.context.as_ref();
        for (did, data) in &values {
            let max_length = self.dids.info(*did).map_or(0, |info| info.max_length);
            if data.len() > max_length {
                warn!(
                    did = format!("0x{:04X}", did),
                    length = data.len(),
                    max_length,
                    "DID data exceeds configured length"
                );
                return reject(context, NegativeResponseCode::GeneralReject);
            }
        }

        let size = 1 + values
            .iter()
            .map(|(_, data)| DID_LENGTH + data.len())
            .sum::<usize>();
        let Some(mut response) = context.acquire_response_buffer(size) else {
            return reject(context, NegativeResponseCode::ResponseTooLong);
        };
        let payload = response.payload_mut();
        payload[0] = positive_response_sid(sid::READ_DATA_BY_IDENTIFIER);
        let mut offset = 1;
        for (did, data) in &values {
            payload[offset..offset + DID_LENGTH].copy_from_slice(&did.to_be_bytes());
            offset += DID_LENGTH;
            payload[offset..offset + data.len()].copy_from_slice(data);
            offset += data.len();
        }
        context.finish_processing(response)?;
        Ok(ProcessingStatus::Done)
    }
}

impl ServiceProcessor for ReadDidProcessor {
    fn handle_message(&mut self) -> Result<ProcessingStatus, ProcessingError> {
        if self.reading.is_none() {
            match self.start() {
                Ok(task) => self.reading = Some(task),
                Err(nrc) => return reject(self.context.as_ref(), nrc),
            }
        }

        let Some(task) = self.reading.as_mut() else {
            return Ok(ProcessingStatus::NotDone);
        };
        match task.poll()? {
            None => Ok(ProcessingStatus::NotDone),
            Some(Ok(values)) => self.finish(values),
            Some(Err(nrc)) => reject(self.context.as_ref(), nrc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DidConfiguration, DidOperationConfiguration, DidTableConfiguration,
        PreconditionsConfiguration,
    };
    use crate::data::InMemoryDataProvider;
    use crate::service::test_support::{drive, RecordingContext};
    use pretty_assertions::assert_eq;

    fn handler(provider: Arc<InMemoryDataProvider>) -> ReadDidHandler {
        let readable = |preconditions| {
            Some(DidOperationConfiguration {
                preconditions,
            })
        };
        let table = DidTableConfiguration {
            max_number_dids_to_read: 2,
            dids: vec![
                DidConfiguration {
                    id: 0x0102,
                    min_length: 0,
                    max_length: 4,
                    value: None,
                    read: readable(None),
                    write: None,
                },
                DidConfiguration {
                    id: 0xF190,
                    min_length: 0,
                    max_length: 3,
                    value: None,
                    read: readable(None),
                    write: None,
                },
                DidConfiguration {
                    id: 0xF1A0,
                    min_length: 0,
                    max_length: 1,
                    value: None,
                    read: readable(Some(PreconditionsConfiguration {
                        sessions: vec![],
                        security_levels: vec![0x01],
                    })),
                    write: None,
                },
                DidConfiguration {
                    id: 0xF1B0,
                    min_length: 0,
                    max_length: 1,
                    value: None,
                    read: readable(Some(PreconditionsConfiguration {
                        sessions: vec![0x03],
                        security_levels: vec![],
                    })),
                    write: None,
                },
            ],
        };
        provider.set(0x0102, vec![0xAA, 0xBB]);
        provider.set(0xF190, b"VIN".to_vec());
        provider.set(0xF1A0, vec![0x01]);
        provider.set(0xF1B0, vec![0x02]);
        ReadDidHandler::new(Arc::new(DidManager::new(&table)), provider)
    }

    async fn run(handler: &ReadDidHandler, context: &Arc<RecordingContext>, payload: &[u8]) {
        let mut processor = handler.create_processor(context.request(payload), context.clone());
        assert_eq!(
            drive(processor.as_mut()).await.unwrap(),
            ProcessingStatus::Done
        );
    }

    #[tokio::test]
    async fn test_read_single_did() {
        let handler = handler(Arc::new(InMemoryDataProvider::new()));
        let context = RecordingContext::new();
        run(&handler, &context, &[0x22, 0x01, 0x02]).await;
        assert_eq!(context.responses(), vec![vec![0x62, 0x01, 0x02, 0xAA, 0xBB]]);
    }

    #[tokio::test]
    async fn test_read_two_dids_skipping_unknown() {
        let handler = handler(Arc::new(InMemoryDataProvider::new()));
        let context = RecordingContext::new();
        run(&handler, &context, &[0x22, 0xF1, 0x90, 0x01, 0x02]).await;
        run(&handler, &context, &[0x22, 0x12, 0x34, 0x01, 0x02]).await;
        assert_eq!(
            context.responses(),
            vec![
                vec![0x62, 0xF1, 0x90, b'V', b'I', b'N', 0x01, 0x02, 0xAA, 0xBB],
                vec![0x62, 0x01, 0x02, 0xAA, 0xBB],
            ]
        );
    }

    #[tokio::test]
    async fn test_slow_provider_reports_not_done() {
        let provider =
            InMemoryDataProvider::new().with_latency(std::time::Duration::from_millis(30));
        let handler = handler(Arc::new(provider));
        let context = RecordingContext::new();
        let mut processor =
            handler.create_processor(context.request(&[0x22, 0x01, 0x02]), context.clone());
        assert_eq!(processor.handle_message().unwrap(), ProcessingStatus::NotDone);
        assert_eq!(
            drive(processor.as_mut()).await.unwrap(),
            ProcessingStatus::Done
        );
        assert_eq!(context.responses().len(), 1);
    }

    #[tokio::test]
    async fn test_request_validation() {
        let handler = handler(Arc::new(InMemoryDataProvider::new()));
        let context = RecordingContext::new();
        // odd length, empty, too many DIDs, nothing readable, wrong session, locked
        run(&handler, &context, &[0x22, 0x01]).await;
        run(&handler, &context, &[0x22]).await;
        run(&handler, &context, &[0x22, 0x01, 0x02, 0xF1, 0x90, 0x01, 0x02]).await;
        run(&handler, &context, &[0x22, 0x12, 0x34]).await;
        run(&handler, &context, &[0x22, 0xF1, 0xB0]).await;
        run(&handler, &context, &[0x22, 0xF1, 0xA0]).await;
        assert_eq!(
            context.nrcs(),
            vec![
                NegativeResponseCode::IncorrectMessageLengthOrFormat,
                NegativeResponseCode::IncorrectMessageLengthOrFormat,
                NegativeResponseCode::IncorrectMessageLengthOrFormat,
                NegativeResponseCode::RequestOutOfRange,
                NegativeResponseCode::RequestOutOfRange,
                NegativeResponseCode::SecurityAccessDenied,
            ]
        );
        assert!(context.responses().is_empty());
    }

    #[tokio::test]
    async fn test_read_with_security_level_unlocked() {
        let handler = handler(Arc::new(InMemoryDataProvider::new()));
        let context = RecordingContext::new();
        context.access.lock().security_level = 0x01;
        run(&handler, &context, &[0x22, 0xF1, 0xA0]).await;
        assert_eq!(context.responses(), vec![vec![0x62, 0xF1, 0xA0, 0x01]]);
    }

    #[tokio::test]
    async fn test_oversized_data_is_rejected() {
        let provider = Arc::new(InMemoryDataProvider::new());
        let handler = handler(provider.clone());
        provider.set(0x0102, vec![0; 5]);
        let context = RecordingContext::new();
        run(&handler, &context, &[0x22, 0x01, 0x02]).await;
        assert_eq!(context.nrcs(), vec![NegativeResponseCode::GeneralReject]);
    }

    #[tokio::test]
    async fn test_provider_error_becomes_negative_response() {
        let provider = Arc::new(InMemoryDataProvider::new());
        let handler = handler(provider);
        let context = RecordingContext::new();
        context.access.lock().security_level = 0x01;
        // Readable DID without a stored value
        let empty = ReadDidHandler::new(
            Arc::clone(&handler.dids),
            Arc::new(InMemoryDataProvider::new()),
        );
        run(&empty, &context, &[0x22, 0xF1, 0xA0]).await;
        assert_eq!(context.nrcs(), vec![NegativeResponseCode::RequestOutOfRange]);
    }
}
