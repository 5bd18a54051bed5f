//! RoutineControl (0x31)

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::routine::{RidManager, RoutineOperationType, RoutineProvider};
use crate::service::{
    positive_response_sid, sid, ProcessingError, ProcessingStatus, ServiceHandler,
    ServiceProcessingContext, ServiceProcessor,
};
use crate::udstransport::{NegativeResponseCode, UdsMessage};

use super::{reject, PendingTask};

/// SID, routine control type and RID
const HEADER_LENGTH: usize = 4;

type RoutineResult = Result<Vec<u8>, NegativeResponseCode>;

pub struct RoutineControlHandler {
    rids: Arc<RidManager>,
    provider: Arc<dyn RoutineProvider>,
}

impl RoutineControlHandler {
    pub fn new(rids: Arc<RidManager>, provider: Arc<dyn RoutineProvider>) -> Self {
        Self { rids, provider }
    }
}

impl ServiceHandler for RoutineControlHandler {
    fn create_processor(
        &self,
        request: UdsMessage,
        context: Arc<dyn ServiceProcessingContext>,
    ) -> Box<dyn ServiceProcessor> {
        Box::new(RoutineControlProcessor {
            request,
            context,
            rids: Arc::clone(&self.rids),
            provider: Arc::clone(&self.provider),
            running: None,
        })
    }
}

/// An operation handed to the provider, with its response reserved
struct RunningRoutine {
    task: PendingTask<RoutineResult>,
    response: UdsMessage,
    min_length: usize,
    max_length: usize,
}

struct RoutineControlProcessor {
    request: UdsMessage,
    context: Arc<dyn ServiceProcessingContext>,
    rids: Arc<RidManager>,
    provider: Arc<dyn RoutineProvider>,
    running: Option<RunningRoutine>,
}

impl RoutineControlProcessor {
    /// Validate the request and start the operation; `Err` carries the NRC
    fn start(&self) -> Result<RunningRoutine, NegativeResponseCode> {
        let payload = self.request.payload();
        if payload.len() < HEADER_LENGTH {
            return Err(NegativeResponseCode::IncorrectMessageLengthOrFormat);
        }
        let rid = u16::from_be_bytes([payload[2], payload[3]]);
        let Some(routine) = self.rids.info(rid) else {
            debug!(rid = format!("0x{:04X}", rid), "RID not supported");
            return Err(NegativeResponseCode::RequestOutOfRange);
        };

        let access = self.context.access_state();
        if !routine.preconditions.session_allowed(&access) {
            return Err(NegativeResponseCode::SubFunctionNotSupportedInActiveSession);
        }
        if !routine.preconditions.security_allowed(&access) {
            return Err(NegativeResponseCode::SecurityAccessDenied);
        }

        let sub_function = payload[1] & !sid::SUPPRESS_POSITIVE_RESPONSE;
        let Some((kind, operation)) = RoutineOperationType::from_sub_function(sub_function)
            .and_then(|kind| routine.operation(kind).map(|operation| (kind, operation)))
        else {
            debug!(
                rid = format!("0x{:04X}", rid),
                sub_function = format!("0x{:02X}", sub_function),
                "Routine operation not supported"
            );
            return Err(NegativeResponseCode::SubFunctionNotSupported);
        };
        if !operation.preconditions.session_allowed(&access) {
            return Err(NegativeResponseCode::SubFunctionNotSupportedInActiveSession);
        }
        if !operation.preconditions.security_allowed(&access) {
            return Err(NegativeResponseCode::SecurityAccessDenied);
        }

        let input = &payload[HEADER_LENGTH..];
        if !operation.accepts_request_length(input.len()) {
            return Err(NegativeResponseCode::IncorrectMessageLengthOrFormat);
        }

        let max_length = operation.max_response_length();
        let Some(mut response) = self
            .context
            .acquire_response_buffer(HEADER_LENGTH + max_length)
        else {
            warn!(size = HEADER_LENGTH + max_length, "No buffer for routine response");
            return Err(NegativeResponseCode::ResponseTooLong);
        };
        response.payload_mut()[..HEADER_LENGTH].copy_from_slice(&[
            positive_response_sid(sid::ROUTINE_CONTROL),
            sub_function,
            payload[2],
            payload[3],
        ]);

        if payload[1] & sid::SUPPRESS_POSITIVE_RESPONSE != 0 {
            self.context.set_suppress_bit(true);
        }

        info!(
            rid = format!("0x{:04X}", rid),
            operation = %kind,
            "Routine control"
        );
        let provider = Arc::clone(&self.provider);
        let input = input.to_vec();
        let handle = self
            .context
            .runtime()
            .spawn(async move { provider.execute(rid, kind, input).await });
        Ok(RunningRoutine {
            task: PendingTask::new(handle),
            response,
            min_length: operation.min_response_length(),
            max_length,
        })
    }

    fn finish(
        context: &dyn ServiceProcessingContext,
        mut running: RunningRoutine,
        record: Vec<u8>,
    ) -> Result<ProcessingStatus, ProcessingError> {
        if !(running.min_length..=running.max_length).contains(&record.len()) {
            warn!(
                length = record.len(),
                min_length = running.min_length,
                max_length = running.max_length,
                "Routine status record outside configured bounds"
            );
            return reject(context, NegativeResponseCode::GeneralReject);
        }
        let end = HEADER_LENGTH + record.len();
        running.response.payload_mut()[HEADER_LENGTH..end].copy_from_slice(&record);
        running.response.truncate(end);
        context.finish_processing(running.response)?;
        Ok(ProcessingStatus::Done)
    }
}

impl ServiceProcessor for RoutineControlProcessor {
    fn handle_message(&mut self) -> Result<ProcessingStatus, ProcessingError> {
        if self.running.is_none() {
            match self.start() {
                Ok(running) => self.running = Some(running),
                Err(nrc) => return reject(self.context.as_ref(), nrc),
            }
        }

        let Some(running) = self.running.as_mut() else {
            return Ok(ProcessingStatus::NotDone);
        };
        let Some(result) = running.task.poll()? else {
            return Ok(ProcessingStatus::NotDone);
        };
        let context = Arc::clone(&self.context);
        let Some(running) = self.running.take() else {
            return Ok(ProcessingStatus::NotDone);
        };
        match result {
            Ok(record) => Self::finish(context.as_ref(), running, record),
            Err(nrc) => reject(context.as_ref(), nrc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        PreconditionsConfiguration, RidConfiguration, RidDataConfiguration,
        RidOperationConfiguration,
    };
    use crate::routine::InMemoryRoutineProvider;
    use crate::service::test_support::{drive, RecordingContext};
    use pretty_assertions::assert_eq;

    fn operation(
        request: Option<(usize, usize)>,
        response: Option<(usize, usize)>,
    ) -> Option<RidOperationConfiguration> {
        let bounds = |(min_length, max_length)| RidDataConfiguration {
            min_length,
            max_length,
        };
        Some(RidOperationConfiguration {
            request_data: request.map(bounds),
            response_data: response.map(bounds),
            preconditions: None,
        })
    }

    fn handler(provider: Arc<InMemoryRoutineProvider>) -> RoutineControlHandler {
        let table = vec![
            RidConfiguration {
                id: 0x0203,
                preconditions: None,
                start: operation(Some((0, 2)), None),
                stop: operation(None, None),
                request_results: operation(None, Some((1, 4))),
            },
            RidConfiguration {
                id: 0xFF00,
                preconditions: Some(PreconditionsConfiguration {
                    sessions: vec![0x03],
                    security_levels: vec![],
                }),
                start: operation(None, None),
                stop: None,
                request_results: None,
            },
            RidConfiguration {
                id: 0xFF01,
                preconditions: None,
                start: Some(RidOperationConfiguration {
                    request_data: None,
                    response_data: None,
                    preconditions: Some(PreconditionsConfiguration {
                        sessions: vec![],
                        security_levels: vec![0x01],
                    }),
                }),
                stop: None,
                request_results: None,
            },
        ];
        RoutineControlHandler::new(Arc::new(RidManager::new(&table)), provider)
    }

    async fn run(handler: &RoutineControlHandler, context: &Arc<RecordingContext>, payload: &[u8]) {
        let mut processor = handler.create_processor(context.request(payload), context.clone());
        assert_eq!(
            drive(processor.as_mut()).await.unwrap(),
            ProcessingStatus::Done
        );
    }

    #[tokio::test]
    async fn test_start_stop_request_results() {
        let provider = Arc::new(InMemoryRoutineProvider::new());
        provider.set_response(0x0203, RoutineOperationType::RequestResults, vec![0x10, 0x20]);
        let handler = handler(provider.clone());
        let context = RecordingContext::new();

        run(&handler, &context, &[0x31, 0x01, 0x02, 0x03, 0xAA]).await;
        assert!(provider.is_running(0x0203));
        assert_eq!(provider.last_input(0x0203), Some(vec![0xAA]));
        run(&handler, &context, &[0x31, 0x02, 0x02, 0x03]).await;
        run(&handler, &context, &[0x31, 0x03, 0x02, 0x03]).await;

        assert_eq!(
            context.responses(),
            vec![
                vec![0x71, 0x01, 0x02, 0x03],
                vec![0x71, 0x02, 0x02, 0x03],
                vec![0x71, 0x03, 0x02, 0x03, 0x10, 0x20],
            ]
        );
        assert!(context.nrcs().is_empty());
    }

    #[tokio::test]
    async fn test_request_validation() {
        let handler = handler(Arc::new(InMemoryRoutineProvider::new()));
        let context = RecordingContext::new();
        // short, unknown RID, unknown and unconfigured sub-function, option record too long,
        // wrong session, locked operation
        run(&handler, &context, &[0x31, 0x01, 0x02]).await;
        run(&handler, &context, &[0x31, 0x01, 0x12, 0x34]).await;
        run(&handler, &context, &[0x31, 0x04, 0x02, 0x03]).await;
        run(&handler, &context, &[0x31, 0x02, 0xFF, 0x01]).await;
        run(&handler, &context, &[0x31, 0x01, 0x02, 0x03, 0x01, 0x02, 0x03]).await;
        run(&handler, &context, &[0x31, 0x01, 0xFF, 0x00]).await;
        run(&handler, &context, &[0x31, 0x01, 0xFF, 0x01]).await;
        assert_eq!(
            context.nrcs(),
            vec![
                NegativeResponseCode::IncorrectMessageLengthOrFormat,
                NegativeResponseCode::RequestOutOfRange,
                NegativeResponseCode::SubFunctionNotSupported,
                NegativeResponseCode::SubFunctionNotSupported,
                NegativeResponseCode::IncorrectMessageLengthOrFormat,
                NegativeResponseCode::SubFunctionNotSupportedInActiveSession,
                NegativeResponseCode::SecurityAccessDenied,
            ]
        );
        assert!(context.responses().is_empty());
    }

    #[tokio::test]
    async fn test_provider_sequence_error_is_forwarded() {
        let handler = handler(Arc::new(InMemoryRoutineProvider::new()));
        let context = RecordingContext::new();
        run(&handler, &context, &[0x31, 0x03, 0x02, 0x03]).await;
        assert_eq!(
            context.nrcs(),
            vec![NegativeResponseCode::RequestSequenceError]
        );
    }

    #[tokio::test]
    async fn test_status_record_outside_bounds_is_rejected() {
        let provider = Arc::new(InMemoryRoutineProvider::new());
        let handler = handler(provider.clone());
        let context = RecordingContext::new();
        run(&handler, &context, &[0x31, 0x01, 0x02, 0x03]).await;

        // empty record below the minimum of 1, then 5 bytes above the maximum of 4
        run(&handler, &context, &[0x31, 0x03, 0x02, 0x03]).await;
        provider.set_response(0x0203, RoutineOperationType::RequestResults, vec![0; 5]);
        run(&handler, &context, &[0x31, 0x03, 0x02, 0x03]).await;
        assert_eq!(
            context.nrcs(),
            vec![
                NegativeResponseCode::GeneralReject,
                NegativeResponseCode::GeneralReject
            ]
        );
    }

    #[tokio::test]
    async fn test_suppress_bit_and_slow_routine() {
        let provider = InMemoryRoutineProvider::new().with_latency(std::time::Duration::from_millis(30));
        let handler = handler(Arc::new(provider));
        let context = RecordingContext::new();
        let mut processor =
            handler.create_processor(context.request(&[0x31, 0x81, 0x02, 0x03]), context.clone());
        assert_eq!(processor.handle_message().unwrap(), ProcessingStatus::NotDone);
        assert!(*context.suppress.lock());
        assert_eq!(
            drive(processor.as_mut()).await.unwrap(),
            ProcessingStatus::Done
        );
        assert_eq!(context.responses(), vec![vec![0x71, 0x01, 0x02, 0x03]]);
    }

    #[tokio::test]
    async fn test_no_response_buffer() {
        let handler = handler(Arc::new(InMemoryRoutineProvider::new()));
        // the request holds the only buffer
        let context = RecordingContext::with_buffers(1, 64);
        run(&handler, &context, &[0x31, 0x01, 0x02, 0x03]).await;
        assert_eq!(context.nrcs(), vec![NegativeResponseCode::ResponseTooLong]);
    }
}
