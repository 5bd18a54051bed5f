//! TesterPresent (0x3E)

use std::sync::Arc;

use crate::service::{
    positive_response_sid, sid, ProcessingError, ProcessingStatus, ServiceHandler,
    ServiceProcessingContext, ServiceProcessor,
};
use crate::udstransport::{NegativeResponseCode, UdsMessage};

use super::{reject, respond};

const REQUEST_LENGTH: usize = 2;
const ZERO_SUB_FUNCTION: u8 = 0x00;

#[derive(Debug, Default)]
pub struct TesterPresentHandler;

impl ServiceHandler for TesterPresentHandler {
    fn create_processor(
        &self,
        request: UdsMessage,
        context: Arc<dyn ServiceProcessingContext>,
    ) -> Box<dyn ServiceProcessor> {
        Box::new(TesterPresentProcessor { request, context })
    }
}

struct TesterPresentProcessor {
    request: UdsMessage,
    context: Arc<dyn ServiceProcessingContext>,
}

impl ServiceProcessor for TesterPresentProcessor {
    fn handle_message(&mut self) -> Result<ProcessingStatus, ProcessingError> {
        let context = self.context.as_ref();
        let payload = self.request.payload();
        if payload.len() < REQUEST_LENGTH {
            return reject(context, NegativeResponseCode::IncorrectMessageLengthOrFormat);
        }

        let mut sub_function = payload[1];
        if sub_function & sid::SUPPRESS_POSITIVE_RESPONSE != 0 {
            context.set_suppress_bit(true);
            sub_function &= !sid::SUPPRESS_POSITIVE_RESPONSE;
        }
        if sub_function != ZERO_SUB_FUNCTION {
            return reject(context, NegativeResponseCode::SubFunctionNotSupported);
        }
        if payload.len() != REQUEST_LENGTH {
            return reject(context, NegativeResponseCode::IncorrectMessageLengthOrFormat);
        }

        respond(
            context,
            &[positive_response_sid(sid::TESTER_PRESENT), ZERO_SUB_FUNCTION],
        )
    }
}
