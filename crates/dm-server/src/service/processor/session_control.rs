//! DiagnosticSessionControl (0x10)

use std::sync::Arc;

use tracing::info;

use crate::service::{
    positive_response_sid, sid, ProcessingError, ProcessingStatus, ServiceHandler,
    ServiceProcessingContext, ServiceProcessor,
};
use crate::udstransport::{NegativeResponseCode, UdsMessage};

use super::reject;

const REQUEST_LENGTH: usize = 2;
const RESPONSE_LENGTH: usize = 6;
/// P2* is reported in units of 10 ms
const P2_STAR_RESOLUTION_MS: u128 = 10;

#[derive(Debug, Default)]
pub struct SessionControlHandler;

impl ServiceHandler for SessionControlHandler {
    fn create_processor(
        &self,
        request: UdsMessage,
        context: Arc<dyn ServiceProcessingContext>,
    ) -> Box<dyn ServiceProcessor> {
        Box::new(SessionControlProcessor { request, context })
    }
}

struct SessionControlProcessor {
    request: UdsMessage,
    context: Arc<dyn ServiceProcessingContext>,
}

impl ServiceProcessor for SessionControlProcessor {
    fn handle_message(&mut self) -> Result<ProcessingStatus, ProcessingError> {
        let context = self.context.as_ref();
        let payload = self.request.payload();
        if payload.len() != REQUEST_LENGTH {
            return reject(context, NegativeResponseCode::IncorrectMessageLengthOrFormat);
        }

        let suppress = payload[1] & sid::SUPPRESS_POSITIVE_RESPONSE != 0;
        let session = payload[1] & !sid::SUPPRESS_POSITIVE_RESPONSE;
        let Some(timing) = context.session_timing(session) else {
            return reject(context, NegativeResponseCode::SubFunctionNotSupported);
        };
        if suppress {
            context.set_suppress_bit(true);
        }

        let Some(mut response) = context.acquire_response_buffer(RESPONSE_LENGTH) else {
            return reject(context, NegativeResponseCode::ResponseTooLong);
        };
        let p2 = u16::try_from(timing.p2.as_millis()).unwrap_or(u16::MAX);
        let p2_star = u16::try_from(timing.p2_star.as_millis() / P2_STAR_RESOLUTION_MS)
            .unwrap_or(u16::MAX);
        let [p2_hi, p2_lo] = p2.to_be_bytes();
        let [p2_star_hi, p2_star_lo] = p2_star.to_be_bytes();
        response.payload_mut().copy_from_slice(&[
            positive_response_sid(sid::DIAGNOSTIC_SESSION_CONTROL),
            session,
            p2_hi,
            p2_lo,
            p2_star_hi,
            p2_star_lo,
        ]);

        info!(session = format!("0x{:02X}", session), "Diagnostic session change");
        context.set_session_id(session);
        context.finish_processing(response)?;
        Ok(ProcessingStatus::Done)
    }
}
