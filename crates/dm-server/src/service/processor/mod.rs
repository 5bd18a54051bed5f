//! Built-in service processors

mod generic;
mod read_did;
mod routine_control;
mod session_control;
mod tester_present;
mod write_did;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::udstransport::NegativeResponseCode;

use super::{ProcessingError, ProcessingStatus, ServiceProcessingContext};

pub use generic::{GenericServiceHandler, GenericUdsService, RequestMeta};
pub use read_did::ReadDidHandler;
pub use routine_control::RoutineControlHandler;
pub use session_control::SessionControlHandler;
pub use tester_present::TesterPresentHandler;
pub use write_did::WriteDidHandler;

/// Send `payload` as positive response, or ResponseTooLong without a buffer
fn respond(
    context: &dyn ServiceProcessingContext,
    payload: &[u8],
) -> Result<ProcessingStatus, ProcessingError> {
    match context.acquire_response_buffer(payload.len()) {
        Some(mut response) => {
            response.payload_mut().copy_from_slice(payload);
            context.finish_processing(response)?;
        }
        None => {
            warn!(size = payload.len(), "No buffer for positive response");
            context.finish_processing_with_nrc(NegativeResponseCode::ResponseTooLong)?;
        }
    }
    Ok(ProcessingStatus::Done)
}

fn reject(
    context: &dyn ServiceProcessingContext,
    nrc: NegativeResponseCode,
) -> Result<ProcessingStatus, ProcessingError> {
    context.finish_processing_with_nrc(nrc)?;
    Ok(ProcessingStatus::Done)
}

/// Asynchronous work a processor polls without blocking
struct PendingTask<T> {
    handle: JoinHandle<T>,
}

impl<T> PendingTask<T> {
    fn new(handle: JoinHandle<T>) -> Self {
        Self { handle }
    }

    /// `None` while the task is still running
    fn poll(&mut self) -> Result<Option<T>, ProcessingError> {
        match (&mut self.handle).now_or_never() {
            None => Ok(None),
            Some(Ok(value)) => Ok(Some(value)),
            Some(Err(e)) => Err(ProcessingError::ProviderTask(e.to_string())),
        }
    }
}

impl<T> Drop for PendingTask<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
