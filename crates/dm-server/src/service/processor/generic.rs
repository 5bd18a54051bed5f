//! Services implemented by the application

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::conversation::AccessState;
use crate::service::{
    ProcessingError, ProcessingStatus, ServiceHandler, ServiceProcessingContext, ServiceProcessor,
};
use crate::udstransport::{
    Address, MetaInfoMap, NegativeResponseCode, TargetAddressType, UdsMessage,
};

use super::{reject, respond, PendingTask};

/// Addressing and access state accompanying a forwarded request
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub source_address: Address,
    pub target_address: Address,
    pub target_address_type: TargetAddressType,
    pub access_state: AccessState,
    pub meta_info: Vec<MetaInfoMap>,
}

/// Application handler for services configured as `External`
///
/// `Ok` carries the complete positive response payload, `Err` the NRC to
/// answer with.
#[async_trait]
pub trait GenericUdsService: Send + Sync {
    async fn handle(
        &self,
        request: Vec<u8>,
        meta: RequestMeta,
    ) -> Result<Vec<u8>, NegativeResponseCode>;
}

pub struct GenericServiceHandler {
    service: Arc<dyn GenericUdsService>,
}

impl GenericServiceHandler {
    pub fn new(service: Arc<dyn GenericUdsService>) -> Self {
        Self { service }
    }
}

impl ServiceHandler for GenericServiceHandler {
    fn create_processor(
        &self,
        request: UdsMessage,
        context: Arc<dyn ServiceProcessingContext>,
    ) -> Box<dyn ServiceProcessor> {
        Box::new(GenericProcessor {
            request,
            context,
            service: Arc::clone(&self.service),
            call: None,
        })
    }
}

struct GenericProcessor {
    request: UdsMessage,
    context: Arc<dyn ServiceProcessingContext>,
    service: Arc<dyn GenericUdsService>,
    call: Option<PendingTask<Result<Vec<u8>, NegativeResponseCode>>>,
}

impl ServiceProcessor for GenericProcessor {
    fn handle_message(&mut self) -> Result<ProcessingStatus, ProcessingError> {
        if self.call.is_none() {
            let meta = RequestMeta {
                source_address: self.request.source_address(),
                target_address: self.request.target_address(),
                target_address_type: self.request.target_address_type(),
                access_state: self.context.access_state(),
                meta_info: self.request.meta_info().cloned().collect(),
            };
            let request = self.request.payload().to_vec();
            let service = Arc::clone(&self.service);
            let handle = self
                .context
                .runtime()
                .spawn(async move { service.handle(request, meta).await });
            self.call = Some(PendingTask::new(handle));
        }

        let Some(call) = self.call.as_mut() else {
            return Ok(ProcessingStatus::NotDone);
        };
        match call.poll()? {
            None => Ok(ProcessingStatus::NotDone),
            Some(Ok(response)) if response.is_empty() => {
                warn!("Generic service returned an empty response");
                reject(self.context.as_ref(), NegativeResponseCode::GeneralReject)
            }
            Some(Ok(response)) => respond(self.context.as_ref(), &response),
            Some(Err(nrc)) => reject(self.context.as_ref(), nrc),
        }
    }
}
