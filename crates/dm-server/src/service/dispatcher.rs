//! Service table built from the configuration

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::{HandlerType, ServiceConfiguration};
use crate::data::{DataIdentifierProvider, DidManager};
use crate::routine::{RidManager, RoutineProvider};
use crate::udstransport::{NegativeResponseCode, UdsMessage};

use super::processor::{
    GenericServiceHandler, GenericUdsService, ReadDidHandler, RoutineControlHandler,
    SessionControlHandler, TesterPresentHandler, WriteDidHandler,
};
use super::{
    sid, Preconditions, ServiceDispatcher, ServiceHandler, ServiceProcessingContext,
    ServiceProcessor,
};

struct ServiceEntry {
    handler: Arc<dyn ServiceHandler>,
    preconditions: Preconditions,
}

/// [`ServiceDispatcher`] keyed by service identifier
#[derive(Default)]
pub struct ServiceTable {
    services: RwLock<HashMap<u8, ServiceEntry>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the built-in handlers for every `Internal` service and the
    /// generic service for every `External` one
    pub fn from_config(
        services: &[ServiceConfiguration],
        dids: Arc<DidManager>,
        data_provider: Arc<dyn DataIdentifierProvider>,
        rids: Arc<RidManager>,
        routine_provider: Arc<dyn RoutineProvider>,
        generic_service: Option<Arc<dyn GenericUdsService>>,
    ) -> Self {
        let table = Self::new();
        let generic: Option<Arc<dyn ServiceHandler>> = generic_service
            .map(|service| Arc::new(GenericServiceHandler::new(service)) as Arc<dyn ServiceHandler>);

        for service in services {
            let preconditions = Preconditions::from(service.preconditions.as_ref());
            let handler: Option<Arc<dyn ServiceHandler>> = match service.handler {
                HandlerType::Internal => match service.id {
                    sid::DIAGNOSTIC_SESSION_CONTROL => Some(Arc::new(SessionControlHandler)),
                    sid::READ_DATA_BY_IDENTIFIER => Some(Arc::new(ReadDidHandler::new(
                        Arc::clone(&dids),
                        Arc::clone(&data_provider),
                    ))),
                    sid::WRITE_DATA_BY_IDENTIFIER => Some(Arc::new(WriteDidHandler::new(
                        Arc::clone(&dids),
                        Arc::clone(&data_provider),
                    ))),
                    sid::ROUTINE_CONTROL => Some(Arc::new(RoutineControlHandler::new(
                        Arc::clone(&rids),
                        Arc::clone(&routine_provider),
                    ))),
                    sid::TESTER_PRESENT => Some(Arc::new(TesterPresentHandler)),
                    _ => None,
                },
                HandlerType::External => generic.clone(),
            };
            match handler {
                Some(handler) => table.register(service.id, handler, preconditions),
                None => warn!(
                    sid = format!("0x{:02X}", service.id),
                    handler = ?service.handler,
                    "No handler available for service, skipped"
                ),
            }
        }
        info!(count = table.len(), "Service table built");
        table
    }

    /// Add or replace the handler of a service
    pub fn register(
        &self,
        service_id: u8,
        handler: Arc<dyn ServiceHandler>,
        preconditions: Preconditions,
    ) {
        debug!(sid = format!("0x{:02X}", service_id), "Service registered");
        self.services.write().insert(
            service_id,
            ServiceEntry {
                handler,
                preconditions,
            },
        );
    }

    pub fn contains(&self, service_id: u8) -> bool {
        self.services.read().contains_key(&service_id)
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}

impl ServiceDispatcher for ServiceTable {
    fn find_service_processor(
        &self,
        request: UdsMessage,
        context: Arc<dyn ServiceProcessingContext>,
    ) -> Result<Box<dyn ServiceProcessor>, NegativeResponseCode> {
        let Some(service_id) = request.sid() else {
            return Err(NegativeResponseCode::GeneralReject);
        };

        let handler = {
            let services = self.services.read();
            let Some(entry) = services.get(&service_id) else {
                debug!(sid = format!("0x{:02X}", service_id), "Service not supported");
                return Err(NegativeResponseCode::ServiceNotSupported);
            };
            let access = context.access_state();
            if !entry.preconditions.session_allowed(&access) {
                return Err(NegativeResponseCode::ServiceNotSupportedInActiveSession);
            }
            if !entry.preconditions.security_allowed(&access) {
                return Err(NegativeResponseCode::SecurityAccessDenied);
            }
            Arc::clone(&entry.handler)
        };
        Ok(handler.create_processor(request, context))
    }
}
