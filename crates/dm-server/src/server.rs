//! Diagnostic server facade

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::info;

use crate::config::DextConfiguration;
use crate::conversation::{AccessStateObserver, CategoryMask, ConversationManager, SubscriptionId};
use crate::data::{DataIdentifierProvider, DidManager, InMemoryDataProvider};
use crate::error::{ServerError, ServerResult};
use crate::routine::{InMemoryRoutineProvider, RidManager, RoutineProvider};
use crate::service::processor::GenericUdsService;
use crate::service::ServiceTable;
use crate::udstransport::{
    TransportHandlerRegistry, UdsTransportProtocolHandler, UdsTransportProtocolMgr,
};

/// One UDS server: configuration, service table, conversations and the
/// transport manager wired together
///
/// Must be created inside a tokio runtime; timers and message handlers are
/// spawned on it.
pub struct DiagnosticServer {
    config: DextConfiguration,
    service_table: Arc<ServiceTable>,
    conversation_manager: Arc<ConversationManager>,
    transport_manager: Arc<UdsTransportProtocolMgr>,
}

impl DiagnosticServer {
    pub fn new(
        config: DextConfiguration,
        data_provider: Arc<dyn DataIdentifierProvider>,
        routine_provider: Arc<dyn RoutineProvider>,
        generic_service: Option<Arc<dyn GenericUdsService>>,
    ) -> ServerResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| ServerError::NoRuntime(e.to_string()))?;

        let dids = Arc::new(DidManager::new(&config.did_table));
        let rids = Arc::new(RidManager::new(&config.rid_table));
        let service_table = Arc::new(ServiceTable::from_config(
            &config.services,
            dids,
            data_provider,
            rids,
            routine_provider,
            generic_service,
        ));

        let transport_handlers = Arc::new(TransportHandlerRegistry::new());
        let conversation_manager = Arc::new(ConversationManager::new(
            &config,
            service_table.clone(),
            Arc::clone(&transport_handlers),
            runtime,
        )?);
        let transport_manager = Arc::new(UdsTransportProtocolMgr::new(transport_handlers));
        transport_manager.register(Arc::clone(&conversation_manager))?;

        info!(
            target_address = format!("0x{:04X}", config.target_address),
            sessions = config.sessions.len(),
            services = service_table.len(),
            "Diagnostic server created"
        );
        Ok(Self {
            config,
            service_table,
            conversation_manager,
            transport_manager,
        })
    }

    /// Server serving DID values from the configuration and routines
    /// tracked in memory
    pub fn with_in_memory_data(config: DextConfiguration) -> ServerResult<Self> {
        let provider = InMemoryDataProvider::from_config(&config.did_table)?;
        Self::new(
            config,
            Arc::new(provider),
            Arc::new(InMemoryRoutineProvider::new()),
            None,
        )
    }

    pub fn config(&self) -> &DextConfiguration {
        &self.config
    }

    pub fn add_transport_handler(
        &self,
        handler: Arc<dyn UdsTransportProtocolHandler>,
    ) -> ServerResult<()> {
        self.transport_manager.add_handler(handler)
    }

    pub fn transport_manager(&self) -> &Arc<UdsTransportProtocolMgr> {
        &self.transport_manager
    }

    pub fn conversation_manager(&self) -> &Arc<ConversationManager> {
        &self.conversation_manager
    }

    pub fn service_table(&self) -> &Arc<ServiceTable> {
        &self.service_table
    }

    /// Observe session and security level changes of every conversation
    pub fn subscribe_access_state(
        &self,
        observer: Arc<dyn AccessStateObserver>,
        mask: CategoryMask,
    ) -> ServerResult<SubscriptionId> {
        Ok(self
            .conversation_manager
            .access_notifier()
            .subscribe(observer, mask)?)
    }

    /// Start all transport handlers
    pub fn run(&self) {
        info!("Diagnostic server running");
        self.transport_manager.run();
    }

    /// Stop transports, then shut down every conversation
    pub async fn shutdown(&self) {
        self.transport_manager.shutdown();
        self.conversation_manager.shutdown().await;
        info!("Diagnostic server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DextConfiguration {
        DextConfiguration::from_toml_str(
            r#"
target_address = 0xF190
uds_message_length = 64
number_conversations = 1

[[services]]
id = 0x3E

[[services]]
id = 0x31

[[rid_table]]
id = 0x0203
start = {}
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_requires_runtime() {
        let result = DiagnosticServer::with_in_memory_data(config());
        assert!(matches!(result, Err(ServerError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn test_wiring() {
        let server = DiagnosticServer::with_in_memory_data(config()).unwrap();
        assert_eq!(server.conversation_manager().target_address(), 0xF190);
        assert_eq!(server.service_table().len(), 2);
        assert!(server.service_table().contains(0x31));
        assert!(server.conversation_manager().is_empty());
        server.run();
        server.shutdown().await;
    }
}
