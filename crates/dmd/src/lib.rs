//! dmd - diagnostic manager daemon
//!
//! Serves one UDS diagnostic server over DoIP. The configuration file holds
//! the server description under `[server]` and the DoIP listener under
//! `[doip]`:
//!
//! ```toml
//! [server]
//! target_address = 0x0010
//! uds_message_length = 4095
//! number_conversations = 4
//!
//! [[server.services]]
//! id = 0x3E
//!
//! [doip]
//! port = 13400
//! logical_address = 0x0010
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::info;

use dm_server::config::ConfigError;
use dm_server::udstransport::doip::{DoIpConfig, DoIpError, DoIpHandler};
use dm_server::udstransport::HandlerId;
use dm_server::{DextConfiguration, DiagnosticServer, ServerError};

/// Handler id of the DoIP transport
pub const DOIP_HANDLER_ID: HandlerId = 1;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("DoIP error: {0}")]
    DoIp(#[from] DoIpError),
}

/// Daemon configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub server: DextConfiguration,
    pub doip: DoIpConfig,
}

impl DaemonConfig {
    /// Load a TOML or YAML file, chosen by extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DaemonError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| DaemonError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let config: Self = match extension.as_str() {
            "toml" => toml::from_str(&content)?,
            "yaml" | "yml" => serde_yaml::from_str(&content)?,
            other => return Err(DaemonError::UnsupportedFormat(other.to_string())),
        };
        config.server.validate()?;
        Ok(config)
    }
}

/// A running diagnostic server with its DoIP listener
pub struct Daemon {
    server: DiagnosticServer,
    doip: Arc<DoIpHandler>,
    local_addr: SocketAddr,
}

impl Daemon {
    /// Bind the DoIP listener and start serving
    ///
    /// DID values come from the configuration's DID table.
    pub async fn start(config: DaemonConfig) -> Result<Self, DaemonError> {
        let server = DiagnosticServer::with_in_memory_data(config.server)?;
        let doip = DoIpHandler::new(
            DOIP_HANDLER_ID,
            config.doip,
            server.transport_manager(),
            Handle::current(),
        );
        let local_addr = doip.bind().await?;
        server.add_transport_handler(doip.clone())?;
        server.run();
        info!(address = %local_addr, "Diagnostic manager serving DoIP");
        Ok(Self {
            server,
            doip,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn server(&self) -> &DiagnosticServer {
        &self.server
    }

    /// Testers with an activated routing
    pub fn active_testers(&self) -> usize {
        self.doip.active_channels()
    }

    pub async fn shutdown(self) {
        self.server.shutdown().await;
        info!("Diagnostic manager stopped");
    }
}
