//! Diagnostic extract (DEXT) configuration
//!
//! The configuration describes one diagnostic server instance: its logical
//! address, resource limits, session timings, the service table, the DID
//! table and the routine (RID) table. It can be loaded from TOML, YAML or
//! JSON.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// P2 used when the active session has no timing entry
pub const DEFAULT_P2_TIME: Duration = Duration::from_millis(50);
/// P2* used when the active session has no timing entry
pub const DEFAULT_P2_STAR_TIME: Duration = Duration::from_millis(5000);
/// Session inactivity timeout
pub const DEFAULT_S3_TIME: Duration = Duration::from_millis(5000);
/// Payload bytes shown when a message is logged
pub const DEFAULT_LOG_MAX_PAYLOAD_BYTES: usize = 8;
/// Response-pending limit value meaning "no limit"
pub const NO_RESPONSE_PENDING_LIMIT: u8 = 0xFF;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration of one diagnostic server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DextConfiguration {
    /// Logical address of this server
    pub target_address: u16,
    /// Maximum UDS message length (request and response)
    pub uds_message_length: u32,
    /// Maximum number of concurrent conversations
    pub number_conversations: u8,
    /// Response-pending messages per request; 0 disables them, 0xFF means unlimited
    #[serde(default)]
    pub max_number_of_response_pending_responses: u8,
    /// S3 session timeout in milliseconds
    #[serde(default = "default_s3_time_ms")]
    pub s3_time_ms: u64,
    /// Payload bytes included in message log output
    #[serde(default = "default_log_max_payload_bytes")]
    pub log_max_payload_bytes: usize,
    /// Session timing table
    #[serde(default)]
    pub sessions: Vec<SessionConfiguration>,
    /// Service table
    #[serde(default)]
    pub services: Vec<ServiceConfiguration>,
    /// DID table
    #[serde(default)]
    pub did_table: DidTableConfiguration,
    /// Routines reachable through RoutineControl
    #[serde(default)]
    pub rid_table: Vec<RidConfiguration>,
}

fn default_s3_time_ms() -> u64 {
    DEFAULT_S3_TIME.as_millis() as u64
}

fn default_log_max_payload_bytes() -> usize {
    DEFAULT_LOG_MAX_PAYLOAD_BYTES
}

// =============================================================================
// Sessions
// =============================================================================

/// Timing of one diagnostic session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfiguration {
    /// Session id (0x01 default, 0x02 programming, 0x03 extended, ...)
    pub id: u8,
    /// P2 server max in milliseconds (1 ms resolution, at most 0xFFFF)
    pub p2_time_ms: u64,
    /// P2* server max in milliseconds (10 ms resolution)
    pub p2_star_time_ms: u64,
}

// =============================================================================
// Services
// =============================================================================

/// Who implements a service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerType {
    /// Implemented by the diagnostic server itself
    #[default]
    Internal,
    /// Forwarded to the application's generic UDS service
    External,
}

/// Session and security level restrictions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreconditionsConfiguration {
    /// Sessions the operation is allowed in (empty: all)
    #[serde(default)]
    pub sessions: Vec<u8>,
    /// Security levels the operation is allowed in (empty: all)
    #[serde(default)]
    pub security_levels: Vec<u8>,
}

/// One entry of the service table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfiguration {
    /// Service identifier
    pub id: u8,
    #[serde(default)]
    pub handler: HandlerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preconditions: Option<PreconditionsConfiguration>,
}

// =============================================================================
// Data identifiers
// =============================================================================

/// DID table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DidTableConfiguration {
    /// Maximum number of DIDs in one ReadDataByIdentifier request
    #[serde(default = "default_max_number_dids_to_read")]
    pub max_number_dids_to_read: u16,
    #[serde(default)]
    pub dids: Vec<DidConfiguration>,
}

impl Default for DidTableConfiguration {
    fn default() -> Self {
        Self {
            max_number_dids_to_read: default_max_number_dids_to_read(),
            dids: Vec::new(),
        }
    }
}

fn default_max_number_dids_to_read() -> u16 {
    1
}

/// Read or write access to a DID
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidOperationConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preconditions: Option<PreconditionsConfiguration>,
}

/// One data identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DidConfiguration {
    pub id: u16,
    #[serde(default)]
    pub min_length: usize,
    pub max_length: usize,
    /// Initial value as hex string, served by the in-memory data provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<DidOperationConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write: Option<DidOperationConfiguration>,
}

// =============================================================================
// Routine identifiers
// =============================================================================

/// Length bounds of a routine's option or status record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RidDataConfiguration {
    #[serde(default)]
    pub min_length: usize,
    pub max_length: usize,
}

/// One of start, stop or request results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RidOperationConfiguration {
    /// Option record; absent means the request carries no data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_data: Option<RidDataConfiguration>,
    /// Status record; absent means the response carries no data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<RidDataConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preconditions: Option<PreconditionsConfiguration>,
}

/// One routine identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RidConfiguration {
    pub id: u16,
    /// Restrictions for every operation of the routine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preconditions: Option<PreconditionsConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<RidOperationConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<RidOperationConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_results: Option<RidOperationConfiguration>,
}

impl RidConfiguration {
    fn operations(&self) -> impl Iterator<Item = &RidOperationConfiguration> {
        [&self.start, &self.stop, &self.request_results]
            .into_iter()
            .flatten()
    }
}

// =============================================================================
// Loading and validation
// =============================================================================

impl DextConfiguration {
    /// Load a configuration file; the format follows the file extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
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
            "json" => serde_json::from_str(&content)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check limits and cross references
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.number_conversations == 0 {
            return Err(ConfigError::Invalid(
                "number_conversations must be at least 1".into(),
            ));
        }
        if self.uds_message_length == 0 {
            return Err(ConfigError::Invalid(
                "uds_message_length must be at least 1".into(),
            ));
        }

        let mut seen = HashSet::new();
        for session in &self.sessions {
            if !seen.insert(session.id) {
                return Err(ConfigError::Invalid(format!(
                    "session 0x{:02X} configured twice",
                    session.id
                )));
            }
            if session.p2_time_ms > u64::from(u16::MAX) {
                return Err(ConfigError::Invalid(format!(
                    "session 0x{:02X}: P2 {} ms does not fit into 16 bits",
                    session.id, session.p2_time_ms
                )));
            }
            if session.p2_star_time_ms % 10 != 0
                || session.p2_star_time_ms / 10 > u64::from(u16::MAX)
            {
                return Err(ConfigError::Invalid(format!(
                    "session 0x{:02X}: P2* {} ms is not a 16 bit multiple of 10 ms",
                    session.id, session.p2_star_time_ms
                )));
            }
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            if !seen.insert(service.id) {
                return Err(ConfigError::Invalid(format!(
                    "service 0x{:02X} configured twice",
                    service.id
                )));
            }
        }

        let mut seen = HashSet::new();
        for did in &self.did_table.dids {
            if !seen.insert(did.id) {
                return Err(ConfigError::Invalid(format!(
                    "DID 0x{:04X} configured twice",
                    did.id
                )));
            }
            if did.read.is_none() && did.write.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "DID 0x{:04X} is neither readable nor writable",
                    did.id
                )));
            }
            if did.min_length > did.max_length {
                return Err(ConfigError::Invalid(format!(
                    "DID 0x{:04X}: min_length exceeds max_length",
                    did.id
                )));
            }
            if let Some(value) = &did.value {
                let bytes = hex::decode(value).map_err(|e| {
                    ConfigError::Invalid(format!("DID 0x{:04X}: invalid hex value: {}", did.id, e))
                })?;
                if bytes.len() > did.max_length {
                    return Err(ConfigError::Invalid(format!(
                        "DID 0x{:04X}: value longer than max_length",
                        did.id
                    )));
                }
            }
        }

        let mut seen = HashSet::new();
        for rid in &self.rid_table {
            if !seen.insert(rid.id) {
                return Err(ConfigError::Invalid(format!(
                    "RID 0x{:04X} configured twice",
                    rid.id
                )));
            }
            if rid.operations().next().is_none() {
                return Err(ConfigError::Invalid(format!(
                    "RID 0x{:04X} has no operation",
                    rid.id
                )));
            }
            let bounds = rid
                .operations()
                .flat_map(|op| [op.request_data, op.response_data])
                .flatten();
            for data in bounds {
                if data.min_length > data.max_length {
                    return Err(ConfigError::Invalid(format!(
                        "RID 0x{:04X}: min_length exceeds max_length",
                        rid.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn s3_time(&self) -> Duration {
        Duration::from_millis(self.s3_time_ms)
    }
}
