//! dm-server - UDS (ISO 14229) diagnostic server conversation engine
//!
//! Transport protocol handlers feed requests into the
//! [`UdsTransportProtocolMgr`]; every tester gets a [`Conversation`] that
//! enforces one request at a time, keeps the tester informed with
//! response-pending messages (P2/P2*) and falls back to the default
//! session after inactivity (S3).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      DiagnosticServer                         │
//! │                                                               │
//! │  ┌────────────────────┐        ┌───────────────────────────┐ │
//! │  │ UdsTransportProto- │ ─────▶ │ ConversationManager       │ │
//! │  │ colMgr (routing)   │        │  UdsMessageProvider       │ │
//! │  └─────────▲──────────┘        │  StateManager (P2/P2*)    │ │
//! │            │                   │  AccessStateNotifier      │ │
//! │            │                   └─────────────┬─────────────┘ │
//! │  ┌─────────┴──────────┐                      │               │
//! │  │ Transport handlers │ ◀── transmit ── ┌────┴─────────────┐ │
//! │  │ (DoIP, mock)       │                 │ Conversation     │ │
//! │  └────────────────────┘                 │  timers P2 / S3  │ │
//! │                                         │  MessageHandler  │ │
//! │                                         └────┬─────────────┘ │
//! │                                              │               │
//! │                                    ┌─────────┴────────────┐  │
//! │                                    │ ServiceTable         │  │
//! │                                    │ (service processors) │  │
//! │                                    └──────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod conversation;
pub mod data;
pub mod error;
pub mod pool;
pub mod routine;
pub mod server;
pub mod service;
pub mod timer;
pub mod udstransport;

pub use config::{ConfigError, DextConfiguration};
pub use conversation::{Conversation, ConversationManager, ConversationState};
pub use error::{ConversationError, ServerError, ServerResult};
pub use server::DiagnosticServer;
pub use service::processor::{GenericUdsService, RequestMeta};
pub use service::{ServiceDispatcher, ServiceTable};
pub use udstransport::{
    IndicationResult, NegativeResponseCode, TargetAddressType, TransmissionResult, UdsMessage,
    UdsTransportProtocolHandler, UdsTransportProtocolMgr,
};
