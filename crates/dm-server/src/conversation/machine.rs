//! Conversation state machine
//!
//! ```text
//! Free  --indicate_message--> Receive
//! Idle  --indicate_message--> Receive
//! Receive --handle_message--> Process
//! Process --finish_processing(nrc)--> Transmit
//! Process --finish_processing(msg, suppressed)--> Idle
//! Process --finish_processing(msg)--> Transmit
//! Transmit --transmit_confirmation--> Idle
//! Idle --(default session)--> Free
//! ```
//!
//! All state lives behind one mutex. It is never held while calling into a
//! transport handler or an access state observer, since both may call back
//! into the conversation.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tokio::runtime::Handle;
use tracing::{debug, error, info, trace, warn};

use crate::config::NO_RESPONSE_PENDING_LIMIT;
use crate::error::ConversationError;
use crate::service::{sid, ServiceDispatcher, ServiceProcessingContext};
use crate::timer::{Timer, TimerExpiry};
use crate::udstransport::{
    Address, GlobalChannelId, IndicationResult, NegativeResponseCode, TargetAddressType,
    TransmissionResult, TransportHandlerRegistry, UdsMessage, UdsMessageParameter,
};

use super::access::{AccessCategory, AccessState, AccessStateChange, AccessStateNotifier};
use super::message_handler::MessageHandler;
use super::provider::UdsMessageProvider;
use super::state_manager::{session_id, SessionTiming, StateManager};

const NEGATIVE_RESPONSE_LENGTH: usize = 3;
const RESPONSE_PENDING_NRC: u8 = 0x78;

/// Conversation protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationState {
    /// Default session, nothing in flight; the slot may be recycled
    Free,
    /// Non-default session, waiting for the next request
    Idle,
    /// Request being processed
    Process,
    /// Buffer handed to the transport, request being received
    Receive,
    /// Final response handed to the transport
    Transmit,
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "Free",
            Self::Idle => "Idle",
            Self::Process => "Process",
            Self::Receive => "Receive",
            Self::Transmit => "Transmit",
        };
        f.write_str(name)
    }
}

/// Collaborators shared by every conversation of one server address
pub struct ConversationContext {
    pub target_address: Address,
    pub provider: Arc<UdsMessageProvider>,
    pub state_manager: Arc<StateManager>,
    pub transport_handlers: Arc<TransportHandlerRegistry>,
    pub dispatcher: Arc<dyn ServiceDispatcher>,
    pub access_notifier: Arc<AccessStateNotifier>,
    pub runtime: Handle,
    /// Response-pending messages per request, [`NO_RESPONSE_PENDING_LIMIT`] for unlimited
    pub response_pending_limit: u8,
    pub s3_time: Duration,
    pub log_max_payload_bytes: usize,
}

struct ConversationInner {
    state: ConversationState,
    session: u8,
    security_level: u8,
    request_sid: Option<u8>,
    suppress_positive_response: bool,
    response_pending_count: u8,
    /// A 0x78 response is with the transport and not yet confirmed
    response_pending_active: bool,
}

/// One diagnostic dialog between a tester and this server
pub struct Conversation {
    channel: GlobalChannelId,
    source_address: Address,
    context: Arc<ConversationContext>,
    inner: Mutex<ConversationInner>,
    p2_timer: Timer,
    s3_timer: Timer,
    message_handler: MessageHandler,
}

impl Conversation {
    pub fn new(
        channel: GlobalChannelId,
        source_address: Address,
        context: Arc<ConversationContext>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let runtime = context.runtime.clone();

            let p2_owner = weak.clone();
            let p2_timer = Timer::new("p2", runtime.clone(), move |expiry| {
                if let Some(conversation) = p2_owner.upgrade() {
                    conversation.on_p2_timer_elapsed(expiry);
                }
            });

            let s3_owner = weak.clone();
            let s3_timer = Timer::new("s3", runtime.clone(), move |expiry| {
                if let Some(conversation) = s3_owner.upgrade() {
                    conversation.on_s3_timer_elapsed(expiry);
                }
            });
            s3_timer.set_one_shot(context.s3_time);

            let message_handler =
                MessageHandler::spawn(weak.clone(), Arc::clone(&context.dispatcher), &runtime);

            debug!(
                channel = %channel,
                tester = format!("0x{:04X}", source_address),
                "Conversation created"
            );

            Self {
                channel,
                source_address,
                context,
                inner: Mutex::new(ConversationInner {
                    state: ConversationState::Free,
                    session: session_id::DEFAULT,
                    security_level: 0,
                    request_sid: None,
                    suppress_positive_response: false,
                    response_pending_count: 0,
                    response_pending_active: false,
                }),
                p2_timer,
                s3_timer,
                message_handler,
            }
        })
    }

    pub fn channel(&self) -> GlobalChannelId {
        self.channel
    }

    pub fn source_address(&self) -> Address {
        self.source_address
    }

    pub fn state(&self) -> ConversationState {
        self.inner.lock().state
    }

    pub fn session_id(&self) -> u8 {
        self.inner.lock().session
    }

    pub fn security_level(&self) -> u8 {
        self.inner.lock().security_level
    }

    pub fn response_pending_count(&self) -> u8 {
        self.inner.lock().response_pending_count
    }

    pub fn is_suppressed(&self) -> bool {
        self.inner.lock().suppress_positive_response
    }

    pub fn access_state(&self) -> AccessState {
        let inner = self.inner.lock();
        AccessState {
            session: inner.session,
            security_level: inner.security_level,
        }
    }

    /// Whether this conversation serves `source_address` on `channel`
    pub fn matches(&self, channel: GlobalChannelId, source_address: Address) -> bool {
        self.channel == channel && self.source_address == source_address
    }

    // =========================================================================
    // Transport facing operations
    // =========================================================================

    /// Reserve a buffer for an incoming request of `size` bytes
    pub fn indicate_message(
        &self,
        size: usize,
        target_address_type: TargetAddressType,
    ) -> (IndicationResult, Option<UdsMessage>) {
        self.s3_timer.stop();
        let mut inner = self.inner.lock();

        if size == 0 {
            error!(channel = %self.channel, "Indicated message size is zero");
            self.resume_s3(&inner);
            return (IndicationResult::Overflow, None);
        }

        if !matches!(
            inner.state,
            ConversationState::Idle | ConversationState::Free
        ) {
            warn!(
                channel = %self.channel,
                state = %inner.state,
                "Request indicated while another one is in flight"
            );
            return (IndicationResult::Busy, None);
        }

        let parameter = UdsMessageParameter {
            source_address: self.source_address,
            target_address: self.context.target_address,
            target_address_type,
            channel: self.channel,
        };
        match self.context.provider.acquire(size, parameter) {
            Some(message) => {
                self.change_state(&mut inner, ConversationState::Receive);
                (IndicationResult::Ok, Some(message))
            }
            None => {
                self.resume_s3(&inner);
                (IndicationResult::Overflow, None)
            }
        }
    }

    /// Start processing a fully received request
    pub fn handle_message(&self, message: UdsMessage) -> Result<(), ConversationError> {
        let mut inner = self.inner.lock();
        self.expect_state(&inner, "handle_message", ConversationState::Receive)?;
        let request_sid = message.sid().ok_or(ConversationError::EmptyPayload)?;

        info!(
            request = %message.to_log_string(self.context.log_max_payload_bytes),
            "Request received"
        );

        if Self::is_functional_tester_present_suppressed(&message) {
            debug!(channel = %self.channel, "Functional TesterPresent without response");
            self.change_state(&mut inner, ConversationState::Idle);
            return Ok(());
        }

        inner.request_sid = Some(request_sid);
        self.start_p2(&mut inner);
        self.change_state(&mut inner, ConversationState::Process);
        drop(inner);

        if let Err(e) = self.message_handler.push(message) {
            let mut inner = self.inner.lock();
            self.stop_p2(&mut inner);
            self.change_state(&mut inner, ConversationState::Idle);
            return Err(e);
        }
        trace!(channel = %self.channel, "Request forwarded to message handler");
        Ok(())
    }

    /// The transport reports the outcome of a transmitted message
    pub fn transmit_confirmation(
        &self,
        message: &UdsMessage,
        result: TransmissionResult,
    ) -> Result<(), ConversationError> {
        let mut inner = self.inner.lock();

        // A 0x78 confirmed after the final response was already handed over
        if Self::is_response_pending(message) && !inner.response_pending_active {
            debug!(channel = %self.channel, "Late response pending confirmation ignored");
            return Ok(());
        }

        let expected = if inner.response_pending_active {
            ConversationState::Process
        } else {
            ConversationState::Transmit
        };
        self.expect_state(&inner, "transmit_confirmation", expected)?;

        if result == TransmissionResult::Failed {
            warn!(
                response = %message.to_log_string(self.context.log_max_payload_bytes),
                "Transmission failed"
            );
        }

        if inner.response_pending_active {
            inner.response_pending_active = false;
        } else {
            self.change_state(&mut inner, ConversationState::Idle);
        }
        Ok(())
    }

    /// Drop a reception the transport could not complete
    pub fn abort_reception(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ConversationState::Receive {
            return false;
        }
        warn!(channel = %self.channel, "Reception aborted by transport");
        self.change_state(&mut inner, ConversationState::Idle);
        true
    }

    // =========================================================================
    // Processor facing operations
    // =========================================================================

    /// Send a positive response
    pub fn finish_processing(&self, response: UdsMessage) -> Result<(), ConversationError> {
        debug!(
            response = %response.to_log_string(self.context.log_max_payload_bytes),
            "Finish processing"
        );
        let mut inner = self.inner.lock();
        self.expect_state(&inner, "finish_processing", ConversationState::Process)?;
        self.stop_p2(&mut inner);

        if inner.suppress_positive_response {
            debug!(channel = %self.channel, "Positive response suppressed");
            self.change_state(&mut inner, ConversationState::Idle);
            return Ok(());
        }
        self.transmit(inner, response)
    }

    /// Send a negative response for the current request
    pub fn finish_processing_with_nrc(
        &self,
        nrc: NegativeResponseCode,
    ) -> Result<(), ConversationError> {
        let mut inner = self.inner.lock();
        self.expect_state(&inner, "finish_processing_with_nrc", ConversationState::Process)?;
        self.stop_p2(&mut inner);
        let request_sid = inner.request_sid.ok_or(ConversationError::NoRequestSid)?;
        self.send_negative_response(inner, request_sid, nrc)
    }

    pub fn acquire_response_buffer(&self, size: usize) -> Option<UdsMessage> {
        let parameter = UdsMessageParameter {
            source_address: self.context.target_address,
            target_address: self.source_address,
            target_address_type: TargetAddressType::Physical,
            channel: self.channel,
        };
        self.context.provider.acquire(size, parameter)
    }

    pub fn set_suppress_bit(&self, suppress: bool) {
        self.inner.lock().suppress_positive_response = suppress;
    }

    pub fn set_session_id(&self, session: u8) {
        let change = {
            let mut inner = self.inner.lock();
            let change = self.update_access(&mut inner, AccessCategory::Session, session);
            if session == session_id::DEFAULT && inner.state == ConversationState::Idle {
                self.change_state(&mut inner, ConversationState::Free);
            }
            change
        };
        self.notify(change);
    }

    pub fn set_security_level(&self, level: u8) {
        let change = {
            let mut inner = self.inner.lock();
            self.update_access(&mut inner, AccessCategory::SecurityLevel, level)
        };
        self.notify(change);
    }

    pub fn session_timing(&self, session: u8) -> Option<SessionTiming> {
        self.context.state_manager.timing(session)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stop timers and the message handler; the conversation ends up Free
    pub fn shutdown(&self) {
        self.s3_timer.stop();
        self.message_handler.shutdown();
        let mut inner = self.inner.lock();
        self.stop_p2(&mut inner);
        inner.state = ConversationState::Free;
        debug!(channel = %self.channel, "Conversation shut down");
    }

    /// Wait for the message handler task after [`shutdown`](Self::shutdown)
    pub async fn join_message_handler(&self) {
        self.message_handler.join().await;
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn on_p2_timer_elapsed(&self, expiry: TimerExpiry) {
        let mut inner = self.inner.lock();
        if !self.p2_timer.is_current(expiry) {
            trace!(channel = %self.channel, "Stale P2 expiry");
            return;
        }
        if inner.state != ConversationState::Process {
            warn!(channel = %self.channel, state = %inner.state, "P2 elapsed outside Process");
            return;
        }

        let limit = self.context.response_pending_limit;
        if limit != NO_RESPONSE_PENDING_LIMIT && inner.response_pending_count >= limit {
            // The tester's own timeout ends the request
            error!(
                channel = %self.channel,
                limit,
                "Response pending limit reached, no further response pending is sent"
            );
            return;
        }

        let Some(request_sid) = inner.request_sid else {
            error!(channel = %self.channel, "P2 elapsed without a request SID");
            return;
        };

        // The final response must be sent once 0x78 went out
        inner.suppress_positive_response = false;
        inner.response_pending_active = true;
        inner.response_pending_count = inner.response_pending_count.saturating_add(1);
        let p2_star = self.timing(inner.session).p2_star;
        self.p2_timer.set_one_shot(p2_star);
        self.p2_timer.start();
        debug!(
            channel = %self.channel,
            count = inner.response_pending_count,
            "Sending response pending"
        );

        if let Err(e) = self.send_negative_response(
            inner,
            request_sid,
            NegativeResponseCode::RequestCorrectlyReceivedResponsePending,
        ) {
            error!(channel = %self.channel, error = %e, "Failed to send response pending");
            self.inner.lock().response_pending_active = false;
        }
    }

    fn on_s3_timer_elapsed(&self, expiry: TimerExpiry) {
        let change = {
            let mut inner = self.inner.lock();
            if !self.s3_timer.is_current(expiry) {
                return;
            }
            if !matches!(
                inner.state,
                ConversationState::Idle | ConversationState::Free
            ) {
                return;
            }
            if inner.session != session_id::DEFAULT {
                info!(
                    channel = %self.channel,
                    session = format!("0x{:02X}", inner.session),
                    "S3 elapsed, returning to default session"
                );
            }
            let change = self.update_access(&mut inner, AccessCategory::Session, session_id::DEFAULT);
            if inner.state == ConversationState::Idle {
                self.change_state(&mut inner, ConversationState::Free);
            }
            change
        };
        self.notify(change);
    }

    fn timing(&self, session: u8) -> SessionTiming {
        self.context.state_manager.timing(session).unwrap_or_else(|| {
            warn!(
                session = format!("0x{:02X}", session),
                "No timing for session, using defaults"
            );
            SessionTiming::default()
        })
    }

    fn start_p2(&self, inner: &mut ConversationInner) {
        inner.response_pending_count = 0;
        inner.response_pending_active = false;
        self.p2_timer.set_one_shot(self.timing(inner.session).p2);
        self.p2_timer.start();
    }

    fn stop_p2(&self, inner: &mut ConversationInner) {
        self.p2_timer.stop();
        inner.response_pending_active = false;
    }

    /// Restart S3 after rejecting an indication in Idle
    fn resume_s3(&self, inner: &ConversationInner) {
        if inner.state == ConversationState::Idle {
            self.s3_timer.start();
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn expect_state(
        &self,
        inner: &ConversationInner,
        operation: &'static str,
        expected: ConversationState,
    ) -> Result<(), ConversationError> {
        if inner.state == expected {
            return Ok(());
        }
        error!(channel = %self.channel, operation, state = %inner.state, "Invalid state");
        Err(ConversationError::InvalidState {
            operation,
            state: inner.state,
        })
    }

    fn change_state(&self, inner: &mut ConversationInner, next: ConversationState) {
        debug!(channel = %self.channel, from = %inner.state, to = %next, "State change");
        inner.state = next;
        if next == ConversationState::Idle {
            self.s3_timer.start();
            inner.suppress_positive_response = false;
            if inner.session == session_id::DEFAULT {
                debug!(channel = %self.channel, from = %next, to = %ConversationState::Free, "State change");
                inner.state = ConversationState::Free;
            }
        }
    }

    fn update_access(
        &self,
        inner: &mut ConversationInner,
        category: AccessCategory,
        value: u8,
    ) -> Option<AccessStateChange> {
        let slot = match category {
            AccessCategory::Session => &mut inner.session,
            AccessCategory::SecurityLevel => &mut inner.security_level,
        };
        let old = std::mem::replace(slot, value);
        (old != value).then_some(AccessStateChange {
            category,
            old,
            new: value,
            source_address: self.source_address,
            channel: self.channel,
        })
    }

    fn notify(&self, change: Option<AccessStateChange>) {
        if let Some(change) = change {
            self.context.access_notifier.notify(&change);
        }
    }

    fn send_negative_response(
        &self,
        mut inner: MutexGuard<'_, ConversationInner>,
        request_sid: u8,
        nrc: NegativeResponseCode,
    ) -> Result<(), ConversationError> {
        debug!(
            channel = %self.channel,
            sid = format!("0x{:02X}", request_sid),
            nrc = %nrc,
            "Negative response"
        );
        let Some(mut message) = self.acquire_response_buffer(NEGATIVE_RESPONSE_LENGTH) else {
            // Let the tester run into its P2 timeout
            error!(channel = %self.channel, "No UDS message available for negative response");
            if inner.response_pending_active {
                inner.response_pending_active = false;
            } else {
                self.change_state(&mut inner, ConversationState::Idle);
            }
            return Ok(());
        };
        message
            .payload_mut()
            .copy_from_slice(&[sid::NEGATIVE_RESPONSE, request_sid, nrc.into()]);
        self.transmit(inner, message)
    }

    /// Hand `message` to its transport handler; releases the lock first
    fn transmit(
        &self,
        mut inner: MutexGuard<'_, ConversationInner>,
        message: UdsMessage,
    ) -> Result<(), ConversationError> {
        let channel = message.channel();
        let Some(handler) = self.context.transport_handlers.get(channel.handler_id) else {
            error!(handler_id = channel.handler_id, "Transport protocol handler not found");
            if inner.response_pending_active {
                inner.response_pending_active = false;
            } else {
                self.change_state(&mut inner, ConversationState::Idle);
            }
            return Err(ConversationError::TransportHandlerNotFound(
                channel.handler_id,
            ));
        };

        if !inner.response_pending_active {
            self.change_state(&mut inner, ConversationState::Transmit);
        }
        drop(inner);

        info!(
            response = %message.to_log_string(self.context.log_max_payload_bytes),
            "Sending response"
        );
        handler.transmit(message, channel.channel_id);
        Ok(())
    }

    fn is_functional_tester_present_suppressed(message: &UdsMessage) -> bool {
        message.target_address_type() == TargetAddressType::Functional
            && matches!(
                message.payload(),
                [sid::TESTER_PRESENT, sid::SUPPRESS_POSITIVE_RESPONSE]
            )
    }

    fn is_response_pending(message: &UdsMessage) -> bool {
        matches!(
            message.payload(),
            [sid::NEGATIVE_RESPONSE, _, RESPONSE_PENDING_NRC]
        )
    }
}

impl ServiceProcessingContext for Conversation {
    fn finish_processing(&self, response: UdsMessage) -> Result<(), ConversationError> {
        Conversation::finish_processing(self, response)
    }

    fn finish_processing_with_nrc(
        &self,
        nrc: NegativeResponseCode,
    ) -> Result<(), ConversationError> {
        Conversation::finish_processing_with_nrc(self, nrc)
    }

    fn acquire_response_buffer(&self, size: usize) -> Option<UdsMessage> {
        Conversation::acquire_response_buffer(self, size)
    }

    fn set_suppress_bit(&self, suppress: bool) {
        Conversation::set_suppress_bit(self, suppress)
    }

    fn access_state(&self) -> AccessState {
        Conversation::access_state(self)
    }

    fn set_session_id(&self, session: u8) {
        Conversation::set_session_id(self, session)
    }

    fn set_security_level(&self, level: u8) {
        Conversation::set_security_level(self, level)
    }

    fn session_timing(&self, session: u8) -> Option<SessionTiming> {
        Conversation::session_timing(self, session)
    }

    fn runtime(&self) -> Handle {
        self.context.runtime.clone()
    }
}

impl fmt::Debug for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Conversation")
            .field("channel", &self.channel)
            .field("source_address", &format_args!("0x{:04X}", self.source_address))
            .field("state", &inner.state)
            .field("session", &format_args!("0x{:02X}", inner.session))
            .finish()
    }
}
