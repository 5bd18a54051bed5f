//! Conversation lifecycle tests
//!
//! Requests are injected through the mock transport handler and the
//! transmitted responses, conversation states and access state
//! notifications are checked. Timers run with real, short durations.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio_test::assert_pending;

use dm_server::conversation::{
    session_id, AccessCategory, AccessStateChange, AccessStateObserver, CategoryMask,
    ConversationState,
};
use dm_server::data::InMemoryDataProvider;
use dm_server::routine::{InMemoryRoutineProvider, RoutineOperationType};
use dm_server::service::{
    Preconditions, ProcessingError, ProcessingStatus, ServiceHandler, ServiceProcessingContext,
    ServiceProcessor,
};
use dm_server::udstransport::{
    GlobalChannelId, MockTransportHandler, TransmittedMessage, UdsMessage,
};
use dm_server::{
    ConversationError, DextConfiguration, DiagnosticServer, IndicationResult, TargetAddressType,
    TransmissionResult,
};

const HANDLER_ID: u8 = 1;
const CHANNEL_ID: u32 = 7;
const TESTER: u16 = 0x0E80;
const SERVER: u16 = 0xF190;

const CONFIG: &str = r#"
target_address = 0xF190
uds_message_length = 64
number_conversations = 2
max_number_of_response_pending_responses = 0xFF
s3_time_ms = 100

[[sessions]]
id = 0x01
p2_time_ms = 50
p2_star_time_ms = 50

[[sessions]]
id = 0x03
p2_time_ms = 25
p2_star_time_ms = 2500

[[services]]
id = 0x10

[[services]]
id = 0x22

[[services]]
id = 0x31

[[services]]
id = 0x3E

[[rid_table]]
id = 0x0203
start = { request_data = { max_length = 1 } }
request_results = { response_data = { min_length = 1, max_length = 2 } }

[did_table]
max_number_dids_to_read = 2

[[did_table.dids]]
id = 0x0102
max_length = 4
value = "AABB"
read = {}
"#;

/// Server with a mock transport attached
struct Harness {
    server: DiagnosticServer,
    mock: Arc<MockTransportHandler>,
    routines: Arc<InMemoryRoutineProvider>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(config(|_| {}), Duration::ZERO)
    }

    fn with_config(config: DextConfiguration, latency: Duration) -> Self {
        let provider = InMemoryDataProvider::from_config(&config.did_table)
            .unwrap()
            .with_latency(latency);
        let routines = Arc::new(InMemoryRoutineProvider::new());
        let server =
            DiagnosticServer::new(config, Arc::new(provider), routines.clone(), None).unwrap();
        let mock = MockTransportHandler::new(HANDLER_ID, server.transport_manager());
        server.add_transport_handler(mock.clone()).unwrap();
        server.run();
        Self {
            server,
            mock,
            routines,
        }
    }

    fn channel(&self) -> GlobalChannelId {
        GlobalChannelId::new(HANDLER_ID, CHANNEL_ID)
    }

    fn send(&self, payload: &[u8]) -> IndicationResult {
        self.send_from(TESTER, CHANNEL_ID, payload)
    }

    fn send_from(&self, tester: u16, channel_id: u32, payload: &[u8]) -> IndicationResult {
        self.mock.send_request(
            tester,
            SERVER,
            TargetAddressType::Physical,
            channel_id,
            payload,
        )
    }

    fn state(&self) -> ConversationState {
        self.state_of(TESTER, CHANNEL_ID)
    }

    fn state_of(&self, tester: u16, channel_id: u32) -> ConversationState {
        self.server
            .conversation_manager()
            .find_conversation(GlobalChannelId::new(HANDLER_ID, channel_id), tester)
            .map(|c| c.state())
            .unwrap_or(ConversationState::Free)
    }

    async fn responses(&self, count: usize) -> Vec<Vec<u8>> {
        self.mock
            .wait_for_transmissions(count, Duration::from_secs(2))
            .await
            .into_iter()
            .map(|m| m.payload)
            .collect()
    }

    async fn wait_for_state(&self, expected: ConversationState) {
        for _ in 0..200 {
            if self.state() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(self.state(), expected);
    }
}

fn config(adjust: impl FnOnce(&mut DextConfiguration)) -> DextConfiguration {
    let mut config = DextConfiguration::from_toml_str(CONFIG).unwrap();
    adjust(&mut config);
    config
}

fn is_response_pending(payload: &[u8]) -> bool {
    matches!(payload, [0x7F, _, 0x78])
}

/// Handler whose processors fail the way a broken application would
enum FailingHandler {
    Panic,
    ProviderTask,
}

struct FailingProcessor {
    panic: bool,
}

impl ServiceHandler for FailingHandler {
    fn create_processor(
        &self,
        _request: UdsMessage,
        _context: Arc<dyn ServiceProcessingContext>,
    ) -> Box<dyn ServiceProcessor> {
        Box::new(FailingProcessor {
            panic: matches!(self, FailingHandler::Panic),
        })
    }
}

impl ServiceProcessor for FailingProcessor {
    fn handle_message(&mut self) -> Result<ProcessingStatus, ProcessingError> {
        if self.panic {
            panic!("processor failure");
        }
        Err(ProcessingError::ProviderTask("task cancelled".to_string()))
    }
}

#[derive(Default)]
struct RecordingObserver {
    changes: Mutex<Vec<AccessStateChange>>,
}

impl AccessStateObserver for RecordingObserver {
    fn on_access_state_change(&self, change: &AccessStateChange) {
        self.changes.lock().push(*change);
    }
}

// =============================================================================
// Request / response pairing
// =============================================================================

#[tokio::test]
async fn test_read_did_full_cycle() {
    let harness = Harness::new();
    harness.mock.set_auto_confirm(false);
    let manager = harness.server.transport_manager();

    let (result, message) = manager.indicate_message(
        TESTER,
        SERVER,
        TargetAddressType::Physical,
        harness.channel(),
        3,
        None,
    );
    assert_eq!(result, IndicationResult::Ok);
    assert_eq!(harness.state(), ConversationState::Receive);

    let mut message = message.unwrap();
    message.payload_mut().copy_from_slice(&[0x22, 0x01, 0x02]);
    manager.handle_message(message);
    assert_eq!(harness.state(), ConversationState::Process);

    let transmitted = harness
        .mock
        .wait_for_transmissions(1, Duration::from_secs(2))
        .await;
    assert_eq!(
        transmitted,
        vec![TransmittedMessage {
            channel_id: CHANNEL_ID,
            source_address: SERVER,
            target_address: TESTER,
            payload: vec![0x62, 0x01, 0x02, 0xAA, 0xBB],
        }]
    );
    assert_eq!(harness.state(), ConversationState::Transmit);

    assert!(harness.mock.confirm_next(TransmissionResult::Ok));
    // default session: Idle collapses into Free
    assert_eq!(harness.state(), ConversationState::Free);
    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_unsupported_service() {
    let harness = Harness::new();
    assert_eq!(harness.send(&[0x27, 0x01]), IndicationResult::Ok);
    assert_eq!(harness.responses(1).await, vec![vec![0x7F, 0x27, 0x11]]);
    harness.wait_for_state(ConversationState::Free).await;
    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_routine_control_cycle() {
    let harness = Harness::new();
    harness
        .routines
        .set_response(0x0203, RoutineOperationType::RequestResults, vec![0x5A]);

    assert_eq!(harness.send(&[0x31, 0x03, 0x02, 0x03]), IndicationResult::Ok);
    harness.responses(1).await;
    harness.wait_for_state(ConversationState::Free).await;
    assert_eq!(harness.send(&[0x31, 0x01, 0x02, 0x03, 0x07]), IndicationResult::Ok);
    harness.responses(2).await;
    harness.wait_for_state(ConversationState::Free).await;
    assert_eq!(harness.send(&[0x31, 0x03, 0x02, 0x03]), IndicationResult::Ok);

    assert_eq!(
        harness.responses(3).await,
        vec![
            vec![0x7F, 0x31, 0x24],
            vec![0x71, 0x01, 0x02, 0x03],
            vec![0x71, 0x03, 0x02, 0x03, 0x5A],
        ]
    );
    assert_eq!(harness.routines.last_input(0x0203), Some(vec![0x07]));
    harness.wait_for_state(ConversationState::Free).await;
    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_panicking_processor_sends_general_reject() {
    let harness = Harness::new();
    harness.server.service_table().register(
        0x31,
        Arc::new(FailingHandler::Panic),
        Preconditions::unrestricted(),
    );

    assert_eq!(harness.send(&[0x31, 0x01, 0x02, 0x03]), IndicationResult::Ok);
    assert_eq!(harness.responses(1).await, vec![vec![0x7F, 0x31, 0x10]]);
    harness.wait_for_state(ConversationState::Free).await;

    // the message handler survives the panic
    assert_eq!(harness.send(&[0x3E, 0x00]), IndicationResult::Ok);
    assert_eq!(harness.responses(2).await[1], vec![0x7E, 0x00]);
    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_processor_error_sends_general_reject() {
    let harness = Harness::new();
    harness.server.service_table().register(
        0x2F,
        Arc::new(FailingHandler::ProviderTask),
        Preconditions::unrestricted(),
    );

    assert_eq!(harness.send(&[0x2F, 0x01, 0x02, 0x03]), IndicationResult::Ok);
    assert_eq!(harness.responses(1).await, vec![vec![0x7F, 0x2F, 0x10]]);
    harness.wait_for_state(ConversationState::Free).await;
    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_busy_while_processing() {
    let harness = Harness::with_config(config(|_| {}), Duration::from_millis(60));
    assert_eq!(harness.send(&[0x22, 0x01, 0x02]), IndicationResult::Ok);
    assert_eq!(harness.send(&[0x3E, 0x00]), IndicationResult::Busy);

    let responses = harness.responses(2).await;
    assert_eq!(
        responses.last().cloned(),
        Some(vec![0x62, 0x01, 0x02, 0xAA, 0xBB])
    );
    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_zero_size_indication_overflows() {
    let harness = Harness::new();
    let (result, message) = harness.server.transport_manager().indicate_message(
        TESTER,
        SERVER,
        TargetAddressType::Physical,
        harness.channel(),
        0,
        None,
    );
    assert_eq!(result, IndicationResult::Overflow);
    assert!(message.is_none());
    assert_eq!(harness.state(), ConversationState::Free);
    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_handle_message_requires_receive() {
    let harness = Harness::new();
    let conversation = harness
        .server
        .conversation_manager()
        .get_or_create_conversation(harness.channel(), TESTER)
        .unwrap();
    let response = conversation.acquire_response_buffer(2).unwrap();
    assert!(matches!(
        conversation.handle_message(response),
        Err(ConversationError::InvalidState {
            operation: "handle_message",
            state: ConversationState::Free,
        })
    ));
    assert!(matches!(
        conversation.finish_processing_with_nrc(dm_server::NegativeResponseCode::GeneralReject),
        Err(ConversationError::InvalidState { .. })
    ));
    harness.server.shutdown().await;
}

// =============================================================================
// Suppressed responses
// =============================================================================

#[tokio::test]
async fn test_functional_tester_present_is_not_processed() {
    let harness = Harness::new();
    let result = harness.mock.send_request(
        TESTER,
        0xE400,
        TargetAddressType::Functional,
        CHANNEL_ID,
        &[0x3E, 0x80],
    );
    assert_eq!(result, IndicationResult::Ok);
    assert_eq!(harness.state(), ConversationState::Free);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(harness.mock.transmitted().is_empty());
    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_suppressed_positive_response() {
    let harness = Harness::new();
    assert_eq!(harness.send(&[0x3E, 0x80]), IndicationResult::Ok);
    harness.wait_for_state(ConversationState::Free).await;
    assert!(harness.mock.transmitted().is_empty());

    // negative responses are never suppressed
    assert_eq!(harness.send(&[0x3E, 0x81]), IndicationResult::Ok);
    assert_eq!(harness.responses(1).await, vec![vec![0x7F, 0x3E, 0x12]]);
    harness.server.shutdown().await;
}

// =============================================================================
// Sessions and S3
// =============================================================================

#[tokio::test]
async fn test_session_change_and_s3_timeout() {
    let harness = Harness::new();
    let observer = Arc::new(RecordingObserver::default());
    harness
        .server
        .subscribe_access_state(observer.clone(), CategoryMask::SESSION)
        .unwrap();

    assert_eq!(harness.send(&[0x10, 0x03]), IndicationResult::Ok);
    assert_eq!(
        harness.responses(1).await,
        vec![vec![0x50, 0x03, 0x00, 0x19, 0x00, 0xFA]]
    );
    harness.wait_for_state(ConversationState::Idle).await;

    let conversation = harness
        .server
        .conversation_manager()
        .find_conversation(harness.channel(), TESTER)
        .unwrap();
    assert_eq!(conversation.session_id(), session_id::EXTENDED);

    // S3 is 100 ms
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(conversation.session_id(), session_id::DEFAULT);
    assert_eq!(conversation.state(), ConversationState::Free);

    let changes = observer.changes.lock().clone();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].category, AccessCategory::Session);
    assert_eq!((changes[0].old, changes[0].new), (0x01, 0x03));
    assert_eq!((changes[1].old, changes[1].new), (0x03, 0x01));
    assert_eq!(changes[1].source_address, TESTER);
    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_tester_present_keeps_session_alive() {
    let harness = Harness::new();
    assert_eq!(harness.send(&[0x10, 0x03]), IndicationResult::Ok);
    harness.responses(1).await;
    harness.wait_for_state(ConversationState::Idle).await;

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.send(&[0x3E, 0x80]), IndicationResult::Ok);
        harness.wait_for_state(ConversationState::Idle).await;
    }
    let conversation = harness
        .server
        .conversation_manager()
        .find_conversation(harness.channel(), TESTER)
        .unwrap();
    assert_eq!(conversation.session_id(), session_id::EXTENDED);
    harness.server.shutdown().await;
}

// =============================================================================
// Response pending
// =============================================================================

#[tokio::test]
async fn test_response_pending_until_final_response() {
    let harness = Harness::with_config(config(|_| {}), Duration::from_millis(150));
    assert_eq!(harness.send(&[0x22, 0x01, 0x02]), IndicationResult::Ok);

    let mut responses = Vec::new();
    for _ in 0..100 {
        responses = harness.responses(1).await;
        if responses.last().is_some_and(|r| !is_response_pending(r)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (pending, finals): (Vec<_>, Vec<_>) =
        responses.into_iter().partition(|r| is_response_pending(r));
    assert!(!pending.is_empty());
    assert!(pending.iter().all(|r| r == &vec![0x7F, 0x22, 0x78]));
    assert_eq!(finals, vec![vec![0x62, 0x01, 0x02, 0xAA, 0xBB]]);
    harness.wait_for_state(ConversationState::Free).await;
    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_response_pending_limit() {
    let harness = Harness::with_config(
        config(|c| {
            c.max_number_of_response_pending_responses = 1;
            c.sessions[0].p2_star_time_ms = 30;
        }),
        Duration::from_millis(150),
    );
    assert_eq!(harness.send(&[0x22, 0x01, 0x02]), IndicationResult::Ok);

    let responses = harness.responses(2).await;
    assert_eq!(
        responses,
        vec![vec![0x7F, 0x22, 0x78], vec![0x62, 0x01, 0x02, 0xAA, 0xBB]]
    );
    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_response_pending_limit_of_two() {
    let harness = Harness::with_config(
        config(|c| c.max_number_of_response_pending_responses = 2),
        Duration::from_millis(300),
    );
    assert_eq!(harness.send(&[0x22, 0x01, 0x02]), IndicationResult::Ok);

    assert_eq!(
        harness.responses(3).await,
        vec![
            vec![0x7F, 0x22, 0x78],
            vec![0x7F, 0x22, 0x78],
            vec![0x62, 0x01, 0x02, 0xAA, 0xBB],
        ]
    );
    harness.wait_for_state(ConversationState::Free).await;
    assert_eq!(harness.mock.transmitted().len(), 3);
    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_response_pending_disabled() {
    let harness = Harness::with_config(
        config(|c| c.max_number_of_response_pending_responses = 0),
        Duration::from_millis(80),
    );
    assert_eq!(harness.send(&[0x22, 0x01, 0x02]), IndicationResult::Ok);
    assert_eq!(
        harness.responses(1).await,
        vec![vec![0x62, 0x01, 0x02, 0xAA, 0xBB]]
    );
    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_late_response_pending_confirmation_is_ignored() {
    let harness = Harness::with_config(
        config(|c| c.max_number_of_response_pending_responses = 1),
        Duration::from_millis(120),
    );
    harness.mock.set_auto_confirm(false);
    assert_eq!(harness.send(&[0x22, 0x01, 0x02]), IndicationResult::Ok);

    // 0x78 and final response, neither confirmed yet
    let responses = harness.responses(2).await;
    assert_eq!(responses.len(), 2);
    assert!(is_response_pending(&responses[0]));
    assert_eq!(harness.state(), ConversationState::Transmit);

    assert!(harness.mock.confirm_next(TransmissionResult::Ok));
    assert_eq!(harness.state(), ConversationState::Transmit);
    assert!(harness.mock.confirm_next(TransmissionResult::Ok));
    assert_eq!(harness.state(), ConversationState::Free);
    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_failed_transmission_returns_to_idle() {
    let harness = Harness::new();
    assert_eq!(harness.send(&[0x10, 0x03]), IndicationResult::Ok);
    harness.responses(1).await;
    harness.wait_for_state(ConversationState::Idle).await;

    harness.mock.set_auto_confirm(false);
    assert_eq!(harness.send(&[0x3E, 0x00]), IndicationResult::Ok);
    harness.responses(2).await;
    assert_eq!(harness.state(), ConversationState::Transmit);
    assert!(harness.mock.confirm_next(TransmissionResult::Failed));
    assert_eq!(harness.state(), ConversationState::Idle);
    harness.server.shutdown().await;
}

// =============================================================================
// Conversation slots
// =============================================================================

#[tokio::test]
async fn test_conversation_slots_are_recycled() {
    let harness = Harness::with_config(config(|c| c.number_conversations = 1), Duration::ZERO);
    let manager = harness.server.conversation_manager();

    // first tester holds the only slot in a non-default session
    assert_eq!(harness.send(&[0x10, 0x03]), IndicationResult::Ok);
    harness.responses(1).await;
    harness.wait_for_state(ConversationState::Idle).await;
    assert_eq!(
        harness.send_from(0x0E81, 8, &[0x3E, 0x00]),
        IndicationResult::Overflow
    );

    // back in the default session the slot becomes reusable
    assert_eq!(harness.send(&[0x10, 0x01]), IndicationResult::Ok);
    harness.responses(2).await;
    harness.wait_for_state(ConversationState::Free).await;

    assert_eq!(
        harness.send_from(0x0E81, 8, &[0x3E, 0x00]),
        IndicationResult::Ok
    );
    let responses = harness.responses(3).await;
    assert_eq!(responses[2], vec![0x7E, 0x00]);
    assert_eq!(manager.len(), 1);
    assert!(manager.find_conversation(harness.channel(), TESTER).is_none());
    assert_eq!(harness.state_of(0x0E81, 8), ConversationState::Free);
    harness.server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_joins_message_handlers() {
    let harness = Harness::new();
    assert_eq!(harness.send(&[0x3E, 0x00]), IndicationResult::Ok);
    harness.responses(1).await;

    let conversation = harness
        .server
        .conversation_manager()
        .find_conversation(harness.channel(), TESTER)
        .unwrap();
    let mut join = tokio_test::task::spawn(conversation.join_message_handler());
    assert_pending!(join.poll());

    conversation.shutdown();
    join.await;
    assert_eq!(conversation.state(), ConversationState::Free);
    assert_eq!(
        harness.send(&[0x3E, 0x00]),
        IndicationResult::Ok,
        "indication still reserves a buffer"
    );
    assert_eq!(harness.state(), ConversationState::Free);

    harness.server.shutdown().await;
    assert!(harness.server.conversation_manager().is_empty());
}
