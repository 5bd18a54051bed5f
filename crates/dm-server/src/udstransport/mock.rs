//! In-memory transport handler for tests and simulations

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    Address, ChannelId, GlobalChannelId, HandlerId, IndicationResult, TargetAddressType,
    TransmissionResult, UdsMessage, UdsTransportProtocolHandler, UdsTransportProtocolMgr,
};

/// Copy of a message handed to [`MockTransportHandler::transmit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmittedMessage {
    pub channel_id: ChannelId,
    pub source_address: Address,
    pub target_address: Address,
    pub payload: Vec<u8>,
}

/// Transport handler that records transmissions instead of sending them
///
/// With auto-confirm (the default) every transmission is confirmed from
/// within `transmit`. Otherwise messages queue up until
/// [`confirm_next`](Self::confirm_next) is called.
pub struct MockTransportHandler {
    handler_id: HandlerId,
    manager: Weak<UdsTransportProtocolMgr>,
    running: AtomicBool,
    auto_confirm: AtomicBool,
    pending: Mutex<VecDeque<UdsMessage>>,
    history: RwLock<Vec<TransmittedMessage>>,
    transmitted_tx: broadcast::Sender<TransmittedMessage>,
}

impl MockTransportHandler {
    pub fn new(handler_id: HandlerId, manager: &Arc<UdsTransportProtocolMgr>) -> Arc<Self> {
        let (transmitted_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            handler_id,
            manager: Arc::downgrade(manager),
            running: AtomicBool::new(false),
            auto_confirm: AtomicBool::new(true),
            pending: Mutex::new(VecDeque::new()),
            history: RwLock::new(Vec::new()),
            transmitted_tx,
        })
    }

    pub fn set_auto_confirm(&self, auto_confirm: bool) {
        self.auto_confirm.store(auto_confirm, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransmittedMessage> {
        self.transmitted_tx.subscribe()
    }

    /// Every message transmitted so far
    pub fn transmitted(&self) -> Vec<TransmittedMessage> {
        self.history.read().clone()
    }

    pub fn clear_transmitted(&self) {
        self.history.write().clear();
    }

    pub fn pending_confirmations(&self) -> usize {
        self.pending.lock().len()
    }

    /// Confirm the oldest unconfirmed transmission
    pub fn confirm_next(&self, result: TransmissionResult) -> bool {
        let Some(message) = self.pending.lock().pop_front() else {
            return false;
        };
        if let Some(manager) = self.manager.upgrade() {
            manager.transmit_confirmation(message, result);
        }
        true
    }

    /// Deliver a complete request the way a transport would
    pub fn send_request(
        &self,
        source_address: Address,
        target_address: Address,
        target_address_type: TargetAddressType,
        channel_id: ChannelId,
        payload: &[u8],
    ) -> IndicationResult {
        let Some(manager) = self.manager.upgrade() else {
            return IndicationResult::Overflow;
        };
        let channel = GlobalChannelId::new(self.handler_id, channel_id);
        let (result, message) = manager.indicate_message(
            source_address,
            target_address,
            target_address_type,
            channel,
            payload.len(),
            None,
        );
        if let (IndicationResult::Ok, Some(mut message)) = (result, message) {
            message.payload_mut().copy_from_slice(payload);
            manager.handle_message(message);
        }
        result
    }

    /// Wait until at least `count` messages were transmitted
    pub async fn wait_for_transmissions(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Vec<TransmittedMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.history.read().len() < count && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        self.transmitted()
    }
}

impl UdsTransportProtocolHandler for MockTransportHandler {
    fn handler_id(&self) -> HandlerId {
        self.handler_id
    }

    fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.pending.lock().clear();
    }

    fn transmit(&self, message: UdsMessage, channel_id: ChannelId) {
        let record = TransmittedMessage {
            channel_id,
            source_address: message.source_address(),
            target_address: message.target_address(),
            payload: message.payload().to_vec(),
        };
        debug!(payload = %hex::encode_upper(&record.payload), "Mock transport: transmit");
        self.history.write().push(record.clone());
        let _ = self.transmitted_tx.send(record);

        if self.auto_confirm.load(Ordering::SeqCst) {
            if let Some(manager) = self.manager.upgrade() {
                manager.transmit_confirmation(message, TransmissionResult::Ok);
            }
        } else {
            self.pending.lock().push_back(message);
        }
    }
}
