//! DoIP TCP server implementing [`UdsTransportProtocolHandler`]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use doip_definitions::payload::{
    ActivationCode, ActivationType, AliveCheckResponse, DiagnosticAckCode, DiagnosticMessage,
    DiagnosticMessageAck, DiagnosticMessageNack, DiagnosticNackCode, DoipPayload, GenericNack,
    NackCode, RoutingActivationRequest, RoutingActivationResponse,
};
use doip_sockets::tcp::{TcpListener, TcpStream as DoIpTcpStream};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{target_address_type, DoIpConfig, DoIpError};
use crate::udstransport::{
    Address, ChannelId, GlobalChannelId, HandlerId, IndicationResult, MetaInfoMap,
    TransmissionResult, UdsMessage, UdsTransportProtocolHandler, UdsTransportProtocolMgr,
};

/// Meta info key carrying the tester's socket address
pub const META_PEER_ADDRESS: &str = "doip.peer_address";

struct ChannelEntry {
    connection_id: u64,
    sender: mpsc::UnboundedSender<UdsMessage>,
}

enum Flow {
    Continue,
    Close,
}

struct Connection {
    id: u64,
    peer: SocketAddr,
    sender: mpsc::UnboundedSender<UdsMessage>,
    source_address: Option<Address>,
}

struct Shared {
    handler_id: HandlerId,
    config: DoIpConfig,
    manager: Weak<UdsTransportProtocolMgr>,
    channels: RwLock<HashMap<ChannelId, ChannelEntry>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_connection_id: AtomicU64,
}

/// Accepts tester connections and carries UDS messages over DoIP
pub struct DoIpHandler {
    shared: Arc<Shared>,
    runtime: Handle,
    listener: Mutex<Option<TcpListener>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl DoIpHandler {
    pub fn new(
        handler_id: HandlerId,
        config: DoIpConfig,
        manager: &Arc<UdsTransportProtocolMgr>,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                handler_id,
                config,
                manager: Arc::downgrade(manager),
                channels: RwLock::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                next_connection_id: AtomicU64::new(1),
            }),
            runtime,
            listener: Mutex::new(None),
            accept_task: Mutex::new(None),
        })
    }

    /// Bind the listening socket ahead of [`start`](UdsTransportProtocolHandler::start)
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 was requested.
    pub async fn bind(&self) -> Result<SocketAddr, DoIpError> {
        let listener = self.shared.bind().await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "DoIP listener bound");
        *self.listener.lock() = Some(listener);
        Ok(local_addr)
    }

    /// Number of testers with an active routing
    pub fn active_channels(&self) -> usize {
        self.shared.channels.read().len()
    }
}

impl UdsTransportProtocolHandler for DoIpHandler {
    fn handler_id(&self) -> HandlerId {
        self.shared.handler_id
    }

    fn start(&self) {
        let mut accept_task = self.accept_task.lock();
        if accept_task.is_some() {
            return;
        }
        let listener = self.listener.lock().take();
        let shared = Arc::clone(&self.shared);
        *accept_task = Some(self.runtime.spawn(async move {
            let listener = match listener {
                Some(listener) => listener,
                None => match shared.bind().await {
                    Ok(listener) => listener,
                    Err(e) => {
                        error!(error = %e, "Failed to start DoIP listener");
                        return;
                    }
                },
            };
            shared.accept_loop(listener).await;
        }));
    }

    fn stop(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        for task in self.shared.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.channels.write().clear();
        if let Some(manager) = self.shared.manager.upgrade() {
            manager.handler_stopped(self.shared.handler_id);
        }
    }

    fn transmit(&self, message: UdsMessage, channel_id: ChannelId) {
        let sender = self
            .shared
            .channels
            .read()
            .get(&channel_id)
            .map(|entry| entry.sender.clone());

        let message = match sender {
            Some(sender) => match sender.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };
        warn!(channel_id, "No DoIP connection for channel");
        self.shared.confirm(message, TransmissionResult::Failed);
    }
}

impl Drop for DoIpHandler {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
    }
}

impl Shared {
    async fn bind(&self) -> Result<TcpListener, DoIpError> {
        let address = self.config.socket_address();
        TcpListener::bind(address.as_str())
            .await
            .map_err(|source| DoIpError::Bind { address, source })
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let limit = Arc::new(Semaphore::new(self.config.max_connections));
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "DoIP accept failed");
                    continue;
                }
            };
            let Ok(permit) = Arc::clone(&limit).try_acquire_owned() else {
                warn!(peer = %peer, max = self.config.max_connections, "Connection limit reached");
                continue;
            };

            let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
            let shared = Arc::clone(&self);
            let task = tokio::spawn(async move {
                shared.serve(id, stream, peer).await;
                drop(permit);
            });

            let mut tasks = self.tasks.lock();
            tasks.retain(|task| !task.is_finished());
            tasks.push(task);
        }
    }

    /// Reads tester frames and writes queued responses until either side closes
    async fn serve(self: Arc<Self>, id: u64, mut stream: DoIpTcpStream, peer: SocketAddr) {
        info!(peer = %peer, "DoIP tester connected");
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut connection = Connection {
            id,
            peer,
            sender,
            source_address: None,
        };

        loop {
            tokio::select! {
                incoming = stream.read() => {
                    let flow = match incoming {
                        Some(Ok(frame)) => {
                            if frame.header.payload_length > self.config.max_payload_length {
                                warn!(
                                    peer = %peer,
                                    length = frame.header.payload_length,
                                    "DoIP payload too large"
                                );
                                send(&mut stream, generic_nack(NackCode::MessageTooLarge)).await;
                                Flow::Close
                            } else {
                                self.handle_payload(&mut stream, &mut connection, frame.payload)
                                    .await
                            }
                        }
                        Some(Err(e)) => {
                            warn!(peer = %peer, error = %e, "Invalid DoIP frame");
                            send(&mut stream, generic_nack(NackCode::IncorrectPatternFormat)).await;
                            Flow::Close
                        }
                        None => Flow::Close,
                    };
                    if let Flow::Close = flow {
                        break;
                    }
                }
                Some(message) = receiver.recv() => {
                    let result = if send(&mut stream, diagnostic_message(&message)).await {
                        TransmissionResult::Ok
                    } else {
                        TransmissionResult::Failed
                    };
                    self.confirm(message, result);
                    if result == TransmissionResult::Failed {
                        break;
                    }
                }
            }
        }

        if let Some(source_address) = connection.source_address {
            self.release_channel(source_address, id);
        }
        drop(stream);
        receiver.close();
        while let Ok(message) = receiver.try_recv() {
            self.confirm(message, TransmissionResult::Failed);
        }
        info!(peer = %peer, "DoIP tester disconnected");
    }

    async fn handle_payload(
        &self,
        stream: &mut DoIpTcpStream,
        connection: &mut Connection,
        payload: DoipPayload,
    ) -> Flow {
        match payload {
            DoipPayload::RoutingActivationRequest(request) => {
                self.activate_routing(stream, connection, request).await
            }
            DoipPayload::AliveCheckRequest(_) => {
                let response = DoipPayload::AliveCheckResponse(AliveCheckResponse {
                    source_address: self.config.logical_address.to_be_bytes(),
                });
                send(stream, response).await;
                Flow::Continue
            }
            DoipPayload::DiagnosticMessage(message) => {
                self.handle_diagnostic_message(stream, connection, message)
                    .await
            }
            other => {
                debug!(payload = ?other, "Payload not served on the DoIP data port");
                send(stream, generic_nack(NackCode::UnknownPayloadType)).await;
                Flow::Continue
            }
        }
    }

    async fn activate_routing(
        &self,
        stream: &mut DoIpTcpStream,
        connection: &mut Connection,
        request: RoutingActivationRequest,
    ) -> Flow {
        let tester = Address::from_be_bytes(request.source_address);
        let response = |activation_code| {
            DoipPayload::RoutingActivationResponse(RoutingActivationResponse {
                logical_address: request.source_address,
                source_address: self.config.logical_address.to_be_bytes(),
                activation_code,
                buffer: [0; 4],
            })
        };

        match &request.activation_type {
            ActivationType::Default | ActivationType::WwhObd => {}
            other => {
                warn!(
                    tester = format!("0x{:04X}", tester),
                    activation_type = ?other,
                    "Unsupported routing activation type"
                );
                send(
                    stream,
                    response(ActivationCode::DeniedUnsupportedRoutingActivationType),
                )
                .await;
                return Flow::Close;
            }
        }

        let already_active = {
            let mut channels = self.channels.write();
            let channel_id = ChannelId::from(tester);
            if channels
                .get(&channel_id)
                .is_some_and(|entry| entry.connection_id != connection.id)
            {
                true
            } else {
                if let Some(previous) = connection.source_address.filter(|sa| *sa != tester) {
                    channels.remove(&ChannelId::from(previous));
                }
                channels.insert(
                    channel_id,
                    ChannelEntry {
                        connection_id: connection.id,
                        sender: connection.sender.clone(),
                    },
                );
                false
            }
        };
        if already_active {
            warn!(
                tester = format!("0x{:04X}", tester),
                "Source address already active on another connection"
            );
            send(stream, response(ActivationCode::DeniedSourceIsAlreadyActive)).await;
            return Flow::Close;
        }

        connection.source_address = Some(tester);
        info!(
            tester = format!("0x{:04X}", tester),
            peer = %connection.peer,
            "Routing activated"
        );
        send(stream, response(ActivationCode::SuccessfullyActivated)).await;
        Flow::Continue
    }

    async fn handle_diagnostic_message(
        &self,
        stream: &mut DoIpTcpStream,
        connection: &mut Connection,
        message: DiagnosticMessage,
    ) -> Flow {
        let Some(registered) = connection.source_address else {
            debug!(peer = %connection.peer, "Diagnostic message before routing activation");
            return Flow::Continue;
        };

        let tester = Address::from_be_bytes(message.source_address);
        let target = Address::from_be_bytes(message.target_address);
        let nack = |nack_code| {
            DoipPayload::DiagnosticMessageNack(DiagnosticMessageNack {
                source_address: message.target_address,
                target_address: message.source_address,
                nack_code,
            })
        };
        if tester != registered {
            warn!(
                tester = format!("0x{:04X}", tester),
                registered = format!("0x{:04X}", registered),
                "Diagnostic message from unregistered source address"
            );
            send(stream, nack(DiagnosticNackCode::InvalidSourceAddress)).await;
            return Flow::Close;
        }

        let Some(manager) = self.manager.upgrade() else {
            send(stream, nack(DiagnosticNackCode::DiagnosticMessageTooLarge)).await;
            return Flow::Continue;
        };
        let meta_info: MetaInfoMap =
            HashMap::from([(META_PEER_ADDRESS.to_string(), connection.peer.to_string())]);
        let channel = GlobalChannelId::new(self.handler_id, ChannelId::from(registered));
        let (result, buffer) = manager.indicate_message(
            tester,
            target,
            target_address_type(target),
            channel,
            message.message.len(),
            Some(Arc::new(meta_info)),
        );

        match (result, buffer) {
            (IndicationResult::Ok, Some(mut buffer)) => {
                let ack = DoipPayload::DiagnosticMessageAck(DiagnosticMessageAck {
                    source_address: message.target_address,
                    target_address: message.source_address,
                    ack_code: DiagnosticAckCode::Acknowledged,
                });
                // The ACK has to be on the wire before the response can be queued
                send(stream, ack).await;
                buffer.payload_mut().copy_from_slice(&message.message);
                manager.handle_message(buffer);
            }
            (result, _) => {
                debug!(
                    tester = format!("0x{:04X}", tester),
                    result = ?result,
                    "Diagnostic message not accepted"
                );
                send(stream, nack(DiagnosticNackCode::DiagnosticMessageTooLarge)).await;
            }
        }
        Flow::Continue
    }

    fn release_channel(&self, source_address: Address, connection_id: u64) {
        let mut channels = self.channels.write();
        let channel_id = ChannelId::from(source_address);
        if channels
            .get(&channel_id)
            .is_some_and(|entry| entry.connection_id == connection_id)
        {
            channels.remove(&channel_id);
        }
    }

    fn confirm(&self, message: UdsMessage, result: TransmissionResult) {
        if let Some(manager) = self.manager.upgrade() {
            manager.transmit_confirmation(message, result);
        }
    }
}

fn generic_nack(nack_code: NackCode) -> DoipPayload {
    DoipPayload::GenericNack(GenericNack { nack_code })
}

/// Response frame: the server is the source, the tester the target
fn diagnostic_message(message: &UdsMessage) -> DoipPayload {
    DoipPayload::DiagnosticMessage(DiagnosticMessage {
        source_address: message.source_address().to_be_bytes(),
        target_address: message.target_address().to_be_bytes(),
        message: message.payload().to_vec().into(),
    })
}

/// Returns false when the frame could not be written
async fn send(stream: &mut DoIpTcpStream, payload: DoipPayload) -> bool {
    match stream.send(payload).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "DoIP write failed");
            false
        }
    }
}
