//! Per-conversation worker driving service processors

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::ConversationError;
use crate::service::{
    ProcessingError, ProcessingStatus, ServiceDispatcher, ServiceProcessingContext,
};
use crate::udstransport::{NegativeResponseCode, UdsMessage};

use super::machine::Conversation;

/// Interval between two polls of an unfinished processor
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Worker task owned by one conversation
///
/// Requests are queued through [`push`](Self::push). `shutdown` closes the
/// queue and asks a running processor loop to stop at its next poll.
pub(crate) struct MessageHandler {
    sender: Mutex<Option<mpsc::UnboundedSender<UdsMessage>>>,
    exit_requested: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MessageHandler {
    pub(crate) fn spawn(
        conversation: Weak<Conversation>,
        dispatcher: Arc<dyn ServiceDispatcher>,
        runtime: &Handle,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let exit_requested = Arc::new(AtomicBool::new(false));
        let task = runtime.spawn(Self::run(
            conversation,
            dispatcher,
            receiver,
            Arc::clone(&exit_requested),
        ));
        Self {
            sender: Mutex::new(Some(sender)),
            exit_requested,
            task: Mutex::new(Some(task)),
        }
    }

    pub(crate) fn push(&self, message: UdsMessage) -> Result<(), ConversationError> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(ConversationError::MessageHandlerClosed)?;
        sender
            .send(message)
            .map_err(|_| ConversationError::MessageHandlerClosed)
    }

    pub(crate) fn shutdown(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
        self.sender.lock().take();
    }

    pub(crate) async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Message handler task failed");
                }
            }
        }
    }

    async fn run(
        conversation: Weak<Conversation>,
        dispatcher: Arc<dyn ServiceDispatcher>,
        mut receiver: mpsc::UnboundedReceiver<UdsMessage>,
        exit_requested: Arc<AtomicBool>,
    ) {
        while let Some(message) = receiver.recv().await {
            if exit_requested.load(Ordering::SeqCst) {
                break;
            }
            let Some(conversation) = conversation.upgrade() else {
                break;
            };

            let outcome = AssertUnwindSafe(Self::process(
                &conversation,
                dispatcher.as_ref(),
                message,
                &exit_requested,
            ))
            .catch_unwind()
            .await;

            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "service processor panicked".to_string(),
            };
            error!(channel = %conversation.channel(), error = %failure, "Request processing failed");
            if let Err(e) =
                conversation.finish_processing_with_nrc(NegativeResponseCode::GeneralReject)
            {
                warn!(error = %e, "Could not send GeneralReject");
            }
        }
        debug!("Message handler stopped");
    }

    async fn process(
        conversation: &Arc<Conversation>,
        dispatcher: &dyn ServiceDispatcher,
        message: UdsMessage,
        exit_requested: &AtomicBool,
    ) -> Result<(), ProcessingError> {
        let context: Arc<dyn ServiceProcessingContext> = conversation.clone();
        let mut processor = match dispatcher.find_service_processor(message, context) {
            Ok(processor) => processor,
            Err(nrc) => {
                debug!(nrc = %nrc, "No service processor for request");
                conversation.finish_processing_with_nrc(nrc)?;
                return Ok(());
            }
        };

        loop {
            if exit_requested.load(Ordering::SeqCst) {
                return Ok(());
            }
            if processor.handle_message()? == ProcessingStatus::Done {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

impl Drop for MessageHandler {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
