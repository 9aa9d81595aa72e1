//! Transport contract consumed by the sync engine.

use crate::error::{SyncError, SyncResult};
use meshsync_protocol::Message;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Per-message send options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendConfig {
    /// Return immediately instead of waiting for buffer space.
    pub non_blocking: bool,
    /// Give up after this long.
    pub timeout: Duration,
}

impl SendConfig {
    /// Blocking send with `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            non_blocking: false,
            timeout,
        }
    }
}

/// Called once with the outcome of an asynchronous send.
pub type OnSendResult = Box<dyn FnOnce(SyncResult<()>) + Send + 'static>;

/// Receives inbound messages: `(source device, message)`.
pub type MessageHandler = Arc<dyn Fn(&str, Message) + Send + Sync + 'static>;

/// Message transport between devices.
pub trait Communicator: Send + Sync {
    /// Queues `message` for `target`. `on_send_result` fires once the
    /// transport knows whether the send succeeded; it is not called when this
    /// returns an error.
    fn send_message(
        &self,
        target: &str,
        message: Message,
        config: &SendConfig,
        on_send_result: Option<OnSendResult>,
    ) -> SyncResult<()>;

    /// Identity of this device.
    fn local_identity(&self) -> String;

    /// Protocol version of the peer's communicator; 0 for legacy peers.
    fn remote_communicator_version(&self, device: &str) -> u16;

    /// Round-trip timeout for `device`.
    fn timeout(&self, device: &str) -> Duration;

    /// Largest packet for `device`, in bytes.
    fn mtu_size(&self, device: &str) -> usize;

    /// Installs the inbound message handler.
    fn register_message_handler(&self, handler: MessageHandler) -> SyncResult<()>;
}

type FailureHook = Arc<dyn Fn(u32) + Send + Sync>;

/// Sends messages to one device and reports failed sessions to a hook.
pub(crate) struct MessageSender {
    communicator: Arc<dyn Communicator>,
    device: String,
    timeout: Duration,
    on_failure: Option<FailureHook>,
}

impl MessageSender {
    pub(crate) fn new(communicator: Arc<dyn Communicator>, device: &str, timeout: Duration) -> Self {
        Self {
            communicator,
            device: device.to_string(),
            timeout,
            on_failure: None,
        }
    }

    /// The hook runs on the transport's thread and must not block.
    pub(crate) fn with_failure_hook(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Arc::new(hook));
        self
    }

    pub(crate) fn device(&self) -> &str {
        &self.device
    }

    /// Communicator version reported for the peer.
    pub(crate) fn remote_version(&self) -> u16 {
        self.communicator.remote_communicator_version(&self.device)
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.communicator.timeout(&self.device)
    }

    pub(crate) fn mtu(&self) -> usize {
        self.communicator.mtu_size(&self.device)
    }

    pub(crate) fn send(&self, message: Message) -> SyncResult<()> {
        let session_id = message.session_id;
        let callback = self.on_failure.clone().map(|hook| {
            Box::new(move |result: SyncResult<()>| {
                if result.is_err() {
                    hook(session_id);
                }
            }) as OnSendResult
        });
        self.communicator
            .send_message(&self.device, message, &SendConfig::new(self.timeout), callback)
            .map_err(|e| {
                warn!(error = %e, session_id, "[Communicator] send failed");
                SyncError::CommAbnormal
            })
    }
}
