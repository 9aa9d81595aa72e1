//! In-process transport between engines.
//!
//! Every [`VirtualCommunicator`] registered on a [`VirtualHub`] can reach the
//! others. Sends are encoded to wire bytes, queued, and delivered in order by
//! one delivery thread per hub, so handlers never run on the sender's stack.

use meshsync_engine::{Communicator, MessageHandler, OnSendResult, SendConfig, SyncError, SyncResult};
use meshsync_protocol::Message;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

type DropFilter = Arc<dyn Fn(&str, &str, &Message) -> bool + Send + Sync>;

struct Endpoint {
    handler: Option<MessageHandler>,
    online: bool,
    mtu: usize,
    version: u16,
    timeout: Duration,
}

impl Endpoint {
    fn new() -> Self {
        Self {
            handler: None,
            online: true,
            mtu: 64 * 1024,
            version: 1,
            timeout: Duration::from_secs(5),
        }
    }
}

struct Delivery {
    source: String,
    target: String,
    bytes: Vec<u8>,
}

struct HubInner {
    endpoints: Mutex<HashMap<String, Endpoint>>,
    queue: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    drop_filter: Mutex<Option<DropFilter>>,
    in_flight: Mutex<usize>,
    idle: Condvar,
}

impl HubInner {
    fn endpoint<R>(&self, device: &str, f: impl FnOnce(&Endpoint) -> R) -> Option<R> {
        self.endpoints.lock().get(device).map(f)
    }

    fn finish_one(&self) {
        let mut in_flight = self.in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }

    fn deliver(&self, delivery: Delivery) {
        let handler = self
            .endpoint(&delivery.target, |e| e.online.then(|| e.handler.clone()).flatten())
            .flatten();
        match (handler, Message::from_bytes(&delivery.bytes)) {
            (Some(handler), Ok(message)) => {
                trace!(source = %delivery.source, target = %delivery.target,
                    "[VirtualHub] delivering");
                handler(&delivery.source, message);
            }
            (None, _) => debug!(target = %delivery.target, "[VirtualHub] target unreachable, dropped"),
            (_, Err(e)) => warn!(error = %e, "[VirtualHub] undecodable message dropped"),
        }
        self.finish_one();
    }
}

/// Routes messages between virtual devices.
pub struct VirtualHub {
    inner: Arc<HubInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for VirtualHub {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualHub {
    /// Creates a hub and starts its delivery thread.
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Delivery>();
        let inner = Arc::new(HubInner {
            endpoints: Mutex::new(HashMap::new()),
            queue: Mutex::new(Some(sender)),
            drop_filter: Mutex::new(None),
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
        });
        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("meshsync-virtual-hub".to_string())
            .spawn(move || {
                while let Some(delivery) = receiver.blocking_recv() {
                    worker_inner.deliver(delivery);
                }
            })
            .ok();
        Self {
            inner,
            worker: Mutex::new(worker),
        }
    }

    /// Registers `device` and returns its transport.
    pub fn communicator(&self, device: &str) -> Arc<VirtualCommunicator> {
        self.inner
            .endpoints
            .lock()
            .entry(device.to_string())
            .or_insert_with(Endpoint::new);
        Arc::new(VirtualCommunicator {
            device: device.to_string(),
            hub: Arc::clone(&self.inner),
        })
    }

    /// Takes `device` on or off the network. Queued messages for an offline
    /// device are dropped at delivery.
    pub fn set_online(&self, device: &str, online: bool) {
        self.update(device, |e| e.online = online);
    }

    /// Sets the MTU of `device`.
    pub fn set_mtu(&self, device: &str, mtu: usize) {
        self.update(device, |e| e.mtu = mtu);
    }

    /// Sets the communicator version `device` reports.
    pub fn set_version(&self, device: &str, version: u16) {
        self.update(device, |e| e.version = version);
    }

    /// Sets the round-trip timeout of `device`.
    pub fn set_timeout(&self, device: &str, timeout: Duration) {
        self.update(device, |e| e.timeout = timeout);
    }

    /// Silently drops messages for which `filter(source, target, message)`
    /// returns true.
    pub fn set_drop_filter(&self, filter: impl Fn(&str, &str, &Message) -> bool + Send + Sync + 'static) {
        *self.inner.drop_filter.lock() = Some(Arc::new(filter));
    }

    /// Removes the drop filter.
    pub fn clear_drop_filter(&self) {
        self.inner.drop_filter.lock().take();
    }

    /// Waits until no message is queued or being handled.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.inner.in_flight.lock();
        while *in_flight > 0 {
            if self.inner.idle.wait_until(&mut in_flight, deadline).timed_out() {
                return *in_flight == 0;
            }
        }
        true
    }

    /// Stops the delivery thread after it drained the queue.
    pub fn shutdown(&self) {
        self.inner.queue.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!("[VirtualHub] delivery thread panicked");
            }
        }
    }

    fn update(&self, device: &str, f: impl FnOnce(&mut Endpoint)) {
        let mut endpoints = self.inner.endpoints.lock();
        f(endpoints.entry(device.to_string()).or_insert_with(Endpoint::new));
    }
}

impl Drop for VirtualHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One device's view of a [`VirtualHub`].
pub struct VirtualCommunicator {
    device: String,
    hub: Arc<HubInner>,
}

impl VirtualCommunicator {
    /// Delivers a message to this device's handler as if `source` sent it.
    pub fn inject(&self, source: &str, message: Message) -> SyncResult<()> {
        let handler = self
            .hub
            .endpoint(&self.device, |e| e.handler.clone())
            .flatten()
            .ok_or(SyncError::CommunicatorNotFound)?;
        handler(source, message);
        Ok(())
    }
}

impl Communicator for VirtualCommunicator {
    fn send_message(
        &self,
        target: &str,
        message: Message,
        _config: &SendConfig,
        on_send_result: Option<OnSendResult>,
    ) -> SyncResult<()> {
        let reachable = self.hub.endpoint(&self.device, |e| e.online).unwrap_or(false)
            && self.hub.endpoint(target, |e| e.online).unwrap_or(false);
        if !reachable {
            return Err(SyncError::CommAbnormal);
        }
        let filter = self.hub.drop_filter.lock().clone();
        if filter.is_some_and(|f| f(&self.device, target, &message)) {
            debug!(source = %self.device, target, "[VirtualHub] message dropped by filter");
            if let Some(callback) = on_send_result {
                callback(Ok(()));
            }
            return Ok(());
        }
        let bytes = message.to_bytes()?;
        let delivery = Delivery {
            source: self.device.clone(),
            target: target.to_string(),
            bytes,
        };
        *self.hub.in_flight.lock() += 1;
        let queued = self
            .hub
            .queue
            .lock()
            .as_ref()
            .is_some_and(|queue| queue.send(delivery).is_ok());
        if !queued {
            self.hub.finish_one();
            return Err(SyncError::CommAbnormal);
        }
        if let Some(callback) = on_send_result {
            callback(Ok(()));
        }
        Ok(())
    }

    fn local_identity(&self) -> String {
        self.device.clone()
    }

    fn remote_communicator_version(&self, device: &str) -> u16 {
        self.hub.endpoint(device, |e| e.version).unwrap_or(0)
    }

    fn timeout(&self, device: &str) -> Duration {
        self.hub
            .endpoint(device, |e| e.timeout)
            .unwrap_or(Duration::from_secs(5))
    }

    fn mtu_size(&self, device: &str) -> usize {
        let local = self.hub.endpoint(&self.device, |e| e.mtu).unwrap_or(0);
        let remote = self.hub.endpoint(device, |e| e.mtu).unwrap_or(0);
        local.min(remote)
    }

    fn register_message_handler(&self, handler: MessageHandler) -> SyncResult<()> {
        let mut endpoints = self.hub.endpoints.lock();
        let endpoint = endpoints
            .get_mut(&self.device)
            .ok_or(SyncError::CommunicatorNotFound)?;
        endpoint.handler = Some(handler);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsync_protocol::{MessageId, Payload};

    fn recorder(comm: &VirtualCommunicator) -> Arc<Mutex<Vec<(String, Message)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        comm.register_message_handler(Arc::new(move |source: &str, message: Message| {
            sink.lock().push((source.to_string(), message));
        }))
        .unwrap();
        seen
    }

    fn ping(session_id: u32) -> Message {
        Message::notify(MessageId::TimeSync, session_id, Payload::Empty)
    }

    #[test]
    fn delivers_in_order() {
        let hub = VirtualHub::new();
        let a = hub.communicator("a");
        let b = hub.communicator("b");
        let seen = recorder(&b);
        for session in 1..=3 {
            a.send_message("b", ping(session), &SendConfig::new(Duration::from_secs(1)), None)
                .unwrap();
        }
        assert!(hub.wait_idle(Duration::from_secs(2)));
        let sessions: Vec<u32> = seen.lock().iter().map(|(_, m)| m.session_id).collect();
        assert_eq!(sessions, vec![1, 2, 3]);
        assert_eq!(seen.lock()[0].0, "a");
    }

    #[test]
    fn offline_target_fails_the_send() {
        let hub = VirtualHub::new();
        let a = hub.communicator("a");
        let _b = hub.communicator("b");
        hub.set_online("b", false);
        let err = a
            .send_message("b", ping(1), &SendConfig::new(Duration::from_secs(1)), None)
            .unwrap_err();
        assert_eq!(err, SyncError::CommAbnormal);
    }

    #[test]
    fn mtu_is_the_smaller_side() {
        let hub = VirtualHub::new();
        let a = hub.communicator("a");
        let _b = hub.communicator("b");
        hub.set_mtu("b", 1024);
        assert_eq!(a.mtu_size("b"), 1024);
    }
}
