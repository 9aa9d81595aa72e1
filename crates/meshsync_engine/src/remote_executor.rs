//! Ad hoc remote queries.
//!
//! A caller submits a statement for one peer. Tasks queue per device and at
//! most `max_task_execute` of them work at once per device; the timeout timer
//! is armed when a task starts working. The peer answers with pages of rows,
//! one ack per page with sequence ids from 1, and flags the last page. The
//! task completes once every page up to the last one arrived.
//!
//! Lock order: task queues, then the task registry, then timeouts. The
//! inbound queue lock is never held with another one.

use crate::communicator::{Communicator, SendConfig};
use crate::config::{PermissionFlag, RemoteExecutorConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::scheduler::{TaskId, TaskScheduler, INVALID_TASK_ID};
use crate::session::SessionRegistry;
use crate::storage::{ContinueToken, SyncStorage};
use crate::time_helper::mask_device;
use meshsync_protocol::{
    AckCode, Feedback, Message, MessageId, MessageType, Payload, PreparedStmt, RelationalRowDataSet,
    RemoteExecutorAckPacket, RemoteExecutorRequestPacket, SecurityLabel, SecurityOption,
    REMOTE_EXECUTOR_PACKET_VERSION,
};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type QueryOutcome = SyncResult<RelationalRowDataSet>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskStatus {
    Waiting,
    Working,
}

struct RemoteTask {
    task_id: u32,
    status: TaskStatus,
    target: String,
    stmt: PreparedStmt,
    timeout: Duration,
    connection_id: u64,
    target_count: u32,
    pages: BTreeMap<u32, RelationalRowDataSet>,
    on_finished: Option<oneshot::Sender<QueryOutcome>>,
}

#[derive(Default)]
struct TaskQueues {
    waiting: HashMap<String, VecDeque<u32>>,
    working: HashMap<String, HashSet<u32>>,
    last_task_id: u32,
}

impl TaskQueues {
    fn next_task_id(&mut self) -> u32 {
        self.last_task_id = self.last_task_id.wrapping_add(1).max(1);
        self.last_task_id
    }

    fn working_len(&self, device: &str) -> usize {
        self.working.get(device).map_or(0, HashSet::len)
    }
}

#[derive(Default)]
struct InboundQueue {
    messages: VecDeque<(String, Message)>,
    workers: usize,
}

/// Caller side of a submitted remote query.
#[derive(Debug)]
pub struct RemoteQueryHandle {
    session_id: u32,
    receiver: oneshot::Receiver<QueryOutcome>,
}

impl RemoteQueryHandle {
    /// Wire session id of the query.
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Blocks until the query finished, failed or timed out.
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> QueryOutcome {
        self.receiver
            .blocking_recv()
            .unwrap_or_else(|_| Err(SyncError::internal("remote query dropped before completing")))
    }
}

/// Runs remote queries for local callers and answers the peers' queries.
pub struct RemoteExecutor {
    config: RemoteExecutorConfig,
    sync_config: Arc<SyncConfig>,
    storage: Arc<dyn SyncStorage>,
    communicator: Arc<dyn Communicator>,
    scheduler: Arc<TaskScheduler>,
    queues: Mutex<TaskQueues>,
    tasks: SessionRegistry<RemoteTask>,
    timeouts: Mutex<HashMap<u32, TaskId>>,
    inbound: Mutex<InboundQueue>,
    drained: Condvar,
    closed: AtomicBool,
    self_ref: Weak<RemoteExecutor>,
}

impl RemoteExecutor {
    pub(crate) fn new(
        config: RemoteExecutorConfig,
        sync_config: Arc<SyncConfig>,
        storage: Arc<dyn SyncStorage>,
        communicator: Arc<dyn Communicator>,
        scheduler: Arc<TaskScheduler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            sync_config,
            storage,
            communicator,
            scheduler,
            queues: Mutex::new(TaskQueues::default()),
            tasks: SessionRegistry::new(),
            timeouts: Mutex::new(HashMap::new()),
            inbound: Mutex::new(InboundQueue::default()),
            drained: Condvar::new(),
            closed: AtomicBool::new(false),
            self_ref: weak.clone(),
        })
    }

    /// Runs `stmt` on `device` and blocks until its rows arrive.
    pub fn remote_query(
        &self,
        device: &str,
        stmt: PreparedStmt,
        timeout: Duration,
        connection_id: u64,
    ) -> QueryOutcome {
        self.submit_remote_query(device, stmt, timeout, connection_id)?
            .wait()
    }

    /// Queues `stmt` for `device`.
    ///
    /// # Errors
    ///
    /// `Busy` once closed, `InvalidArgs` for a bad device or timeout and
    /// `MaxLimits` when the device or global queue is full.
    pub fn submit_remote_query(
        &self,
        device: &str,
        stmt: PreparedStmt,
        timeout: Duration,
        connection_id: u64,
    ) -> SyncResult<RemoteQueryHandle> {
        self.check_param_valid(device, timeout)?;
        let (sender, receiver) = oneshot::channel();
        let session_id = {
            let mut queues = self.queues.lock();
            // `close` flips the flag under this lock, so no task lands after
            // its sweep.
            if self.closed.load(Ordering::Acquire) {
                return Err(SyncError::Busy);
            }
            if !self.check_task_exe_status(&queues, device) {
                warn!(device = %mask_device(device), "[RemoteExecutor] queue size is over limit");
                return Err(SyncError::MaxLimits);
            }
            let task_id = queues.next_task_id();
            let task = RemoteTask {
                task_id,
                status: TaskStatus::Waiting,
                target: device.to_string(),
                stmt,
                timeout,
                connection_id,
                target_count: 0,
                pages: BTreeMap::new(),
                on_finished: Some(sender),
            };
            let session_id = session_id_of(self.tasks.insert_bounded(task, u64::from(u32::MAX)));
            queues
                .waiting
                .entry(device.to_string())
                .or_default()
                .push_back(session_id);
            debug!(device = %mask_device(device), task_id, session_id,
                "[RemoteExecutor] remote query task created");
            session_id
        };
        if !self.schedule_try_execute(device) {
            self.do_roll_back(session_id);
            return Err(SyncError::SchedulerFull);
        }
        Ok(RemoteQueryHandle {
            session_id,
            receiver,
        })
    }

    fn check_param_valid(&self, device: &str, timeout: Duration) -> SyncResult<()> {
        if timeout < self.config.min_timeout || timeout > self.config.max_timeout {
            return Err(SyncError::invalid_args(format!(
                "timeout {timeout:?} outside {:?}..={:?}",
                self.config.min_timeout, self.config.max_timeout
            )));
        }
        if device.is_empty() {
            return Err(SyncError::invalid_args("device is empty"));
        }
        if device == self.communicator.local_identity() {
            return Err(SyncError::invalid_args("cannot query the local device"));
        }
        Ok(())
    }

    /// Admits a task when the device stays within its queue plus execute caps
    /// and the overflow of every device stays within the global cap.
    fn check_task_exe_status(&self, queues: &TaskQueues, device: &str) -> bool {
        let per_device = self.config.max_task_per_device;
        let queued = queues.waiting.get(device).map_or(0, VecDeque::len);
        let working = queues.working_len(device);
        let overflow: usize = queues
            .waiting
            .iter()
            .map(|(dev, queue)| (queue.len() + queues.working_len(dev)).saturating_sub(per_device))
            .sum();
        queued + working < per_device + self.config.max_task_execute
            && overflow < self.config.max_queue_count
    }

    fn schedule_try_execute(&self, device: &str) -> bool {
        let weak = self.self_ref.clone();
        let device = device.to_string();
        let id = self.scheduler.execute(move || {
            if let Some(executor) = weak.upgrade() {
                executor.try_execute_task(&device);
            }
        });
        id != INVALID_TASK_ID
    }

    /// Promotes the oldest waiting task of `device` if it has a free slot.
    fn try_execute_task(&self, device: &str) {
        let session_id = {
            let mut queues = self.queues.lock();
            if queues.working_len(device) >= self.config.max_task_execute {
                return;
            }
            let session_id = loop {
                let Some(session_id) = queues.waiting.get_mut(device).and_then(VecDeque::pop_front) else {
                    debug!(device = %mask_device(device), "[RemoteExecutor] no task to execute");
                    return;
                };
                let timeout = self.tasks.with_session(u64::from(session_id), |task| {
                    task.status = TaskStatus::Working;
                    task.timeout
                });
                if let Some(timeout) = timeout {
                    queues
                        .working
                        .entry(device.to_string())
                        .or_default()
                        .insert(session_id);
                    self.start_timer(timeout, session_id);
                    break session_id;
                }
            };
            session_id
        };
        if let Err(e) = self.request_start(session_id) {
            self.do_finished(session_id, Err(e));
        }
    }

    /// Drops a task that never started working.
    fn do_roll_back(&self, session_id: u32) {
        let mut queues = self.queues.lock();
        let status = self.tasks.with_session(u64::from(session_id), |task| task.status);
        if status != Some(TaskStatus::Waiting) {
            return;
        }
        if let Some(task) = self.tasks.remove(u64::from(session_id)) {
            if let Some(queue) = queues.waiting.get_mut(&task.target) {
                queue.retain(|id| *id != session_id);
            }
        }
    }

    fn request_start(&self, session_id: u32) -> SyncResult<()> {
        let (target, stmt) = self
            .tasks
            .with_session(u64::from(session_id), |task| (task.target.clone(), task.stmt.clone()))
            .ok_or(SyncError::NotFound)?;
        let message = Message::request(
            MessageId::RemoteExecute,
            session_id,
            Payload::RemoteRequest(RemoteExecutorRequestPacket::new(stmt)),
        );
        let weak = self.self_ref.clone();
        let on_result = Box::new(move |result: SyncResult<()>| {
            if let Err(e) = result {
                debug!(session_id, error = %e, "[RemoteExecutor] request send failed");
                if let Some(executor) = weak.upgrade() {
                    executor.do_finished(session_id, Err(SyncError::PeripheralInterfaceFail));
                }
            }
        });
        self.communicator
            .send_message(
                &target,
                message,
                &SendConfig::new(self.config.send_timeout),
                Some(on_result),
            )
            .map_err(|e| {
                warn!(device = %mask_device(&target), session_id, error = %e,
                    "[RemoteExecutor] sending request failed");
                SyncError::PeripheralInterfaceFail
            })
    }

    /// Entry point for REMOTE_EXECUTE messages from `device`.
    pub(crate) fn receive_message(&self, device: &str, message: Message) -> SyncResult<()> {
        if self.closed.load(Ordering::Acquire) {
            debug!("[RemoteExecutor] closing, message ignored");
            return Err(SyncError::Busy);
        }
        let weak = self.self_ref.clone();
        let device = device.to_string();
        let id = self.scheduler.execute(move || {
            if let Some(executor) = weak.upgrade() {
                executor.receive_message_inner(&device, message);
            }
        });
        if id == INVALID_TASK_ID {
            return Err(SyncError::SchedulerFull);
        }
        Ok(())
    }

    fn receive_message_inner(&self, device: &str, message: Message) {
        if let Some(feedback) = message.feedback {
            if self.is_packet_valid(message.session_id) {
                let err = match feedback {
                    Feedback::UnknownMessage => SyncError::UnknownMessage,
                    Feedback::CommunicatorNotFound => SyncError::CommunicatorNotFound,
                };
                self.do_finished(message.session_id, Err(err));
            }
            return;
        }
        match message.message_type {
            MessageType::Request => self.receive_remote_executor_request(device, message),
            MessageType::Response => {
                if let Err(e) = self.receive_remote_executor_ack(device, message) {
                    debug!(device = %mask_device(device), error = %e, "[RemoteExecutor] ack dropped");
                }
            }
            MessageType::Notify => debug!("[RemoteExecutor] unknown message type ignored"),
        }
    }

    /// Queues an inbound request; at most `max_task_execute` worker threads
    /// drain the queue. The scheduler thread only runs timers.
    fn receive_remote_executor_request(&self, device: &str, message: Message) {
        let worker_index = {
            let mut inbound = self.inbound.lock();
            inbound.messages.push_back((device.to_string(), message));
            if inbound.workers >= self.config.max_task_execute {
                return;
            }
            inbound.workers += 1;
            inbound.workers
        };
        let weak = self.self_ref.clone();
        let spawned = thread::Builder::new()
            .name(format!("meshsync-remote-query-{worker_index}"))
            .spawn(move || {
                if let Some(executor) = weak.upgrade() {
                    executor.drain_inbound();
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "[RemoteExecutor] starting inbound worker failed");
            let mut inbound = self.inbound.lock();
            inbound.workers -= 1;
            drop(inbound);
            self.drained.notify_all();
        }
    }

    fn drain_inbound(&self) {
        loop {
            let entry = {
                let mut inbound = self.inbound.lock();
                match inbound.messages.pop_front() {
                    Some(entry) => entry,
                    None => {
                        inbound.workers -= 1;
                        break;
                    }
                }
            };
            self.parse_one_request_message(&entry.0, &entry.1);
        }
        self.drained.notify_all();
    }

    fn parse_one_request_message(&self, device: &str, message: &Message) {
        if self.closed.load(Ordering::Acquire) {
            warn!("[RemoteExecutor] closed, request dropped");
            return;
        }
        let result = self
            .check_permissions(device)
            .and_then(|()| message.as_remote_request().map_err(SyncError::from))
            .and_then(|packet| {
                self.response_remote_query_request(&packet.stmt, device, message.session_id)
            });
        if let Err(e) = result {
            self.response_failed(&e, message.session_id, message.sequence_id, device);
        }
    }

    fn check_permissions(&self, device: &str) -> SyncResult<()> {
        if self
            .sync_config
            .permission_checker
            .check(device, PermissionFlag::RemoteQuery)
        {
            Ok(())
        } else {
            warn!(device = %mask_device(device), "[RemoteExecutor] permission check failed");
            Err(SyncError::NotPermit)
        }
    }

    /// Streams the rows of `stmt` to `device`, one ack per page.
    fn response_remote_query_request(&self, stmt: &PreparedStmt, device: &str, session_id: u32) -> SyncResult<()> {
        if !stmt.is_query() {
            warn!(device = %mask_device(device), "[RemoteExecutor] only queries may run remotely");
            return Err(SyncError::DeniedSql);
        }
        let budget = self.config.packet_budget(self.communicator.mtu_size(device));
        let security = self.storage.get_security_option();
        let mut token: Option<ContinueToken> = None;
        let mut sequence_id = 1u32;
        loop {
            let page = self.storage.execute_query(stmt, budget, token.take())?;
            let last = page.token.is_none();
            let sent = self.response_data(page.rows, session_id, sequence_id, last, security, device);
            if let Err(e) = sent {
                if let Some(token) = page.token {
                    self.storage.release_continue_token(token);
                }
                return Err(e);
            }
            match page.token {
                Some(next) => token = Some(next),
                None => break,
            }
            sequence_id += 1;
        }
        debug!(device = %mask_device(device), session_id, pages = sequence_id,
            "[RemoteExecutor] remote query answered");
        Ok(())
    }

    fn response_data(
        &self,
        rows: RelationalRowDataSet,
        session_id: u32,
        sequence_id: u32,
        last: bool,
        security: SecurityOption,
        device: &str,
    ) -> SyncResult<()> {
        let packet = RemoteExecutorAckPacket {
            version: REMOTE_EXECUTOR_PACKET_VERSION,
            ack_code: AckCode::Ok,
            last,
            security,
            rows,
        };
        self.response_start(packet, session_id, sequence_id, device)
    }

    fn response_failed(&self, err: &SyncError, session_id: u32, sequence_id: u32, device: &str) {
        warn!(device = %mask_device(device), session_id, error = %err,
            "[RemoteExecutor] answering remote query with failure");
        let packet = RemoteExecutorAckPacket::failed(err.ack_code(), self.storage.get_security_option());
        if let Err(e) = self.response_start(packet, session_id, sequence_id, device) {
            warn!(error = %e, "[RemoteExecutor] failure ack not sent");
        }
    }

    fn response_start(
        &self,
        packet: RemoteExecutorAckPacket,
        session_id: u32,
        sequence_id: u32,
        device: &str,
    ) -> SyncResult<()> {
        let message = Message::response(MessageId::RemoteExecute, session_id, Payload::RemoteAck(packet))
            .with_sequence(sequence_id);
        self.communicator
            .send_message(device, message, &SendConfig::new(self.config.send_timeout), None)
    }

    fn receive_remote_executor_ack(&self, device: &str, message: Message) -> SyncResult<()> {
        let session_id = message.session_id;
        let sequence_id = message.sequence_id;
        let Payload::RemoteAck(packet) = message.payload else {
            return Err(SyncError::invalid_args("remote execute response without an ack"));
        };
        if !self.is_packet_valid(session_id) {
            return Err(SyncError::StaleSession { session_id });
        }
        let checked = match SyncError::from_ack(packet.ack_code) {
            Some(err) => Err(err),
            None => self.check_security_option(device, &packet.security),
        };
        match checked {
            Ok(()) => self.receive_data_with_valid_session(device, session_id, sequence_id, packet),
            Err(e) => self.do_finished(session_id, Err(e)),
        }
        Ok(())
    }

    /// Rows are accepted when the labels match and the device is able to
    /// hold data of the remote option.
    fn check_security_option(&self, device: &str, remote: &SecurityOption) -> SyncResult<()> {
        let local = self.storage.get_security_option();
        if remote.label == SecurityLabel::NotSupport || local.label == SecurityLabel::NotSupport {
            return Ok(());
        }
        if local.is_compatible_with(remote)
            && self.sync_config.security_ability_checker.check(device, remote)
        {
            return Ok(());
        }
        warn!(device = %mask_device(device), remote = ?remote, local = ?local,
            "[RemoteExecutor] security option check failed");
        Err(SyncError::SecurityOptionCheck)
    }

    fn is_packet_valid(&self, session_id: u32) -> bool {
        self.tasks.with_session(u64::from(session_id), |task| task.status) == Some(TaskStatus::Working)
    }

    fn receive_data_with_valid_session(
        &self,
        device: &str,
        session_id: u32,
        sequence_id: u32,
        packet: RemoteExecutorAckPacket,
    ) {
        let finished = self.tasks.with_session(u64::from(session_id), |task| {
            if task.status != TaskStatus::Working {
                return false;
            }
            debug!(device = %mask_device(device), task_id = task.task_id, sequence_id,
                "[RemoteExecutor] result page received");
            if packet.last {
                task.target_count = sequence_id;
            }
            task.pages.insert(sequence_id, packet.rows);
            task.target_count != 0 && task.pages.len() == task.target_count as usize
        });
        if finished == Some(true) {
            self.do_finished(session_id, Ok(()));
        }
    }

    fn do_finished(&self, session_id: u32, result: SyncResult<()>) {
        let Some(task) = self.clear_task_info(session_id) else {
            return;
        };
        info!(device = %mask_device(&task.target), task_id = task.task_id, session_id,
            ok = result.is_ok(), "[RemoteExecutor] task finished");
        if let Some(on_finished) = task.on_finished {
            let outcome = result.map(|()| RelationalRowDataSet::from_pages(task.pages));
            if on_finished.send(outcome).is_err() {
                debug!(session_id, "[RemoteExecutor] caller gone before completion");
            }
        }
        if !self.schedule_try_execute(&task.target) {
            debug!(device = %mask_device(&task.target), "[RemoteExecutor] scheduling next task failed");
        }
    }

    fn clear_task_info(&self, session_id: u32) -> Option<RemoteTask> {
        let task = {
            let mut queues = self.queues.lock();
            let task = self.tasks.remove(u64::from(session_id))?;
            if let Some(working) = queues.working.get_mut(&task.target) {
                working.remove(&session_id);
            }
            if let Some(waiting) = queues.waiting.get_mut(&task.target) {
                waiting.retain(|id| *id != session_id);
            }
            task
        };
        self.remove_timer(session_id);
        Some(task)
    }

    fn start_timer(&self, timeout: Duration, session_id: u32) {
        let weak = self.self_ref.clone();
        let id = self.scheduler.at(Instant::now() + timeout, move || {
            if let Some(executor) = weak.upgrade() {
                executor.do_timeout(session_id);
            }
        });
        if id == INVALID_TASK_ID {
            warn!(session_id, "[RemoteExecutor] arming timeout failed");
            return;
        }
        self.timeouts.lock().insert(session_id, id);
    }

    fn remove_timer(&self, session_id: u32) {
        let id = self.timeouts.lock().remove(&session_id);
        if let Some(id) = id {
            self.scheduler.remove(id);
        }
    }

    fn do_timeout(&self, session_id: u32) {
        if self.timeouts.lock().remove(&session_id).is_none() {
            return;
        }
        debug!(session_id, "[RemoteExecutor] task timed out");
        self.do_finished(session_id, Err(SyncError::Timeout));
    }

    fn remove_all_task(&self, err: &SyncError) {
        let tasks = {
            let mut queues = self.queues.lock();
            queues.waiting.clear();
            queues.working.clear();
            self.tasks.drain()
        };
        for (_, task) in tasks {
            debug!(task_id = task.task_id, error = %err, "[RemoteExecutor] task removed");
            if let Some(on_finished) = task.on_finished {
                let _ = on_finished.send(Err(err.clone()));
            }
        }
        let timers: Vec<TaskId> = self.timeouts.lock().drain().map(|(_, id)| id).collect();
        for id in timers {
            self.scheduler.remove(id);
        }
    }

    /// Fails the tasks of `device` with `PeripheralInterfaceFail`.
    pub fn notify_device_offline(&self, device: &str) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        debug!(device = %mask_device(device), "[RemoteExecutor] device offline");
        let sessions: Vec<u32> = {
            let queues = self.queues.lock();
            let working = queues.working.get(device).into_iter().flatten().copied();
            let waiting = queues.waiting.get(device).into_iter().flatten().copied();
            working.chain(waiting).collect()
        };
        for session_id in sessions {
            self.do_finished(session_id, Err(SyncError::PeripheralInterfaceFail));
        }
    }

    /// Fails the tasks submitted on `connection_id` with `Busy`.
    pub fn notify_connection_closed(&self, connection_id: u64) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let sessions = self.tasks.find_ids(|task| task.connection_id == connection_id);
        for id in sessions {
            self.do_finished(session_id_of(id), Err(SyncError::Busy));
        }
    }

    /// Fails every task with `UserChanged`.
    pub fn notify_user_change(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.remove_all_task(&SyncError::UserChanged);
    }

    /// Rejects new work, fails every task with `Busy` and waits until no
    /// inbound worker runs. No completion fires after this returns.
    ///
    /// Must not be called from a scheduler task.
    pub fn close(&self) {
        {
            let _queues = self.queues.lock();
            self.closed.store(true, Ordering::Release);
        }
        info!("[RemoteExecutor] close");
        self.remove_all_task(&SyncError::Busy);
        let mut inbound = self.inbound.lock();
        inbound.messages.clear();
        while inbound.workers > 0 {
            self.drained.wait(&mut inbound);
        }
    }

    /// Returns true once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn session_id_of(id: u64) -> u32 {
    u32::try_from(id).unwrap_or_default()
}
