use crate::communicator::MessageSender;
use crate::config::PermissionFlag;
use crate::context::SyncTaskContext;
use crate::error::{SyncError, SyncResult};
use crate::operation::OperationStatus;
use crate::state_machine::Progress;
use crate::subscribe::SubscribeManager;
use crate::time_helper::mask_device;
use meshsync_protocol::{
    AckCode, ControlAckPacket, ControlCmd, ControlRequestPacket, Message, MessageId, Payload,
    SyncMode,
};
use tracing::info;

const CONTROL_CMD_VERSION: u32 = 1;

/// Sends the live task's subscribe or unsubscribe command.
pub(crate) fn control_cmd_start(
    ctx: &SyncTaskContext,
    sender: &MessageSender,
    subscribes: &SubscribeManager,
) -> SyncResult<Progress> {
    let query = ctx
        .query()
        .ok_or_else(|| SyncError::invalid_args("control command without a query"))?;
    let cmd = match ctx.mode() {
        SyncMode::SubscribeQuery => {
            subscribes.reserve_local(ctx.device(), &query)?;
            ControlCmd::SubscribeQuery
        }
        SyncMode::UnsubscribeQuery => ControlCmd::UnsubscribeQuery,
        _ => return Err(SyncError::NotSupport),
    };
    let packet = ControlRequestPacket {
        version: CONTROL_CMD_VERSION,
        cmd,
        query,
    };
    sender.send(Message::request(
        MessageId::ControlSync,
        ctx.request_session_id(),
        Payload::ControlRequest(packet),
    ))?;
    Ok(Progress::Waiting)
}

/// Applies a peer's command and acks it.
pub(crate) fn control_cmd_request_recv(
    ctx: &SyncTaskContext,
    sender: &MessageSender,
    message: &Message,
    subscribes: &SubscribeManager,
) -> SyncResult<()> {
    let packet = message.as_control_request()?;
    let device = ctx.device();
    let result = match packet.cmd {
        ControlCmd::SubscribeQuery => {
            if ctx
                .config()
                .permission_checker
                .check(device, PermissionFlag::Send)
            {
                ctx.storage()
                    .check_query(&packet.query)
                    .and_then(|()| subscribes.add_remote(device, packet.query.clone()))
            } else {
                Err(SyncError::NotPermit)
            }
        }
        ControlCmd::UnsubscribeQuery => {
            subscribes.remove_remote(device, &packet.query.identify());
            Ok(())
        }
        ControlCmd::Invalid(_) => Err(SyncError::NotSupport),
    };
    info!(device = %mask_device(device), cmd = ?packet.cmd, ok = result.is_ok(),
        "[DataSync] control command received");
    let ack = ControlAckPacket {
        version: CONTROL_CMD_VERSION,
        cmd: packet.cmd,
        recv_code: result.as_ref().map_or_else(SyncError::ack_code, |()| AckCode::Ok),
    };
    sender.send(
        Message::response(MessageId::ControlSync, message.session_id, Payload::ControlAck(ack))
            .with_sequence(message.sequence_id),
    )?;
    result
}

/// Applies the peer's ack to the live control task.
pub(crate) fn control_cmd_ack_recv(
    ctx: &SyncTaskContext,
    message: &Message,
    subscribes: &SubscribeManager,
) -> SyncResult<Progress> {
    let ack = message.as_control_ack()?;
    let query_id = ctx.query_id();
    if let Some(err) = SyncError::from_ack(ack.recv_code) {
        if ack.cmd == ControlCmd::SubscribeQuery {
            subscribes.remove_local(ctx.device(), &query_id);
        }
        return Err(err);
    }
    match ack.cmd {
        ControlCmd::SubscribeQuery => subscribes.activate_local(ctx.device(), &query_id),
        ControlCmd::UnsubscribeQuery => subscribes.remove_local(ctx.device(), &query_id),
        ControlCmd::Invalid(_) => return Err(SyncError::NotSupport),
    }
    ctx.set_operation_status(OperationStatus::FinishedAll);
    Ok(Progress::Finished)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::context::tests::context_with;
    use crate::operation::{SyncOperation, SyncRequest};
    use crate::test_support::{FakeStorage, RecordingCommunicator};
    use meshsync_protocol::QueryObject;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn subscribe_round_activates_local_subscription() {
        let query = QueryObject::new().with_prefix(b"user/".to_vec());
        let requester = context_with(Arc::new(FakeStorage::default()), SyncConfig::new("dev-a"));
        let (op, _handle) = SyncOperation::new(
            1,
            SyncRequest::new(vec!["dev-b".into()], SyncMode::SubscribeQuery).with_query(query.clone()),
        );
        requester.add_sync_operation(&op, 10);
        assert!(requester.move_to_next_target());
        requester.generate_request_session_id();

        let comm = Arc::new(RecordingCommunicator::new("dev-a"));
        let sender = MessageSender::new(comm.clone(), "dev-b", Duration::from_secs(1));
        let local = SubscribeManager::new();
        control_cmd_start(&requester, &sender, &local).unwrap();
        let request = comm.take_sent().pop().unwrap().1;

        let responder = context_with(Arc::new(FakeStorage::default()), SyncConfig::new("dev-b"));
        let remote = SubscribeManager::new();
        control_cmd_request_recv(&responder, &sender, &request, &remote).unwrap();
        assert_eq!(remote.remote_subscribers().len(), 1);
        let ack = comm.take_sent().pop().unwrap().1;

        assert_eq!(control_cmd_ack_recv(&requester, &ack, &local).unwrap(), Progress::Finished);
        assert_eq!(local.local_queries("dev-b"), vec![query]);
        assert_eq!(op.status("dev-b"), Some(OperationStatus::FinishedAll));
    }

    #[test]
    fn rejected_subscribe_releases_reservation() {
        let query = QueryObject::new().with_prefix(b"x/".to_vec());
        let ctx = context_with(Arc::new(FakeStorage::default()), SyncConfig::new("dev-a"));
        let (op, _handle) = SyncOperation::new(
            1,
            SyncRequest::new(vec!["dev-b".into()], SyncMode::SubscribeQuery).with_query(query.clone()),
        );
        ctx.add_sync_operation(&op, 10);
        ctx.move_to_next_target();
        let local = SubscribeManager::new();
        local.reserve_local("dev-b", &query).unwrap();
        let ack = Message::response(
            MessageId::ControlSync,
            1,
            Payload::ControlAck(ControlAckPacket {
                version: CONTROL_CMD_VERSION,
                cmd: ControlCmd::SubscribeQuery,
                recv_code: AckCode::NotPermit,
            }),
        );
        assert_eq!(control_cmd_ack_recv(&ctx, &ack, &local), Err(SyncError::NotPermit));
        local.activate_local("dev-b", &query.identify());
        assert!(local.local_queries("dev-b").is_empty());
    }
}
