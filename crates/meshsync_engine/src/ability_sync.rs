//! Version and capability handshake.
//!
//! The requester sends its versions, capabilities, security option,
//! compression algorithms and schema fingerprint. The responder checks them
//! and answers; the requester confirms with a `CheckSuccess` notify and the
//! responder closes the round with `LastNotify`. Peers at or below
//! [`SOFTWARE_VERSION_RELEASE_2_0`] finish on the response.

use crate::communicator::MessageSender;
use crate::context::SyncTaskContext;
use crate::error::{SyncError, SyncResult};
use crate::state_machine::{Progress, SINGLE_VER_SYNC_PROCTOL_V3};
use crate::time_helper::mask_device;
use meshsync_protocol::{
    AbilityAckCode, AbilitySyncAck, AbilitySyncRequest, CapabilitySet, Message, MessageId,
    Payload, SecurityOption, SOFTWARE_VERSION_CURRENT, SOFTWARE_VERSION_RELEASE_2_0,
};
use tracing::{info, warn};

/// Opens a round on `session_id`.
pub(crate) fn sync_start(ctx: &SyncTaskContext, sender: &MessageSender, session_id: u32) -> SyncResult<()> {
    let request = AbilitySyncRequest {
        protocol_version: SINGLE_VER_SYNC_PROCTOL_V3,
        software_version: SOFTWARE_VERSION_CURRENT,
        capabilities: CapabilitySet::all(),
        security: ctx.local_security(),
        compress_algorithms: ctx.local_compress_algorithms(),
        schema_fingerprint: ctx.storage().schema_fingerprint(),
    };
    sender.send(Message::request(
        MessageId::AbilitySync,
        session_id,
        Payload::AbilityRequest(request),
    ))
}

/// Responder side: checks the request and answers it.
pub(crate) fn request_recv(ctx: &SyncTaskContext, sender: &MessageSender, message: &Message) -> SyncResult<()> {
    let request = message.as_ability_request()?;
    ctx.set_remote_software_version(request.software_version);
    let mut ack = local_ack(ctx, AbilityAckCode::Accepted);
    match check_remote(ctx, &request.schema_fingerprint, &request.security) {
        Ok(()) => {
            ctx.set_remote_capabilities(CapabilitySet::all().intersect(&request.capabilities));
            ctx.set_remote_security(request.security);
            ack.compress_algorithm = ctx.choose_compression(&request.compress_algorithms);
        }
        Err(e) => {
            warn!(device = %mask_device(ctx.device()), error = %e,
                "[AbilitySync] rejecting ability request");
            ack.ack_code = AbilityAckCode::Rejected(e.ack_code());
        }
    }
    if request.software_version <= SOFTWARE_VERSION_RELEASE_2_0
        && ack.ack_code == AbilityAckCode::Accepted
    {
        finish(ctx);
    }
    sender.send(
        Message::response(MessageId::AbilitySync, message.session_id, Payload::AbilityAck(ack))
            .with_sequence(message.sequence_id),
    )
}

/// Requester side: handles the response.
pub(crate) fn ack_recv(ctx: &SyncTaskContext, sender: &MessageSender, message: &Message) -> SyncResult<Progress> {
    let ack = message.as_ability_ack()?;
    match ack.ack_code {
        AbilityAckCode::Accepted => {}
        AbilityAckCode::Rejected(code) => {
            return Err(SyncError::from_ack(code).unwrap_or(SyncError::RemoteFailed));
        }
        other => {
            return Err(SyncError::internal(format!("unexpected ability response {other:?}")));
        }
    }
    ctx.set_remote_software_version(ack.software_version);
    if let Err(e) = check_remote(ctx, &ack.schema_fingerprint, &ack.security) {
        let reject = AbilitySyncAck::simple(AbilityAckCode::Rejected(e.ack_code()), SOFTWARE_VERSION_CURRENT);
        sender.send(Message::notify(
            MessageId::AbilitySync,
            message.session_id,
            Payload::AbilityAck(reject),
        ))?;
        return Err(e);
    }
    ctx.set_remote_capabilities(CapabilitySet::all().intersect(&ack.capabilities));
    ctx.set_remote_security(ack.security);
    ctx.set_compression(ack.compress_algorithm);
    if ack.software_version <= SOFTWARE_VERSION_RELEASE_2_0 {
        finish(ctx);
        return Ok(Progress::Finished);
    }
    let notify = AbilitySyncAck::simple(AbilityAckCode::CheckSuccess, SOFTWARE_VERSION_CURRENT);
    sender.send(Message::notify(
        MessageId::AbilitySync,
        message.session_id,
        Payload::AbilityAck(notify),
    ))?;
    Ok(Progress::Waiting)
}

/// Both sides: handles the two notifies that close a round.
pub(crate) fn ack_notify_recv(
    ctx: &SyncTaskContext,
    sender: &MessageSender,
    message: &Message,
) -> SyncResult<Progress> {
    let ack = message.as_ability_ack()?;
    match ack.ack_code {
        AbilityAckCode::CheckSuccess => {
            finish(ctx);
            let last = AbilitySyncAck::simple(AbilityAckCode::LastNotify, SOFTWARE_VERSION_CURRENT);
            sender.send(Message::notify(
                MessageId::AbilitySync,
                message.session_id,
                Payload::AbilityAck(last),
            ))?;
            Ok(Progress::Waiting)
        }
        AbilityAckCode::LastNotify => {
            finish(ctx);
            Ok(Progress::Finished)
        }
        AbilityAckCode::Rejected(code) => {
            ctx.set_ability_finished(false);
            Err(SyncError::from_ack(code).unwrap_or(SyncError::RemoteFailed))
        }
        AbilityAckCode::Accepted => Err(SyncError::internal("accepted ability ack sent as notify")),
    }
}

fn local_ack(ctx: &SyncTaskContext, ack_code: AbilityAckCode) -> AbilitySyncAck {
    AbilitySyncAck {
        ack_code,
        protocol_version: SINGLE_VER_SYNC_PROCTOL_V3,
        software_version: SOFTWARE_VERSION_CURRENT,
        capabilities: CapabilitySet::all(),
        security: ctx.local_security(),
        compress_algorithm: meshsync_protocol::CompressAlgorithm::None,
        schema_fingerprint: ctx.storage().schema_fingerprint(),
    }
}

fn check_remote(ctx: &SyncTaskContext, fingerprint: &str, security: &SecurityOption) -> SyncResult<()> {
    if fingerprint != ctx.storage().schema_fingerprint() {
        return Err(SyncError::SchemaMismatch);
    }
    if !ctx.local_security().is_compatible_with(security) {
        return Err(SyncError::SecurityOptionCheck);
    }
    Ok(())
}

fn finish(ctx: &SyncTaskContext) {
    ctx.set_ability_finished(true);
    let version_id = ctx.bump_remote_version_id();
    info!(device = %mask_device(ctx.device()), version = ctx.remote_software_version(),
        version_id, "[AbilitySync] ability sync finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::context::tests::context_with;
    use crate::test_support::{FakeStorage, RecordingCommunicator};
    use meshsync_protocol::{CompressAlgorithm, SecurityFlag, SecurityLabel};
    use std::sync::Arc;
    use std::time::Duration;

    fn pair(config_a: SyncConfig, config_b: SyncConfig) -> (
        (SyncTaskContext, Arc<RecordingCommunicator>, MessageSender),
        (SyncTaskContext, Arc<RecordingCommunicator>, MessageSender),
    ) {
        let build = |config: SyncConfig| {
            let ctx = context_with(Arc::new(FakeStorage::default()), config);
            let comm = Arc::new(RecordingCommunicator::new("local"));
            let sender = MessageSender::new(comm.clone(), "peer", Duration::from_secs(1));
            (ctx, comm, sender)
        };
        (build(config_a), build(config_b))
    }

    fn last_sent(comm: &RecordingCommunicator) -> Message {
        comm.take_sent().pop().unwrap().1
    }

    #[test]
    fn three_way_handshake() {
        let zlib = vec![CompressAlgorithm::Zlib];
        let ((a, a_comm, a_send), (b, b_comm, b_send)) = pair(
            SyncConfig::new("a").with_compress_algorithms(zlib.clone()),
            SyncConfig::new("b").with_compress_algorithms(zlib),
        );

        sync_start(&a, &a_send, 11).unwrap();
        request_recv(&b, &b_send, &last_sent(&a_comm)).unwrap();
        assert_eq!(b.remote_software_version(), SOFTWARE_VERSION_CURRENT);
        assert!(!b.is_ability_finished());

        let response = last_sent(&b_comm);
        assert_eq!(response.session_id, 11);
        assert_eq!(ack_recv(&a, &a_send, &response).unwrap(), Progress::Waiting);
        assert_eq!(a.compression(), CompressAlgorithm::Zlib);

        let check = last_sent(&a_comm);
        assert_eq!(ack_notify_recv(&b, &b_send, &check).unwrap(), Progress::Waiting);
        assert!(b.is_ability_finished());
        assert_eq!(b.remote_version_id(), 1);

        let last = last_sent(&b_comm);
        assert_eq!(ack_notify_recv(&a, &a_send, &last).unwrap(), Progress::Finished);
        assert!(a.is_ability_finished());
        assert_eq!(a.remote_version_id(), 1);
    }

    #[test]
    fn security_mismatch_is_rejected_by_responder() {
        let s2 = SecurityOption::new(SecurityLabel::S2, SecurityFlag::Ece);
        let s3 = SecurityOption::new(SecurityLabel::S3, SecurityFlag::Ece);
        let ((a, a_comm, a_send), (b, b_comm, b_send)) = pair(
            SyncConfig::new("a").with_security(s2),
            SyncConfig::new("b").with_security(s3),
        );
        sync_start(&a, &a_send, 5).unwrap();
        request_recv(&b, &b_send, &last_sent(&a_comm)).unwrap();
        let err = ack_recv(&a, &a_send, &last_sent(&b_comm)).unwrap_err();
        assert_eq!(err, SyncError::SecurityOptionCheck);
        assert!(!a.is_ability_finished());
    }

    #[test]
    fn store_security_applies_without_configured_label() {
        let s1 = SecurityOption::new(SecurityLabel::S1, SecurityFlag::Ece);
        let s3 = SecurityOption::new(SecurityLabel::S3, SecurityFlag::Ece);
        let build = |security: SecurityOption| {
            let storage = FakeStorage {
                security,
                ..FakeStorage::default()
            };
            let ctx = context_with(Arc::new(storage), SyncConfig::new("local"));
            let comm = Arc::new(RecordingCommunicator::new("local"));
            let sender = MessageSender::new(comm.clone(), "peer", Duration::from_secs(1));
            (ctx, comm, sender)
        };
        let (a, a_comm, a_send) = build(s1);
        let (b, b_comm, b_send) = build(s3);
        assert_eq!(a.local_security(), s1);

        sync_start(&a, &a_send, 9).unwrap();
        request_recv(&b, &b_send, &last_sent(&a_comm)).unwrap();
        let err = ack_recv(&a, &a_send, &last_sent(&b_comm)).unwrap_err();
        assert_eq!(err, SyncError::SecurityOptionCheck);
    }

    #[test]
    fn legacy_peer_finishes_on_response() {
        let ((a, _a_comm, a_send), (b, _b_comm, _b_send)) =
            pair(SyncConfig::new("a"), SyncConfig::new("b"));
        let mut ack = local_ack(&b, AbilityAckCode::Accepted);
        ack.software_version = SOFTWARE_VERSION_RELEASE_2_0;
        let response = Message::response(MessageId::AbilitySync, 3, Payload::AbilityAck(ack));
        assert_eq!(ack_recv(&a, &a_send, &response).unwrap(), Progress::Finished);
        assert!(a.is_ability_finished());
    }
}
