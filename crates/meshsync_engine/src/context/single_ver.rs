use super::{ContextState, SyncTaskContext};
use crate::error::SyncResult;
use crate::operation::OperationStatus;
use meshsync_protocol::{CapabilitySet, CompressAlgorithm, SecurityLabel, SecurityOption, SyncMode};

impl SyncTaskContext {
    pub(super) fn save_last_push_task_exec_status(
        state: &mut ContextState,
        query_id: &str,
        status: OperationStatus,
    ) {
        match state.mode {
            SyncMode::Push | SyncMode::PushAndPull => state.last_full_push_status = Some(status),
            SyncMode::QueryPush | SyncMode::QueryPushPull => {
                state
                    .last_query_push_status
                    .insert(query_id.to_string(), status);
            }
            _ => {}
        }
    }

    /// Auto-lift applies when the last full push finished completely.
    pub(crate) fn is_auto_lift_watermark(&self) -> bool {
        self.state.lock().last_full_push_status == Some(OperationStatus::FinishedAll)
    }

    /// Start of the next data range to send for the live task.
    pub(crate) fn get_corrected_send_watermark_for_current_task(&self) -> SyncResult<u64> {
        let device = self.device();
        let full = self.metadata.local_watermark(device)?;
        if !self.is_query_sync() {
            return Ok(full);
        }
        let query_watermark = self
            .metadata
            .send_query_watermark(&self.query_id(), device)?;
        if self.is_auto_lift_watermark() {
            return Ok(query_watermark.max(full));
        }
        Ok(query_watermark)
    }

    /// Returns true if the live push task has nothing new to send.
    pub(crate) fn is_current_sync_task_can_be_skipped(&self) -> SyncResult<bool> {
        let (mode, query_id, finished) = {
            let state = self.state.lock();
            let query_id = state
                .current
                .as_ref()
                .map(|t| t.query_id().to_string())
                .unwrap_or_default();
            let finished = match state.mode {
                SyncMode::Push => state.last_full_push_status == Some(OperationStatus::FinishedAll),
                SyncMode::QueryPush => {
                    state.last_query_push_status.get(&query_id) == Some(&OperationStatus::FinishedAll)
                }
                _ => false,
            };
            (state.mode, query_id, finished)
        };
        if !finished {
            return Ok(false);
        }
        let watermark = match mode {
            SyncMode::QueryPush => self.metadata.send_query_watermark(&query_id, self.device())?,
            _ => self.metadata.local_watermark(self.device())?,
        };
        Ok(watermark > self.storage.get_max_timestamp())
    }

    pub(crate) fn remote_software_version(&self) -> u32 {
        self.state.lock().remote_software_version
    }

    pub(crate) fn set_remote_software_version(&self, version: u32) {
        self.state.lock().remote_software_version = version;
    }

    pub(crate) fn remote_version_id(&self) -> u64 {
        self.state.lock().remote_version_id
    }

    /// Records a completed ability round.
    pub(crate) fn bump_remote_version_id(&self) -> u64 {
        let mut state = self.state.lock();
        state.remote_version_id = state.remote_version_id.wrapping_add(1);
        state.remote_version_id
    }

    pub(crate) fn remote_security(&self) -> SecurityOption {
        self.state.lock().remote_security
    }

    pub(crate) fn set_remote_security(&self, security: SecurityOption) {
        self.state.lock().remote_security = security;
    }

    pub(crate) fn remote_capabilities(&self) -> CapabilitySet {
        self.state.lock().remote_capabilities.clone()
    }

    pub(crate) fn set_remote_capabilities(&self, capabilities: CapabilitySet) {
        self.state.lock().remote_capabilities = capabilities;
    }

    /// Security option announced to peers. A configured label wins over
    /// the store's own.
    pub(crate) fn local_security(&self) -> SecurityOption {
        if self.config.security.label == SecurityLabel::NotSet {
            self.storage.get_security_option()
        } else {
            self.config.security
        }
    }

    /// Compression algorithms offered to peers, from the config or else the
    /// store.
    pub(crate) fn local_compress_algorithms(&self) -> Vec<CompressAlgorithm> {
        if self.config.compress_algorithms.is_empty() {
            self.storage.get_compression_algo()
        } else {
            self.config.compress_algorithms.clone()
        }
    }

    /// Picks the packet compression shared with the peer.
    pub(crate) fn choose_compression(&self, remote: &[CompressAlgorithm]) -> CompressAlgorithm {
        let chosen = CompressAlgorithm::choose(&self.local_compress_algorithms(), remote);
        self.state.lock().compress = chosen;
        chosen
    }

    pub(crate) fn set_compression(&self, algorithm: CompressAlgorithm) {
        self.state.lock().compress = algorithm;
    }

    pub(crate) fn compression(&self) -> CompressAlgorithm {
        self.state.lock().compress
    }

    pub(crate) fn is_need_reset_ability_sync(&self) -> bool {
        self.state.lock().need_reset_ability_sync
    }

    pub(crate) fn set_need_reset_ability_sync(&self, need: bool) {
        self.state.lock().need_reset_ability_sync = need;
    }

    pub(crate) fn is_ability_finished(&self) -> bool {
        let state = self.state.lock();
        state.ability_finished && !state.need_reset_ability_sync
    }

    pub(crate) fn set_ability_finished(&self, finished: bool) {
        let mut state = self.state.lock();
        state.ability_finished = finished;
        if finished {
            state.need_reset_ability_sync = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::context_with;
    use crate::config::SyncConfig;
    use crate::operation::{OperationStatus, SyncOperation, SyncRequest};
    use crate::test_support::FakeStorage;
    use meshsync_protocol::{DataItem, QueryObject, SyncMode};
    use std::sync::Arc;

    fn storage_with_max(ts: u64) -> Arc<FakeStorage> {
        Arc::new(FakeStorage::with_entries(vec![DataItem::new(
            b"k".to_vec(),
            b"v".to_vec(),
            ts,
        )]))
    }

    #[test]
    fn finished_push_with_newer_watermark_is_skipped() {
        let ctx = context_with(storage_with_max(100), SyncConfig::new("dev-a"));
        let (op, _h) = SyncOperation::new(1, SyncRequest::new(vec!["dev-b".into()], SyncMode::Push));
        ctx.add_sync_operation(&op, 200);
        ctx.move_to_next_target();
        assert!(!ctx.is_current_sync_task_can_be_skipped().unwrap());

        ctx.set_operation_status(OperationStatus::RecvFinished);
        ctx.set_operation_status(OperationStatus::SendFinished);
        ctx.metadata().set_local_watermark("dev-b", 201).unwrap();

        let (again, _h2) =
            SyncOperation::new(2, SyncRequest::new(vec!["dev-b".into()], SyncMode::Push));
        ctx.add_sync_operation(&again, 300);
        ctx.move_to_next_target();
        assert!(ctx.is_current_sync_task_can_be_skipped().unwrap());
    }

    #[test]
    fn new_local_write_prevents_the_skip() {
        let ctx = context_with(storage_with_max(500), SyncConfig::new("dev-a"));
        let (op, _h) = SyncOperation::new(1, SyncRequest::new(vec!["dev-b".into()], SyncMode::Push));
        ctx.add_sync_operation(&op, 200);
        ctx.move_to_next_target();
        ctx.set_operation_status(OperationStatus::FinishedAll);
        ctx.metadata().set_local_watermark("dev-b", 201).unwrap();

        let (again, _h2) =
            SyncOperation::new(2, SyncRequest::new(vec!["dev-b".into()], SyncMode::Push));
        ctx.add_sync_operation(&again, 300);
        ctx.move_to_next_target();
        assert!(!ctx.is_current_sync_task_can_be_skipped().unwrap());
    }

    #[test]
    fn query_watermark_auto_lifts_after_full_push() {
        let ctx = context_with(storage_with_max(1), SyncConfig::new("dev-a"));
        ctx.metadata().set_local_watermark("dev-b", 40).unwrap();
        let query = QueryObject::new().with_prefix(b"a".to_vec());
        ctx.metadata()
            .set_send_query_watermark(&query.identify(), "dev-b", 10)
            .unwrap();

        let (op, _h) = SyncOperation::new(
            1,
            SyncRequest::new(vec!["dev-b".into()], SyncMode::QueryPush).with_query(query.clone()),
        );
        ctx.add_sync_operation(&op, 100);
        ctx.move_to_next_target();
        assert_eq!(ctx.get_corrected_send_watermark_for_current_task().unwrap(), 10);

        let (full, _h2) = SyncOperation::new(2, SyncRequest::new(vec!["dev-b".into()], SyncMode::Push));
        ctx.add_sync_operation(&full, 100);
        ctx.move_to_next_target();
        ctx.set_operation_status(OperationStatus::FinishedAll);

        let (op3, _h3) = SyncOperation::new(
            3,
            SyncRequest::new(vec!["dev-b".into()], SyncMode::QueryPush).with_query(query),
        );
        ctx.add_sync_operation(&op3, 100);
        ctx.move_to_next_target();
        assert_eq!(ctx.get_corrected_send_watermark_for_current_task().unwrap(), 40);
    }

    #[test]
    fn ability_reset_flag_overrides_finished() {
        let ctx = context_with(Arc::new(FakeStorage::default()), SyncConfig::new("dev-a"));
        ctx.set_ability_finished(true);
        assert!(ctx.is_ability_finished());
        ctx.set_need_reset_ability_sync(true);
        assert!(!ctx.is_ability_finished());
        ctx.set_ability_finished(true);
        assert!(ctx.is_ability_finished());
    }
}
