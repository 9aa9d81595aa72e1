//! Queued units of sync work.

use crate::operation::SyncOperation;
use meshsync_protocol::{QueryObject, SyncMode};
use std::sync::Arc;

/// Which queue a target belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Started locally by a [`SyncOperation`].
    Request,
    /// Answers a peer's pull.
    Response,
}

/// One occurrence of sync work for one device.
///
/// The end watermark is captured when the target is queued and only moves
/// forward when an auto sync coalesces into it.
#[derive(Debug, Clone)]
pub struct SyncTarget {
    mode: SyncMode,
    end_watermark: u64,
    response_session_id: u32,
    query: Option<QueryObject>,
    query_id: String,
    kind: TaskKind,
    operation: Option<Arc<SyncOperation>>,
}

impl SyncTarget {
    /// Target for one device of `operation`.
    pub fn request(operation: Arc<SyncOperation>, end_watermark: u64) -> Self {
        Self {
            mode: operation.mode(),
            end_watermark,
            response_session_id: 0,
            query: operation.query().cloned(),
            query_id: operation.query_id().to_string(),
            kind: TaskKind::Request,
            operation: Some(operation),
        }
    }

    /// Pull response for the peer session `session_id`.
    pub fn response(session_id: u32, end_watermark: u64, query: Option<QueryObject>) -> Self {
        let query_id = query.as_ref().map(QueryObject::identify).unwrap_or_default();
        Self {
            mode: SyncMode::ResponsePull,
            end_watermark,
            response_session_id: session_id,
            query,
            query_id,
            kind: TaskKind::Response,
            operation: None,
        }
    }

    /// Sync mode.
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Upper bound of the data this target covers.
    pub fn end_watermark(&self) -> u64 {
        self.end_watermark
    }

    /// Peer session answered by a pull response; 0 for request targets.
    pub fn response_session_id(&self) -> u32 {
        self.response_session_id
    }

    /// Query, for query modes.
    pub fn query(&self) -> Option<&QueryObject> {
        self.query.as_ref()
    }

    /// Identity of the query, or empty.
    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    /// Returns true if the target is query filtered.
    pub fn is_query_sync(&self) -> bool {
        self.query.is_some()
    }

    /// Queue the target belongs to.
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Owning operation of a request target.
    pub fn operation(&self) -> Option<&Arc<SyncOperation>> {
        self.operation.as_ref()
    }

    /// Returns true if this is an auto sync request target.
    pub fn is_auto(&self) -> bool {
        self.operation.as_ref().is_some_and(|op| op.is_auto())
    }

    pub(crate) fn lift_end_watermark(&mut self, end_watermark: u64) {
        self.end_watermark = self.end_watermark.max(end_watermark);
    }

    pub(crate) fn into_operation(self) -> Option<Arc<SyncOperation>> {
        self.operation
    }
}
