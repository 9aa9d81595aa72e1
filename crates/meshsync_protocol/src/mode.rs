//! Sync modes.

use serde::{Deserialize, Serialize};

/// The kind of work a sync target asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncMode {
    /// Send local changes to the peer.
    Push,
    /// Fetch the peer's changes.
    Pull,
    /// Push then pull in one session.
    PushAndPull,
    /// Answer a peer's pull request.
    ResponsePull,
    /// Push filtered by a query.
    QueryPush,
    /// Pull filtered by a query.
    QueryPull,
    /// Push and pull filtered by a query.
    QueryPushPull,
    /// Register a query subscription on the peer.
    SubscribeQuery,
    /// Remove a query subscription from the peer.
    UnsubscribeQuery,
}

impl SyncMode {
    /// Maps query variants to their base data mode.
    pub fn transfer(self) -> SyncMode {
        match self {
            SyncMode::QueryPush => SyncMode::Push,
            SyncMode::QueryPull => SyncMode::Pull,
            SyncMode::QueryPushPull => SyncMode::PushAndPull,
            other => other,
        }
    }

    /// Returns true for modes that carry a query object.
    pub fn is_query(self) -> bool {
        matches!(
            self,
            SyncMode::QueryPush
                | SyncMode::QueryPull
                | SyncMode::QueryPushPull
                | SyncMode::SubscribeQuery
                | SyncMode::UnsubscribeQuery
        )
    }

    /// Returns true for subscribe and unsubscribe.
    pub fn is_control(self) -> bool {
        matches!(self, SyncMode::SubscribeQuery | SyncMode::UnsubscribeQuery)
    }

    /// Returns true for modes that send local data to the peer.
    pub fn sends_data(self) -> bool {
        matches!(self.transfer(), SyncMode::Push | SyncMode::PushAndPull)
    }

    /// Returns true for modes that expect data from the peer.
    pub fn receives_data(self) -> bool {
        matches!(self.transfer(), SyncMode::Pull | SyncMode::PushAndPull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_modes_transfer_to_base_modes() {
        assert_eq!(SyncMode::QueryPush.transfer(), SyncMode::Push);
        assert_eq!(SyncMode::QueryPull.transfer(), SyncMode::Pull);
        assert_eq!(SyncMode::QueryPushPull.transfer(), SyncMode::PushAndPull);
        assert_eq!(SyncMode::ResponsePull.transfer(), SyncMode::ResponsePull);
    }

    #[test]
    fn direction_predicates() {
        assert!(SyncMode::Push.sends_data());
        assert!(!SyncMode::Push.receives_data());
        assert!(SyncMode::QueryPushPull.sends_data());
        assert!(SyncMode::QueryPushPull.receives_data());
        assert!(SyncMode::SubscribeQuery.is_control());
        assert!(!SyncMode::Pull.is_query());
    }
}
