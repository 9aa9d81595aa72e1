//! Query subscriptions in both directions.
//!
//! Local subscriptions are queries this device asked a peer to push; they are
//! reserved when the command is sent and activated by the peer's ack. Remote
//! subscriptions are queries peers registered here; local writes are pushed
//! to them as auto query syncs.

use crate::error::{SyncError, SyncResult};
use meshsync_protocol::QueryObject;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// Subscriptions allowed per device and direction.
pub const MAX_SUBSCRIBE_PER_DEVICE: usize = 8;

#[derive(Debug, Clone)]
struct LocalSubscription {
    query: QueryObject,
    active: bool,
}

#[derive(Debug, Default)]
struct SubscribeState {
    local: HashMap<String, BTreeMap<String, LocalSubscription>>,
    remote: HashMap<String, BTreeMap<String, QueryObject>>,
}

/// Bookkeeping for subscribe and unsubscribe commands.
#[derive(Debug, Default)]
pub struct SubscribeManager {
    state: Mutex<SubscribeState>,
}

impl SubscribeManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a local subscription before the command is sent.
    pub fn reserve_local(&self, device: &str, query: &QueryObject) -> SyncResult<()> {
        let mut state = self.state.lock();
        let subs = state.local.entry(device.to_string()).or_default();
        let query_id = query.identify();
        if !subs.contains_key(&query_id) && subs.len() >= MAX_SUBSCRIBE_PER_DEVICE {
            return Err(SyncError::MaxLimits);
        }
        subs.entry(query_id).or_insert(LocalSubscription {
            query: query.clone(),
            active: false,
        });
        Ok(())
    }

    /// Marks a reserved subscription as accepted by the peer.
    pub fn activate_local(&self, device: &str, query_id: &str) {
        if let Some(sub) = self
            .state
            .lock()
            .local
            .get_mut(device)
            .and_then(|subs| subs.get_mut(query_id))
        {
            sub.active = true;
        }
    }

    /// Drops a local subscription.
    pub fn remove_local(&self, device: &str, query_id: &str) {
        let mut state = self.state.lock();
        if let Some(subs) = state.local.get_mut(device) {
            subs.remove(query_id);
            if subs.is_empty() {
                state.local.remove(device);
            }
        }
    }

    /// Active local subscriptions toward `device`.
    pub fn local_queries(&self, device: &str) -> Vec<QueryObject> {
        self.state
            .lock()
            .local
            .get(device)
            .map(|subs| {
                subs.values()
                    .filter(|s| s.active)
                    .map(|s| s.query.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Registers a peer's subscription.
    pub fn add_remote(&self, device: &str, query: QueryObject) -> SyncResult<()> {
        let mut state = self.state.lock();
        let subs = state.remote.entry(device.to_string()).or_default();
        let query_id = query.identify();
        if !subs.contains_key(&query_id) && subs.len() >= MAX_SUBSCRIBE_PER_DEVICE {
            return Err(SyncError::MaxLimits);
        }
        subs.insert(query_id, query);
        Ok(())
    }

    /// Removes a peer's subscription.
    pub fn remove_remote(&self, device: &str, query_id: &str) {
        let mut state = self.state.lock();
        if let Some(subs) = state.remote.get_mut(device) {
            subs.remove(query_id);
            if subs.is_empty() {
                state.remote.remove(device);
            }
        }
    }

    /// Every `(device, query)` registered by peers.
    pub fn remote_subscribers(&self) -> Vec<(String, QueryObject)> {
        let state = self.state.lock();
        let mut out: Vec<(String, QueryObject)> = state
            .remote
            .iter()
            .flat_map(|(device, subs)| subs.values().map(move |q| (device.clone(), q.clone())))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Forgets everything involving `device`.
    pub fn clear_device(&self, device: &str) {
        let mut state = self.state.lock();
        state.local.remove(device);
        state.remote.remove(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(prefix: &str) -> QueryObject {
        QueryObject::new().with_prefix(prefix.as_bytes().to_vec())
    }

    #[test]
    fn local_subscription_lifecycle() {
        let manager = SubscribeManager::new();
        let q = query("user/");
        manager.reserve_local("dev-b", &q).unwrap();
        assert!(manager.local_queries("dev-b").is_empty());
        manager.activate_local("dev-b", &q.identify());
        assert_eq!(manager.local_queries("dev-b"), vec![q.clone()]);
        manager.remove_local("dev-b", &q.identify());
        assert!(manager.local_queries("dev-b").is_empty());
    }

    #[test]
    fn per_device_limit() {
        let manager = SubscribeManager::new();
        for i in 0..MAX_SUBSCRIBE_PER_DEVICE {
            manager.add_remote("dev-b", query(&format!("t{i}/"))).unwrap();
        }
        assert_eq!(manager.add_remote("dev-b", query("extra/")), Err(SyncError::MaxLimits));
        assert!(manager.add_remote("dev-b", query("t0/")).is_ok());
        assert!(manager.add_remote("dev-c", query("extra/")).is_ok());
    }

    #[test]
    fn clear_device_drops_both_directions() {
        let manager = SubscribeManager::new();
        manager.add_remote("dev-b", query("a/")).unwrap();
        manager.reserve_local("dev-b", &query("b/")).unwrap();
        manager.add_remote("dev-c", query("a/")).unwrap();
        manager.clear_device("dev-b");
        let remaining = manager.remote_subscribers();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].0, "dev-c");
    }
}
