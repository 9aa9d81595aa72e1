//! Table of active sessions.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;

/// Maps opaque 64-bit ids to session state.
///
/// Callers hold ids only. State is read by cloning or mutated inside a
/// closure that runs under the table lock, so at most one mutator touches a
/// session at a time.
pub struct SessionRegistry<S> {
    sessions: Mutex<HashMap<u64, S>>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl<S> SessionRegistry<S> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `session` under a fresh random nonzero id.
    pub fn insert(&self, session: S) -> u64 {
        self.insert_bounded(session, u64::MAX)
    }

    /// Stores `session` under a fresh random id in `1..=max`, for ids that
    /// travel in narrower wire fields.
    pub fn insert_bounded(&self, session: S, max: u64) -> u64 {
        let mut sessions = self.sessions.lock();
        let mut rng = rand::thread_rng();
        let id = loop {
            let candidate: u64 = rng.gen_range(1..=max.max(1));
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        sessions.insert(id, session);
        id
    }

    /// Runs `f` on the session, if present.
    pub fn with_session<R>(&self, id: u64, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        self.sessions.lock().get_mut(&id).map(f)
    }

    /// Removes and returns the session.
    pub fn remove(&self, id: u64) -> Option<S> {
        self.sessions.lock().remove(&id)
    }

    /// Returns true if the id is live.
    pub fn contains(&self, id: u64) -> bool {
        self.sessions.lock().contains_key(&id)
    }

    /// Ids of sessions matching `pred`.
    pub fn find_ids(&self, mut pred: impl FnMut(&S) -> bool) -> Vec<u64> {
        self.sessions
            .lock()
            .iter()
            .filter(|(_, s)| pred(s))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Removes every session and returns them.
    pub fn drain(&self) -> Vec<(u64, S)> {
        self.sessions.lock().drain().collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Returns true if no session is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every session.
    pub fn clear(&self) {
        self.sessions.lock().clear();
    }
}

impl<S: Clone> SessionRegistry<S> {
    /// Returns a copy of the session state.
    pub fn get(&self, id: u64) -> Option<S> {
        self.sessions.lock().get(&id).cloned()
    }
}
