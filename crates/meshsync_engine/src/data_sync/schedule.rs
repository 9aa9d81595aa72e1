//! Receive-side ordering of data packets.

use meshsync_protocol::Message;
use std::collections::{BTreeMap, VecDeque};

/// Sessions tracked at once; the oldest is forgotten first.
const MAX_TRACKED_SESSIONS: usize = 4;

/// What to do with an inbound data packet.
#[derive(Debug)]
pub(crate) enum Scheduled {
    /// These packets are next in order and can be handled now.
    Ready(Vec<Message>),
    /// Already handled; answer with a finished ack.
    Duplicate(Message),
    /// Buffered until the gap before it is filled.
    Pending,
}

#[derive(Debug)]
struct SessionOrder {
    session_id: u32,
    expected: u32,
    pending: BTreeMap<u32, Message>,
}

/// Orders data packets by sequence id within each session.
#[derive(Debug, Default)]
pub(crate) struct DataMessageSchedule {
    sessions: VecDeque<SessionOrder>,
}

impl DataMessageSchedule {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn accept(&mut self, message: Message) -> Scheduled {
        let order = self.session(message.session_id);
        let sequence = message.sequence_id;
        if sequence < order.expected {
            return Scheduled::Duplicate(message);
        }
        if sequence > order.expected {
            order.pending.insert(sequence, message);
            return Scheduled::Pending;
        }
        let mut ready = vec![message];
        order.expected += 1;
        while let Some(next) = order.pending.remove(&order.expected) {
            ready.push(next);
            order.expected += 1;
        }
        Scheduled::Ready(ready)
    }

    /// Forgets every session.
    pub(crate) fn clear(&mut self) {
        self.sessions.clear();
    }

    fn session(&mut self, session_id: u32) -> &mut SessionOrder {
        let index = match self.sessions.iter().position(|s| s.session_id == session_id) {
            Some(index) => index,
            None => {
                if self.sessions.len() == MAX_TRACKED_SESSIONS {
                    self.sessions.pop_front();
                }
                self.sessions.push_back(SessionOrder {
                    session_id,
                    expected: 1,
                    pending: BTreeMap::new(),
                });
                self.sessions.len() - 1
            }
        };
        &mut self.sessions[index]
    }
}
