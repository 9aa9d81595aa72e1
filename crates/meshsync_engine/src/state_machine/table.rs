//! Versioned state switch tables.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Protocol version that added control commands.
pub(crate) const SINGLE_VER_SYNC_PROCTOL_V3: u32 = 3;
/// Oldest protocol version with a switch table.
pub(crate) const SINGLE_VER_SYNC_PROCTOL_V2: u32 = 2;

/// Machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// No task.
    Idle,
    /// Clock offset exchange.
    TimeSync,
    /// Version and capability negotiation.
    AbilitySync,
    /// Sending the local side of a task.
    StartInitiactiveDataSync,
    /// Answering pull requests.
    StartPassiveDataSync,
    /// Waiting for the peer's data.
    WaitForReceiveDataFinish,
    /// Running a subscribe or unsubscribe command.
    SyncControlCmd,
    /// Task done; picking the next one.
    SyncTaskFinished,
    /// Task timed out.
    SyncTimeOut,
    /// Task failed.
    InnerErr,
}

/// Machine events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// A task was prepared.
    StartSync,
    /// Time sync completed.
    TimeSyncFinished,
    /// The watchdog gave up.
    TimeOut,
    /// A step failed.
    InnerErr,
    /// The peer's version is unusable.
    VersionNotSupported,
    /// Ability sync completed.
    AbilitySyncFinished,
    /// The task is a control command.
    ControlCmd,
    /// Ability sync must run again.
    NeedAbilitySync,
    /// The local side finished sending.
    SendFinished,
    /// Start sending again from the last watermark.
    ReSendData,
    /// No pull response is left to answer.
    ResponseTaskFinished,
    /// The peer's data arrived.
    RecvFinished,
    /// A pull response is queued.
    StartPullResponse,
    /// Both queues are empty.
    AllTaskFinished,
    /// Matches any event.
    Any,
    /// Suspend until the next message.
    WaitAck,
    /// More data can be sent.
    SendData,
    /// A timeout that will be retried.
    WaitTimeOut,
}

/// Outcome of a table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    /// The event moves the machine to this state.
    Next(State),
    /// The state has no entries at all.
    UnknownState,
    /// The state does not accept the event.
    Rejected,
}

/// One immutable `(state, event) -> state` map.
#[derive(Debug)]
pub struct StateSwitchTable {
    version: u32,
    switches: HashMap<(State, Event), State>,
}

impl StateSwitchTable {
    fn build(version: u32, entries: &[(State, Event, State)]) -> Self {
        Self {
            version,
            switches: entries.iter().map(|&(s, e, n)| ((s, e), n)).collect(),
        }
    }

    /// Protocol version of the table.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Looks up the transition for `event` in `state`.
    pub fn lookup(&self, state: State, event: Event) -> Switch {
        if let Some(next) = self.switches.get(&(state, event)) {
            return Switch::Next(*next);
        }
        if let Some(next) = self.switches.get(&(state, Event::Any)) {
            return Switch::Next(*next);
        }
        if self.switches.keys().any(|(s, _)| *s == state) {
            Switch::Rejected
        } else {
            Switch::UnknownState
        }
    }

    /// All tables, highest version first.
    pub fn all() -> &'static [StateSwitchTable] {
        static TABLES: OnceLock<Vec<StateSwitchTable>> = OnceLock::new();
        TABLES.get_or_init(|| {
            let mut v3 = v2_entries();
            v3.extend_from_slice(&CONTROL_CMD_ENTRIES);
            let mut tables = vec![
                StateSwitchTable::build(SINGLE_VER_SYNC_PROCTOL_V3, &v3),
                StateSwitchTable::build(SINGLE_VER_SYNC_PROCTOL_V2, &v2_entries()),
            ];
            tables.sort_by(|a, b| b.version.cmp(&a.version));
            tables
        })
    }

    /// The newest table not newer than `version`, or the oldest one.
    pub fn for_version(version: u32) -> &'static StateSwitchTable {
        let tables = Self::all();
        tables
            .iter()
            .find(|t| t.version <= version)
            .unwrap_or(&tables[tables.len() - 1])
    }
}

const CONTROL_CMD_ENTRIES: [(State, Event, State); 5] = [
    (State::AbilitySync, Event::ControlCmd, State::SyncControlCmd),
    (State::SyncControlCmd, Event::SendFinished, State::SyncTaskFinished),
    (State::SyncControlCmd, Event::TimeOut, State::SyncTimeOut),
    (State::SyncControlCmd, Event::InnerErr, State::InnerErr),
    (State::SyncControlCmd, Event::NeedAbilitySync, State::AbilitySync),
];

fn v2_entries() -> Vec<(State, Event, State)> {
    use Event as E;
    use State as S;
    vec![
        (S::Idle, E::StartSync, S::TimeSync),
        (S::TimeSync, E::TimeSyncFinished, S::AbilitySync),
        (S::TimeSync, E::TimeOut, S::SyncTimeOut),
        (S::TimeSync, E::InnerErr, S::InnerErr),
        (S::AbilitySync, E::VersionNotSupported, S::InnerErr),
        (S::AbilitySync, E::AbilitySyncFinished, S::StartInitiactiveDataSync),
        (S::AbilitySync, E::TimeOut, S::SyncTimeOut),
        (S::AbilitySync, E::InnerErr, S::InnerErr),
        (S::StartInitiactiveDataSync, E::NeedAbilitySync, S::AbilitySync),
        (S::StartInitiactiveDataSync, E::TimeOut, S::SyncTimeOut),
        (S::StartInitiactiveDataSync, E::InnerErr, S::InnerErr),
        (S::StartInitiactiveDataSync, E::SendFinished, S::StartPassiveDataSync),
        (S::StartInitiactiveDataSync, E::ReSendData, S::StartInitiactiveDataSync),
        (S::StartPassiveDataSync, E::SendFinished, S::StartPassiveDataSync),
        (S::StartPassiveDataSync, E::ResponseTaskFinished, S::WaitForReceiveDataFinish),
        (S::StartPassiveDataSync, E::TimeOut, S::SyncTimeOut),
        (S::StartPassiveDataSync, E::InnerErr, S::InnerErr),
        (S::StartPassiveDataSync, E::NeedAbilitySync, S::AbilitySync),
        (S::StartPassiveDataSync, E::ReSendData, S::StartPassiveDataSync),
        (S::WaitForReceiveDataFinish, E::RecvFinished, S::SyncTaskFinished),
        (S::WaitForReceiveDataFinish, E::StartPullResponse, S::StartPassiveDataSync),
        (S::WaitForReceiveDataFinish, E::TimeOut, S::SyncTimeOut),
        (S::WaitForReceiveDataFinish, E::InnerErr, S::InnerErr),
        (S::WaitForReceiveDataFinish, E::NeedAbilitySync, S::AbilitySync),
        (S::SyncTaskFinished, E::AllTaskFinished, S::Idle),
        (S::SyncTaskFinished, E::StartSync, S::TimeSync),
        (S::SyncTimeOut, E::Any, S::SyncTaskFinished),
        (S::InnerErr, E::Any, S::SyncTaskFinished),
    ]
}
