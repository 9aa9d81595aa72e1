//! # MeshSync Engine
//!
//! Device-to-device sync sessions over a caller-supplied transport.
//!
//! This crate provides:
//! - [`SyncEngine`], the facade that owns one state machine per peer
//! - Time sync, ability sync and sliding-window data sync
//! - Subscribe and unsubscribe control commands
//! - [`RemoteExecutor`] for read-only queries run on a peer's store
//! - [`TaskScheduler`], a single-worker timer queue
//!
//! The engine sees the local store through [`SyncStorage`] and the transport
//! through [`Communicator`].
//!
//! ## Example
//!
//! ```no_run
//! use meshsync_engine::{SyncConfig, SyncEngine, SyncRequest};
//! use meshsync_protocol::SyncMode;
//! # use std::sync::Arc;
//! # fn demo(storage: Arc<dyn meshsync_engine::SyncStorage>, comm: Arc<dyn meshsync_engine::Communicator>) -> meshsync_engine::SyncResult<()> {
//! let engine = SyncEngine::new(SyncConfig::new("phone"), storage, comm)?;
//! let handle = engine.sync(SyncRequest::new(vec!["tablet".into()], SyncMode::PushAndPull))?;
//! let report = handle.wait(std::time::Duration::from_secs(30))?;
//! println!("{report:?}");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ability_sync;
mod block_data;
mod communicator;
mod config;
mod context;
mod data_sync;
mod engine;
mod error;
mod metadata;
mod operation;
mod remote_executor;
mod scheduler;
mod session;
mod state_machine;
mod storage;
mod subscribe;
mod target;
mod time_helper;
mod time_sync;

#[cfg(test)]
mod test_support;

pub use block_data::BlockData;
pub use communicator::{Communicator, MessageHandler, OnSendResult, SendConfig};
pub use config::{
    PermissionChecker, PermissionFlag, RemoteExecutorConfig, SecurityAbilityChecker, SyncConfig,
};
pub use engine::SyncEngine;
pub use error::{ErrorKind, SyncError, SyncResult};
pub use operation::{OperationStatus, SyncHandle, SyncOperation, SyncReport, SyncRequest};
pub use remote_executor::{RemoteExecutor, RemoteQueryHandle};
pub use scheduler::{PeriodicHandle, TaskId, TaskScheduler, INVALID_TASK_ID};
pub use session::SessionRegistry;
pub use state_machine::{Event, State, StateSwitchTable, Switch};
pub use storage::{ContinueToken, DataSizeSpec, QueryPage, SyncDataPage, SyncStorage};
pub use subscribe::{SubscribeManager, MAX_SUBSCRIBE_PER_DEVICE};
pub use target::{SyncTarget, TaskKind};
pub use time_helper::{mask_device, now_ticks, MAX_TIME_OFFSET_NOISE, TICKS_PER_SECOND};
