//! # MeshSync Testkit
//!
//! Test utilities for MeshSync.
//!
//! This crate provides:
//! - [`MemoryStorage`], a paged in-memory store with fault injection
//! - [`VirtualHub`] and [`VirtualCommunicator`] for in-process networks
//! - [`TestDevice`] fixtures that wire an engine to both
//! - Property-based test generators using proptest
//! - [`init_tracing`] for log output in tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meshsync_testkit::prelude::*;
//!
//! let hub = VirtualHub::new();
//! let a = TestDevice::spawn(&hub, "a", MemoryStorage::new(), test_config("a"))?;
//! let b = TestDevice::spawn(&hub, "b", MemoryStorage::new(), test_config("b"))?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod logging;
pub mod network;
pub mod storage;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
    pub use crate::network::*;
    pub use crate::storage::*;
}

pub use fixtures::*;
pub use generators::*;
pub use logging::*;
pub use network::*;
pub use storage::*;
