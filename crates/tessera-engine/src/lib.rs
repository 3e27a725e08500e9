//! # tessera-engine
//!
//! Asynchronous, dependency-tracking execution engine.
//!
//! Operations are described by an [`OpDescriptor`]: a kernel closure plus the
//! [`Var`]s it reads and writes and the [`Device`](tessera_core::Device) it
//! targets. [`Engine::submit`] returns immediately; the engine runs each
//! operation on one of its device lanes once every earlier conflicting
//! operation has finished:
//!
//! - read-after-write: a reader waits for the previous writer
//! - write-after-read: a writer waits for all previous readers
//! - write-after-write: a writer waits for the previous writer
//!
//! Operations with disjoint vars are never ordered against each other and run
//! in parallel on different lanes. [`Engine::wait_for`] is the barrier that
//! makes results observable; a kernel failure is handed to every operation
//! downstream of it and to every waiter instead of hanging.

pub mod config;
mod dispatch;
pub mod engine;
mod node;
pub mod op;
pub mod profiler;
pub mod var;

pub use config::{EngineConfig, EngineKind};
pub use engine::{Engine, EngineStats, OpHandle};
pub use node::NodeState;
pub use op::{Kernel, LaneId, LaneKind, OpDescriptor, RunContext};
pub use profiler::{LaneBusy, OpRecord, ProfileEntry, ProfileReport, Profiler};
pub use var::{Var, VarId};
