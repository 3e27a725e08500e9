//! # Tessera
//!
//! Asynchronously computed n-dimensional arrays on a dependency-tracking
//! execution engine.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use tessera::prelude::*;
//!
//! let engine = Engine::new(EngineConfig::default().cpu_workers(2)).unwrap();
//! let a = NDArray::full((2, 2), 2.0, Device::cpu(), &engine).unwrap();
//! let b = a.mul_scalar(3.0).unwrap(); // queued, not yet computed
//! assert_eq!(b.to_vec().unwrap(), vec![6.0; 4]); // blocks until ready
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `tessera-core` | Error, Shape, Device, Storage |
//! | `tessera-engine` | Var, OpDescriptor, Engine, lanes, profiler |
//! | `tessera` | NDArray, CPU kernels, Symbol/Executor, checkpoints |
//!
//! ## Modules
//!
//! - [`ndarray`]: the array type and its operators
//! - [`kernels`]: CPU reference kernels
//! - [`symbol`]: declarative graphs over a closed operator set
//! - [`checkpoint`]: save/load named arrays

pub use tessera_core::{Device, DeviceKind, Error, Result, Shape, Storage};
pub use tessera_engine::{
    Engine, EngineConfig, EngineKind, EngineStats, LaneId, LaneKind, NodeState, OpDescriptor,
    OpHandle, ProfileReport, RunContext, Var, VarId,
};

/// Re-export the engine crate for custom operators.
pub mod engine {
    pub use tessera_engine::*;
}

pub mod checkpoint;
pub mod kernels;
pub mod ndarray;
pub mod symbol;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::ndarray::NDArray;
    pub use crate::symbol::{ActType, Executor, Operator, ShapeInfo, Symbol};
    pub use crate::{Device, Engine, EngineConfig, EngineKind, Error, Result, Shape};
}
