//! # tessera-core
//!
//! Core types shared by the Tessera engine and array crates.
//!
//! This crate provides:
//! - [`Error`] / [`Result`]: the single error type used across Tessera
//! - [`Shape`]: n-dimensional shape representation
//! - [`Device`]: CPU and (simulated) GPU device identities
//! - [`Storage`]: shared, lockable array buffers

pub mod device;
pub mod error;
pub mod shape;
pub mod storage;

pub use device::{Device, DeviceKind};
pub use error::{Error, Result};
pub use shape::Shape;
pub use storage::Storage;
