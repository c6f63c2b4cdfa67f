//! Shared compute resources for the join drivers
//!
//! Arbitration of the bounded CPU worker pool and optional accelerator
//! slots, plus the dispatch policy that picks between them per batch.
//!
//! # Submodules
//! - `broker` - Resource arbitration (CPU gate, accelerator slots)
//! - `computer` - Batch dispatch policy over the broker

mod broker;
mod computer;

pub use broker::{Accelerator, CpuGuard, DeviceGuard, ResourceBroker};
pub use computer::GeometryComputer;
