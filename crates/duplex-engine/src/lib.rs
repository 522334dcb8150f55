//! # duplex-engine
//!
//! The synchronization engine: workflow catalog, coordinator, and
//! reconciler.
//!
//! The [`coordinator::Coordinator`] runs catalog workflows against the two
//! stores with write-ahead logging, bounded retries, reverse-order
//! compensation, per-key mutual exclusion, and crash recovery. The
//! [`reconciler::Reconciler`] sweeps configured cross-store pairs for drift
//! and routes repairs back through the coordinator.

#![deny(unsafe_code)]

pub mod catalog;
pub mod coordinator;
pub mod reconciler;
pub mod stores;

pub use catalog::WorkflowCatalog;
pub use coordinator::{Coordinator, WorkflowStatus};
pub use reconciler::{DriftKind, ReconciliationTask, Reconciler, SweepReport};
pub use stores::StorePair;
