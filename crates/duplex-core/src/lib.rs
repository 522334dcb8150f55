//! # duplex-core
//!
//! Foundation types for the Duplex dual-store synchronization core.
//!
//! This crate provides the shared vocabulary that all other Duplex crates
//! depend on:
//!
//! - **Branded IDs**: [`ids::WorkflowKey`], [`ids::EntryId`], [`ids::StoreRef`],
//!   [`ids::TaskId`] as newtypes
//! - **Errors**: [`errors::DuplexError`] taxonomy via `thiserror` — the
//!   transient/permanent split that drives every retry decision
//! - **Retry**: [`retry::RetryConfig`] and backoff calculation
//! - **Workflow vocabulary**: [`workflow::Step`], [`workflow::WorkflowRequest`],
//!   [`workflow::WorkflowOutcome`]
//! - **Logging**: [`logging::init_subscriber`] for the `tracing` subscriber
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by all other duplex crates.

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod retry;
pub mod workflow;
