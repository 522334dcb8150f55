//! # duplex-store
//!
//! Store adapter contract and in-memory store implementations.
//!
//! The coordinator never talks to a database directly; it talks to a
//! [`adapter::StoreAdapter`], which owns idempotent re-apply (the same
//! workflow key + step index never produces a second side effect) and
//! transient/permanent error classification.
//!
//! Two in-memory implementations live here:
//!
//! - [`relational::RelationalStore`]: tables of rows with generated integer
//!   keys, parameterized insert/update/delete shapes
//! - [`document::DocumentStore`]: collections of JSON documents with
//!   upsert-by-filter, set-fields + append-to-list composites, and
//!   aggregation-style grouped counts
//!
//! Both support fault injection and write counters so tests can assert
//! at-most-once side effects under retries and crash recovery.

#![deny(unsafe_code)]

pub mod adapter;
pub mod document;
pub mod relational;

pub use adapter::{FaultKind, RefRecord, StoreAdapter};
pub use document::{DocumentStore, PRIMARY_REF_FIELD};
pub use relational::RelationalStore;
