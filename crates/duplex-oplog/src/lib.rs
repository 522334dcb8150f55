//! # duplex-oplog
//!
//! Durable, append-only operation log backed by `SQLite`.
//!
//! The log is the engine's write-ahead record of cross-store intent: before
//! any store write, a `pending` row lands on disk; afterward a `committed`,
//! `failed`, or `compensated` row follows. Rows are never updated in place,
//! so the full history of every workflow attempt can be replayed after a
//! crash.
//!
//! Layered like the rest of the workspace: [`connection`] builds the pool,
//! [`migrations`] owns the schema, [`repository`] holds the raw SQL, and
//! [`log::OperationLog`] is the facade the engine uses.

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod log;
pub mod migrations;
pub mod repository;

pub use connection::ConnectionConfig;
pub use errors::{OpLogError, Result};
pub use log::OperationLog;
