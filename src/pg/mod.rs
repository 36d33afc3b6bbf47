//! PostgreSQL wire protocol client.
//!
//! This module provides a pipelining PostgreSQL client that:
//! - Speaks the text format of the extended query protocol
//! - Caches prepared statements per connection
//! - Pipelines queries on each connection and schedules them across a pool
//!
//! Architecture:
//! - `protocol`: Frame builder, frontend encoders, backend decoder
//! - `types`: OIDs, values and the text type registry
//! - `auth` / `scram`: Authentication negotiation
//! - `statement`: Prepared statements and the per-connection cache
//! - `query`: The query future, results, cursors and COPY channels
//! - `config`: Pool settings and runtime hooks
//! - `transport`: Sockets, SSL negotiation and cancel requests
//! - `connection`: The per-connection protocol engine
//! - `pool`: The pool scheduler, reserved connections and transactions

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod query;
pub mod scram;
pub mod statement;
pub mod transport;
pub mod types;

#[cfg(test)]
mod tests;

pub use config::{Notification, PoolOptions, Settings, SslMode, TargetSessionAttrs};
pub use connection::{backoff_delay, Connection, ConnectionState};
pub use error::{ConnectionCode, GenericCode, PgError, PgResult, ServerError};
pub use pool::{PgPool, PoolStats, Reserved, Transaction};
pub use query::{
    CancelHandle, CopyReader, CopyWriter, CursorControl, Query, QueryResult, QueryState, Row,
};
pub use statement::{Column, PreparedStatement, SharedColumns};
pub use types::{Oid, PgValue, TypeRegistry};
