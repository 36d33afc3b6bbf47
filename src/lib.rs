//! pgkit - a pipelining PostgreSQL client with a load-aware connection pool.
//!
//! ```no_run
//! # async fn run() -> pgkit::PgResult<()> {
//! let pool = pgkit::PgPool::connect("postgres://postgres@localhost/postgres")?;
//! let result = pool.query("select $1::int as x", vec![pgkit::PgValue::Int4(1)]).await?;
//! assert_eq!(result.rows[0].get("x"), Some(&pgkit::PgValue::Int4(1)));
//! pool.end(None).await;
//! # Ok(())
//! # }
//! ```

pub mod pg;

pub use pg::{
    CancelHandle, Column, ConnectionCode, CopyReader, CopyWriter, CursorControl, GenericCode,
    PgError, PgPool, PgResult, PgValue, PoolOptions, PoolStats, Query, QueryResult, Reserved,
    Row, ServerError, Settings, SslMode, TargetSessionAttrs, Transaction, TypeRegistry,
};
pub use pg::types::Oid;
