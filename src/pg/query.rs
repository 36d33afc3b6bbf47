//! The caller-facing query handle.
//!
//! A [`Query`] is built by the pool (or a reserved connection), configured
//! with builder methods and submitted lazily on first poll. The engine
//! reports back through the shared half, [`QueryShared`], which also carries
//! the lifecycle state used to settle cancellation races.

use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::connection::Connection;
use super::error::{ConnectionCode, GenericCode, PgError, PgResult};
use super::statement::{ParamTypes, PreparedStatement, SharedColumns};
use super::types::{Oid, PgValue};

// ============================================================================
// Options and state
// ============================================================================

/// Per-query execution flags.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Use the simple protocol (one `Query` frame, no parameters)
    pub simple: bool,
    /// Override the pool's `prepare` setting
    pub prepare: Option<bool>,
    /// Only Parse + Describe; resolve with the statement description
    pub describe_only: bool,
    /// Return undecoded column bytes
    pub raw: bool,
    /// Fetch in batches of this many rows
    pub cursor_rows: Option<u32>,
    /// The statement is a COPY; nothing is pipelined behind it
    pub copy: bool,
}

/// Lifecycle of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Built, maybe queued, nothing written yet
    Created,
    /// Frames written, earlier statements still ahead of it
    Executing,
    /// The server is working on it
    Active,
    Resolved,
    Rejected,
    Cancelled,
}

impl QueryState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueryState::Resolved | QueryState::Rejected | QueryState::Cancelled
        )
    }
}

/// Process id and secret of a backend, needed for CancelRequest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendKey {
    pub process_id: i32,
    pub secret_key: i32,
}

/// Returned by a cursor callback after each batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorControl {
    Continue,
    Close,
}

pub type CursorFn = Box<dyn FnMut(Vec<Row>) -> CursorControl + Send>;

// ============================================================================
// Rows and results
// ============================================================================

/// One decoded row.
#[derive(Debug, Clone)]
pub struct Row {
    columns: SharedColumns,
    values: Vec<PgValue>,
}

impl Row {
    pub(crate) fn new(columns: SharedColumns, values: Vec<PgValue>) -> Self {
        Self { columns, values }
    }

    /// Value of the first column called `name`.
    pub fn get(&self, name: &str) -> Option<&PgValue> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .and_then(|i| self.values.get(i))
    }

    pub fn get_index(&self, index: usize) -> Option<&PgValue> {
        self.values.get(index)
    }

    pub fn columns(&self) -> &SharedColumns {
        &self.columns
    }

    pub fn values(&self) -> &[PgValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<PgValue> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Result of one statement.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    /// Trailing number of the command tag, e.g. 3 for `UPDATE 3`
    pub count: Option<u64>,
    /// Command word(s) of the tag, e.g. `SELECT`, `CREATE TABLE`
    pub command: String,
    pub columns: SharedColumns,
    pub statement: Option<Arc<PreparedStatement>>,
    pub backend: Option<BackendKey>,
    /// Results of earlier statements in a simple-protocol script
    pub previous: Vec<QueryResult>,
}

impl QueryResult {
    pub(crate) fn apply_tag(&mut self, tag: &str) {
        match tag.rsplit_once(' ') {
            Some((head, tail)) if tail.bytes().all(|b| b.is_ascii_digit()) => {
                self.count = tail.parse().ok();
                // INSERT carries an extra oid field: `INSERT 0 1`
                self.command = head
                    .strip_suffix(" 0")
                    .filter(|_| head.starts_with("INSERT"))
                    .unwrap_or(head)
                    .to_string();
            }
            _ => {
                self.command = tag.to_string();
                self.count = None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }
}

// ============================================================================
// COPY channels
// ============================================================================

#[derive(Debug)]
pub(crate) enum CopyMessage {
    Data(Bytes),
    Done,
    Fail(String),
}

/// Feeds a `COPY ... FROM STDIN`.
pub struct CopyWriter {
    tx: mpsc::UnboundedSender<CopyMessage>,
}

impl CopyWriter {
    pub fn send(&self, chunk: impl Into<Bytes>) -> PgResult<()> {
        self.tx
            .send(CopyMessage::Data(chunk.into()))
            .map_err(|_| PgError::generic(GenericCode::CopyFailed, "COPY is no longer in progress"))
    }

    /// Complete the copy; the query resolves with the row count.
    pub fn finish(self) {
        let _ = self.tx.send(CopyMessage::Done);
    }

    /// Abort the copy; the query rejects with the server's error.
    pub fn fail(self, message: &str) {
        let _ = self.tx.send(CopyMessage::Fail(message.to_string()));
    }
}

/// Drains a `COPY ... TO STDOUT`.
pub struct CopyReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl CopyReader {
    /// Next chunk, `None` after CopyDone.
    pub async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

// ============================================================================
// Shared query state
// ============================================================================

/// Where a query goes when it is first polled.
pub(crate) trait QuerySink: Send + Sync {
    fn submit(&self, query: Arc<QueryShared>);
}

pub(crate) struct QueryInner {
    pub state: QueryState,
    tx: Option<oneshot::Sender<PgResult<QueryResult>>>,
    connection: Option<Weak<Connection>>,
    cancel_requested: bool,
    pub cursor: Option<CursorFn>,
    pub copy_in: Option<mpsc::UnboundedReceiver<CopyMessage>>,
    pub copy_out: Option<mpsc::UnboundedSender<Bytes>>,
}

/// The half of a query shared with the scheduler and the engine.
pub struct QueryShared {
    pub(crate) sql: String,
    pub(crate) params: Vec<PgValue>,
    pub(crate) types: ParamTypes,
    pub(crate) options: QueryOptions,
    pub(crate) origin: &'static Location<'static>,
    pub(crate) inner: Mutex<QueryInner>,
}

impl fmt::Debug for QueryShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryShared")
            .field("sql", &self.sql)
            .field("params", &self.params.len())
            .field("state", &self.state())
            .field("origin", &self.origin)
            .finish()
    }
}

impl QueryShared {
    pub fn state(&self) -> QueryState {
        self.inner.lock().state
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == QueryState::Cancelled
    }

    /// Claim the query for a connection. False if it was cancelled or
    /// already finished while queued.
    pub(crate) fn begin_execute(&self, connection: Weak<Connection>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != QueryState::Created {
            return false;
        }
        inner.state = QueryState::Executing;
        inner.connection = Some(connection);
        true
    }

    /// The query reached the head of its connection's pipeline. Returns
    /// true when a cancel was requested in the meantime and must be sent.
    pub(crate) fn activate(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == QueryState::Executing {
            inner.state = QueryState::Active;
            return inner.cancel_requested;
        }
        false
    }

    /// Settle the query. Server errors get the origin attached.
    pub(crate) fn complete(&self, result: PgResult<QueryResult>) {
        let tx = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = if result.is_ok() {
                QueryState::Resolved
            } else {
                QueryState::Rejected
            };
            inner.cursor = None;
            inner.copy_in = None;
            inner.copy_out = None;
            inner.tx.take()
        };
        let result = result.map_err(|e| match e {
            PgError::Server(mut server) => {
                server.origin.get_or_insert(self.origin);
                PgError::Server(server)
            }
            other => other,
        });
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
    }

    pub(crate) fn reject(&self, error: PgError) {
        self.complete(Err(error));
    }

    /// Request cancellation. Safe to call any number of times.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            QueryState::Created => {
                inner.state = QueryState::Cancelled;
                let tx = inner.tx.take();
                drop(inner);
                if let Some(tx) = tx {
                    let _ = tx.send(Err(cancelled_error()));
                }
            }
            QueryState::Executing => inner.cancel_requested = true,
            QueryState::Active if !inner.cancel_requested => {
                inner.cancel_requested = true;
                let connection = inner.connection.as_ref().and_then(Weak::upgrade);
                drop(inner);
                if let Some(connection) = connection {
                    connection.send_cancel();
                }
            }
            _ => {}
        }
    }
}

fn cancelled_error() -> PgError {
    PgError::generic(
        GenericCode::QueryCancelled,
        "canceling statement due to user request",
    )
}

/// Cancels a query from another task.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    shared: Arc<QueryShared>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn state(&self) -> QueryState {
        self.shared.state()
    }
}

// ============================================================================
// Query future
// ============================================================================

/// A pending query. Await it to run it.
#[must_use = "queries do nothing unless awaited"]
pub struct Query {
    shared: Arc<QueryShared>,
    rx: oneshot::Receiver<PgResult<QueryResult>>,
    sink: Option<Arc<dyn QuerySink>>,
}

impl Query {
    #[track_caller]
    pub(crate) fn new(
        sink: Arc<dyn QuerySink>,
        sql: impl Into<String>,
        params: Vec<PgValue>,
        types: Option<&[Oid]>,
    ) -> Self {
        let types = match types {
            Some(types) => ParamTypes::from_slice(types),
            None => params.iter().map(PgValue::type_oid).collect(),
        };
        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(QueryShared {
            sql: sql.into(),
            params,
            types,
            options: QueryOptions::default(),
            origin: Location::caller(),
            inner: Mutex::new(QueryInner {
                state: QueryState::Created,
                tx: Some(tx),
                connection: None,
                cancel_requested: false,
                cursor: None,
                copy_in: None,
                copy_out: None,
            }),
        });
        Self {
            shared,
            rx,
            sink: Some(sink),
        }
    }

    /// Builder methods only take effect before the query is submitted and
    /// before a cancel handle is taken.
    fn configure(mut self, f: impl FnOnce(&mut QueryShared)) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            f(shared);
        }
        self
    }

    /// Run through the simple protocol. Parameters are not allowed.
    pub fn simple(self) -> Self {
        self.configure(|q| q.options.simple = true)
    }

    /// Override the pool's prepared statement setting.
    pub fn prepare(self, prepare: bool) -> Self {
        self.configure(|q| q.options.prepare = Some(prepare))
    }

    /// Resolve with the statement's parameter types and columns only.
    pub fn describe(self) -> Self {
        self.configure(|q| q.options.describe_only = true)
    }

    /// Return column values as undecoded bytes.
    pub fn raw(self) -> Self {
        self.configure(|q| q.options.raw = true)
    }

    /// Stream the result in batches of `rows`; `callback` decides after each
    /// batch whether to keep fetching.
    pub fn cursor<F>(self, rows: u32, callback: F) -> Self
    where
        F: FnMut(Vec<Row>) -> CursorControl + Send + 'static,
    {
        self.configure(|q| {
            q.options.cursor_rows = Some(rows.max(1));
            q.inner.get_mut().cursor = Some(Box::new(callback));
        })
    }

    /// Attach a writer for `COPY ... FROM STDIN`.
    pub fn copy_in(self) -> (Self, CopyWriter) {
        let (tx, rx) = mpsc::unbounded_channel();
        let query = self.configure(|q| {
            q.options.copy = true;
            q.inner.get_mut().copy_in = Some(rx);
        });
        (query, CopyWriter { tx })
    }

    /// Attach a reader for `COPY ... TO STDOUT`.
    pub fn copy_out(self) -> (Self, CopyReader) {
        let (tx, rx) = mpsc::unbounded_channel();
        let query = self.configure(|q| {
            q.options.copy = true;
            q.inner.get_mut().copy_out = Some(tx);
        });
        (query, CopyReader { rx })
    }

    /// Submit now instead of on first poll.
    pub fn execute(mut self) -> Self {
        self.submit();
        self
    }

    fn submit(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.submit(Arc::clone(&self.shared));
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn state(&self) -> QueryState {
        self.shared.state()
    }

    /// Where in the caller's code this query was built.
    pub fn origin(&self) -> &'static Location<'static> {
        self.shared.origin
    }

    pub fn sql(&self) -> &str {
        &self.shared.sql
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query").field("shared", &self.shared).finish()
    }
}

impl Future for Query {
    type Output = PgResult<QueryResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.submit();
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(PgError::connection(
                    ConnectionCode::Destroyed,
                    "query dropped by its connection",
                ))
            })
        })
    }
}
