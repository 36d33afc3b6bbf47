//! PostgreSQL connection implementation.
//!
//! A [`Connection`] owns one server session at a time and runs the protocol
//! engine for it:
//! - startup, SSL negotiation and authentication
//! - array type discovery and the target_session_attrs check
//! - pipelined extended-protocol execution with a per-connection statement cache
//! - cursors, COPY, cancellation, idle and lifetime timers
//!
//! All mutable state lives in an [`Engine`] behind a mutex that is never held
//! across an await. Work that must not run under the lock (completing
//! queries, pool callbacks, user callbacks, spawning tasks) is collected as
//! [`Effect`]s and run once the lock is released.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Notify, OnceCell};
use tokio::time::Instant;

use super::auth::{AuthStep, Authenticator, PasswordSource};
use super::config::{BoxStream, Notification, PoolOptions, TargetSessionAttrs};
use super::error::{ConnectionCode, GenericCode, PgError, PgResult, ServerError};
use super::protocol::*;
use super::query::{BackendKey, CopyMessage, CursorControl, QueryResult, QueryShared, Row};
use super::statement::{
    signature, Column, ParamTypes, PreparedStatement, SharedColumns, StatementCache,
    StatementNamer,
};
use super::transport;
use super::types::{Oid, PgValue, TypeRegistry};

/// Below this many buffered bytes the writer waits one scheduler tick so
/// queries submitted together leave in one write.
const WRITE_IMMEDIATE: usize = 1024;

/// Unflushed bytes at which the connection reports itself full.
const HIGH_WATER: usize = 64 * 1024;

/// Server routines that mean a cached plan went stale.
const RETRY_ROUTINES: [&str; 3] = [
    "FetchPreparedStatement",
    "RevalidateCachedQuery",
    "transformAssignedExpr",
];

const ARRAY_TYPES_QUERY: &str = "select b.oid, b.typarray \
     from pg_catalog.pg_type a \
     left join pg_catalog.pg_type b on b.oid = a.typelem \
     where a.typcategory = 'A' \
     group by b.oid, b.typarray \
     order by b.oid";

const SESSION_ATTRS_QUERY: &str =
    "show transaction_read_only; select pg_catalog.pg_is_in_recovery()";

// ============================================================================
// Pool-facing interfaces
// ============================================================================

/// Callbacks the pool scheduler receives from its connections.
///
/// Invoked without any connection lock held.
pub(crate) trait ConnectionEvents: Send + Sync {
    /// Startup finished or the last in-flight query completed.
    fn on_open(&self, connection: &Arc<Connection>);
    /// A full connection can take work again.
    fn on_drain(&self, connection: &Arc<Connection>);
    /// Startup finished with the pipeline already full.
    fn on_full(&self, connection: &Arc<Connection>);
    /// A graceful shutdown was requested.
    fn on_end(&self, connection: &Arc<Connection>);
    /// The session is gone; `error` is set when it failed.
    fn on_close(&self, connection: &Arc<Connection>, error: Option<PgError>);
}

/// State shared by every connection of one pool.
pub(crate) struct PoolShared {
    pub options: PoolOptions,
    pub types: RwLock<TypeRegistry>,
    array_types: OnceCell<()>,
    /// Consecutive failed connection attempts, reset by a successful startup
    pub retries: AtomicU32,
}

impl PoolShared {
    pub fn new(options: PoolOptions) -> Self {
        let types = RwLock::new(options.types.clone());
        Self {
            options,
            types,
            array_types: OnceCell::new(),
            retries: AtomicU32::new(0),
        }
    }
}

/// Reconnect delay after `retries` consecutive failures:
/// `(0.5 + rand / 2) * min(3^retries / 100, 20)` seconds.
pub fn backoff_delay(retries: u32) -> Duration {
    let ceiling = (3f64.powi(retries.min(32) as i32) / 100.0).min(20.0);
    Duration::from_secs_f64((0.5 + rand::random::<f64>() / 2.0) * ceiling)
}

/// Lifecycle of the session owned by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

// ============================================================================
// In-flight queries
// ============================================================================

/// A query whose frames have been written, waiting for its ReadyForQuery.
struct InFlight {
    query: Arc<QueryShared>,
    simple: bool,
    statement: Option<Arc<PreparedStatement>>,
    /// The statement came from the cache
    cached: bool,
    /// This query's Parse created the cache entry
    created: bool,
    /// Parse + Describe were sent alone; Bind follows the description
    describe_first: bool,
    /// Nothing may be pipelined behind this query
    blocking: bool,
    /// No Sync has been written for this query yet
    awaiting_sync: bool,
    copy_in: bool,
    copy_out: Option<mpsc::UnboundedSender<Bytes>>,
    retried: Option<PgError>,
    param_types: ParamTypes,
    columns: SharedColumns,
    result: QueryResult,
    /// Completed statements of a simple-protocol script
    finished: Vec<QueryResult>,
    /// Already resolved or rejected
    done: bool,
}

impl InFlight {
    fn new(query: Arc<QueryShared>, retried: Option<PgError>) -> Self {
        Self {
            query,
            simple: false,
            statement: None,
            cached: false,
            created: false,
            describe_first: false,
            blocking: false,
            awaiting_sync: false,
            copy_in: false,
            copy_out: None,
            retried,
            param_types: ParamTypes::new(),
            columns: SharedColumns::default(),
            result: QueryResult::default(),
            finished: Vec::new(),
            done: false,
        }
    }

    fn take_result(&mut self, backend: Option<BackendKey>) -> QueryResult {
        let mut result = std::mem::take(&mut self.result);
        result.columns = Arc::clone(&self.columns);
        result.statement = self.statement.clone();
        result.backend = backend;
        result
    }

    fn finish(mut self, backend: Option<BackendKey>) -> QueryResult {
        if !self.simple {
            return self.take_result(backend);
        }
        let mut last = self.finished.pop().unwrap_or_default();
        last.previous = self.finished;
        last.backend = backend;
        last
    }
}

// ============================================================================
// Effects
// ============================================================================

/// Work collected under the engine lock and run after it is released.
enum Effect {
    Complete(Arc<QueryShared>, PgResult<QueryResult>),
    Cancel,
    Cursor {
        generation: u64,
        query: Arc<QueryShared>,
        rows: Vec<Row>,
        last: bool,
    },
    CopyIn {
        generation: u64,
        query: Arc<QueryShared>,
        rx: mpsc::UnboundedReceiver<CopyMessage>,
    },
    Notice(ServerError),
    Notification(Notification),
    Open,
    Drain,
    Full,
    End,
    Close(Option<PgError>),
    Connect(u64, Duration),
    IdleTimer(u64),
    Lifetime(u64),
}

// ============================================================================
// Engine
// ============================================================================

/// Wakers of the reader and writer tasks of one session.
struct Session {
    wake: Arc<Notify>,
    stop: Arc<Notify>,
}

struct Engine {
    state: ConnectionState,
    /// Bumped whenever a session starts or ends; tasks of older sessions exit
    generation: u64,
    session: Option<Session>,
    /// Submitted but not written yet
    queue: VecDeque<Arc<QueryShared>>,
    /// Stale-plan retries with the error of their first attempt; written
    /// before `queue` once the pipeline has room
    retries: VecDeque<(Arc<QueryShared>, PgError)>,
    /// Written, in server order; the head is the active query
    sent: VecDeque<InFlight>,
    statements: StatementCache,
    namer: StatementNamer,
    frame: FrameBuilder,
    out: BytesMut,
    /// Final bytes of a terminated session and the generation allowed to write them
    draining: Option<(u64, Bytes)>,
    backend: Option<BackendKey>,
    parameters: HashMap<String, String>,
    status: TransactionStatus,
    full: bool,
    ending: bool,
    /// The pool is gone; no reconnects
    ended: bool,
    reserved: bool,
    host_index: usize,
    reconnect_at: Option<Instant>,
    idle_epoch: u64,
    end_waiters: Vec<oneshot::Sender<()>>,
}

impl Engine {
    fn new(capacity: usize) -> Self {
        Self {
            state: ConnectionState::Closed,
            generation: 0,
            session: None,
            queue: VecDeque::new(),
            retries: VecDeque::new(),
            sent: VecDeque::new(),
            statements: StatementCache::new(capacity),
            namer: StatementNamer::new(),
            frame: FrameBuilder::new(),
            out: BytesMut::with_capacity(8192),
            draining: None,
            backend: None,
            parameters: HashMap::new(),
            status: TransactionStatus::Idle,
            full: false,
            ending: false,
            ended: false,
            reserved: false,
            host_index: 0,
            reconnect_at: None,
            idle_epoch: 0,
            end_waiters: Vec::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.sent.is_empty() && self.queue.is_empty() && self.retries.is_empty()
    }

    fn accepting(&self) -> bool {
        self.state == ConnectionState::Open && !self.full && !self.ending
    }

    fn put<M: FrontendMessage>(&mut self, message: &M) {
        let bytes = message.encode(&mut self.frame);
        self.out.extend_from_slice(&bytes);
    }

    fn wake_writer(&self) {
        if let Some(ref session) = self.session {
            session.wake.notify_one();
        }
    }

    fn begin_connect(&mut self, effects: &mut Vec<Effect>) {
        self.state = ConnectionState::Connecting;
        self.generation += 1;
        let delay = self
            .reconnect_at
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or_default();
        effects.push(Effect::Connect(self.generation, delay));
    }

    /// Write queued queries while the pipeline has room.
    fn pump(&mut self, conn: &Connection, effects: &mut Vec<Effect>) {
        let max_pipeline = conn.shared.options.settings.max_pipeline.max(1);
        let mut wrote = false;

        while self.state == ConnectionState::Open && !self.full {
            let (query, retried) = match self.retries.pop_front() {
                Some((query, first)) => (query, Some(first)),
                None => match self.queue.pop_front() {
                    Some(query) => (query, None),
                    None => break,
                },
            };
            if retried.is_none() && !query.begin_execute(conn.this.clone()) {
                continue;
            }
            match self.write_query(conn, Arc::clone(&query), retried) {
                Ok(flight) => {
                    let blocking = flight.blocking;
                    self.sent.push_back(flight);
                    wrote = true;
                    if self.sent.len() == 1 && query.activate() {
                        effects.push(Effect::Cancel);
                    }
                    if blocking || self.sent.len() >= max_pipeline || self.out.len() >= HIGH_WATER {
                        self.full = true;
                    }
                }
                Err(e) => effects.push(Effect::Complete(query, Err(e))),
            }
        }

        if wrote {
            self.idle_epoch += 1;
            self.wake_writer();
        }
    }

    /// Serialize one query into frames. Nothing is written on error.
    fn write_query(
        &mut self,
        conn: &Connection,
        query: Arc<QueryShared>,
        retried: Option<PgError>,
    ) -> PgResult<InFlight> {
        if query.params.len() > MAX_PARAMETERS {
            return Err(PgError::generic(
                GenericCode::MaxParametersExceeded,
                format!("Max number of parameters ({}) exceeded", MAX_PARAMETERS),
            ));
        }

        let mut flight = InFlight::new(Arc::clone(&query), retried);
        let options = &query.options;

        if options.simple {
            flight.simple = true;
            flight.blocking = options.copy;
            self.put(&QueryMessage { query: &query.sql });
            return Ok(flight);
        }

        let prepare = conn.shared.options.settings.prepare && options.prepare.unwrap_or(true);
        let key = signature(&query.types, &query.sql);

        if options.describe_only {
            if let Some(old) = self.statements.get(&key) {
                self.statements.evict(&key, &old.name);
                self.put(&CloseMessage {
                    kind: b'S',
                    name: &old.name,
                });
            }
        }

        let cached = if prepare { self.statements.get(&key) } else { None };
        let registry = conn.shared.types.read();
        let mut frames = BytesMut::new();

        let statement = match cached {
            Some(statement) => {
                tracing::debug!(connection = conn.id, statement = %statement.name, "statement cache hit");
                encode_execute(&mut self.frame, &mut frames, &registry, &statement, &query)?;
                flight.cached = true;
                statement
            }
            None => {
                let name = if prepare {
                    self.namer.next_name()
                } else {
                    String::new()
                };
                let statement = Arc::new(PreparedStatement::new(name, &query.sql, &query.types));
                frames.extend_from_slice(
                    &ParseMessage {
                        name: &statement.name,
                        query: &query.sql,
                        param_types: &query.types,
                    }
                    .encode(&mut self.frame),
                );
                frames.extend_from_slice(
                    &DescribeMessage {
                        kind: b'S',
                        name: &statement.name,
                    }
                    .encode(&mut self.frame),
                );

                flight.describe_first = options.describe_only || !query.params.is_empty();
                if flight.describe_first {
                    frames.extend_from_slice(&FlushMessage.encode(&mut self.frame));
                    flight.awaiting_sync = true;
                } else {
                    encode_execute(&mut self.frame, &mut frames, &registry, &statement, &query)?;
                }
                tracing::debug!(connection = conn.id, statement = %statement.name, "parse");
                statement
            }
        };
        drop(registry);

        if prepare && !flight.cached {
            flight.created = true;
            // Closing the displaced statement goes ahead of the new Parse, so
            // an error in this query cannot make the server skip it.
            if let Some(old) = self.statements.insert(Arc::clone(&statement)) {
                self.put(&CloseMessage {
                    kind: b'S',
                    name: &old.name,
                });
            }
        }

        self.out.extend_from_slice(&frames);
        flight.statement = Some(statement);
        flight.blocking = flight.describe_first || options.cursor_rows.is_some() || options.copy;
        if options.cursor_rows.is_some() {
            flight.awaiting_sync = true;
        }
        Ok(flight)
    }

    // ------------------------------------------------------------------------
    // Backend messages
    // ------------------------------------------------------------------------

    fn handle(
        &mut self,
        conn: &Connection,
        message: BackendMessage,
        effects: &mut Vec<Effect>,
    ) -> PgResult<()> {
        match message {
            BackendMessage::ParseComplete | BackendMessage::CloseComplete => {}
            BackendMessage::BindComplete => {
                if let Some(head) = self.sent.front_mut() {
                    if let Some(ref statement) = head.statement {
                        head.columns = statement.columns();
                    }
                }
            }
            BackendMessage::ParameterDescription { type_oids } => {
                if let Some(head) = self.sent.front_mut() {
                    head.param_types = type_oids.into_iter().collect();
                }
            }
            BackendMessage::RowDescription { fields } => {
                let columns = describe_columns(conn, &fields);
                self.described(conn, columns, effects);
            }
            BackendMessage::NoData => self.described(conn, Vec::new(), effects),
            BackendMessage::DataRow { values } => {
                let Some(head) = self.sent.front_mut() else {
                    return Err(PgError::Protocol("DataRow without a query".to_string()));
                };
                if head.done {
                    return Ok(());
                }
                match decode_row(&head.columns, values, head.query.options.raw) {
                    Ok(row) => head.result.rows.push(row),
                    Err(e) => {
                        head.done = true;
                        effects.push(Effect::Complete(Arc::clone(&head.query), Err(e)));
                    }
                }
            }
            BackendMessage::CommandComplete { tag } => self.command_complete(conn, &tag, effects),
            BackendMessage::EmptyQueryResponse => {
                let backend = self.backend;
                if let Some(head) = self.sent.front_mut() {
                    if head.simple {
                        head.finished.push(QueryResult::default());
                    } else if !head.done {
                        head.done = true;
                        let result = head.take_result(backend);
                        effects.push(Effect::Complete(Arc::clone(&head.query), Ok(result)));
                    }
                }
            }
            BackendMessage::PortalSuspended => {
                if let Some(head) = self.sent.front_mut() {
                    let rows = std::mem::take(&mut head.result.rows);
                    effects.push(Effect::Cursor {
                        generation: self.generation,
                        query: Arc::clone(&head.query),
                        rows,
                        last: false,
                    });
                }
            }
            BackendMessage::CopyInResponse { .. } => self.copy_in(effects),
            BackendMessage::CopyOutResponse { .. } => self.copy_out(),
            BackendMessage::CopyBothResponse { .. } => {
                self.copy_out();
                self.copy_in(effects);
            }
            BackendMessage::CopyData { data } => {
                if let Some(tx) = self.sent.front().and_then(|h| h.copy_out.as_ref()) {
                    let _ = tx.send(data);
                }
            }
            BackendMessage::CopyDone => {
                if let Some(head) = self.sent.front_mut() {
                    head.copy_out = None;
                }
            }
            BackendMessage::ReadyForQuery { status } => self.ready(conn, status, effects),
            BackendMessage::ErrorResponse { fields } => {
                self.error_response(conn, ServerError::from_fields(&fields), effects)
            }
            BackendMessage::NoticeResponse { fields } => {
                effects.push(Effect::Notice(ServerError::from_fields(&fields)))
            }
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => effects.push(Effect::Notification(Notification {
                process_id,
                channel,
                payload,
            })),
            BackendMessage::ParameterStatus { name, value } => {
                self.parameters.insert(name, value);
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                self.backend = Some(BackendKey {
                    process_id,
                    secret_key,
                });
            }
            BackendMessage::Unsupported { name } => match self.sent.front_mut() {
                Some(head) if !head.done => {
                    head.done = true;
                    effects.push(Effect::Complete(
                        Arc::clone(&head.query),
                        Err(PgError::NotSupported(name.to_string())),
                    ));
                }
                _ => tracing::error!(connection = conn.id, kind = name, "unsupported message"),
            },
            other => {
                return Err(PgError::Protocol(format!(
                    "Unexpected message after startup: {:?}",
                    other
                )))
            }
        }
        Ok(())
    }

    /// RowDescription or NoData answered a Describe.
    fn described(&mut self, conn: &Connection, columns: Vec<Column>, effects: &mut Vec<Effect>) {
        let backend = self.backend;
        let Some(head) = self.sent.front_mut() else {
            return;
        };

        if head.simple {
            head.columns = Arc::new(columns);
            return;
        }
        let Some(statement) = head.statement.clone() else {
            return;
        };
        statement.describe(head.param_types.clone(), columns);
        head.columns = statement.columns();

        if head.query.options.describe_only {
            if !head.done {
                head.done = true;
                let result = head.take_result(backend);
                effects.push(Effect::Complete(Arc::clone(&head.query), Ok(result)));
            }
            head.awaiting_sync = false;
            self.put(&SyncMessage);
            self.wake_writer();
            return;
        }

        if !head.describe_first {
            return;
        }
        head.describe_first = false;
        let cursor = head.query.options.cursor_rows.is_some();
        let query = Arc::clone(&head.query);

        let mut frames = BytesMut::new();
        let encoded = {
            let registry = conn.shared.types.read();
            encode_execute(&mut self.frame, &mut frames, &registry, &statement, &query)
        };
        let Some(head) = self.sent.front_mut() else {
            return;
        };
        match encoded {
            Ok(()) => {
                head.awaiting_sync = cursor;
                self.out.extend_from_slice(&frames);
            }
            Err(e) => {
                head.done = true;
                head.awaiting_sync = false;
                effects.push(Effect::Complete(query, Err(e)));
                self.put(&SyncMessage);
            }
        }
        self.wake_writer();
    }

    fn command_complete(&mut self, conn: &Connection, tag: &str, effects: &mut Vec<Effect>) {
        let backend = self.backend;
        let unsafe_begin = conn.shared.options.settings.max > 1 && !self.reserved;
        let generation = self.generation;
        let Some(head) = self.sent.front_mut() else {
            return;
        };
        if head.done {
            return;
        }

        head.result.apply_tag(tag);
        if unsafe_begin && head.result.command == "BEGIN" {
            head.done = true;
            effects.push(Effect::Complete(
                Arc::clone(&head.query),
                Err(PgError::generic(
                    GenericCode::UnsafeTransaction,
                    "Only use Pool::begin, Pool::reserve or max = 1",
                )),
            ));
            return;
        }

        if head.simple {
            let mut result = std::mem::take(&mut head.result);
            result.columns = std::mem::take(&mut head.columns);
            result.backend = backend;
            head.finished.push(result);
            return;
        }

        let cursor = head.query.options.cursor_rows.is_some();
        if cursor {
            let rows = std::mem::take(&mut head.result.rows);
            if !rows.is_empty() {
                effects.push(Effect::Cursor {
                    generation,
                    query: Arc::clone(&head.query),
                    rows,
                    last: true,
                });
            }
            head.awaiting_sync = false;
        }

        head.done = true;
        let result = head.take_result(backend);
        effects.push(Effect::Complete(Arc::clone(&head.query), Ok(result)));

        if cursor {
            self.put(&SyncMessage);
            self.wake_writer();
        }
    }

    fn error_response(&mut self, conn: &Connection, error: ServerError, effects: &mut Vec<Effect>) {
        let Some(head) = self.sent.front_mut() else {
            tracing::warn!(connection = conn.id, code = %error.code, message = %error.message, "server error outside a query");
            return;
        };

        let needs_sync = head.awaiting_sync || (head.copy_in && !head.simple);
        head.awaiting_sync = false;
        head.copy_in = false;

        let retry = !head.done
            && head.retried.is_none()
            && head.cached
            && error
                .routine
                .as_deref()
                .is_some_and(|r| RETRY_ROUTINES.contains(&r));

        // A statement whose Parse failed, or whose plan went stale, is not reused.
        let stale = match head.statement {
            Some(ref statement) if retry || (head.created && !head.done) => {
                Some((statement.signature.clone(), statement.name.clone()))
            }
            _ => None,
        };

        let was_done = std::mem::replace(&mut head.done, true);
        let query = Arc::clone(&head.query);
        let first = head.retried.take();

        if needs_sync {
            self.put(&SyncMessage);
        }
        if let Some((key, name)) = stale {
            if self.statements.evict(&key, &name).is_some() {
                tracing::debug!(connection = conn.id, statement = %name, routine = ?error.routine, "evicted statement after error");
                self.put(&CloseMessage {
                    kind: b'S',
                    name: &name,
                });
            }
        }

        if was_done {
            self.wake_writer();
            return;
        }

        if let Some(first) = first {
            effects.push(Effect::Complete(query, Err(first)));
        } else if retry {
            // Frames already on the wire are answered first; `pump` writes
            // the retry once nothing blocks the pipeline.
            tracing::debug!(connection = conn.id, "retrying query after stale plan");
            self.retries.push_back((query, PgError::from(error)));
        } else {
            effects.push(Effect::Complete(query, Err(PgError::from(error))));
        }
        self.wake_writer();
    }

    fn copy_in(&mut self, effects: &mut Vec<Effect>) {
        let generation = self.generation;
        let Some(head) = self.sent.front_mut() else {
            return;
        };
        head.copy_in = true;
        let writer = head.query.inner.lock().copy_in.take();
        match writer {
            Some(rx) => effects.push(Effect::CopyIn {
                generation,
                query: Arc::clone(&head.query),
                rx,
            }),
            None => {
                head.copy_in = false;
                let extended = !head.simple;
                self.put(&CopyFailMessage {
                    message: "COPY FROM STDIN requires a CopyWriter",
                });
                if extended {
                    self.put(&SyncMessage);
                }
                self.wake_writer();
            }
        }
    }

    fn copy_out(&mut self) {
        if let Some(head) = self.sent.front_mut() {
            head.copy_out = head.query.inner.lock().copy_out.take();
        }
    }

    fn ready(&mut self, conn: &Connection, status: TransactionStatus, effects: &mut Vec<Effect>) {
        self.status = status;
        let backend = self.backend;
        if let Some(flight) = self.sent.pop_front() {
            if !flight.done {
                let query = Arc::clone(&flight.query);
                effects.push(Effect::Complete(query, Ok(flight.finish(backend))));
            }
        }
        if let Some(next) = self.sent.front() {
            if next.query.activate() {
                effects.push(Effect::Cancel);
            }
        }

        let max_pipeline = conn.shared.options.settings.max_pipeline.max(1);
        let was_full = self.full;
        if self.full
            && self.sent.len() < max_pipeline
            && self.out.len() < HIGH_WATER
            && !self.sent.iter().any(|f| f.blocking)
        {
            self.full = false;
        }
        self.pump(conn, effects);

        if self.is_idle() {
            self.full = false;
            if self.ending {
                self.terminate(conn, ConnectionCode::Destroyed, effects);
            } else if !self.reserved {
                effects.push(Effect::Open);
                effects.push(Effect::IdleTimer(self.idle_epoch));
            }
        } else if was_full && !self.full && !self.reserved {
            effects.push(Effect::Drain);
        }
    }

    fn cursor_next(&mut self, query: &Arc<QueryShared>, control: CursorControl) {
        let Some(head) = self.sent.front_mut() else {
            return;
        };
        if !Arc::ptr_eq(&head.query, query) || head.done {
            return;
        }
        match control {
            CursorControl::Continue => {
                let rows = query.options.cursor_rows.unwrap_or(1);
                self.put(&ExecuteMessage {
                    portal: "",
                    max_rows: i32::try_from(rows).unwrap_or(i32::MAX),
                });
                self.put(&FlushMessage);
            }
            CursorControl::Close => {
                head.awaiting_sync = false;
                self.put(&CloseMessage {
                    kind: b'P',
                    name: "",
                });
                self.put(&SyncMessage);
            }
        }
        self.wake_writer();
    }

    /// Reject everything outstanding.
    fn reject_all(&mut self, error: &PgError, effects: &mut Vec<Effect>) {
        for flight in self.sent.drain(..) {
            if !flight.done {
                effects.push(Effect::Complete(flight.query, Err(error.clone())));
            }
        }
        for (query, _) in self.retries.drain(..) {
            effects.push(Effect::Complete(query, Err(error.clone())));
        }
        for query in self.queue.drain(..) {
            effects.push(Effect::Complete(query, Err(error.clone())));
        }
    }

    fn reset_session(&mut self) {
        self.state = ConnectionState::Closed;
        self.generation += 1;
        if let Some(session) = self.session.take() {
            session.stop.notify_one();
            session.wake.notify_one();
        }
        self.out.clear();
        self.statements.clear();
        self.backend = None;
        self.parameters.clear();
        self.status = TransactionStatus::Idle;
        self.full = false;
        self.ending = false;
        for waiter in self.end_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Send Terminate, reject what is left and drop the session.
    fn terminate(&mut self, conn: &Connection, code: ConnectionCode, effects: &mut Vec<Effect>) {
        let error = PgError::connection(code, conn.shared.options.address(self.host_index));
        self.reject_all(&error, effects);

        if self.state == ConnectionState::Open {
            let mut chunk = self.out.split();
            chunk.extend_from_slice(&TerminateMessage.encode(&mut self.frame));
            self.draining = Some((self.generation, chunk.freeze()));
            self.wake_writer();
        }
        let was_connected = self.state != ConnectionState::Closed;
        self.reset_session();
        if was_connected {
            tracing::info!(connection = conn.id, "connection terminated");
            effects.push(Effect::Close(None));
        }
    }
}

/// Bind + Execute for `statement`, then Sync (or Flush for a cursor).
fn encode_execute(
    frame: &mut FrameBuilder,
    out: &mut BytesMut,
    registry: &TypeRegistry,
    statement: &PreparedStatement,
    query: &QueryShared,
) -> PgResult<()> {
    let types = statement.param_types();
    let params = query
        .params
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let oid = types.get(i).copied().unwrap_or_else(|| value.type_oid());
            registry.serialize(oid, value)
        })
        .collect::<PgResult<Vec<_>>>()?;

    out.extend_from_slice(
        &BindMessage {
            portal: "",
            statement: &statement.name,
            params: &params,
        }
        .encode(frame),
    );
    match query.options.cursor_rows {
        Some(rows) => {
            out.extend_from_slice(
                &ExecuteMessage {
                    portal: "",
                    max_rows: i32::try_from(rows).unwrap_or(i32::MAX),
                }
                .encode(frame),
            );
            out.extend_from_slice(&FlushMessage.encode(frame));
        }
        None => {
            out.extend_from_slice(&ExecuteMessage { portal: "", max_rows: 0 }.encode(frame));
            out.extend_from_slice(&SyncMessage.encode(frame));
        }
    }
    Ok(())
}

fn describe_columns(conn: &Connection, fields: &[FieldDescription]) -> Vec<Column> {
    let registry = conn.shared.types.read();
    let transform = conn.shared.options.column_transform.as_ref();
    fields
        .iter()
        .map(|field| {
            let name = match transform {
                Some(transform) => transform(&field.name),
                None => field.name.clone(),
            };
            Column::new(field, name, registry.parser(field.type_oid))
        })
        .collect()
}

fn decode_row(columns: &SharedColumns, values: Vec<Option<Bytes>>, raw: bool) -> PgResult<Row> {
    let mut decoded = Vec::with_capacity(values.len());
    for (i, value) in values.into_iter().enumerate() {
        let value = match value {
            None => PgValue::Null,
            Some(bytes) if raw => PgValue::Bytea(bytes.to_vec()),
            Some(bytes) => {
                let text = std::str::from_utf8(&bytes)
                    .map_err(|e| PgError::Type(format!("column {}: {}", i, e)))?;
                match columns.get(i).and_then(|c| c.parser.as_ref()) {
                    Some(parse) => parse(text)?,
                    None => PgValue::Text(text.to_string()),
                }
            }
        };
        decoded.push(value);
    }
    Ok(Row::new(Arc::clone(columns), decoded))
}

fn session_attrs_accept(
    attrs: TargetSessionAttrs,
    read_only: bool,
    standby: bool,
    last_host: bool,
) -> bool {
    match attrs {
        TargetSessionAttrs::Any => true,
        TargetSessionAttrs::ReadWrite => !read_only,
        TargetSessionAttrs::ReadOnly => read_only,
        TargetSessionAttrs::Primary => !standby,
        TargetSessionAttrs::Standby => standby,
        TargetSessionAttrs::PreferStandby => standby || last_host,
    }
}

// ============================================================================
// Startup
// ============================================================================

/// A session that finished startup and is ready for queries.
struct Handshake {
    stream: BoxStream,
    frames: FrameReader,
    host_index: usize,
    backend: Option<BackendKey>,
    parameters: HashMap<String, String>,
    status: TransactionStatus,
}

async fn read_message(stream: &mut BoxStream, frames: &mut FrameReader) -> PgResult<BackendMessage> {
    loop {
        if let Some(message) = frames.next_message()? {
            return Ok(message);
        }
        if stream.read_buf(frames.buffer_mut()).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection during startup",
            )
            .into());
        }
    }
}

async fn write_frame(stream: &mut BoxStream, frame: &[u8]) -> PgResult<()> {
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Run a simple query during startup and collect every row as text.
async fn startup_query(
    stream: &mut BoxStream,
    frames: &mut FrameReader,
    sql: &str,
) -> PgResult<Vec<Vec<Option<String>>>> {
    write_frame(stream, &QueryMessage { query: sql }.to_bytes()).await?;
    let mut rows = Vec::new();
    let mut error = None;
    loop {
        match read_message(stream, frames).await? {
            BackendMessage::DataRow { values } => rows.push(
                values
                    .into_iter()
                    .map(|v| v.map(|b| String::from_utf8_lossy(&b).into_owned()))
                    .collect(),
            ),
            BackendMessage::ErrorResponse { fields } => {
                error = Some(PgError::from(ServerError::from_fields(&fields)))
            }
            BackendMessage::ReadyForQuery { .. } => {
                return match error {
                    Some(e) => Err(e),
                    None => Ok(rows),
                }
            }
            _ => {}
        }
    }
}

async fn fetch_array_types(
    stream: &mut BoxStream,
    frames: &mut FrameReader,
    types: &RwLock<TypeRegistry>,
) -> PgResult<()> {
    let rows = startup_query(stream, frames, ARRAY_TYPES_QUERY).await?;
    let mut registry = types.write();
    let mut registered = 0usize;
    for row in rows {
        let (Some(Some(element)), Some(Some(array))) = (row.first(), row.get(1)) else {
            continue;
        };
        let (Ok(element), Ok(array)) = (element.parse::<u32>(), array.parse::<u32>()) else {
            continue;
        };
        if registry.register_array(Oid(element), Oid(array)) {
            registered += 1;
        }
    }
    tracing::debug!(registered, "array types registered");
    Ok(())
}

// ============================================================================
// Connection
// ============================================================================

/// One pooled connection. Sessions come and go; the connection persists
/// for the lifetime of its pool.
pub struct Connection {
    id: usize,
    shared: Arc<PoolShared>,
    events: Weak<dyn ConnectionEvents>,
    engine: Mutex<Engine>,
    this: Weak<Connection>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let engine = self.engine.lock();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &engine.state)
            .field("sent", &engine.sent.len())
            .field("queued", &(engine.queue.len() + engine.retries.len()))
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        id: usize,
        shared: Arc<PoolShared>,
        events: Weak<dyn ConnectionEvents>,
    ) -> Arc<Self> {
        let capacity = shared.options.settings.statement_cache_capacity;
        Arc::new_cyclic(|this| Self {
            id,
            shared,
            events,
            engine: Mutex::new(Engine::new(capacity)),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.engine.lock().state
    }

    pub fn backend(&self) -> Option<BackendKey> {
        self.engine.lock().backend
    }

    /// A server parameter reported by ParameterStatus.
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.engine.lock().parameters.get(name).cloned()
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.engine.lock().status
    }

    /// Queries written or queued and not yet answered.
    pub fn pending(&self) -> usize {
        let engine = self.engine.lock();
        engine.sent.len() + engine.queue.len() + engine.retries.len()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.engine.lock().is_idle()
    }

    /// Submit a query. Returns whether the connection can take more work
    /// right away; queries it cannot write yet stay queued on it.
    pub(crate) fn execute(&self, query: Arc<QueryShared>) -> bool {
        let mut effects = Vec::new();
        let accepting = {
            let mut engine = self.engine.lock();
            if engine.ended {
                let error = PgError::connection(
                    ConnectionCode::Destroyed,
                    self.shared.options.address(engine.host_index),
                );
                effects.push(Effect::Complete(query, Err(error)));
                false
            } else {
                engine.queue.push_back(query);
                match engine.state {
                    ConnectionState::Open => engine.pump(self, &mut effects),
                    ConnectionState::Closed => engine.begin_connect(&mut effects),
                    ConnectionState::Connecting => {}
                }
                engine.accepting()
            }
        };
        self.run(effects);
        accepting
    }

    /// Open a session without any work for it.
    pub(crate) fn connect(&self) {
        let mut effects = Vec::new();
        {
            let mut engine = self.engine.lock();
            if engine.state == ConnectionState::Closed && !engine.ended {
                engine.begin_connect(&mut effects);
            }
        }
        self.run(effects);
    }

    pub(crate) fn set_reserved(&self, reserved: bool) {
        let mut engine = self.engine.lock();
        engine.reserved = reserved;
        engine.idle_epoch += 1;
    }

    /// Ask the server to cancel the statement running on this session.
    pub(crate) fn send_cancel(&self) {
        let (key, host_index) = {
            let engine = self.engine.lock();
            (engine.backend, engine.host_index)
        };
        let Some(key) = key else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        let id = self.id;
        tokio::spawn(async move {
            tracing::debug!(connection = id, pid = key.process_id, "sending cancel request");
            if let Err(e) = transport::cancel(&shared.options, host_index, key).await {
                tracing::debug!(connection = id, error = %e, "cancel request failed");
            }
        });
    }

    /// Finish outstanding work, then close the session.
    pub(crate) async fn end(&self) {
        let mut effects = Vec::new();
        let waiter = {
            let mut engine = self.engine.lock();
            match engine.state {
                ConnectionState::Closed => None,
                ConnectionState::Open if engine.is_idle() => {
                    effects.push(Effect::End);
                    engine.terminate(self, ConnectionCode::Destroyed, &mut effects);
                    None
                }
                _ => {
                    if !engine.ending {
                        effects.push(Effect::End);
                    }
                    engine.ending = true;
                    let (tx, rx) = oneshot::channel();
                    engine.end_waiters.push(tx);
                    Some(rx)
                }
            }
        };
        self.run(effects);
        if let Some(rx) = waiter {
            let _ = rx.await;
        }
    }

    /// Close immediately, rejecting outstanding work with CONNECTION_DESTROYED.
    pub(crate) fn terminate(&self) {
        let mut effects = Vec::new();
        {
            let mut engine = self.engine.lock();
            engine.ended = true;
            engine.terminate(self, ConnectionCode::Destroyed, &mut effects);
        }
        self.run(effects);
    }

    /// Stop reconnecting; used when the pool ends.
    pub(crate) fn mark_ended(&self) {
        self.engine.lock().ended = true;
    }

    // ------------------------------------------------------------------------
    // Session tasks
    // ------------------------------------------------------------------------

    async fn establish(self: Arc<Self>, generation: u64, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let first_host = {
            let engine = self.engine.lock();
            if engine.generation != generation {
                return;
            }
            engine.host_index
        };

        let timeout = self.shared.options.connect_timeout_duration();
        let outcome = match tokio::time::timeout(timeout, self.handshake(first_host)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PgError::connection(
                ConnectionCode::ConnectTimeout,
                self.shared.options.address(first_host),
            )),
        };

        match outcome {
            Ok(handshake) => self.opened(generation, handshake),
            Err(e) => {
                {
                    let mut engine = self.engine.lock();
                    if engine.generation == generation {
                        engine.host_index = (first_host + 1) % self.shared.options.host_count();
                    }
                }
                self.closed(generation, Some(e));
            }
        }
    }

    /// Try hosts in order from `first_host` until one satisfies
    /// target_session_attrs.
    async fn handshake(&self, first_host: usize) -> PgResult<Handshake> {
        let options = &self.shared.options;
        let hosts = options.host_count();
        let attrs = options.settings.target_session_attrs;

        for attempt in 0..hosts {
            let host_index = (first_host + attempt) % hosts;
            let mut handshake = self.startup(host_index).await?;

            if options.settings.fetch_types {
                let Handshake {
                    ref mut stream,
                    ref mut frames,
                    ..
                } = handshake;
                self.shared
                    .array_types
                    .get_or_try_init(|| fetch_array_types(stream, frames, &self.shared.types))
                    .await?;
            }

            if attrs == TargetSessionAttrs::Any {
                return Ok(handshake);
            }
            let (read_only, standby) = self.session_attrs(&mut handshake).await?;
            if session_attrs_accept(attrs, read_only, standby, attempt + 1 == hosts) {
                return Ok(handshake);
            }

            tracing::warn!(
                connection = self.id,
                host = %options.address(host_index),
                read_only,
                standby,
                "server does not match target_session_attrs"
            );
            let _ = write_frame(&mut handshake.stream, &TerminateMessage.to_bytes()).await;
        }

        Err(PgError::connection(
            ConnectionCode::Closed,
            format!("no host matches target_session_attrs {:?}", attrs),
        ))
    }

    async fn startup(&self, host_index: usize) -> PgResult<Handshake> {
        let options = &self.shared.options;
        let settings = &options.settings;
        let mut stream = transport::open(options, host_index).await?;

        let mut params = Vec::new();
        if let Some(ref name) = settings.application_name {
            params.push(("application_name".to_string(), name.clone()));
        }
        params.extend(settings.connection.iter().cloned());
        let startup = StartupMessage {
            user: settings.user.clone(),
            database: Some(settings.database.clone()),
            options: params,
        };
        write_frame(&mut stream, &startup.to_bytes()).await?;

        let source = match (&options.password_provider, &settings.password) {
            (Some(provider), _) => PasswordSource::Provider(Arc::clone(provider)),
            (None, Some(password)) => PasswordSource::Static(password.clone()),
            (None, None) => PasswordSource::None,
        };
        let mut auth = Authenticator::new(&settings.user, source);
        let mut frames = FrameReader::new();
        let mut backend = None;
        let mut parameters = HashMap::new();

        let status = loop {
            match read_message(&mut stream, &mut frames).await? {
                message @ (BackendMessage::AuthenticationOk
                | BackendMessage::AuthenticationCleartextPassword
                | BackendMessage::AuthenticationMD5Password { .. }
                | BackendMessage::AuthenticationSASL { .. }
                | BackendMessage::AuthenticationSASLContinue { .. }
                | BackendMessage::AuthenticationSASLFinal { .. }
                | BackendMessage::AuthenticationOther { .. }) => {
                    if let AuthStep::Respond(frame) = auth.step(message).await? {
                        if !frame.is_empty() {
                            write_frame(&mut stream, &frame).await?;
                        }
                    }
                }
                BackendMessage::ParameterStatus { name, value } => {
                    parameters.insert(name, value);
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    backend = Some(BackendKey {
                        process_id,
                        secret_key,
                    })
                }
                BackendMessage::ReadyForQuery { status } => break status,
                BackendMessage::ErrorResponse { fields } => {
                    return Err(ServerError::from_fields(&fields).into())
                }
                BackendMessage::NoticeResponse { fields } => {
                    self.notice(&ServerError::from_fields(&fields))
                }
                BackendMessage::Unsupported { name } => {
                    return Err(PgError::NotSupported(name.to_string()))
                }
                other => {
                    return Err(PgError::Protocol(format!(
                        "Unexpected message during startup: {:?}",
                        other
                    )))
                }
            }
        };

        Ok(Handshake {
            stream,
            frames,
            host_index,
            backend,
            parameters,
            status,
        })
    }

    /// (read_only, standby) from ParameterStatus when the server reports
    /// both, otherwise from a follow-up query.
    async fn session_attrs(&self, handshake: &mut Handshake) -> PgResult<(bool, bool)> {
        let reported = (
            handshake.parameters.get("default_transaction_read_only"),
            handshake.parameters.get("in_hot_standby"),
        );
        if let (Some(read_only), Some(standby)) = reported {
            return Ok((read_only == "on", standby == "on"));
        }

        let rows = startup_query(&mut handshake.stream, &mut handshake.frames, SESSION_ATTRS_QUERY).await?;
        let cell = |i: usize| rows.get(i).and_then(|r| r.first()).cloned().flatten();
        Ok((
            cell(0).as_deref() == Some("on"),
            cell(1).as_deref() == Some("t"),
        ))
    }

    fn opened(&self, generation: u64, handshake: Handshake) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let Handshake {
            stream,
            frames,
            host_index,
            backend,
            parameters,
            status,
        } = handshake;

        let wake = Arc::new(Notify::new());
        let stop = Arc::new(Notify::new());
        let mut effects = Vec::new();
        {
            let mut engine = self.engine.lock();
            if engine.generation != generation || engine.state != ConnectionState::Connecting {
                return;
            }
            engine.state = ConnectionState::Open;
            engine.host_index = host_index;
            engine.backend = backend;
            engine.parameters = parameters;
            engine.status = status;
            engine.full = false;
            engine.reconnect_at = None;
            engine.namer = StatementNamer::new();
            engine.session = Some(Session {
                wake: Arc::clone(&wake),
                stop: Arc::clone(&stop),
            });
            self.shared.retries.store(0, Ordering::Relaxed);

            tracing::info!(
                connection = self.id,
                host = %self.shared.options.address(host_index),
                pid = backend.map(|b| b.process_id),
                "connection open"
            );

            engine.pump(self, &mut effects);
            if engine.is_idle() {
                if engine.ending {
                    engine.terminate(self, ConnectionCode::Destroyed, &mut effects);
                } else if !engine.reserved {
                    effects.push(Effect::Open);
                    effects.push(Effect::IdleTimer(engine.idle_epoch));
                }
            } else if !engine.reserved {
                effects.push(if engine.full { Effect::Full } else { Effect::Drain });
            }
            effects.push(Effect::Lifetime(generation));
        }

        let (read, write) = tokio::io::split(stream);
        tokio::spawn(Arc::clone(&this).read_loop(generation, read, frames, stop));
        tokio::spawn(this.write_loop(generation, write, wake));
        self.run(effects);
    }

    /// The session ended. `error` is set when it failed.
    fn closed(&self, generation: u64, error: Option<PgError>) {
        let mut effects = Vec::new();
        {
            let mut engine = self.engine.lock();
            if engine.generation != generation {
                return;
            }
            let address = self.shared.options.address(engine.host_index);
            let rejection = match error {
                Some(ref e) if !matches!(e, PgError::Io(_)) => e.clone(),
                _ => PgError::connection(ConnectionCode::Closed, address.clone()),
            };
            engine.reject_all(&rejection, &mut effects);
            engine.reset_session();

            if let Some(ref e) = error {
                let retries = self.shared.retries.fetch_add(1, Ordering::Relaxed) + 1;
                if self.shared.options.settings.backoff {
                    let delay = backoff_delay(retries);
                    engine.reconnect_at = Some(Instant::now() + delay);
                    tracing::warn!(connection = self.id, host = %address, error = %e, retries, ?delay, "connection failed");
                } else {
                    tracing::warn!(connection = self.id, host = %address, error = %e, "connection failed");
                }
            } else {
                tracing::info!(connection = self.id, host = %address, "connection closed");
            }
            effects.push(Effect::Close(error));
        }
        self.run(effects);
    }

    async fn read_loop(
        self: Arc<Self>,
        generation: u64,
        mut read: ReadHalf<BoxStream>,
        mut frames: FrameReader,
        stop: Arc<Notify>,
    ) {
        loop {
            match self.process(generation, &mut frames) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    tracing::error!(connection = self.id, error = %e, "protocol violation");
                    self.closed(generation, Some(e));
                    return;
                }
            }
            let read = tokio::select! {
                read = read.read_buf(frames.buffer_mut()) => read,
                _ = stop.notified() => return,
            };
            match read {
                Ok(0) => {
                    self.closed(generation, None);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    self.closed(generation, Some(e.into()));
                    return;
                }
            }
        }
    }

    /// Handle every complete frame in the buffer. False once the session is stale.
    fn process(&self, generation: u64, frames: &mut FrameReader) -> PgResult<bool> {
        let mut effects = Vec::new();
        let outcome = {
            let mut engine = self.engine.lock();
            if engine.generation != generation {
                return Ok(false);
            }
            let mut outcome = Ok(true);
            loop {
                match frames.next_message() {
                    Ok(Some(message)) => {
                        if let Err(e) = engine.handle(self, message, &mut effects) {
                            outcome = Err(e);
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                }
            }
            outcome
        };
        self.run(effects);
        outcome
    }

    async fn write_loop(self: Arc<Self>, generation: u64, mut write: WriteHalf<BoxStream>, wake: Arc<Notify>) {
        loop {
            wake.notified().await;
            let small = self.engine.lock().out.len() < WRITE_IMMEDIATE;
            if small {
                tokio::task::yield_now().await;
            }

            let (chunk, last) = {
                let mut engine = self.engine.lock();
                if engine.generation == generation {
                    (engine.out.split().freeze(), false)
                } else {
                    match engine.draining.take() {
                        Some((g, chunk)) if g == generation => (chunk, true),
                        other => {
                            engine.draining = other;
                            return;
                        }
                    }
                }
            };

            if !chunk.is_empty() {
                let written = async {
                    write.write_all(&chunk).await?;
                    write.flush().await
                }
                .await;
                if let Err(e) = written {
                    if !last {
                        self.closed(generation, Some(e.into()));
                    }
                    return;
                }
            }
            if last {
                let _ = write.shutdown().await;
                return;
            }
            self.flushed(generation);
        }
    }

    /// The writer emptied the buffer; a connection held full by backpressure
    /// may take work again.
    fn flushed(&self, generation: u64) {
        let mut effects = Vec::new();
        {
            let mut engine = self.engine.lock();
            if engine.generation != generation || !engine.full || engine.reserved {
                return;
            }
            let max_pipeline = self.shared.options.settings.max_pipeline.max(1);
            if engine.sent.len() < max_pipeline
                && engine.out.len() < HIGH_WATER
                && !engine.sent.iter().any(|f| f.blocking)
            {
                engine.full = false;
                effects.push(Effect::Drain);
            }
        }
        self.run(effects);
    }

    fn write_copy(&self, generation: u64, query: &Arc<QueryShared>, message: CopyMessage) -> bool {
        let mut engine = self.engine.lock();
        if engine.generation != generation {
            return false;
        }
        let extended = match engine.sent.front() {
            Some(head) if Arc::ptr_eq(&head.query, query) && head.copy_in => !head.simple,
            _ => return false,
        };
        let finished = match message {
            CopyMessage::Data(data) => {
                engine.put(&CopyDataMessage { data: &data });
                false
            }
            CopyMessage::Done => {
                engine.put(&CopyDoneMessage);
                true
            }
            CopyMessage::Fail(reason) => {
                engine.put(&CopyFailMessage { message: &reason });
                true
            }
        };
        if finished {
            if extended {
                engine.put(&SyncMessage);
            }
            if let Some(head) = engine.sent.front_mut() {
                head.copy_in = false;
            }
        }
        engine.wake_writer();
        true
    }

    async fn forward_copy(
        self: Arc<Self>,
        generation: u64,
        query: Arc<QueryShared>,
        mut rx: mpsc::UnboundedReceiver<CopyMessage>,
    ) {
        loop {
            let message = rx
                .recv()
                .await
                .unwrap_or_else(|| CopyMessage::Fail("CopyWriter dropped before finish".to_string()));
            let finished = !matches!(message, CopyMessage::Data(_));
            if !self.write_copy(generation, &query, message) || finished {
                return;
            }
        }
    }

    fn run_cursor(&self, generation: u64, query: Arc<QueryShared>, rows: Vec<Row>, last: bool) {
        let mut callback = query.inner.lock().cursor.take();
        let control = match callback.as_mut() {
            Some(callback) => callback(rows),
            None => CursorControl::Close,
        };
        {
            let mut inner = query.inner.lock();
            if !inner.state.is_terminal() {
                inner.cursor = callback;
            }
        }
        if last {
            return;
        }
        let mut engine = self.engine.lock();
        if engine.generation == generation {
            engine.cursor_next(&query, control);
        }
    }

    fn notice(&self, notice: &ServerError) {
        match self.shared.options.on_notice {
            Some(ref handler) => handler(notice),
            None => tracing::warn!(
                connection = self.id,
                severity = %notice.severity,
                code = %notice.code,
                "{}",
                notice.message
            ),
        }
    }

    fn spawn_timer(&self, delay: Duration, check: impl FnOnce(&Engine) -> bool + Send + 'static) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let expired = check(&this.engine.lock());
            if expired {
                this.end().await;
            }
        });
    }

    fn run(&self, effects: Vec<Effect>) {
        if effects.is_empty() {
            return;
        }
        let this = self.this.upgrade();
        let events = self.events.upgrade();

        for effect in effects {
            match effect {
                Effect::Complete(query, result) => query.complete(result),
                Effect::Cancel => self.send_cancel(),
                Effect::Cursor {
                    generation,
                    query,
                    rows,
                    last,
                } => self.run_cursor(generation, query, rows, last),
                Effect::CopyIn {
                    generation,
                    query,
                    rx,
                } => {
                    if let Some(ref this) = this {
                        tokio::spawn(Arc::clone(this).forward_copy(generation, query, rx));
                    }
                }
                Effect::Notice(notice) => self.notice(&notice),
                Effect::Notification(notification) => {
                    if let Some(ref handler) = self.shared.options.on_notification {
                        handler(&notification);
                    }
                }
                Effect::Open => {
                    if let (Some(events), Some(this)) = (&events, &this) {
                        events.on_open(this);
                    }
                }
                Effect::Drain => {
                    if let (Some(events), Some(this)) = (&events, &this) {
                        events.on_drain(this);
                    }
                }
                Effect::Full => {
                    if let (Some(events), Some(this)) = (&events, &this) {
                        events.on_full(this);
                    }
                }
                Effect::End => {
                    if let (Some(events), Some(this)) = (&events, &this) {
                        events.on_end(this);
                    }
                }
                Effect::Close(error) => {
                    if let (Some(events), Some(this)) = (&events, &this) {
                        events.on_close(this, error);
                    }
                }
                Effect::Connect(generation, delay) => {
                    if let Some(ref this) = this {
                        tokio::spawn(Arc::clone(this).establish(generation, delay));
                    }
                }
                Effect::IdleTimer(epoch) => {
                    if let Some(idle) = self.shared.options.idle_timeout_duration() {
                        self.spawn_timer(idle, move |engine| {
                            engine.state == ConnectionState::Open
                                && engine.idle_epoch == epoch
                                && engine.is_idle()
                                && !engine.reserved
                        });
                    }
                }
                Effect::Lifetime(generation) => {
                    if let Some(lifetime) = self.shared.options.max_lifetime_duration() {
                        self.spawn_timer(lifetime, move |engine| {
                            engine.state == ConnectionState::Open && engine.generation == generation
                        });
                    }
                }
            }
        }
    }
}
