//! PostgreSQL connection pool.
//!
//! The pool owns exactly `max` connections, created lazily and tracked in
//! one of several state queues. Queries are routed to an idle connection
//! first, then to a closed one (which connects), then pipelined onto the
//! least loaded busy one; when every connection is full they wait in a
//! central backlog that is shared out as connections free up.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use super::config::PoolOptions;
use super::connection::{Connection, ConnectionEvents, ConnectionState, PoolShared};
use super::error::{ConnectionCode, PgError, PgResult};
use super::query::{Query, QueryShared, QuerySink};
use super::types::{Oid, PgValue};

// ============================================================================
// State queues
// ============================================================================

/// Where the pool keeps a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Idle and ready
    Open,
    /// Has work in flight and room for more
    Busy,
    /// Cannot take more work until it drains
    Full,
    Connecting,
    Closed,
    /// Pinned by a `Reserved` handle or a transaction
    Reserved,
    /// Shutting down
    Ended,
}

const SLOTS: [Slot; 7] = [
    Slot::Open,
    Slot::Busy,
    Slot::Full,
    Slot::Connecting,
    Slot::Closed,
    Slot::Reserved,
    Slot::Ended,
];

/// Connection ids partitioned by [`Slot`]. Every id is in exactly one queue;
/// moves are O(1) through swap-remove.
struct StateQueues {
    queues: [Vec<usize>; SLOTS.len()],
    /// (slot, index in that slot's queue), indexed by connection id
    location: Vec<(Slot, usize)>,
}

impl StateQueues {
    fn new(count: usize) -> Self {
        let mut queues: [Vec<usize>; SLOTS.len()] = Default::default();
        queues[Slot::Closed as usize] = (0..count).collect();
        Self {
            queues,
            location: (0..count).map(|id| (Slot::Closed, id)).collect(),
        }
    }

    fn slot(&self, id: usize) -> Slot {
        self.location[id].0
    }

    fn ids(&self, slot: Slot) -> &[usize] {
        &self.queues[slot as usize]
    }

    fn len(&self, slot: Slot) -> usize {
        self.queues[slot as usize].len()
    }

    fn first(&self, slot: Slot) -> Option<usize> {
        self.queues[slot as usize].first().copied()
    }

    fn move_to(&mut self, id: usize, slot: Slot) {
        let (from, index) = self.location[id];
        if from == slot {
            return;
        }
        let queue = &mut self.queues[from as usize];
        queue.swap_remove(index);
        if let Some(&moved) = queue.get(index) {
            self.location[moved].1 = index;
        }
        let queue = &mut self.queues[slot as usize];
        self.location[id] = (slot, queue.len());
        queue.push(id);
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Work waiting for a connection.
enum Pending {
    Query(Arc<QueryShared>),
    Reserve(oneshot::Sender<Arc<Connection>>),
}

struct Scheduler {
    queues: StateQueues,
    backlog: VecDeque<Pending>,
    ending: bool,
}

/// Snapshot of where the pool's connections are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub open: usize,
    pub busy: usize,
    pub full: usize,
    pub connecting: usize,
    pub closed: usize,
    pub reserved: usize,
    pub ended: usize,
    /// Queries and reservations waiting in the backlog
    pub queued: usize,
}

struct PoolInner {
    shared: Arc<PoolShared>,
    connections: Vec<Arc<Connection>>,
    scheduler: Mutex<Scheduler>,
}

impl PoolInner {
    fn ended_error(&self) -> PgError {
        PgError::connection(ConnectionCode::Ended, self.shared.options.address(0))
    }

    /// Hand `query` to `connection` and file the connection by how it took it.
    fn go(&self, scheduler: &mut Scheduler, connection: &Connection, query: Arc<QueryShared>) -> bool {
        let accepting = connection.execute(query);
        let slot = if accepting {
            // Rejected before it was written, e.g. too many parameters.
            if connection.pending() == 0 {
                Slot::Open
            } else {
                Slot::Busy
            }
        } else if connection.state() == ConnectionState::Open {
            Slot::Full
        } else {
            Slot::Connecting
        };
        scheduler.queues.move_to(connection.id(), slot);
        accepting
    }

    fn reserve_on(&self, scheduler: &mut Scheduler, connection: &Arc<Connection>, tx: oneshot::Sender<Arc<Connection>>) -> bool {
        connection.set_reserved(true);
        scheduler.queues.move_to(connection.id(), Slot::Reserved);
        match tx.send(Arc::clone(connection)) {
            Ok(()) => true,
            Err(_) => {
                // The caller gave up waiting.
                connection.set_reserved(false);
                false
            }
        }
    }

    /// Give `connection` its share of the backlog.
    fn drain(&self, scheduler: &mut Scheduler, connection: &Arc<Connection>) {
        let connecting = scheduler.queues.len(Slot::Connecting);
        let share = scheduler.backlog.len().div_ceil(connecting + 1);

        for _ in 0..share {
            let Some(pending) = scheduler.backlog.pop_front() else {
                break;
            };
            match pending {
                Pending::Query(query) => {
                    if !self.go(scheduler, connection, query) {
                        break;
                    }
                }
                Pending::Reserve(tx) => {
                    if self.reserve_on(scheduler, connection, tx) {
                        break;
                    }
                    scheduler.queues.move_to(connection.id(), self.resting_slot(connection));
                }
            }
        }
    }

    /// The queue an unreserved connection belongs in, judged by its engine.
    fn resting_slot(&self, connection: &Connection) -> Slot {
        match connection.state() {
            ConnectionState::Open if connection.is_idle() => Slot::Open,
            ConnectionState::Open => Slot::Busy,
            ConnectionState::Connecting => Slot::Connecting,
            ConnectionState::Closed => Slot::Closed,
        }
    }

    fn least_loaded(&self, scheduler: &Scheduler) -> Option<usize> {
        scheduler
            .queues
            .ids(Slot::Busy)
            .iter()
            .copied()
            .min_by_key(|&id| self.connections[id].pending())
    }

    async fn reserve(self: &Arc<Self>) -> PgResult<Arc<Connection>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut scheduler = self.scheduler.lock();
            if scheduler.ending {
                return Err(self.ended_error());
            }
            let candidate = scheduler
                .queues
                .first(Slot::Open)
                .or_else(|| scheduler.queues.first(Slot::Closed));
            match candidate {
                Some(id) => {
                    let connection = Arc::clone(&self.connections[id]);
                    connection.set_reserved(true);
                    scheduler.queues.move_to(id, Slot::Reserved);
                    connection.connect();
                    return Ok(connection);
                }
                None => scheduler.backlog.push_back(Pending::Reserve(tx)),
            }
        }
        rx.await.map_err(|_| self.ended_error())
    }

    fn release(&self, connection: &Arc<Connection>) {
        connection.set_reserved(false);
        let mut scheduler = self.scheduler.lock();
        if scheduler.queues.slot(connection.id()) != Slot::Reserved {
            return;
        }
        if scheduler.ending {
            scheduler.queues.move_to(connection.id(), Slot::Ended);
            return;
        }
        let slot = self.resting_slot(connection);
        scheduler.queues.move_to(connection.id(), slot);
        tracing::debug!(connection = connection.id(), ?slot, "connection released");
        match slot {
            Slot::Open | Slot::Busy => self.drain(&mut scheduler, connection),
            Slot::Closed if !scheduler.backlog.is_empty() => {
                connection.connect();
                scheduler.queues.move_to(connection.id(), Slot::Connecting);
            }
            _ => {}
        }
    }

    fn take_backlog(&self, ending: bool) -> Vec<Arc<Connection>> {
        let backlog = {
            let mut scheduler = self.scheduler.lock();
            scheduler.ending = true;
            std::mem::take(&mut scheduler.backlog)
        };
        let error = self.ended_error();
        for pending in backlog {
            if let Pending::Query(query) = pending {
                query.reject(error.clone());
            }
        }
        for connection in &self.connections {
            if ending {
                connection.mark_ended();
            }
        }
        self.connections.clone()
    }
}

impl QuerySink for PoolInner {
    fn submit(&self, query: Arc<QueryShared>) {
        let mut scheduler = self.scheduler.lock();
        if scheduler.ending {
            drop(scheduler);
            query.reject(self.ended_error());
            return;
        }

        let target = scheduler
            .queues
            .first(Slot::Open)
            .or_else(|| scheduler.queues.first(Slot::Closed))
            .or_else(|| self.least_loaded(&scheduler));
        match target {
            Some(id) => {
                let connection = Arc::clone(&self.connections[id]);
                self.go(&mut scheduler, &connection, query);
            }
            None => scheduler.backlog.push_back(Pending::Query(query)),
        }
    }
}

impl ConnectionEvents for PoolInner {
    fn on_open(&self, connection: &Arc<Connection>) {
        let mut scheduler = self.scheduler.lock();
        if matches!(scheduler.queues.slot(connection.id()), Slot::Reserved | Slot::Ended) {
            return;
        }
        scheduler.queues.move_to(connection.id(), Slot::Open);
        self.drain(&mut scheduler, connection);
    }

    fn on_drain(&self, connection: &Arc<Connection>) {
        let mut scheduler = self.scheduler.lock();
        if matches!(scheduler.queues.slot(connection.id()), Slot::Reserved | Slot::Ended) {
            return;
        }
        scheduler.queues.move_to(connection.id(), Slot::Busy);
        self.drain(&mut scheduler, connection);
    }

    fn on_full(&self, connection: &Arc<Connection>) {
        let mut scheduler = self.scheduler.lock();
        if matches!(scheduler.queues.slot(connection.id()), Slot::Reserved | Slot::Ended) {
            return;
        }
        scheduler.queues.move_to(connection.id(), Slot::Full);
    }

    fn on_end(&self, connection: &Arc<Connection>) {
        let mut scheduler = self.scheduler.lock();
        if scheduler.queues.slot(connection.id()) != Slot::Reserved {
            scheduler.queues.move_to(connection.id(), Slot::Ended);
        }
    }

    fn on_close(&self, connection: &Arc<Connection>, error: Option<PgError>) {
        let mut scheduler = self.scheduler.lock();
        if scheduler.queues.slot(connection.id()) == Slot::Reserved {
            return;
        }
        if scheduler.ending {
            scheduler.queues.move_to(connection.id(), Slot::Ended);
            return;
        }
        scheduler.queues.move_to(connection.id(), Slot::Closed);
        if !scheduler.backlog.is_empty() {
            tracing::debug!(connection = connection.id(), failed = error.is_some(), "reconnecting for backlog");
            connection.connect();
            scheduler.queues.move_to(connection.id(), Slot::Connecting);
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for connection in &self.connections {
            connection.terminate();
        }
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A PostgreSQL connection pool.
///
/// Cloning is cheap; clones share the same connections.
#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for PgPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgPool").field("stats", &self.stats()).finish()
    }
}

impl PgPool {
    /// Create a pool. No connection is opened until the first query.
    pub fn new(options: PoolOptions) -> Self {
        let max = options.settings.max.max(1);
        let shared = Arc::new(PoolShared::new(options));
        let inner = Arc::new_cyclic(|this: &Weak<PoolInner>| {
            let events: Weak<dyn ConnectionEvents> = this.clone();
            PoolInner {
                connections: (0..max)
                    .map(|id| Connection::new(id, Arc::clone(&shared), events.clone()))
                    .collect(),
                shared,
                scheduler: Mutex::new(Scheduler {
                    queues: StateQueues::new(max),
                    backlog: VecDeque::new(),
                    ending: false,
                }),
            }
        });
        Self { inner }
    }

    /// Create a pool from a `postgres://` URL.
    pub fn connect(url: &str) -> PgResult<Self> {
        Ok(Self::new(PoolOptions::from_url(url)?))
    }

    fn sink(&self) -> Arc<dyn QuerySink> {
        Arc::clone(&self.inner) as Arc<dyn QuerySink>
    }

    /// A parameterized query; parameter types come from the values.
    #[track_caller]
    pub fn query(&self, sql: impl Into<String>, params: Vec<PgValue>) -> Query {
        Query::new(self.sink(), sql, params, None)
    }

    /// A parameterized query with explicit parameter types.
    #[track_caller]
    pub fn query_typed(&self, sql: impl Into<String>, params: Vec<PgValue>, types: &[Oid]) -> Query {
        Query::new(self.sink(), sql, params, Some(types))
    }

    /// A script run through the simple protocol.
    #[track_caller]
    pub fn simple(&self, sql: impl Into<String>) -> Query {
        Query::new(self.sink(), sql, Vec::new(), None).simple()
    }

    /// Pin one connection until the returned handle is dropped.
    pub async fn reserve(&self) -> PgResult<Reserved> {
        let connection = self.inner.reserve().await?;
        Ok(Reserved::new(Arc::clone(&self.inner), connection))
    }

    /// Start a transaction on a reserved connection.
    pub async fn begin(&self) -> PgResult<Transaction> {
        self.begin_with("").await
    }

    /// Start a transaction with extra BEGIN options, e.g. `isolation level serializable`.
    pub async fn begin_with(&self, options: &str) -> PgResult<Transaction> {
        let reserved = self.reserve().await?;
        let sql = if options.is_empty() {
            "begin".to_string()
        } else {
            format!("begin {}", options)
        };
        reserved.simple(sql).await?;
        Ok(Transaction {
            reserved: Some(reserved),
        })
    }

    /// Stop accepting queries and close every connection once its work is
    /// done. After `timeout`, whatever is left is terminated.
    pub async fn end(&self, timeout: Option<Duration>) {
        let connections = self.inner.take_backlog(true);
        tracing::info!(connections = connections.len(), "ending pool");

        let mut ending = JoinSet::new();
        for connection in connections {
            ending.spawn(async move { connection.end().await });
        }
        let all = async { while ending.join_next().await.is_some() {} };

        match timeout {
            Some(timeout) => {
                if tokio::time::timeout(timeout, all).await.is_err() {
                    tracing::warn!(?timeout, "pool end timed out, terminating");
                    self.terminate();
                }
            }
            None => all.await,
        }
    }

    /// Close every connection now, rejecting outstanding queries with
    /// `CONNECTION_DESTROYED`.
    pub fn terminate(&self) {
        for connection in self.inner.take_backlog(false) {
            connection.terminate();
        }
    }

    pub fn stats(&self) -> PoolStats {
        let scheduler = self.inner.scheduler.lock();
        let queues = &scheduler.queues;
        PoolStats {
            open: queues.len(Slot::Open),
            busy: queues.len(Slot::Busy),
            full: queues.len(Slot::Full),
            connecting: queues.len(Slot::Connecting),
            closed: queues.len(Slot::Closed),
            reserved: queues.len(Slot::Reserved),
            ended: queues.len(Slot::Ended),
            queued: scheduler.backlog.len(),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.shared.options
    }
}

// ============================================================================
// Reserved connections
// ============================================================================

/// Routes queries straight to one connection.
struct Pinned(Arc<Connection>);

impl QuerySink for Pinned {
    fn submit(&self, query: Arc<QueryShared>) {
        self.0.execute(query);
    }
}

/// A connection taken out of shared routing. Returned to the pool on drop.
pub struct Reserved {
    pool: Arc<PoolInner>,
    connection: Arc<Connection>,
    sink: Arc<Pinned>,
}

impl fmt::Debug for Reserved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reserved").field("connection", &self.connection).finish()
    }
}

impl Reserved {
    fn new(pool: Arc<PoolInner>, connection: Arc<Connection>) -> Self {
        let sink = Arc::new(Pinned(Arc::clone(&connection)));
        Self {
            pool,
            connection,
            sink,
        }
    }

    fn sink(&self) -> Arc<dyn QuerySink> {
        Arc::clone(&self.sink) as Arc<dyn QuerySink>
    }

    #[track_caller]
    pub fn query(&self, sql: impl Into<String>, params: Vec<PgValue>) -> Query {
        Query::new(self.sink(), sql, params, None)
    }

    #[track_caller]
    pub fn query_typed(&self, sql: impl Into<String>, params: Vec<PgValue>, types: &[Oid]) -> Query {
        Query::new(self.sink(), sql, params, Some(types))
    }

    #[track_caller]
    pub fn simple(&self, sql: impl Into<String>) -> Query {
        Query::new(self.sink(), sql, Vec::new(), None).simple()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Return the connection to the pool.
    pub fn release(self) {}
}

impl Drop for Reserved {
    fn drop(&mut self) {
        self.pool.release(&self.connection);
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// A transaction on a reserved connection.
///
/// Dropping it without `commit` or `rollback` queues a rollback ahead of
/// anything the pool sends to the connection next.
#[derive(Debug)]
pub struct Transaction {
    reserved: Option<Reserved>,
}

impl Transaction {
    fn reserved(&self) -> PgResult<&Reserved> {
        self.reserved.as_ref().ok_or_else(|| {
            PgError::connection(ConnectionCode::Ended, "transaction already finished")
        })
    }

    #[track_caller]
    pub fn query(&self, sql: impl Into<String>, params: Vec<PgValue>) -> PgResult<Query> {
        Ok(self.reserved()?.query(sql, params))
    }

    #[track_caller]
    pub fn query_typed(&self, sql: impl Into<String>, params: Vec<PgValue>, types: &[Oid]) -> PgResult<Query> {
        Ok(self.reserved()?.query_typed(sql, params, types))
    }

    #[track_caller]
    pub fn simple(&self, sql: impl Into<String>) -> PgResult<Query> {
        Ok(self.reserved()?.simple(sql))
    }

    pub async fn commit(mut self) -> PgResult<()> {
        self.finish("commit").await
    }

    pub async fn rollback(mut self) -> PgResult<()> {
        self.finish("rollback").await
    }

    async fn finish(&mut self, sql: &str) -> PgResult<()> {
        let reserved = self.reserved.take().ok_or_else(|| {
            PgError::connection(ConnectionCode::Ended, "transaction already finished")
        })?;
        reserved.simple(sql).await.map(|_| ())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(reserved) = self.reserved.take() {
            tracing::debug!(connection = reserved.connection.id(), "rolling back dropped transaction");
            drop(reserved.simple("rollback").execute());
        }
    }
}
