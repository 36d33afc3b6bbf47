//! Engine and pool tests against a scripted in-memory server.
//!
//! Each connection the pool opens gets its own `tokio::io::duplex` pair; the
//! server half is driven by `Mock::serve`, which speaks enough of the v3
//! protocol to exercise pipelining, statement caching, cursors, COPY and
//! cancellation without a live PostgreSQL.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;

use super::config::{BoxFuture, BoxStream, PoolOptions, TargetSessionAttrs, TransportFactory};
use super::pool::PgPool;
use super::query::{CancelHandle, CursorControl, Query, QueryState};
use super::types::{Oid, PgValue};

const CANCEL_CODE: i32 = 80877102;
const VOID: Oid = Oid(2278);

// ============================================================================
// Scripted server
// ============================================================================

#[derive(Default)]
struct Log {
    hosts: Vec<String>,
    startups: usize,
    startup_params: HashMap<String, String>,
    passwords: Vec<String>,
    cancels: usize,
    terminates: usize,
    parses: Vec<String>,
    closes: Vec<(u8, String)>,
    simple: Vec<String>,
}

#[derive(Default)]
struct Mock {
    log: Mutex<Log>,
    /// Binds of already bound statements still to fail as a stale plan
    stale_plan: AtomicUsize,
    /// Connection attempts to refuse before accepting
    refuse: AtomicUsize,
    /// Never answer the startup message
    silent: AtomicBool,
    /// Ask for a cleartext password and check it
    password: Mutex<Option<String>>,
    /// Report the first session as a hot standby
    standby_first: AtomicBool,
    /// Leave session attributes out of ParameterStatus
    hide_attrs: AtomicBool,
    delay_ms: AtomicU64,
    cancel: Notify,
}

#[derive(Default)]
struct Session {
    statements: HashMap<String, (String, Vec<Oid>)>,
    bound: HashSet<String>,
    portal: Option<Portal>,
    skipping: bool,
    copy: Option<CopyIn>,
    in_transaction: bool,
}

struct Portal {
    sql: String,
    params: Vec<Option<String>>,
    offset: usize,
}

struct CopyIn {
    rows: usize,
    extended: bool,
}

enum Outcome {
    Rows {
        rows: Vec<Vec<Option<String>>>,
        tag: String,
    },
    CopyIn,
    CopyOut(Vec<&'static str>),
}

struct Failure {
    code: &'static str,
    message: String,
    routine: &'static str,
}

impl Failure {
    fn new(code: &'static str, message: impl Into<String>, routine: &'static str) -> Self {
        Self {
            code,
            message: message.into(),
            routine,
        }
    }
}

fn rows(rows: Vec<Vec<Option<&str>>>, tag: &str) -> Result<Outcome, Failure> {
    Ok(Outcome::Rows {
        rows: rows
            .into_iter()
            .map(|row| row.into_iter().map(|v| v.map(str::to_string)).collect())
            .collect(),
        tag: tag.to_string(),
    })
}

fn columns(sql: &str) -> Vec<(&'static str, Oid)> {
    match sql {
        "select 1 as x" => vec![("x", Oid::INT4)],
        "show transaction_read_only" => vec![("transaction_read_only", Oid::TEXT)],
        "select pg_catalog.pg_is_in_recovery()" => vec![("pg_is_in_recovery", Oid::BOOL)],
        s if s.starts_with("select $1::int") => vec![("x", Oid::INT4)],
        s if s.starts_with("select generate_series") => vec![("n", Oid::INT4)],
        s if s.starts_with("select pg_sleep") => vec![("pg_sleep", VOID)],
        s if s.starts_with("select b.oid") => {
            vec![("oid", Oid::OID_TYPE), ("typarray", Oid::OID_TYPE)]
        }
        _ => Vec::new(),
    }
}

fn inferred_params(sql: &str) -> Vec<Oid> {
    if sql.starts_with("select $1::int") {
        vec![Oid::INT4]
    } else {
        Vec::new()
    }
}

fn argument<T: std::str::FromStr>(sql: &str, open: &str) -> T {
    let start = sql.find(open).unwrap() + open.len();
    let end = sql[start..].find(')').unwrap() + start;
    sql[start..end].trim().parse().ok().unwrap()
}

// Backend message writers

fn frame(out: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    let mut payload = BytesMut::new();
    body(&mut payload);
    out.put_u8(tag);
    out.put_i32(payload.len() as i32 + 4);
    out.extend_from_slice(&payload);
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.put_u8(0);
}

fn read_cstr(body: &mut Bytes) -> String {
    let end = body.iter().position(|&b| b == 0).unwrap();
    let s = String::from_utf8(body.split_to(end).to_vec()).unwrap();
    body.advance(1);
    s
}

fn error_fields(out: &mut BytesMut, tag: u8, severity: &str, failure: &Failure) {
    frame(out, tag, |b| {
        b.put_u8(b'S');
        put_cstr(b, severity);
        b.put_u8(b'V');
        put_cstr(b, severity);
        b.put_u8(b'C');
        put_cstr(b, failure.code);
        b.put_u8(b'M');
        put_cstr(b, &failure.message);
        b.put_u8(b'R');
        put_cstr(b, failure.routine);
        b.put_u8(0);
    });
}

fn parameter_status(out: &mut BytesMut, name: &str, value: &str) {
    frame(out, b'S', |b| {
        put_cstr(b, name);
        put_cstr(b, value);
    });
}

fn row_description(out: &mut BytesMut, cols: &[(&str, Oid)]) {
    frame(out, b'T', |b| {
        b.put_i16(cols.len() as i16);
        for (name, oid) in cols {
            put_cstr(b, name);
            b.put_i32(0);
            b.put_i16(0);
            b.put_u32(oid.0);
            b.put_i16(-1);
            b.put_i32(-1);
            b.put_i16(0);
        }
    });
}

fn data_row(out: &mut BytesMut, values: &[Option<String>]) {
    frame(out, b'D', |b| {
        b.put_i16(values.len() as i16);
        for value in values {
            match value {
                Some(v) => {
                    b.put_i32(v.len() as i32);
                    b.extend_from_slice(v.as_bytes());
                }
                None => b.put_i32(-1),
            }
        }
    });
}

fn command_complete(out: &mut BytesMut, tag: &str) {
    frame(out, b'C', |b| put_cstr(b, tag));
}

fn copy_response(out: &mut BytesMut, tag: u8) {
    frame(out, tag, |b| {
        b.put_u8(0);
        b.put_i16(1);
        b.put_i16(0);
    });
}

fn ready(out: &mut BytesMut, session: &Session) {
    let status = if session.in_transaction { b'T' } else { b'I' };
    frame(out, b'Z', |b| b.put_u8(status));
}

async fn read_untagged(stream: &mut DuplexStream, input: &mut BytesMut) -> Option<Bytes> {
    loop {
        if input.len() >= 4 {
            let len = i32::from_be_bytes(input[..4].try_into().unwrap()) as usize;
            if input.len() >= len {
                let mut body = input.split_to(len).freeze();
                body.advance(4);
                return Some(body);
            }
        }
        if stream.read_buf(input).await.ok()? == 0 {
            return None;
        }
    }
}

async fn read_tagged(stream: &mut DuplexStream, input: &mut BytesMut) -> Option<(u8, Bytes)> {
    loop {
        if input.len() >= 5 {
            let len = i32::from_be_bytes(input[1..5].try_into().unwrap()) as usize;
            if input.len() > len {
                let mut body = input.split_to(len + 1).freeze();
                let tag = body.get_u8();
                body.advance(4);
                return Some((tag, body));
            }
        }
        if stream.read_buf(input).await.ok()? == 0 {
            return None;
        }
    }
}

impl Mock {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn factory(self: &Arc<Self>) -> Arc<dyn TransportFactory> {
        let mock = Arc::clone(self);
        Arc::new(
            move |host: &str, _port: u16| -> BoxFuture<'static, io::Result<BoxStream>> {
                let mock = Arc::clone(&mock);
                let host = host.to_string();
                Box::pin(async move {
                    mock.log.lock().hosts.push(host);
                    if mock
                        .refuse
                        .fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                    {
                        return Err(io::Error::new(
                            io::ErrorKind::ConnectionRefused,
                            "connection refused",
                        ));
                    }
                    let (client, server) = tokio::io::duplex(1 << 16);
                    tokio::spawn(Arc::clone(&mock).serve(server));
                    Ok(Box::new(client) as BoxStream)
                })
            },
        )
    }

    fn options(self: &Arc<Self>) -> PoolOptions {
        PoolOptions::default()
            .transport(self.factory())
            .fetch_types(false)
            .backoff(false)
    }

    fn parses(&self) -> usize {
        self.log.lock().parses.len()
    }

    async fn serve(self: Arc<Self>, mut stream: DuplexStream) {
        let mut input = BytesMut::new();
        let Some(mut startup) = read_untagged(&mut stream, &mut input).await else {
            return;
        };
        if startup.get_i32() == CANCEL_CODE {
            self.log.lock().cancels += 1;
            self.cancel.notify_one();
            return;
        }
        if self.silent.load(SeqCst) {
            let _ = stream.read(&mut [0u8; 1]).await;
            return;
        }

        let mut params = HashMap::new();
        while startup.first().is_some_and(|&b| b != 0) {
            let name = read_cstr(&mut startup);
            let value = read_cstr(&mut startup);
            params.insert(name, value);
        }
        let number = {
            let mut log = self.log.lock();
            log.startups += 1;
            log.startup_params = params;
            log.startups
        };

        let mut out = BytesMut::new();
        let expected = self.password.lock().clone();
        if let Some(expected) = expected {
            frame(&mut out, b'R', |b| b.put_i32(3));
            if stream.write_all(&out.split()).await.is_err() {
                return;
            }
            let Some((b'p', mut body)) = read_tagged(&mut stream, &mut input).await else {
                return;
            };
            let password = read_cstr(&mut body);
            self.log.lock().passwords.push(password.clone());
            if password != expected {
                let failure = Failure::new(
                    "28P01",
                    "password authentication failed for user \"postgres\"",
                    "auth_failed",
                );
                error_fields(&mut out, b'E', "FATAL", &failure);
                let _ = stream.write_all(&out).await;
                return;
            }
        }

        let standby = self.standby_first.load(SeqCst) && number == 1;
        frame(&mut out, b'R', |b| b.put_i32(0));
        parameter_status(&mut out, "server_version", "16.2");
        parameter_status(&mut out, "client_encoding", "UTF8");
        if !self.hide_attrs.load(SeqCst) {
            parameter_status(&mut out, "in_hot_standby", if standby { "on" } else { "off" });
            parameter_status(
                &mut out,
                "default_transaction_read_only",
                if standby { "on" } else { "off" },
            );
        }
        frame(&mut out, b'K', |b| {
            b.put_i32(1000 + number as i32);
            b.put_i32(42);
        });
        let mut session = Session::default();
        ready(&mut out, &session);
        if stream.write_all(&out).await.is_err() {
            return;
        }

        loop {
            let Some((tag, body)) = read_tagged(&mut stream, &mut input).await else {
                return;
            };
            let mut out = BytesMut::new();
            let keep = self.handle(&mut session, tag, body, &mut out).await;
            if !out.is_empty() && stream.write_all(&out).await.is_err() {
                return;
            }
            if !keep {
                return;
            }
        }
    }

    async fn handle(&self, s: &mut Session, tag: u8, mut body: Bytes, out: &mut BytesMut) -> bool {
        if let Some(copy) = s.copy.as_mut() {
            match tag {
                b'd' => copy.rows += body.iter().filter(|&&b| b == b'\n').count(),
                b'c' => {
                    let copy = s.copy.take().unwrap();
                    command_complete(out, &format!("COPY {}", copy.rows));
                    if !copy.extended {
                        ready(out, s);
                    }
                }
                b'f' => {
                    let copy = s.copy.take().unwrap();
                    let reason = read_cstr(&mut body);
                    let failure = Failure::new(
                        "57014",
                        format!("COPY from stdin failed: {}", reason),
                        "CopyGetData",
                    );
                    error_fields(out, b'E', "ERROR", &failure);
                    if copy.extended {
                        s.skipping = true;
                    } else {
                        ready(out, s);
                    }
                }
                // Sync and Flush mean nothing during COPY IN
                _ => {}
            }
            return true;
        }
        if s.skipping && tag != b'S' && tag != b'X' {
            return true;
        }

        match tag {
            b'Q' => {
                let sql = read_cstr(&mut body);
                self.log.lock().simple.push(sql.clone());
                for statement in sql.split(';').map(str::trim).filter(|q| !q.is_empty()) {
                    if !self.run_simple(s, statement, out).await {
                        break;
                    }
                }
                if s.copy.is_none() {
                    ready(out, s);
                }
            }
            b'P' => {
                let name = read_cstr(&mut body);
                let sql = read_cstr(&mut body);
                let count = body.get_i16() as u16;
                let declared: Vec<Oid> = (0..count).map(|_| Oid(body.get_u32())).collect();
                self.log.lock().parses.push(sql.clone());
                s.bound.remove(&name);
                s.statements.insert(name, (sql, declared));
                frame(out, b'1', |_| {});
            }
            b'D' => {
                let kind = body.get_u8();
                let name = read_cstr(&mut body);
                if kind != b'S' {
                    frame(out, b'n', |_| {});
                    return true;
                }
                let Some((sql, declared)) = s.statements.get(&name) else {
                    let failure = Failure::new(
                        "26000",
                        format!("prepared statement \"{}\" does not exist", name),
                        "FetchPreparedStatement",
                    );
                    error_fields(out, b'E', "ERROR", &failure);
                    s.skipping = true;
                    return true;
                };
                let inferred = inferred_params(sql);
                let params: Vec<Oid> = declared
                    .iter()
                    .enumerate()
                    .map(|(i, oid)| match *oid {
                        Oid::UNSPECIFIED => inferred.get(i).copied().unwrap_or(Oid::TEXT),
                        oid => oid,
                    })
                    .collect();
                frame(out, b't', |b| {
                    b.put_i16(params.len() as i16);
                    for oid in &params {
                        b.put_u32(oid.0);
                    }
                });
                let cols = columns(sql);
                if cols.is_empty() {
                    frame(out, b'n', |_| {});
                } else {
                    row_description(out, &cols);
                }
            }
            b'B' => {
                let _portal = read_cstr(&mut body);
                let name = read_cstr(&mut body);
                let formats = body.get_i16() as usize;
                body.advance(formats * 2);
                let count = body.get_i16() as u16;
                let params: Vec<Option<String>> = (0..count)
                    .map(|_| match body.get_i32() {
                        -1 => None,
                        len => Some(
                            String::from_utf8(body.split_to(len as usize).to_vec()).unwrap(),
                        ),
                    })
                    .collect();
                let Some((sql, _)) = s.statements.get(&name).cloned() else {
                    let failure = Failure::new(
                        "26000",
                        format!("prepared statement \"{}\" does not exist", name),
                        "FetchPreparedStatement",
                    );
                    error_fields(out, b'E', "ERROR", &failure);
                    s.skipping = true;
                    return true;
                };
                let reused = !name.is_empty() && !s.bound.insert(name);
                let stale = reused
                    && self
                        .stale_plan
                        .fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1))
                        .is_ok();
                if stale {
                    let failure = Failure::new(
                        "0A000",
                        "cached plan must not change result type",
                        "RevalidateCachedQuery",
                    );
                    error_fields(out, b'E', "ERROR", &failure);
                    s.skipping = true;
                    return true;
                }
                s.portal = Some(Portal {
                    sql,
                    params,
                    offset: 0,
                });
                frame(out, b'2', |_| {});
            }
            b'E' => {
                let _portal = read_cstr(&mut body);
                let max_rows = body.get_i32();
                let Some(portal) = s.portal.take() else {
                    let failure = Failure::new("34000", "portal \"\" does not exist", "GetPortalByName");
                    error_fields(out, b'E', "ERROR", &failure);
                    s.skipping = true;
                    return true;
                };
                if !self.execute_portal(s, portal, max_rows, out).await {
                    s.skipping = true;
                }
            }
            b'S' => {
                s.skipping = false;
                ready(out, s);
            }
            b'H' => {}
            b'C' => {
                let kind = body.get_u8();
                let name = read_cstr(&mut body);
                if kind == b'S' {
                    s.statements.remove(&name);
                    s.bound.remove(&name);
                } else {
                    s.portal = None;
                }
                self.log.lock().closes.push((kind, name));
                frame(out, b'3', |_| {});
            }
            b'X' => {
                self.log.lock().terminates += 1;
                return false;
            }
            other => {
                let failure = Failure::new(
                    "08P01",
                    format!("invalid frontend message type {}", other),
                    "SocketBackend",
                );
                error_fields(out, b'E', "FATAL", &failure);
                return false;
            }
        }
        true
    }

    async fn run_simple(&self, s: &mut Session, sql: &str, out: &mut BytesMut) -> bool {
        match self.evaluate(s, sql, &[], out).await {
            Ok(Outcome::Rows { rows, tag }) => {
                let cols = columns(sql);
                if !cols.is_empty() {
                    row_description(out, &cols);
                }
                for row in &rows {
                    data_row(out, row);
                }
                command_complete(out, &tag);
                true
            }
            Ok(Outcome::CopyIn) => {
                copy_response(out, b'G');
                s.copy = Some(CopyIn {
                    rows: 0,
                    extended: false,
                });
                false
            }
            Ok(Outcome::CopyOut(chunks)) => {
                copy_out(out, &chunks);
                true
            }
            Err(failure) => {
                error_fields(out, b'E', "ERROR", &failure);
                false
            }
        }
    }

    async fn execute_portal(
        &self,
        s: &mut Session,
        mut portal: Portal,
        max_rows: i32,
        out: &mut BytesMut,
    ) -> bool {
        let sql = portal.sql.clone();
        match self.evaluate(s, &sql, &portal.params, out).await {
            Ok(Outcome::Rows { rows, tag }) => {
                let remaining = &rows[portal.offset.min(rows.len())..];
                let limit = max_rows.max(0) as usize;
                if limit > 0 && remaining.len() > limit {
                    for row in &remaining[..limit] {
                        data_row(out, row);
                    }
                    portal.offset += limit;
                    s.portal = Some(portal);
                    frame(out, b's', |_| {});
                } else {
                    for row in remaining {
                        data_row(out, row);
                    }
                    command_complete(out, &tag);
                }
                true
            }
            Ok(Outcome::CopyIn) => {
                copy_response(out, b'G');
                s.copy = Some(CopyIn {
                    rows: 0,
                    extended: true,
                });
                true
            }
            Ok(Outcome::CopyOut(chunks)) => {
                copy_out(out, &chunks);
                true
            }
            Err(failure) => {
                error_fields(out, b'E', "ERROR", &failure);
                false
            }
        }
    }

    async fn evaluate(
        &self,
        s: &mut Session,
        sql: &str,
        params: &[Option<String>],
        out: &mut BytesMut,
    ) -> Result<Outcome, Failure> {
        let delay = self.delay_ms.load(SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        match sql {
            "select 1 as x" => rows(vec![vec![Some("1")]], "SELECT 1"),
            "select 1/0" => Err(Failure::new("22012", "division by zero", "int4div")),
            "begin" => {
                s.in_transaction = true;
                rows(vec![], "BEGIN")
            }
            "commit" | "rollback" => {
                s.in_transaction = false;
                rows(vec![], &sql.to_uppercase())
            }
            "show transaction_read_only" => rows(vec![vec![Some("off")]], "SHOW"),
            "select pg_catalog.pg_is_in_recovery()" => rows(vec![vec![Some("f")]], "SELECT 1"),
            "copy t from stdin" => Ok(Outcome::CopyIn),
            "copy t to stdout" => Ok(Outcome::CopyOut(vec!["1\ta\n", "2\tb\n"])),
            "select notice()" => {
                let notice = Failure::new("00000", "hello", "exec_stmt_raise");
                error_fields(out, b'N', "NOTICE", &notice);
                frame(out, b'A', |b| {
                    b.put_i32(1001);
                    put_cstr(b, "jobs");
                    put_cstr(b, "42");
                });
                rows(vec![], "SELECT 0")
            }
            q if q.starts_with("select $1::int") => {
                let value = params.first().cloned().flatten();
                Ok(Outcome::Rows {
                    rows: vec![vec![value]],
                    tag: "SELECT 1".to_string(),
                })
            }
            q if q.starts_with("select generate_series(1,") => {
                let n: usize = argument(q, "(1,");
                Ok(Outcome::Rows {
                    rows: (1..=n).map(|i| vec![Some(i.to_string())]).collect(),
                    tag: format!("SELECT {}", n),
                })
            }
            q if q.starts_with("select pg_sleep(") => {
                let secs: f64 = argument(q, "pg_sleep(");
                tokio::select! {
                    _ = self.cancel.notified() => Err(Failure::new(
                        "57014",
                        "canceling statement due to user request",
                        "ProcessInterrupts",
                    )),
                    _ = tokio::time::sleep(Duration::from_secs_f64(secs)) => {
                        rows(vec![vec![Some("")]], "SELECT 1")
                    }
                }
            }
            q if q.starts_with("select b.oid, b.typarray") => rows(
                vec![
                    vec![Some("16"), Some("1000")],
                    vec![Some("23"), Some("1007")],
                ],
                "SELECT 2",
            ),
            q if q.starts_with("insert") => rows(vec![], "INSERT 0 1"),
            _ => rows(vec![], "SELECT 0"),
        }
    }
}

fn copy_out(out: &mut BytesMut, chunks: &[&str]) {
    copy_response(out, b'H');
    for chunk in chunks {
        frame(out, b'd', |b| b.extend_from_slice(chunk.as_bytes()));
    }
    frame(out, b'c', |_| {});
    command_complete(out, &format!("COPY {}", chunks.len()));
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

fn total_slots(pool: &PgPool) -> usize {
    let s = pool.stats();
    s.open + s.busy + s.full + s.connecting + s.closed + s.reserved + s.ended
}

// ============================================================================
// Query execution
// ============================================================================

mod execution {
    use super::*;

    #[tokio::test]
    async fn test_select_one() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options());

        let result = pool.query("select 1 as x", vec![]).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.rows[0].get("x"), Some(&PgValue::Int4(1)));
        assert_eq!(result.command, "SELECT");
        assert_eq!(result.count, Some(1));
        assert_eq!(result.backend.map(|b| b.process_id), Some(1001));

        pool.end(None).await;
        eventually(|| mock.log.lock().terminates == 1).await;
    }

    #[tokio::test]
    async fn test_server_error_keeps_connection() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(1));

        let err = pool.query("select 1/0", vec![]).await.unwrap_err();
        assert_eq!(err.code(), Some("22012"));
        assert_eq!(err.routine(), Some("int4div"));
        let server = err.server().unwrap();
        assert_eq!(server.origin.map(|o| o.file()), Some(file!()));

        let result = pool.query("select 1 as x", vec![]).await.unwrap();
        assert_eq!(result.rows[0].get("x"), Some(&PgValue::Int4(1)));
        assert_eq!(mock.log.lock().startups, 1);
    }

    #[tokio::test]
    async fn test_pipelined_queries_resolve_in_order() {
        let mock = Mock::new();
        mock.delay_ms.store(2, SeqCst);
        let pool = PgPool::new(mock.options().max(1));

        let queries: Vec<Query> = (0..20)
            .map(|i| {
                pool.query("select $1::int as x", vec![PgValue::Int4(i)])
                    .execute()
            })
            .collect();
        let handles: Vec<CancelHandle> = queries.iter().map(Query::cancel_handle).collect();

        for (i, query) in queries.into_iter().enumerate() {
            let result = query.await.unwrap();
            assert_eq!(result.rows[0].get("x"), Some(&PgValue::Int4(i as i32)));
            for earlier in &handles[..i] {
                assert_eq!(earlier.state(), QueryState::Resolved);
            }
        }
        assert_eq!(mock.parses(), 1);
        assert_eq!(mock.log.lock().startups, 1);
    }

    #[tokio::test]
    async fn test_statement_parsed_once() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(1));

        for i in 0..3 {
            pool.query("select $1::int as x", vec![PgValue::Int4(i)])
                .await
                .unwrap();
        }
        assert_eq!(mock.parses(), 1);

        // Another parameter type is another statement.
        pool.query("select $1::int as x", vec![PgValue::Int8(7)])
            .await
            .unwrap();
        assert_eq!(mock.parses(), 2);

        for _ in 0..2 {
            pool.query("select 1 as x", vec![])
                .prepare(false)
                .await
                .unwrap();
        }
        assert_eq!(mock.parses(), 4);
    }

    #[tokio::test]
    async fn test_stale_plan_reparsed_once() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(1));

        pool.query("select 1 as x", vec![]).await.unwrap();
        mock.stale_plan.store(1, SeqCst);

        let result = pool.query("select 1 as x", vec![]).await.unwrap();
        assert_eq!(result.rows[0].get("x"), Some(&PgValue::Int4(1)));
        assert_eq!(mock.stale_plan.load(SeqCst), 0);
        assert_eq!(mock.parses(), 2);
        {
            let log = mock.log.lock();
            let closed: Vec<_> = log.closes.iter().filter(|(kind, _)| *kind == b'S').collect();
            assert_eq!(closed.len(), 1);
        }

        pool.query("select 1 as x", vec![]).await.unwrap();
        assert_eq!(mock.parses(), 2);
    }

    #[tokio::test]
    async fn test_stale_plan_retry_waits_behind_describe() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(1));

        pool.query("select 1 as x", vec![]).await.unwrap();
        mock.stale_plan.store(1, SeqCst);

        // The second query needs a Describe round trip before its Bind, so
        // the retry of the first must not be written ahead of that Bind.
        let first = pool.query("select 1 as x", vec![]).execute();
        let second = pool
            .query("select $1::int as x", vec![PgValue::Int4(5)])
            .execute();

        let second = second.await.unwrap();
        let first = first.await.unwrap();
        assert_eq!(first.rows[0].get("x"), Some(&PgValue::Int4(1)));
        assert_eq!(first.len(), 1);
        assert_eq!(second.rows[0].get("x"), Some(&PgValue::Int4(5)));
        assert_eq!(second.len(), 1);
        assert_eq!(mock.stale_plan.load(SeqCst), 0);
        assert_eq!(mock.parses(), 3);
        assert_eq!(mock.log.lock().startups, 1);
    }

    #[tokio::test]
    async fn test_pipelined_stale_plans_retry_in_order() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(1));

        pool.query("select $1::int as x", vec![PgValue::Int4(0)])
            .await
            .unwrap();
        mock.stale_plan.store(2, SeqCst);

        let queries: Vec<Query> = (1..=2)
            .map(|i| {
                pool.query("select $1::int as x", vec![PgValue::Int4(i)])
                    .execute()
            })
            .collect();
        let handles: Vec<CancelHandle> = queries.iter().map(Query::cancel_handle).collect();

        for (i, query) in queries.into_iter().enumerate() {
            let result = query.await.unwrap();
            assert_eq!(result.rows[0].get("x"), Some(&PgValue::Int4(i as i32 + 1)));
            assert_eq!(result.len(), 1);
            for earlier in &handles[..i] {
                assert_eq!(earlier.state(), QueryState::Resolved);
            }
        }
        assert_eq!(mock.stale_plan.load(SeqCst), 0);
        // One re-Parse serves both retries.
        assert_eq!(mock.parses(), 2);
        {
            let log = mock.log.lock();
            let closed = log.closes.iter().filter(|(kind, _)| *kind == b'S').count();
            assert_eq!(closed, 1);
        }

        let result = pool
            .query("select $1::int as x", vec![PgValue::Int4(3)])
            .await
            .unwrap();
        assert_eq!(result.rows[0].get("x"), Some(&PgValue::Int4(3)));
        assert_eq!(mock.parses(), 2);
    }

    #[tokio::test]
    async fn test_cancel_running_query() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(1));

        let query = pool.query("select pg_sleep(10)", vec![]).execute();
        let handle = query.cancel_handle();
        eventually(|| handle.state() == QueryState::Active).await;
        handle.cancel();

        let err = query.await.unwrap_err();
        assert_eq!(err.code(), Some("57014"));
        assert_eq!(mock.log.lock().cancels, 1);

        pool.query("select 1 as x", vec![]).await.unwrap();
        assert_eq!(mock.log.lock().startups, 1);
    }

    #[tokio::test]
    async fn test_cancel_before_write() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(1));

        let query = pool.query("select 1 as x", vec![]);
        query.cancel();
        let err = query.await.unwrap_err();
        assert_eq!(err.code(), Some("57014"));

        pool.query("select 1 as x", vec![]).await.unwrap();
        assert_eq!(mock.log.lock().parses, vec!["select 1 as x"]);
    }

    #[tokio::test]
    async fn test_simple_script_keeps_previous_results() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(1));

        let result = pool.simple("begin; select 1 as x; commit").await.unwrap();
        assert_eq!(result.command, "COMMIT");
        assert_eq!(result.previous.len(), 2);
        assert_eq!(result.previous[0].command, "BEGIN");
        assert_eq!(
            result.previous[1].rows[0].get("x"),
            Some(&PgValue::Int4(1))
        );
        assert_eq!(mock.parses(), 0);
    }

    #[tokio::test]
    async fn test_begin_on_shared_connection_rejected() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(2));

        let err = pool.simple("begin").await.unwrap_err();
        assert_eq!(err.code(), Some("UNSAFE_TRANSACTION"));
    }

    #[tokio::test]
    async fn test_describe_only() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(1));

        let result = pool
            .query_typed("select $1::int as x", vec![], &[Oid::UNSPECIFIED])
            .describe()
            .await
            .unwrap();
        assert!(result.rows.is_empty());
        let statement = result.statement.unwrap();
        assert_eq!(statement.param_types(), &[Oid::INT4]);
        assert_eq!(statement.columns()[0].name, "x");
        assert!(mock.log.lock().closes.is_empty());
    }

    #[tokio::test]
    async fn test_too_many_parameters() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(1));

        let err = pool
            .query("select 1 as x", vec![PgValue::Null; 65535])
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("MAX_PARAMETERS_EXCEEDED"));

        pool.query("select 1 as x", vec![]).await.unwrap();
        assert_eq!(mock.parses(), 1);
    }

    #[tokio::test]
    async fn test_notices_and_notifications() {
        let mock = Mock::new();
        let notices = Arc::new(Mutex::new(Vec::new()));
        let notifications = Arc::new(Mutex::new(Vec::new()));
        let seen_notices = Arc::clone(&notices);
        let seen_notifications = Arc::clone(&notifications);
        let pool = PgPool::new(
            mock.options()
                .on_notice(move |n| seen_notices.lock().push(n.message.clone()))
                .on_notification(move |n| {
                    seen_notifications
                        .lock()
                        .push((n.channel.clone(), n.payload.clone()))
                }),
        );

        pool.query("select notice()", vec![]).await.unwrap();
        assert_eq!(*notices.lock(), vec!["hello".to_string()]);
        assert_eq!(
            *notifications.lock(),
            vec![("jobs".to_string(), "42".to_string())]
        );
    }
}

// ============================================================================
// Cursors and COPY
// ============================================================================

mod streaming {
    use super::*;

    #[tokio::test]
    async fn test_cursor_batches() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(1));
        let batches = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&batches);

        let result = pool
            .query("select generate_series(1, 10) as n", vec![])
            .cursor(3, move |rows| {
                seen.lock().push(rows.len());
                CursorControl::Continue
            })
            .await
            .unwrap();

        assert_eq!(*batches.lock(), vec![3, 3, 3, 1]);
        assert_eq!(result.command, "SELECT");
        assert!(result.rows.is_empty());
    }

    #[tokio::test]
    async fn test_cursor_closed_early() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(1));
        let batches = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&batches);

        pool.query("select generate_series(1, 10) as n", vec![])
            .cursor(4, move |rows| {
                seen.lock().push(rows.len());
                CursorControl::Close
            })
            .await
            .unwrap();

        assert_eq!(*batches.lock(), vec![4]);
        assert!(mock
            .log
            .lock()
            .closes
            .iter()
            .any(|(kind, name)| *kind == b'P' && name.is_empty()));

        // The session is back in sync.
        pool.query("select 1 as x", vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_in() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(1));

        let (query, writer) = pool.query("copy t from stdin", vec![]).copy_in();
        writer.send("1\ta\n").unwrap();
        writer.send(Bytes::from_static(b"2\tb\n")).unwrap();
        writer.finish();

        let result = query.await.unwrap();
        assert_eq!(result.command, "COPY");
        assert_eq!(result.count, Some(2));
        pool.query("select 1 as x", vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_in_failed_by_writer() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(1));

        let (query, writer) = pool.query("copy t from stdin", vec![]).copy_in();
        writer.send("1\ta\n").unwrap();
        writer.fail("bad input");

        let err = query.await.unwrap_err();
        assert_eq!(err.code(), Some("57014"));
        assert!(err.to_string().contains("bad input"));
        pool.query("select 1 as x", vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_in_without_writer() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(1));

        let err = pool.query("copy t from stdin", vec![]).await.unwrap_err();
        assert!(err.to_string().contains("CopyWriter"));
        pool.query("select 1 as x", vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_out() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(1));

        let (query, mut reader) = pool.query("copy t to stdout", vec![]).copy_out();
        let result = query.await.unwrap();
        assert_eq!(result.count, Some(2));

        let mut chunks = Vec::new();
        while let Some(chunk) = reader.next().await {
            chunks.push(chunk);
        }
        assert_eq!(
            chunks,
            vec![Bytes::from_static(b"1\ta\n"), Bytes::from_static(b"2\tb\n")]
        );
    }
}

// ============================================================================
// Pool scheduling
// ============================================================================

mod scheduling {
    use super::*;

    #[tokio::test]
    async fn test_saturated_pool_queues() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(2).max_pipeline(1));
        let started = Instant::now();

        let queries: Vec<Query> = (0..3)
            .map(|_| pool.query("select pg_sleep(0.05)", vec![]).execute())
            .collect();
        let stats = pool.stats();
        assert_eq!(stats.connecting, 2);
        assert_eq!(stats.queued, 1);

        for query in queries {
            query.await.unwrap();
        }
        // The third query only ran once one of the first two finished.
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(mock.log.lock().startups, 2);
        assert_eq!(total_slots(&pool), 2);
    }

    #[tokio::test]
    async fn test_connection_full_on_open_filed_as_full() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(1).max_pipeline(1));

        let query = pool.query("select pg_sleep(0.2)", vec![]).execute();
        let handle = query.cancel_handle();
        assert_eq!(pool.stats().connecting, 1);

        eventually(|| handle.state() == QueryState::Active).await;
        eventually(|| pool.stats().full == 1).await;
        let stats = pool.stats();
        assert_eq!(stats.connecting, 0);
        assert_eq!(stats.open + stats.busy, 0);
        assert_eq!(handle.state(), QueryState::Active);

        query.await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.open, 1);
        assert_eq!(stats.full, 0);
        assert_eq!(total_slots(&pool), 1);
    }

    #[tokio::test]
    async fn test_every_connection_in_one_slot() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(3));

        for _ in 0..10 {
            let queries: Vec<Query> = (0..5)
                .map(|i| {
                    pool.query("select $1::int as x", vec![PgValue::Int4(i)])
                        .execute()
                })
                .collect();
            assert_eq!(total_slots(&pool), 3);
            for query in queries {
                query.await.unwrap();
                assert_eq!(total_slots(&pool), 3);
            }
        }
    }

    #[tokio::test]
    async fn test_reconnect_backs_off() {
        let mock = Mock::new();
        mock.refuse.store(1, SeqCst);
        let pool = PgPool::new(mock.options().backoff(true).max(1));

        let err = pool.query("select 1 as x", vec![]).await.unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(err.code(), Some("CONNECTION_CLOSED"));

        let started = Instant::now();
        pool.query("select 1 as x", vec![]).await.unwrap();
        // One failure waits between 15ms and 30ms.
        assert!(started.elapsed() >= Duration::from_millis(10));
        assert_eq!(mock.log.lock().startups, 1);
    }

    #[tokio::test]
    async fn test_transaction_commit() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(2));

        let tx = pool.begin().await.unwrap();
        assert_eq!(pool.stats().reserved, 1);
        let result = tx
            .query("insert into t values (1)", vec![])
            .unwrap()
            .await
            .unwrap();
        assert_eq!(result.count, Some(1));
        tx.commit().await.unwrap();

        assert_eq!(pool.stats().reserved, 0);
        assert_eq!(mock.log.lock().simple, vec!["begin", "commit"]);
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(1));

        let tx = pool.begin().await.unwrap();
        tx.query("insert into t values (1)", vec![])
            .unwrap()
            .await
            .unwrap();
        drop(tx);

        pool.query("select 1 as x", vec![]).await.unwrap();
        assert_eq!(mock.log.lock().simple, vec!["begin", "rollback"]);
        assert_eq!(pool.stats().reserved, 0);
    }

    #[tokio::test]
    async fn test_reserved_connection_is_exclusive() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(2));

        let reserved = pool.reserve().await.unwrap();
        reserved.simple("begin").await.unwrap();
        let id = reserved.connection().id();
        assert_eq!(pool.stats().reserved, 1);

        // Other queries land on the second connection.
        pool.query("select 1 as x", vec![]).await.unwrap();
        assert_eq!(mock.log.lock().startups, 2);

        reserved.simple("commit").await.unwrap();
        reserved.release();
        assert_eq!(pool.stats().reserved, 0);
        pool.query("select 1 as x", vec![]).await.unwrap();
        assert!(id < 2);
    }

    #[tokio::test]
    async fn test_end_waits_for_queries() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(1));

        let query = pool.query("select pg_sleep(0.02)", vec![]).execute();
        let ending = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.end(None).await })
        };

        query.await.unwrap();
        ending.await.unwrap();

        let err = pool.query("select 1 as x", vec![]).await.unwrap_err();
        assert_eq!(err.code(), Some("CONNECTION_ENDED"));
        eventually(|| mock.log.lock().terminates == 1).await;
    }

    #[tokio::test]
    async fn test_end_timeout_destroys() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().max(1));

        let query = pool.query("select pg_sleep(10)", vec![]).execute();
        let handle = query.cancel_handle();
        eventually(|| handle.state() == QueryState::Active).await;

        pool.end(Some(Duration::from_millis(20))).await;
        let err = query.await.unwrap_err();
        assert_eq!(err.code(), Some("CONNECTION_DESTROYED"));
    }
}

// ============================================================================
// Connection lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_startup_parameters() {
        let mock = Mock::new();
        let mut options = mock.options();
        options.settings.user = "app".to_string();
        options.settings.database = "shop".to_string();
        let pool = PgPool::new(options);

        pool.query("select 1 as x", vec![]).await.unwrap();
        let log = mock.log.lock();
        assert_eq!(log.startup_params["user"], "app");
        assert_eq!(log.startup_params["database"], "shop");
        assert_eq!(log.startup_params["application_name"], "pgkit");
        assert_eq!(log.startup_params["client_encoding"], "UTF8");
    }

    #[tokio::test]
    async fn test_cleartext_password() {
        let mock = Mock::new();
        *mock.password.lock() = Some("secret".to_string());

        let mut options = mock.options();
        options.settings.password = Some("secret".to_string());
        PgPool::new(options)
            .query("select 1 as x", vec![])
            .await
            .unwrap();

        let mut options = mock.options();
        options.settings.password = Some("wrong".to_string());
        let err = PgPool::new(options)
            .query("select 1 as x", vec![])
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("28P01"));
        assert_eq!(mock.log.lock().passwords, vec!["secret", "wrong"]);
    }

    #[tokio::test]
    async fn test_array_types_fetched_once() {
        let mock = Mock::new();
        let pool = PgPool::new(mock.options().fetch_types(true).max(2).max_pipeline(1));

        let a = pool.query("select pg_sleep(0.01)", vec![]).execute();
        let b = pool.query("select pg_sleep(0.01)", vec![]).execute();
        a.await.unwrap();
        b.await.unwrap();

        let log = mock.log.lock();
        assert_eq!(log.startups, 2);
        let fetches = log
            .simple
            .iter()
            .filter(|q| q.starts_with("select b.oid"))
            .count();
        assert_eq!(fetches, 1);
    }

    #[tokio::test]
    async fn test_primary_skips_standby() {
        let mock = Mock::new();
        mock.standby_first.store(true, SeqCst);
        let mut options = mock
            .options()
            .target_session_attrs(TargetSessionAttrs::Primary)
            .max(1);
        options.settings.hosts = vec![("a".to_string(), 5432), ("b".to_string(), 5432)];
        let pool = PgPool::new(options);

        pool.query("select 1 as x", vec![]).await.unwrap();
        eventually(|| mock.log.lock().terminates == 1).await;
        let log = mock.log.lock();
        assert_eq!(log.hosts, vec!["a", "b"]);
        assert_eq!(log.startups, 2);
    }

    #[tokio::test]
    async fn test_session_attributes_queried() {
        let mock = Mock::new();
        mock.hide_attrs.store(true, SeqCst);
        let pool = PgPool::new(
            mock.options()
                .target_session_attrs(TargetSessionAttrs::ReadWrite)
                .max(1),
        );

        pool.query("select 1 as x", vec![]).await.unwrap();
        let log = mock.log.lock();
        assert_eq!(log.startups, 1);
        assert!(log
            .simple
            .iter()
            .any(|q| q.contains("show transaction_read_only")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let mock = Mock::new();
        mock.silent.store(true, SeqCst);
        let pool = PgPool::new(
            mock.options()
                .connect_timeout(Duration::from_secs(2))
                .max(1),
        );

        let err = pool.query("select 1 as x", vec![]).await.unwrap_err();
        assert_eq!(err.code(), Some("CONNECT_TIMEOUT"));
        assert!(err.is_connection_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_closed() {
        let mock = Mock::new();
        let pool = PgPool::new(
            mock.options()
                .idle_timeout(Some(Duration::from_secs(1)))
                .max(1),
        );

        pool.query("select 1 as x", vec![]).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        eventually(|| mock.log.lock().terminates == 1).await;
        assert_eq!(pool.stats().closed, 1);

        pool.query("select 1 as x", vec![]).await.unwrap();
        assert_eq!(mock.log.lock().startups, 2);
    }
}

// ============================================================================
// Live server
// ============================================================================

/// Run with `--features postgres-integration-tests` and `PGKIT_TEST_URL`
/// pointing at a scratch database.
#[cfg(feature = "postgres-integration-tests")]
mod integration {
    use super::*;

    fn pool() -> PgPool {
        let url = std::env::var("PGKIT_TEST_URL")
            .unwrap_or_else(|_| "postgres://postgres@localhost/postgres".to_string());
        PgPool::connect(&url).unwrap()
    }

    #[tokio::test]
    async fn test_live_select() {
        let pool = pool();
        let result = pool
            .query("select $1::int + 1 as x", vec![PgValue::Int4(41)])
            .await
            .unwrap();
        assert_eq!(result.rows[0].get("x"), Some(&PgValue::Int4(42)));
        pool.end(None).await;
    }

    #[tokio::test]
    async fn test_live_cancel() {
        let pool = pool();
        let query = pool.query("select pg_sleep(10)", vec![]).execute();
        let handle = query.cancel_handle();
        eventually(|| handle.state() == QueryState::Active).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
        assert_eq!(query.await.unwrap_err().code(), Some("57014"));
        pool.end(None).await;
    }

    #[tokio::test]
    async fn test_live_transaction() {
        let pool = pool();
        let tx = pool.begin().await.unwrap();
        tx.simple("create temp table pgkit_t (id int)")
            .unwrap()
            .await
            .unwrap();
        tx.query("insert into pgkit_t values ($1)", vec![PgValue::Int4(1)])
            .unwrap()
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        pool.end(None).await;
    }
}
