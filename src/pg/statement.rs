//! Prepared statement management and caching.
//!
//! This module provides:
//! - `PreparedStatement`: a server-side statement and its description
//! - `StatementCache`: O(1) LRU cache keyed by statement signature, one per connection
//! - `StatementNamer`: per-connection statement name generator

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};

use lru::LruCache;
use smallvec::SmallVec;

use super::protocol::FieldDescription;
use super::types::{Oid, ParseFn};

/// Parameter type lists are short in practice.
pub type ParamTypes = SmallVec<[Oid; 8]>;

/// Shared column descriptions, cloned into every result.
pub type SharedColumns = Arc<Vec<Column>>;

// ============================================================================
// Columns
// ============================================================================

/// A result column with its bound parser.
#[derive(Clone)]
pub struct Column {
    /// Name after the configured column transform
    pub name: String,
    pub type_oid: Oid,
    pub table_oid: i32,
    pub column_attr: i16,
    pub(crate) parser: Option<ParseFn>,
}

impl Column {
    pub fn new(field: &FieldDescription, name: String, parser: Option<ParseFn>) -> Self {
        Self {
            name,
            type_oid: field.type_oid,
            table_oid: field.table_oid,
            column_attr: field.column_attr,
            parser,
        }
    }
}

impl fmt::Debug for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("name", &self.name)
            .field("type_oid", &self.type_oid)
            .finish()
    }
}

// ============================================================================
// Prepared Statement
// ============================================================================

/// Cache key of a statement: declared parameter types, then the SQL text.
pub fn signature(types: &[Oid], sql: &str) -> String {
    let mut key = String::with_capacity(sql.len() + types.len() * 5 + 1);
    for (i, oid) in types.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        key.push_str(&oid.to_string());
    }
    key.push(':');
    key.push_str(sql);
    key
}

/// What the server reported for a statement: ParameterDescription plus
/// RowDescription (or NoData).
#[derive(Debug, Clone)]
pub struct Description {
    pub param_types: ParamTypes,
    pub columns: SharedColumns,
}

/// A prepared statement that has been parsed by PostgreSQL.
///
/// The description is filled in once, when the server answers the Describe
/// that followed its Parse; queries pipelined behind the Parse share it.
#[derive(Debug)]
pub struct PreparedStatement {
    /// Server-side name; empty for the unnamed statement
    pub name: String,
    pub signature: String,
    pub query: String,
    declared_types: ParamTypes,
    description: OnceLock<Description>,
}

impl PreparedStatement {
    pub fn new(name: String, query: &str, param_types: &[Oid]) -> Self {
        Self {
            name,
            signature: signature(param_types, query),
            query: query.to_string(),
            declared_types: SmallVec::from_slice(param_types),
            description: OnceLock::new(),
        }
    }

    /// Record the server's description. Later calls are ignored.
    pub fn describe(&self, param_types: ParamTypes, columns: Vec<Column>) {
        let _ = self.description.set(Description {
            param_types,
            columns: Arc::new(columns),
        });
    }

    pub fn is_described(&self) -> bool {
        self.description.get().is_some()
    }

    /// Parameter types as reported by the server, else as declared.
    pub fn param_types(&self) -> &[Oid] {
        match self.description.get() {
            Some(d) => &d.param_types,
            None => &self.declared_types,
        }
    }

    pub fn columns(&self) -> SharedColumns {
        self.description
            .get()
            .map(|d| Arc::clone(&d.columns))
            .unwrap_or_default()
    }

    /// Whether the statement produces a row set.
    pub fn returns_rows(&self) -> bool {
        self.description
            .get()
            .is_some_and(|d| !d.columns.is_empty())
    }
}

// ============================================================================
// Statement Cache (O(1) LRU)
// ============================================================================

/// Per-connection LRU cache of prepared statements, keyed by signature.
///
/// Entries are never shared across connections; the server-side names only
/// exist in the session that parsed them.
pub struct StatementCache {
    cache: LruCache<String, Arc<PreparedStatement>>,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
        }
    }

    /// Look up a statement and mark it recently used.
    pub fn get(&mut self, signature: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.get(signature).map(Arc::clone)
    }

    #[inline]
    pub fn contains(&self, signature: &str) -> bool {
        self.cache.contains(signature)
    }

    /// Insert a statement; returns the evicted least recently used one, which
    /// the caller must close on the server.
    pub fn insert(&mut self, statement: Arc<PreparedStatement>) -> Option<Arc<PreparedStatement>> {
        let key = statement.signature.clone();
        let name = statement.name.clone();
        self.cache
            .push(key, statement)
            .map(|(_, old)| old)
            .filter(|old| old.name != name)
    }

    /// Remove the entry for `signature` if it still refers to `name`.
    pub fn evict(&mut self, signature: &str, name: &str) -> Option<Arc<PreparedStatement>> {
        match self.cache.peek(signature) {
            Some(stmt) if stmt.name == name => self.cache.pop(signature),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Forget everything; used when the session is gone.
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(100)
    }
}

// ============================================================================
// Statement names
// ============================================================================

/// Generates statement names unique within one connection's lifetime.
pub struct StatementNamer {
    prefix: String,
    next_id: u64,
}

impl StatementNamer {
    /// A fresh random namespace, so names from an earlier session never clash.
    pub fn new() -> Self {
        let tag: [u8; 3] = rand::random();
        Self {
            prefix: format!("pk{}_", hex::encode(tag)),
            next_id: 0,
        }
    }

    pub fn next_name(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        format!("{}{}", self.prefix, id)
    }
}

impl Default for StatementNamer {
    fn default() -> Self {
        Self::new()
    }
}
