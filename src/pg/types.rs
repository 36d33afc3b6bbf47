//! PostgreSQL type registry.
//!
//! Values travel in the text format: every type is a pair of functions
//! turning a [`PgValue`] into its text representation and back, keyed by
//! OID. Array OIDs reuse the element functions through the array literal
//! codec at the bottom of this module.
//! Reference: https://www.postgresql.org/docs/current/arrays.html#ARRAYS-IO

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use once_cell::sync::Lazy;

use super::error::{PgError, PgResult};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Oid(pub u32);

impl Oid {
    /// Lets the server infer the parameter type.
    pub const UNSPECIFIED: Oid = Oid(0);

    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID_TYPE: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const UNKNOWN: Oid = Oid(705);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const NUMERIC: Oid = Oid(1700);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    pub const JSON_ARRAY: Oid = Oid(199);
    pub const BOOL_ARRAY: Oid = Oid(1000);
    pub const BYTEA_ARRAY: Oid = Oid(1001);
    pub const INT2_ARRAY: Oid = Oid(1005);
    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);
    pub const VARCHAR_ARRAY: Oid = Oid(1015);
    pub const INT8_ARRAY: Oid = Oid(1016);
    pub const FLOAT4_ARRAY: Oid = Oid(1021);
    pub const FLOAT8_ARRAY: Oid = Oid(1022);
    pub const TIMESTAMP_ARRAY: Oid = Oid(1115);
    pub const DATE_ARRAY: Oid = Oid(1182);
    pub const TIMESTAMPTZ_ARRAY: Oid = Oid(1185);
    pub const NUMERIC_ARRAY: Oid = Oid(1231);
    pub const UUID_ARRAY: Oid = Oid(2951);
    pub const JSONB_ARRAY: Oid = Oid(3807);

    #[inline]
    pub fn from_u32(oid: u32) -> Self {
        Oid(oid)
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME | Oid::UNKNOWN
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8)
    }

    /// Check if this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Element/array pairs known without asking the catalog.
const BUILTIN_ARRAYS: &[(Oid, Oid)] = &[
    (Oid::BOOL, Oid::BOOL_ARRAY),
    (Oid::BYTEA, Oid::BYTEA_ARRAY),
    (Oid::INT2, Oid::INT2_ARRAY),
    (Oid::INT4, Oid::INT4_ARRAY),
    (Oid::INT8, Oid::INT8_ARRAY),
    (Oid::TEXT, Oid::TEXT_ARRAY),
    (Oid::VARCHAR, Oid::VARCHAR_ARRAY),
    (Oid::FLOAT4, Oid::FLOAT4_ARRAY),
    (Oid::FLOAT8, Oid::FLOAT8_ARRAY),
    (Oid::TIMESTAMP, Oid::TIMESTAMP_ARRAY),
    (Oid::TIMESTAMPTZ, Oid::TIMESTAMPTZ_ARRAY),
    (Oid::DATE, Oid::DATE_ARRAY),
    (Oid::NUMERIC, Oid::NUMERIC_ARRAY),
    (Oid::UUID, Oid::UUID_ARRAY),
    (Oid::JSON, Oid::JSON_ARRAY),
    (Oid::JSONB, Oid::JSONB_ARRAY),
];

// ============================================================================
// PostgreSQL Values
// ============================================================================

/// A decoded PostgreSQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    /// Kept as text to avoid losing precision.
    Numeric(String),
    Text(String),
    Bytea(Vec<u8>),
    Uuid(uuid::Uuid),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Json(serde_json::Value),
    /// Possibly nested; inner arrays are rows of a multi-dimensional array.
    Array(Vec<PgValue>),
}

impl PgValue {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Get the OID for this value's type. NULL and empty arrays let the
    /// server decide.
    pub fn type_oid(&self) -> Oid {
        match self {
            PgValue::Null => Oid::UNSPECIFIED,
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Numeric(_) => Oid::NUMERIC,
            PgValue::Text(_) => Oid::TEXT,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Uuid(_) => Oid::UUID,
            PgValue::Timestamp(_) => Oid::TIMESTAMP,
            PgValue::TimestampTz(_) => Oid::TIMESTAMPTZ,
            PgValue::Date(_) => Oid::DATE,
            PgValue::Json(_) => Oid::JSONB,
            PgValue::Array(items) => {
                let element = first_element_oid(items);
                BUILTIN_ARRAYS
                    .iter()
                    .find(|(e, _)| *e == element)
                    .map(|(_, a)| *a)
                    .unwrap_or(Oid::UNSPECIFIED)
            }
        }
    }

    /// Text representation as PostgreSQL prints it. `None` for NULL.
    pub fn to_text(&self) -> Option<String> {
        let text = match self {
            PgValue::Null => return None,
            PgValue::Bool(v) => (if *v { "t" } else { "f" }).to_string(),
            PgValue::Int2(v) => v.to_string(),
            PgValue::Int4(v) => v.to_string(),
            PgValue::Int8(v) => v.to_string(),
            PgValue::Float4(v) => format_float(f64::from(*v), v.to_string()),
            PgValue::Float8(v) => format_float(*v, v.to_string()),
            PgValue::Numeric(v) | PgValue::Text(v) => v.clone(),
            PgValue::Bytea(v) => format!("\\x{}", hex::encode(v)),
            PgValue::Uuid(v) => v.hyphenated().to_string(),
            PgValue::Timestamp(v) => format!(
                "{}{}",
                v.format("%Y-%m-%d %H:%M:%S"),
                fraction(v.nanosecond())
            ),
            PgValue::TimestampTz(v) => format!(
                "{}{}+00",
                v.format("%Y-%m-%d %H:%M:%S"),
                fraction(v.nanosecond())
            ),
            PgValue::Date(v) => v.format("%Y-%m-%d").to_string(),
            PgValue::Json(v) => v.to_string(),
            PgValue::Array(items) => {
                let mut out = String::new();
                // Element encoding of builtin values cannot fail.
                let _ = write_array(&mut out, items, &|v: &PgValue| {
                    v.to_text()
                        .ok_or_else(|| PgError::Type("NULL element".to_string()))
                });
                out
            }
        };
        Some(text)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PgValue::Text(s) | PgValue::Numeric(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view of any integer variant.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PgValue::Int2(v) => Some(i64::from(*v)),
            PgValue::Int4(v) => Some(i64::from(*v)),
            PgValue::Int8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PgValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

fn first_element_oid(items: &[PgValue]) -> Oid {
    for item in items {
        match item {
            PgValue::Null => continue,
            PgValue::Array(inner) => {
                let oid = first_element_oid(inner);
                if oid != Oid::UNSPECIFIED {
                    return oid;
                }
            }
            v => return v.type_oid(),
        }
    }
    Oid::UNSPECIFIED
}

fn format_float(v: f64, shortest: String) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        shortest
    }
}

/// Microsecond fraction with trailing zeros trimmed, as the server prints it.
fn fraction(nanos: u32) -> String {
    let micros = nanos / 1_000;
    if micros == 0 {
        return String::new();
    }
    let digits = format!("{:06}", micros);
    format!(".{}", digits.trim_end_matches('0'))
}

// ============================================================================
// Registry
// ============================================================================

/// Serializes a non-NULL value to its text form.
pub type SerializeFn = Arc<dyn Fn(&PgValue) -> PgResult<String> + Send + Sync>;
/// Parses the text form of a non-NULL value.
pub type ParseFn = Arc<dyn Fn(&str) -> PgResult<PgValue> + Send + Sync>;

/// One registered type.
#[derive(Clone)]
pub struct TypeEntry {
    pub oid: Oid,
    pub serialize: SerializeFn,
    pub parse: ParseFn,
    /// OID of the array type whose elements are this type.
    pub array_oid: Option<Oid>,
}

impl fmt::Debug for TypeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeEntry")
            .field("oid", &self.oid)
            .field("array_oid", &self.array_oid)
            .finish()
    }
}

/// OID keyed serializers and parsers, extensible by the user.
#[derive(Clone, Debug)]
pub struct TypeRegistry {
    entries: HashMap<Oid, TypeEntry>,
}

static BUILTINS: Lazy<TypeRegistry> = Lazy::new(TypeRegistry::with_builtins);

impl Default for TypeRegistry {
    fn default() -> Self {
        BUILTINS.clone()
    }
}

impl TypeRegistry {
    /// A registry without any types; everything parses as text.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn with_builtins() -> Self {
        let mut registry = Self::empty();

        registry.register_parser(Oid::BOOL, |s| match s {
            "t" | "true" => Ok(PgValue::Bool(true)),
            "f" | "false" => Ok(PgValue::Bool(false)),
            other => Err(PgError::Type(format!("Invalid BOOL: {}", other))),
        });
        registry.register_parser(Oid::INT2, |s| {
            s.parse()
                .map(PgValue::Int2)
                .map_err(|e| PgError::Type(format!("Invalid INT2: {}", e)))
        });
        registry.register_parser(Oid::INT4, |s| {
            s.parse()
                .map(PgValue::Int4)
                .map_err(|e| PgError::Type(format!("Invalid INT4: {}", e)))
        });
        for oid in [Oid::INT8, Oid::OID_TYPE] {
            registry.register_parser(oid, |s| {
                s.parse()
                    .map(PgValue::Int8)
                    .map_err(|e| PgError::Type(format!("Invalid INT8: {}", e)))
            });
        }
        registry.register_parser(Oid::FLOAT4, |s| parse_float(s).map(|v| PgValue::Float4(v as f32)));
        registry.register_parser(Oid::FLOAT8, |s| parse_float(s).map(PgValue::Float8));
        registry.register_parser(Oid::NUMERIC, |s| Ok(PgValue::Numeric(s.to_string())));
        for oid in [Oid::TEXT, Oid::VARCHAR, Oid::BPCHAR, Oid::CHAR, Oid::NAME, Oid::UNKNOWN] {
            registry.register_parser(oid, |s| Ok(PgValue::Text(s.to_string())));
        }
        registry.register_parser(Oid::BYTEA, parse_bytea);
        registry.register_parser(Oid::UUID, |s| {
            uuid::Uuid::parse_str(s)
                .map(PgValue::Uuid)
                .map_err(|e| PgError::Type(format!("Invalid UUID: {}", e)))
        });
        registry.register_parser(Oid::TIMESTAMP, parse_timestamp);
        registry.register_parser(Oid::TIMESTAMPTZ, parse_timestamptz);
        registry.register_parser(Oid::DATE, |s| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(PgValue::Date)
                .map_err(|e| PgError::Type(format!("Invalid DATE {}: {}", s, e)))
        });
        for oid in [Oid::JSON, Oid::JSONB] {
            registry.register_parser(oid, |s| {
                serde_json::from_str(s)
                    .map(PgValue::Json)
                    .map_err(|e| PgError::Type(format!("Invalid JSON: {}", e)))
            });
        }

        for (element, array) in BUILTIN_ARRAYS {
            registry.register_array(*element, *array);
        }
        registry
    }

    /// Register a type with both directions supplied by the caller.
    pub fn register(
        &mut self,
        oid: Oid,
        array_oid: Option<Oid>,
        serialize: SerializeFn,
        parse: ParseFn,
    ) {
        self.entries.insert(
            oid,
            TypeEntry {
                oid,
                serialize,
                parse,
                array_oid,
            },
        );
        if let Some(array) = array_oid {
            self.register_array(oid, array);
        }
    }

    fn register_parser<F>(&mut self, oid: Oid, parse: F)
    where
        F: Fn(&str) -> PgResult<PgValue> + Send + Sync + 'static,
    {
        self.entries.insert(
            oid,
            TypeEntry {
                oid,
                serialize: Arc::new(default_serialize),
                parse: Arc::new(parse),
                array_oid: None,
            },
        );
    }

    /// Derive an array type from a registered element type.
    ///
    /// Returns false when the element type is unknown.
    pub fn register_array(&mut self, element: Oid, array: Oid) -> bool {
        let Some(entry) = self.entries.get_mut(&element) else {
            return false;
        };
        entry.array_oid = Some(array);

        let element_serialize = Arc::clone(&entry.serialize);
        let element_parse = Arc::clone(&entry.parse);
        let serialize: SerializeFn = Arc::new(move |value: &PgValue| match value {
            PgValue::Array(items) => {
                let mut out = String::new();
                write_array(&mut out, items, &*element_serialize)?;
                Ok(out)
            }
            other => element_serialize(other),
        });
        let parse: ParseFn = Arc::new(move |text: &str| parse_array(text, &*element_parse));

        self.entries.insert(
            array,
            TypeEntry {
                oid: array,
                serialize,
                parse,
                array_oid: None,
            },
        );
        true
    }

    pub fn get(&self, oid: Oid) -> Option<&TypeEntry> {
        self.entries.get(&oid)
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.entries.contains_key(&oid)
    }

    /// Parser bound to a result column, if the type is known.
    pub fn parser(&self, oid: Oid) -> Option<ParseFn> {
        self.entries.get(&oid).map(|e| Arc::clone(&e.parse))
    }

    pub fn array_oid(&self, element: Oid) -> Option<Oid> {
        self.entries.get(&element).and_then(|e| e.array_oid)
    }

    /// Serialize a parameter for the given declared type. NULL is `None`.
    pub fn serialize(&self, oid: Oid, value: &PgValue) -> PgResult<Option<String>> {
        if value.is_null() {
            return Ok(None);
        }
        match self.entries.get(&oid) {
            Some(entry) => (entry.serialize)(value).map(Some),
            None => default_serialize(value).map(Some),
        }
    }

    /// Parse a column value; unknown types come back as text.
    pub fn parse(&self, oid: Oid, text: &str) -> PgResult<PgValue> {
        match self.entries.get(&oid) {
            Some(entry) => (entry.parse)(text),
            None => Ok(PgValue::Text(text.to_string())),
        }
    }
}

fn default_serialize(value: &PgValue) -> PgResult<String> {
    value
        .to_text()
        .ok_or_else(|| PgError::Type("Cannot serialize NULL".to_string()))
}

fn parse_float(s: &str) -> PgResult<f64> {
    match s {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        _ => s
            .parse()
            .map_err(|e| PgError::Type(format!("Invalid FLOAT: {}", e))),
    }
}

fn parse_bytea(s: &str) -> PgResult<PgValue> {
    let hex_digits = s
        .strip_prefix("\\x")
        .ok_or_else(|| PgError::Type("BYTEA is not in hex format".to_string()))?;
    hex::decode(hex_digits)
        .map(PgValue::Bytea)
        .map_err(|e| PgError::Type(format!("Invalid BYTEA: {}", e)))
}

fn parse_timestamp(s: &str) -> PgResult<PgValue> {
    if s == "infinity" || s == "-infinity" {
        return Ok(PgValue::Text(s.to_string()));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(PgValue::Timestamp)
        .map_err(|e| PgError::Type(format!("Invalid TIMESTAMP {}: {}", s, e)))
}

fn parse_timestamptz(s: &str) -> PgResult<PgValue> {
    if s == "infinity" || s == "-infinity" {
        return Ok(PgValue::Text(s.to_string()));
    }
    let invalid = || PgError::Type(format!("Invalid TIMESTAMPTZ: {}", s));

    // The offset sign is the first '+' or '-' after the date part.
    let split = s
        .char_indices()
        .skip(10)
        .find(|(_, c)| *c == '+' || *c == '-')
        .map(|(i, _)| i)
        .ok_or_else(invalid)?;
    let (local, offset) = s.split_at(split);

    let naive =
        NaiveDateTime::parse_from_str(local, "%Y-%m-%d %H:%M:%S%.f").map_err(|_| invalid())?;
    let sign = if offset.starts_with('-') { -1 } else { 1 };
    let mut seconds = 0i32;
    for (i, part) in offset[1..].split(':').enumerate() {
        let n: i32 = part.parse().map_err(|_| invalid())?;
        seconds += n * [3600, 60, 1].get(i).copied().ok_or_else(invalid)?;
    }
    let offset = FixedOffset::east_opt(sign * seconds).ok_or_else(invalid)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| PgValue::TimestampTz(dt.with_timezone(&Utc)))
        .ok_or_else(invalid)
}

// ============================================================================
// Array literal codec
// ============================================================================

fn needs_quotes(s: &str) -> bool {
    s.is_empty()
        || s.eq_ignore_ascii_case("NULL")
        || s.chars()
            .any(|c| matches!(c, '{' | '}' | ',' | '"' | '\\') || c.is_ascii_whitespace())
}

fn write_array(
    out: &mut String,
    items: &[PgValue],
    element: &(dyn Fn(&PgValue) -> PgResult<String> + Send + Sync),
) -> PgResult<()> {
    out.push('{');
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match item {
            PgValue::Null => out.push_str("NULL"),
            PgValue::Array(inner) => write_array(out, inner, element)?,
            value => {
                let text = element(value)?;
                if needs_quotes(&text) {
                    out.push('"');
                    for c in text.chars() {
                        if c == '"' || c == '\\' {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                    out.push('"');
                } else {
                    out.push_str(&text);
                }
            }
        }
    }
    out.push('}');
    Ok(())
}

/// Parse an array literal such as `{{1,2},{3,NULL}}` or `{"a\"b",c}`.
pub fn parse_array(
    text: &str,
    element: &(dyn Fn(&str) -> PgResult<PgValue> + Send + Sync),
) -> PgResult<PgValue> {
    // Arrays with non-default bounds are prefixed with `[1:2]=`.
    let body = match text.strip_prefix('[') {
        Some(_) => text
            .find('=')
            .map(|i| &text[i + 1..])
            .ok_or_else(|| PgError::Type(format!("Invalid array bounds: {}", text)))?,
        None => text,
    };
    let mut parser = ArrayParser {
        bytes: body.as_bytes(),
        pos: 0,
        element,
    };
    let items = parser.parse_level()?;
    Ok(PgValue::Array(items))
}

struct ArrayParser<'a> {
    bytes: &'a [u8],
    pos: usize,
    element: &'a (dyn Fn(&str) -> PgResult<PgValue> + Send + Sync),
}

impl ArrayParser<'_> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn error(&self) -> PgError {
        PgError::Type(format!(
            "Malformed array literal at byte {}: {}",
            self.pos,
            String::from_utf8_lossy(self.bytes)
        ))
    }

    fn parse_level(&mut self) -> PgResult<Vec<PgValue>> {
        self.skip_whitespace();
        if self.peek() != Some(b'{') {
            return Err(self.error());
        }
        self.pos += 1;

        let mut items = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(items);
        }

        loop {
            self.skip_whitespace();
            let item = match self.peek() {
                Some(b'{') => PgValue::Array(self.parse_level()?),
                Some(b'"') => {
                    let raw = self.quoted()?;
                    (self.element)(&raw)?
                }
                Some(_) => {
                    let raw = self.unquoted()?;
                    if raw.eq_ignore_ascii_case("NULL") {
                        PgValue::Null
                    } else {
                        (self.element)(&raw)?
                    }
                }
                None => return Err(self.error()),
            };
            items.push(item);

            self.skip_whitespace();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(items);
                }
                _ => return Err(self.error()),
            }
        }
    }

    fn quoted(&mut self) -> PgResult<String> {
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                Some(b'\\') => {
                    self.pos += 1;
                    out.push(self.peek().ok_or_else(|| self.error())?);
                    self.pos += 1;
                }
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b) => {
                    out.push(b);
                    self.pos += 1;
                }
                None => return Err(self.error()),
            }
        }
        String::from_utf8(out).map_err(|e| PgError::Type(format!("Invalid UTF-8 in array: {}", e)))
    }

    fn unquoted(&mut self) -> PgResult<String> {
        let mut out = Vec::new();
        while let Some(b) = self.peek() {
            match b {
                b',' | b'}' => break,
                b'\\' => {
                    self.pos += 1;
                    out.push(self.peek().ok_or_else(|| self.error())?);
                    self.pos += 1;
                }
                _ => {
                    out.push(b);
                    self.pos += 1;
                }
            }
        }
        let text = String::from_utf8(out)
            .map_err(|e| PgError::Type(format!("Invalid UTF-8 in array: {}", e)))?;
        Ok(text.trim_end().to_string())
    }
}
