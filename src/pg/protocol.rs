//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::error::{PgError, PgResult};
use super::types::Oid;

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Magic version code of an SSLRequest
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Magic version code of a CancelRequest
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Largest number of bind parameters a frame can carry (int16 count).
pub const MAX_PARAMETERS: usize = 65534;

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

impl From<i16> for Format {
    fn from(v: i16) -> Self {
        if v == 0 {
            Format::Text
        } else {
            Format::Binary
        }
    }
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frame Builder
// ============================================================================

/// Scratch buffer that produces one length-prefixed frame at a time.
///
/// `begin` writes the tag and a length placeholder, the typed appenders fill
/// the payload, and `finish` patches the length and hands the frame out as
/// immutable `Bytes`. The underlying allocation is reused across frames.
#[derive(Debug, Default)]
pub struct FrameBuilder {
    buf: BytesMut,
    length_at: usize,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            length_at: 0,
        }
    }

    /// Start a tagged frame.
    pub fn begin(&mut self, tag: u8) -> &mut Self {
        self.buf.clear();
        self.buf.put_u8(tag);
        self.length_at = 1;
        self.buf.put_i32(0);
        self
    }

    /// Start a frame without a tag byte (startup, SSL and cancel requests).
    pub fn begin_untagged(&mut self) -> &mut Self {
        self.buf.clear();
        self.length_at = 0;
        self.buf.put_i32(0);
        self
    }

    /// Append UTF-8 text without a terminator.
    pub fn str(&mut self, s: &str) -> &mut Self {
        self.buf.put_slice(s.as_bytes());
        self
    }

    /// Append a NUL-terminated string.
    pub fn cstr(&mut self, s: &str) -> &mut Self {
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
        self
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn i16(&mut self, v: i16) -> &mut Self {
        self.buf.put_i16(v);
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32(v);
        self
    }

    pub fn zero(&mut self, n: usize) -> &mut Self {
        self.buf.put_bytes(0, n);
        self
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Patch the length field and take the finished frame.
    pub fn finish(&mut self) -> Bytes {
        let len = (self.buf.len() - self.length_at) as i32;
        self.buf[self.length_at..self.length_at + 4].copy_from_slice(&len.to_be_bytes());
        self.length_at = 0;
        self.buf.split().freeze()
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    fn encode(&self, frame: &mut FrameBuilder) -> Bytes;

    /// Encode with a throwaway builder.
    fn to_bytes(&self) -> Bytes {
        self.encode(&mut FrameBuilder::new())
    }
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self, frame: &mut FrameBuilder) -> Bytes {
        frame.begin_untagged().i32(PROTOCOL_VERSION);
        frame.cstr("user").cstr(&self.user);
        if let Some(ref db) = self.database {
            frame.cstr("database").cstr(db);
        }
        if !self.options.iter().any(|(k, _)| k == "client_encoding") {
            frame.cstr("client_encoding").cstr("UTF8");
        }
        for (key, value) in &self.options {
            frame.cstr(key).cstr(value);
        }
        frame.u8(0).finish()
    }
}

/// SSLRequest, answered by a single `S` or `N` byte
#[derive(Debug, Clone, Copy)]
pub struct SslRequestMessage;

impl FrontendMessage for SslRequestMessage {
    fn encode(&self, frame: &mut FrameBuilder) -> Bytes {
        frame.begin_untagged().i32(SSL_REQUEST_CODE).finish()
    }
}

/// CancelRequest, sent on its own short-lived connection
#[derive(Debug, Clone, Copy)]
pub struct CancelRequestMessage {
    pub process_id: i32,
    pub secret_key: i32,
}

impl FrontendMessage for CancelRequestMessage {
    fn encode(&self, frame: &mut FrameBuilder) -> Bytes {
        frame
            .begin_untagged()
            .i32(CANCEL_REQUEST_CODE)
            .i32(self.process_id)
            .i32(self.secret_key)
            .finish()
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self, frame: &mut FrameBuilder) -> Bytes {
        frame.begin(b'p').cstr(&self.password).finish()
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: String,
    /// Initial client response data
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode(&self, frame: &mut FrameBuilder) -> Bytes {
        frame
            .begin(b'p')
            .cstr(&self.mechanism)
            .i32(self.data.len() as i32)
            .raw(&self.data)
            .finish()
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode(&self, frame: &mut FrameBuilder) -> Bytes {
        frame.begin(b'p').raw(&self.data).finish()
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage<'a> {
    pub query: &'a str,
}

impl FrontendMessage for QueryMessage<'_> {
    fn encode(&self, frame: &mut FrameBuilder) -> Bytes {
        frame.begin(b'Q').cstr(self.query).finish()
    }
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone)]
pub struct ParseMessage<'a> {
    pub name: &'a str,
    pub query: &'a str,
    pub param_types: &'a [Oid],
}

impl FrontendMessage for ParseMessage<'_> {
    fn encode(&self, frame: &mut FrameBuilder) -> Bytes {
        frame
            .begin(b'P')
            .cstr(self.name)
            .cstr(self.query)
            .i16(self.param_types.len() as i16);
        for oid in self.param_types {
            frame.i32(oid.as_u32() as i32);
        }
        frame.finish()
    }
}

/// Bind message ('B') - Binds text parameters to a prepared statement
///
/// All parameters and results use the text format, so both format code
/// lists are empty.
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub params: &'a [Option<String>],
}

impl FrontendMessage for BindMessage<'_> {
    fn encode(&self, frame: &mut FrameBuilder) -> Bytes {
        frame
            .begin(b'B')
            .cstr(self.portal)
            .cstr(self.statement)
            .i16(0)
            .i16(self.params.len() as i16);
        for param in self.params {
            match param {
                None => {
                    frame.i32(-1);
                }
                Some(text) => {
                    frame.i32(text.len() as i32).str(text);
                }
            }
        }
        frame.i16(0).finish()
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    /// 0 = no limit
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    fn encode(&self, frame: &mut FrameBuilder) -> Bytes {
        frame
            .begin(b'E')
            .cstr(self.portal)
            .i32(self.max_rows)
            .finish()
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    fn encode(&self, frame: &mut FrameBuilder) -> Bytes {
        frame.begin(b'D').u8(self.kind).cstr(self.name).finish()
    }
}

/// Close message ('C') - Release a statement or portal
#[derive(Debug, Clone)]
pub struct CloseMessage<'a> {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for CloseMessage<'_> {
    fn encode(&self, frame: &mut FrameBuilder) -> Bytes {
        frame.begin(b'C').u8(self.kind).cstr(self.name).finish()
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self, frame: &mut FrameBuilder) -> Bytes {
        frame.begin(b'S').finish()
    }
}

/// Flush message ('H') - Request server to flush output buffer
#[derive(Debug, Clone, Copy)]
pub struct FlushMessage;

impl FrontendMessage for FlushMessage {
    fn encode(&self, frame: &mut FrameBuilder) -> Bytes {
        frame.begin(b'H').finish()
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self, frame: &mut FrameBuilder) -> Bytes {
        frame.begin(b'X').finish()
    }
}

/// CopyData message ('d')
#[derive(Debug, Clone)]
pub struct CopyDataMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for CopyDataMessage<'_> {
    fn encode(&self, frame: &mut FrameBuilder) -> Bytes {
        frame.begin(b'd').raw(self.data).finish()
    }
}

/// CopyDone message ('c')
#[derive(Debug, Clone, Copy)]
pub struct CopyDoneMessage;

impl FrontendMessage for CopyDoneMessage {
    fn encode(&self, frame: &mut FrameBuilder) -> Bytes {
        frame.begin(b'c').finish()
    }
}

/// CopyFail message ('f') - Abort a COPY FROM STDIN
#[derive(Debug, Clone)]
pub struct CopyFailMessage<'a> {
    pub message: &'a str,
}

impl FrontendMessage for CopyFailMessage<'_> {
    fn encode(&self, frame: &mut FrameBuilder) -> Bytes {
        frame.begin(b'f').cstr(self.message).finish()
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password {
        salt: [u8; 4],
    },
    AuthenticationSASL {
        mechanisms: Vec<String>,
    },
    AuthenticationSASLContinue {
        data: Bytes,
    },
    AuthenticationSASLFinal {
        data: Bytes,
    },
    /// Kerberos, GSSAPI, SSPI and anything newer.
    AuthenticationOther {
        kind: i32,
    },

    // Query responses
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: Vec<Option<Bytes>>,
    },
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,

    // COPY
    CopyInResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyOutResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyBothResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyData {
        data: Bytes,
    },
    CopyDone,

    // Status
    ReadyForQuery {
        status: TransactionStatus,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },

    // Errors and notices
    ErrorResponse {
        fields: HashMap<u8, String>,
    },
    NoticeResponse {
        fields: HashMap<u8, String>,
    },

    // Other
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    ParameterDescription {
        type_oids: Vec<Oid>,
    },

    /// A well-formed message this client does not act on.
    Unsupported {
        name: &'static str,
    },
}

impl BackendMessage {
    /// Decode a backend message from bytes.
    ///
    /// The input buffer should start with the message type byte and hold
    /// the whole frame.
    pub fn decode(buf: &mut Bytes) -> PgResult<Self> {
        if buf.remaining() < 5 {
            return Err(PgError::Protocol("Incomplete message header".to_string()));
        }

        let msg_type = buf.get_u8();
        let len = buf.get_i32();
        if len < 4 {
            return Err(PgError::Protocol(format!("Invalid message length {}", len)));
        }
        let len = len as usize;

        if buf.remaining() < len - 4 {
            return Err(PgError::Protocol("Incomplete message body".to_string()));
        }

        let body = buf.split_to(len - 4);

        match msg_type {
            b'R' => Self::decode_auth(body),
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => Self::decode_command_complete(body),
            b'Z' => Self::decode_ready_for_query(body),
            b'E' => Self::decode_error_response(body),
            b'N' => Self::decode_notice_response(body),
            b'S' => Self::decode_parameter_status(body),
            b'K' => Self::decode_backend_key_data(body),
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b's' => Ok(BackendMessage::PortalSuspended),
            b't' => Self::decode_parameter_description(body),
            b'A' => Self::decode_notification_response(body),
            b'G' => Self::decode_copy_response(body, msg_type),
            b'H' => Self::decode_copy_response(body, msg_type),
            b'W' => Self::decode_copy_response(body, msg_type),
            b'd' => Ok(BackendMessage::CopyData { data: body }),
            b'c' => Ok(BackendMessage::CopyDone),
            b'V' => Ok(BackendMessage::Unsupported {
                name: "FunctionCallResponse",
            }),
            b'v' => Ok(BackendMessage::Unsupported {
                name: "NegotiateProtocolVersion",
            }),
            _ => Err(PgError::Protocol(format!(
                "Unknown message type: {}",
                msg_type as char
            ))),
        }
    }

    fn decode_auth(mut body: Bytes) -> PgResult<Self> {
        need(&body, 4)?;
        let auth_type = body.get_i32();

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                need(&body, 4)?;
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&body[..4]);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.remaining() > 0 {
                    let mech = read_cstring(&mut body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body }),
            kind => Ok(BackendMessage::AuthenticationOther { kind }),
        }
    }

    fn decode_row_description(mut body: Bytes) -> PgResult<Self> {
        need(&body, 2)?;
        let num_fields = body.get_i16().max(0) as usize;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = read_cstring(&mut body)?;
            need(&body, 18)?;
            let table_oid = body.get_i32();
            let column_attr = body.get_i16();
            let type_oid = Oid::from_u32(body.get_u32());
            let type_size = body.get_i16();
            let type_modifier = body.get_i32();
            let format = Format::from(body.get_i16());

            fields.push(FieldDescription {
                name,
                table_oid,
                column_attr,
                type_oid,
                type_size,
                type_modifier,
                format,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(mut body: Bytes) -> PgResult<Self> {
        need(&body, 2)?;
        let num_cols = body.get_i16().max(0) as usize;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            need(&body, 4)?;
            let len = body.get_i32();
            if len < 0 {
                values.push(None);
            } else {
                need(&body, len as usize)?;
                values.push(Some(body.split_to(len as usize)));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_command_complete(mut body: Bytes) -> PgResult<Self> {
        let tag = read_cstring(&mut body)?;
        Ok(BackendMessage::CommandComplete { tag })
    }

    fn decode_ready_for_query(mut body: Bytes) -> PgResult<Self> {
        need(&body, 1)?;
        let status = TransactionStatus::from(body.get_u8());
        Ok(BackendMessage::ReadyForQuery { status })
    }

    fn decode_error_response(body: Bytes) -> PgResult<Self> {
        let fields = read_error_fields(body)?;
        Ok(BackendMessage::ErrorResponse { fields })
    }

    fn decode_notice_response(body: Bytes) -> PgResult<Self> {
        let fields = read_error_fields(body)?;
        Ok(BackendMessage::NoticeResponse { fields })
    }

    fn decode_parameter_status(mut body: Bytes) -> PgResult<Self> {
        let name = read_cstring(&mut body)?;
        let value = read_cstring(&mut body)?;
        Ok(BackendMessage::ParameterStatus { name, value })
    }

    fn decode_backend_key_data(mut body: Bytes) -> PgResult<Self> {
        need(&body, 8)?;
        let process_id = body.get_i32();
        let secret_key = body.get_i32();
        Ok(BackendMessage::BackendKeyData {
            process_id,
            secret_key,
        })
    }

    fn decode_parameter_description(mut body: Bytes) -> PgResult<Self> {
        need(&body, 2)?;
        let num_params = body.get_u16() as usize;
        need(&body, num_params * 4)?;
        let type_oids = (0..num_params)
            .map(|_| Oid::from_u32(body.get_u32()))
            .collect();

        Ok(BackendMessage::ParameterDescription { type_oids })
    }

    fn decode_notification_response(mut body: Bytes) -> PgResult<Self> {
        need(&body, 4)?;
        let process_id = body.get_i32();
        let channel = read_cstring(&mut body)?;
        let payload = read_cstring(&mut body)?;

        Ok(BackendMessage::NotificationResponse {
            process_id,
            channel,
            payload,
        })
    }

    fn decode_copy_response(mut body: Bytes, msg_type: u8) -> PgResult<Self> {
        need(&body, 3)?;
        let format = Format::from(i16::from(body.get_u8()));
        let count = body.get_i16().max(0) as usize;
        need(&body, count * 2)?;
        let column_formats = (0..count).map(|_| Format::from(body.get_i16())).collect();

        Ok(match msg_type {
            b'G' => BackendMessage::CopyInResponse {
                format,
                column_formats,
            },
            b'H' => BackendMessage::CopyOutResponse {
                format,
                column_formats,
            },
            _ => BackendMessage::CopyBothResponse {
                format,
                column_formats,
            },
        })
    }
}

// ============================================================================
// Frame Reader
// ============================================================================

/// Accumulates transport reads and splits off complete backend frames.
///
/// Partial frames stay in the buffer; once the header of a frame is known
/// the buffer reserves exactly what is still missing, so each byte is copied
/// once regardless of how the stream was chunked.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
        }
    }

    /// The read target for the transport.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Split off the next complete frame, tag byte included.
    pub fn next_frame(&mut self) -> PgResult<Option<Bytes>> {
        if self.buf.len() < 5 {
            return Ok(None);
        }
        let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        if len < 4 {
            return Err(PgError::Protocol(format!(
                "Invalid length {} for message {}",
                len, self.buf[0] as char
            )));
        }
        let total = len as usize + 1;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(total).freeze()))
    }

    /// Decode the next complete frame.
    pub fn next_message(&mut self) -> PgResult<Option<BackendMessage>> {
        match self.next_frame()? {
            Some(mut frame) => BackendMessage::decode(&mut frame).map(Some),
            None => Ok(None),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn need(body: &Bytes, n: usize) -> PgResult<()> {
    if body.remaining() < n {
        return Err(PgError::Protocol(format!(
            "Truncated message: needed {} bytes, had {}",
            n,
            body.remaining()
        )));
    }
    Ok(())
}

/// Read a null-terminated string from the buffer.
/// Tries direct UTF-8 first, falls back to lossy only if invalid.
fn read_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

    let s = std::str::from_utf8(&buf[..end])
        .map(|s| s.to_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..end]).into_owned());

    buf.advance(end + 1);
    Ok(s)
}

/// Read error/notice response fields
fn read_error_fields(mut body: Bytes) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.remaining() > 0 {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        let value = read_cstring(&mut body)?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}

/// Name of an authentication request this client cannot answer.
pub fn auth_type_name(kind: i32) -> String {
    match kind {
        2 => "KerberosV5".to_string(),
        6 => "SCMCredential".to_string(),
        7 => "GSS".to_string(),
        8 => "GSSContinue".to_string(),
        9 => "SSPI".to_string(),
        other => format!("Unknown ({})", other),
    }
}
