//! Client/server protocol packets.
//!
//! # Packet Framing
//! ```text
//! [payload_len: 3 bytes LE] [seq_id: 1 byte] [payload]
//! ```
//! A payload of exactly `0xFFFFFF` bytes continues in the next packet.
//!
//! Only the text protocol is spoken: handshake v10, `HandshakeResponse41`,
//! `COM_QUERY` and `COM_QUIT`.

use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::mysql::result::{Cell, DataType, ErrPacket, Field, OkPacket};
use crate::mysql::MySqlError;

pub const HEADER_SIZE: usize = 4;
pub const MAX_PAYLOAD: usize = 0xFF_FFFF;

pub const COM_QUIT: u8 = 0x01;
pub const COM_QUERY: u8 = 0x03;

pub const OK_MARKER: u8 = 0x00;
pub const AUTH_MORE_DATA: u8 = 0x01;
pub const LOCAL_INFILE_MARKER: u8 = 0xfb;
pub const EOF_MARKER: u8 = 0xfe;
pub const ERR_MARKER: u8 = 0xff;

/// utf8mb4_general_ci
pub const DEFAULT_CHARSET: u8 = 45;

pub mod capability {
    pub const LONG_PASSWORD: u32 = 0x0000_0001;
    pub const FOUND_ROWS: u32 = 0x0000_0002;
    pub const LONG_FLAG: u32 = 0x0000_0004;
    pub const CONNECT_WITH_DB: u32 = 0x0000_0008;
    pub const PROTOCOL_41: u32 = 0x0000_0200;
    pub const SSL: u32 = 0x0000_0800;
    pub const TRANSACTIONS: u32 = 0x0000_2000;
    pub const SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const MULTI_STATEMENTS: u32 = 0x0001_0000;
    pub const MULTI_RESULTS: u32 = 0x0002_0000;
    pub const PS_MULTI_RESULTS: u32 = 0x0004_0000;
    pub const PLUGIN_AUTH: u32 = 0x0008_0000;
}

/// Server status flag: another result follows.
pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;

pub const NATIVE_PASSWORD: &str = "mysql_native_password";
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

/// Capabilities this client asks for.
pub const CLIENT_CAPABILITIES: u32 = capability::LONG_PASSWORD
    | capability::FOUND_ROWS
    | capability::LONG_FLAG
    | capability::PROTOCOL_41
    | capability::TRANSACTIONS
    | capability::SECURE_CONNECTION
    | capability::MULTI_STATEMENTS
    | capability::MULTI_RESULTS
    | capability::PS_MULTI_RESULTS
    | capability::PLUGIN_AUTH;

// ── Reading ──────────────────────────────────────────────────────────

/// Cursor over one packet payload.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], MySqlError> {
        if self.remaining() < n {
            return Err(MySqlError::Protocol("packet truncated"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), MySqlError> {
        self.bytes(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, MySqlError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, MySqlError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, MySqlError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn uint_le(&mut self, n: usize) -> Result<u64, MySqlError> {
        let b = self.bytes(n)?;
        Ok(b.iter().rev().fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)))
    }

    /// Length-encoded integer. `None` is the NULL marker `0xFB`.
    pub fn lenenc_int(&mut self) -> Result<Option<u64>, MySqlError> {
        match self.u8()? {
            0xfb => Ok(None),
            0xfc => self.uint_le(2).map(Some),
            0xfd => self.uint_le(3).map(Some),
            0xfe => self.uint_le(8).map(Some),
            0xff => Err(MySqlError::Protocol("invalid length-encoded integer")),
            small => Ok(Some(u64::from(small))),
        }
    }

    /// Length-encoded string. `None` is SQL NULL.
    pub fn lenenc_bytes(&mut self) -> Result<Option<&'a [u8]>, MySqlError> {
        match self.lenenc_int()? {
            None => Ok(None),
            Some(len) => self.bytes(len as usize).map(Some),
        }
    }

    pub fn lenenc_string(&mut self) -> Result<String, MySqlError> {
        Ok(self
            .lenenc_bytes()?
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default())
    }

    /// NUL-terminated string; a missing terminator takes the rest.
    pub fn null_string(&mut self) -> String {
        let rest = &self.buf[self.pos..];
        let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
        self.pos += (end + 1).min(rest.len());
        String::from_utf8_lossy(&rest[..end]).into_owned()
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

// ── Writing ──────────────────────────────────────────────────────────

pub fn put_lenenc_int(buf: &mut Vec<u8>, value: u64) {
    match value {
        0..=250 => buf.push(value as u8),
        251..=0xFFFF => {
            buf.push(0xfc);
            buf.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xFF_FFFF => {
            buf.push(0xfd);
            buf.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
        }
        _ => {
            buf.push(0xfe);
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }
}

pub fn put_lenenc_bytes(buf: &mut Vec<u8>, value: &[u8]) {
    put_lenenc_int(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

/// Frame `payload` into one or more packets starting at sequence `seq`.
///
/// Returns the next sequence id.
pub fn frame(out: &mut Vec<u8>, payload: &[u8], mut seq: u8) -> u8 {
    let mut chunks = payload.chunks(MAX_PAYLOAD).peekable();
    if chunks.peek().is_none() {
        out.extend_from_slice(&[0, 0, 0, seq]);
        return seq.wrapping_add(1);
    }
    let mut last_len = 0;
    for chunk in chunks {
        let len = (chunk.len() as u32).to_le_bytes();
        out.extend_from_slice(&[len[0], len[1], len[2], seq]);
        out.extend_from_slice(chunk);
        seq = seq.wrapping_add(1);
        last_len = chunk.len();
    }
    if last_len == MAX_PAYLOAD {
        out.extend_from_slice(&[0, 0, 0, seq]);
        seq = seq.wrapping_add(1);
    }
    seq
}

// ── Packets ──────────────────────────────────────────────────────────

/// Initial handshake sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    pub scramble: Vec<u8>,
    pub auth_plugin: String,
}

pub fn parse_handshake(payload: &[u8]) -> Result<Handshake, MySqlError> {
    let mut r = Reader::new(payload);
    let protocol_version = r.u8()?;
    if protocol_version != 10 {
        return Err(MySqlError::Protocol("unsupported handshake version"));
    }
    let server_version = r.null_string();
    let connection_id = r.u32()?;
    let mut scramble = r.bytes(8)?.to_vec();
    r.skip(1)?;
    let cap_low = r.u16()?;
    let charset = r.u8()?;
    let status_flags = r.u16()?;
    let cap_high = r.u16()?;
    let capabilities = u32::from(cap_low) | (u32::from(cap_high) << 16);
    let auth_data_len = r.u8()?;
    r.skip(10)?;

    if capabilities & capability::SECURE_CONNECTION != 0 {
        let part2 = (auth_data_len as usize).saturating_sub(8).max(13);
        let data = r.bytes(part2.min(r.remaining()))?;
        // The second part is NUL-terminated.
        let data = data.strip_suffix(&[0]).unwrap_or(data);
        scramble.extend_from_slice(data);
    }
    let auth_plugin = if capabilities & capability::PLUGIN_AUTH != 0 {
        r.null_string()
    } else {
        NATIVE_PASSWORD.to_string()
    };

    Ok(Handshake {
        protocol_version,
        server_version,
        connection_id,
        capabilities,
        charset,
        status_flags,
        scramble,
        auth_plugin,
    })
}

/// Build `HandshakeResponse41`.
pub fn handshake_response(
    capabilities: u32,
    user: &str,
    auth_response: &[u8],
    database: Option<&str>,
    auth_plugin: &str,
) -> Vec<u8> {
    let mut caps = capabilities;
    if database.is_some() {
        caps |= capability::CONNECT_WITH_DB;
    }
    let mut buf = Vec::with_capacity(64 + user.len() + auth_response.len());
    buf.extend_from_slice(&caps.to_le_bytes());
    buf.extend_from_slice(&(MAX_PAYLOAD as u32).to_le_bytes());
    buf.push(DEFAULT_CHARSET);
    buf.extend_from_slice(&[0u8; 23]);
    buf.extend_from_slice(user.as_bytes());
    buf.push(0);
    buf.push(auth_response.len() as u8);
    buf.extend_from_slice(auth_response);
    if let Some(db) = database {
        buf.extend_from_slice(db.as_bytes());
        buf.push(0);
    }
    buf.extend_from_slice(auth_plugin.as_bytes());
    buf.push(0);
    buf
}

/// Parse an OK packet, marker included.
pub fn parse_ok(payload: &[u8]) -> Result<OkPacket, MySqlError> {
    let mut r = Reader::new(payload);
    let marker = r.u8()?;
    if marker != OK_MARKER && marker != EOF_MARKER {
        return Err(MySqlError::Protocol("expected OK packet"));
    }
    let affected_rows = r.lenenc_int()?.unwrap_or(0);
    let insert_id = r.lenenc_int()?.unwrap_or(0);
    let status_flags = r.u16()?;
    let warnings = r.u16()?;
    let info = String::from_utf8_lossy(r.rest()).into_owned();
    Ok(OkPacket {
        affected_rows,
        insert_id,
        status_flags,
        warnings,
        info,
    })
}

/// Parse an ERR packet, marker included.
pub fn parse_err(payload: &[u8]) -> Result<ErrPacket, MySqlError> {
    let mut r = Reader::new(payload);
    if r.u8()? != ERR_MARKER {
        return Err(MySqlError::Protocol("expected ERR packet"));
    }
    let code = r.u16()?;
    let sql_state = if r.peek() == Some(b'#') {
        r.skip(1)?;
        String::from_utf8_lossy(r.bytes(5)?).into_owned()
    } else {
        String::new()
    };
    let message = String::from_utf8_lossy(r.rest()).into_owned();
    Ok(ErrPacket {
        code,
        sql_state,
        message,
    })
}

/// True for an EOF packet (as opposed to a row starting with `0xFE`).
pub fn is_eof(payload: &[u8]) -> bool {
    payload.first() == Some(&EOF_MARKER) && payload.len() < 9
}

/// Status flags of an EOF packet.
pub fn eof_status(payload: &[u8]) -> u16 {
    match payload {
        [_, _, _, lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
        _ => 0,
    }
}

/// Parse a `ColumnDefinition41` packet.
pub fn parse_column(payload: &[u8]) -> Result<Field, MySqlError> {
    let mut r = Reader::new(payload);
    let _catalog = r.lenenc_string()?;
    let db = r.lenenc_string()?;
    let table = r.lenenc_string()?;
    let org_table = r.lenenc_string()?;
    let name = r.lenenc_string()?;
    let org_name = r.lenenc_string()?;
    let _fixed_len = r.lenenc_int()?;
    let charset = r.u16()?;
    let length = r.u32()?;
    let data_type = DataType::from_code(r.u8()?);
    let flags = r.u16()?;
    let decimals = r.u8()?;
    Ok(Field {
        db,
        table,
        org_table,
        name,
        org_name,
        charset,
        length,
        data_type,
        flags,
        decimals,
    })
}

/// Parse a text-protocol row against its column definitions.
pub fn parse_text_row(payload: &[u8], fields: &[Field]) -> Result<Vec<Cell>, MySqlError> {
    let mut r = Reader::new(payload);
    let mut row = Vec::with_capacity(fields.len());
    for field in fields {
        row.push(Cell::from_text(field.data_type, r.lenenc_bytes()?));
    }
    Ok(row)
}

// ── Authentication ───────────────────────────────────────────────────

/// `mysql_native_password`: SHA1(pw) XOR SHA1(scramble + SHA1(SHA1(pw))).
pub fn scramble_native(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(&scramble[..scramble.len().min(20)]);
    hasher.update(stage2);
    let token = hasher.finalize();
    stage1.iter().zip(token.iter()).map(|(a, b)| a ^ b).collect()
}

/// `caching_sha2_password`: SHA256(pw) XOR SHA256(SHA256(SHA256(pw)) + scramble).
pub fn scramble_caching_sha2(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);
    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(&scramble[..scramble.len().min(20)]);
    let token = hasher.finalize();
    stage1.iter().zip(token.iter()).map(|(a, b)| a ^ b).collect()
}

/// Auth response for `plugin`, or `None` when the plugin is not spoken.
pub fn auth_response(plugin: &str, password: &str, scramble: &[u8]) -> Option<Vec<u8>> {
    match plugin {
        NATIVE_PASSWORD => Some(scramble_native(password, scramble)),
        CACHING_SHA2_PASSWORD => Some(scramble_caching_sha2(password, scramble)),
        _ => None,
    }
}
