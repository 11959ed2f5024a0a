//! Query results as returned by the server.
//!
//! A response holds every result set of a (possibly multi-statement) query
//! in server order, followed by the error that ended it, if any.

use std::fmt;

/// Column type codes of the client/server protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Decimal,
    Tiny,
    Short,
    Long,
    Float,
    Double,
    Null,
    Timestamp,
    LongLong,
    Int24,
    Date,
    Time,
    DateTime,
    Year,
    NewDate,
    VarChar,
    Bit,
    Json,
    NewDecimal,
    Enum,
    Set,
    TinyBlob,
    MediumBlob,
    LongBlob,
    Blob,
    VarString,
    String,
    Geometry,
    Other(u8),
}

impl DataType {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => DataType::Decimal,
            0x01 => DataType::Tiny,
            0x02 => DataType::Short,
            0x03 => DataType::Long,
            0x04 => DataType::Float,
            0x05 => DataType::Double,
            0x06 => DataType::Null,
            0x07 => DataType::Timestamp,
            0x08 => DataType::LongLong,
            0x09 => DataType::Int24,
            0x0a => DataType::Date,
            0x0b => DataType::Time,
            0x0c => DataType::DateTime,
            0x0d => DataType::Year,
            0x0e => DataType::NewDate,
            0x0f => DataType::VarChar,
            0x10 => DataType::Bit,
            0xf5 => DataType::Json,
            0xf6 => DataType::NewDecimal,
            0xf7 => DataType::Enum,
            0xf8 => DataType::Set,
            0xf9 => DataType::TinyBlob,
            0xfa => DataType::MediumBlob,
            0xfb => DataType::LongBlob,
            0xfc => DataType::Blob,
            0xfd => DataType::VarString,
            0xfe => DataType::String,
            0xff => DataType::Geometry,
            other => DataType::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            DataType::Decimal => 0x00,
            DataType::Tiny => 0x01,
            DataType::Short => 0x02,
            DataType::Long => 0x03,
            DataType::Float => 0x04,
            DataType::Double => 0x05,
            DataType::Null => 0x06,
            DataType::Timestamp => 0x07,
            DataType::LongLong => 0x08,
            DataType::Int24 => 0x09,
            DataType::Date => 0x0a,
            DataType::Time => 0x0b,
            DataType::DateTime => 0x0c,
            DataType::Year => 0x0d,
            DataType::NewDate => 0x0e,
            DataType::VarChar => 0x0f,
            DataType::Bit => 0x10,
            DataType::Json => 0xf5,
            DataType::NewDecimal => 0xf6,
            DataType::Enum => 0xf7,
            DataType::Set => 0xf8,
            DataType::TinyBlob => 0xf9,
            DataType::MediumBlob => 0xfa,
            DataType::LongBlob => 0xfb,
            DataType::Blob => 0xfc,
            DataType::VarString => 0xfd,
            DataType::String => 0xfe,
            DataType::Geometry => 0xff,
            DataType::Other(code) => *code,
        }
    }

    /// Protocol name of the type, e.g. `MYSQL_TYPE_LONG`.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Decimal => "MYSQL_TYPE_DECIMAL",
            DataType::Tiny => "MYSQL_TYPE_TINY",
            DataType::Short => "MYSQL_TYPE_SHORT",
            DataType::Long => "MYSQL_TYPE_LONG",
            DataType::Float => "MYSQL_TYPE_FLOAT",
            DataType::Double => "MYSQL_TYPE_DOUBLE",
            DataType::Null => "MYSQL_TYPE_NULL",
            DataType::Timestamp => "MYSQL_TYPE_TIMESTAMP",
            DataType::LongLong => "MYSQL_TYPE_LONGLONG",
            DataType::Int24 => "MYSQL_TYPE_INT24",
            DataType::Date => "MYSQL_TYPE_DATE",
            DataType::Time => "MYSQL_TYPE_TIME",
            DataType::DateTime => "MYSQL_TYPE_DATETIME",
            DataType::Year => "MYSQL_TYPE_YEAR",
            DataType::NewDate => "MYSQL_TYPE_NEWDATE",
            DataType::VarChar => "MYSQL_TYPE_VARCHAR",
            DataType::Bit => "MYSQL_TYPE_BIT",
            DataType::Json => "MYSQL_TYPE_JSON",
            DataType::NewDecimal => "MYSQL_TYPE_NEWDECIMAL",
            DataType::Enum => "MYSQL_TYPE_ENUM",
            DataType::Set => "MYSQL_TYPE_SET",
            DataType::TinyBlob => "MYSQL_TYPE_TINY_BLOB",
            DataType::MediumBlob => "MYSQL_TYPE_MEDIUM_BLOB",
            DataType::LongBlob => "MYSQL_TYPE_LONG_BLOB",
            DataType::Blob => "MYSQL_TYPE_BLOB",
            DataType::VarString => "MYSQL_TYPE_VAR_STRING",
            DataType::String => "MYSQL_TYPE_STRING",
            DataType::Geometry => "MYSQL_TYPE_GEOMETRY",
            DataType::Other(_) => "MYSQL_TYPE_UNKNOWN",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub db: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    pub length: u32,
    pub data_type: DataType,
    pub flags: u16,
    pub decimals: u8,
}

impl Field {
    /// Column definition with only a name, a table and a type.
    pub fn new(db: &str, table: &str, name: &str, data_type: DataType) -> Self {
        Self {
            db: db.to_string(),
            table: table.to_string(),
            org_table: table.to_string(),
            name: name.to_string(),
            org_name: name.to_string(),
            charset: 45,
            length: 0,
            data_type,
            flags: 0,
            decimals: 0,
        }
    }
}

/// One value of a row, typed by its column.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Int(i64),
    ULongLong(u64),
    Float(f32),
    Double(f64),
    Date(String),
    Time(String),
    DateTime(String),
    String(String),
}

impl Cell {
    /// Convert a text-protocol value according to its column type.
    ///
    /// Values that do not parse as their column type stay text.
    pub fn from_text(data_type: DataType, value: Option<&[u8]>) -> Self {
        let Some(raw) = value else {
            return Cell::Null;
        };
        let text = String::from_utf8_lossy(raw).into_owned();
        match data_type {
            DataType::Tiny | DataType::Short | DataType::Int24 | DataType::Long => {
                text.parse().map(Cell::Int).unwrap_or(Cell::String(text))
            }
            DataType::LongLong => match text.parse::<u64>() {
                Ok(v) => Cell::ULongLong(v),
                Err(_) => text.parse().map(Cell::Int).unwrap_or(Cell::String(text)),
            },
            DataType::Float => text.parse().map(Cell::Float).unwrap_or(Cell::String(text)),
            DataType::Double => text.parse().map(Cell::Double).unwrap_or(Cell::String(text)),
            DataType::Date | DataType::NewDate => Cell::Date(text),
            DataType::Time => Cell::Time(text),
            DataType::DateTime | DataType::Timestamp => Cell::DateTime(text),
            DataType::Null => Cell::Null,
            _ => Cell::String(text),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

/// Status of a statement that returned no rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

/// Error reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

/// One result of a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultSet {
    Rows { fields: Vec<Field>, rows: Vec<Vec<Cell>> },
    Ok(OkPacket),
}

/// Kind of the packet that ended a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Last result carried rows.
    Eof,
    Ok,
    Error,
}

/// Everything the server sent back for one query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MySqlResponse {
    pub results: Vec<ResultSet>,
    pub error: Option<ErrPacket>,
}

impl MySqlResponse {
    pub fn packet_type(&self) -> PacketType {
        if self.error.is_some() {
            return PacketType::Error;
        }
        match self.results.last() {
            Some(ResultSet::Rows { .. }) => PacketType::Eof,
            _ => PacketType::Ok,
        }
    }

    /// The final OK packet, when the response ended in one.
    pub fn last_ok(&self) -> Option<&OkPacket> {
        match (self.packet_type(), self.results.last()) {
            (PacketType::Ok, Some(ResultSet::Ok(ok))) => Some(ok),
            _ => None,
        }
    }
}

/// Position of a [`ResultCursor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStatus {
    /// On a result set with rows.
    GetResult,
    /// On a statement status.
    Ok,
    /// On the error that ended the response.
    Error,
    /// Past the last result.
    End,
}

/// Walks the results of a response in server order.
#[derive(Debug)]
pub struct ResultCursor<'a> {
    response: &'a MySqlResponse,
    index: usize,
    row: usize,
}

impl<'a> ResultCursor<'a> {
    pub fn new(response: &'a MySqlResponse) -> Self {
        Self {
            response,
            index: 0,
            row: 0,
        }
    }

    fn current(&self) -> Option<&'a ResultSet> {
        self.response.results.get(self.index)
    }

    pub fn status(&self) -> CursorStatus {
        match self.current() {
            Some(ResultSet::Rows { .. }) => CursorStatus::GetResult,
            Some(ResultSet::Ok(_)) => CursorStatus::Ok,
            None if self.response.error.is_some() => CursorStatus::Error,
            None => CursorStatus::End,
        }
    }

    /// Move to the next result. Returns false once past the last one.
    pub fn next_result_set(&mut self) -> bool {
        if self.index < self.response.results.len() {
            self.index += 1;
            self.row = 0;
        }
        matches!(self.status(), CursorStatus::GetResult | CursorStatus::Ok)
    }

    pub fn field_count(&self) -> usize {
        match self.current() {
            Some(ResultSet::Rows { fields, .. }) => fields.len(),
            _ => 0,
        }
    }

    pub fn rows_count(&self) -> usize {
        match self.current() {
            Some(ResultSet::Rows { rows, .. }) => rows.len(),
            _ => 0,
        }
    }

    pub fn fetch_fields(&self) -> &'a [Field] {
        match self.current() {
            Some(ResultSet::Rows { fields, .. }) => fields,
            _ => &[],
        }
    }

    /// The next row of the current result set.
    pub fn fetch_row(&mut self) -> Option<&'a [Cell]> {
        let Some(ResultSet::Rows { rows, .. }) = self.current() else {
            return None;
        };
        let row = rows.get(self.row)?;
        self.row += 1;
        Some(row)
    }

    /// Every row not fetched yet.
    pub fn fetch_all(&mut self) -> Vec<&'a [Cell]> {
        let mut all = Vec::new();
        while let Some(row) = self.fetch_row() {
            all.push(row);
        }
        all
    }

    fn ok(&self) -> Option<&'a OkPacket> {
        match self.current() {
            Some(ResultSet::Ok(ok)) => Some(ok),
            _ => None,
        }
    }

    pub fn affected_rows(&self) -> u64 {
        self.ok().map_or(0, |ok| ok.affected_rows)
    }

    pub fn warnings(&self) -> u16 {
        self.ok().map_or(0, |ok| ok.warnings)
    }

    pub fn insert_id(&self) -> u64 {
        self.ok().map_or(0, |ok| ok.insert_id)
    }

    pub fn info(&self) -> &'a str {
        self.ok().map_or("", |ok| ok.info.as_str())
    }

    /// The error that ended the response, once the cursor reached it.
    pub fn error(&self) -> Option<&'a ErrPacket> {
        match self.status() {
            CursorStatus::Error => self.response.error.as_ref(),
            _ => None,
        }
    }
}
