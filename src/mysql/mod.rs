//! MySQL client subsystem.
//!
//! # Data Flow
//! ```text
//! HttpResp::mysql*(url, sql)
//!     → MySqlExecutor::query
//!         → client.rs (connect, handshake, COM_QUERY, COM_QUIT)
//!         → protocol.rs (packet framing and parsing)
//!     → result.rs (MySqlResponse, ResultCursor)
//!     → json.rs (result document)
//! ```
//!
//! # Design Decisions
//! - Text protocol only; every value arrives as text and is typed by its column
//! - One connection per query
//! - A server error after the handshake is part of the response, not a failed task

pub mod client;
pub mod json;
pub mod protocol;
pub mod result;

use std::io;

use thiserror::Error;

use crate::subtask::{eai, errno, io_errno, task_error, TaskState};

pub use client::{MySqlExecutor, QueryOutcome, TcpMySqlExecutor};
pub use result::{Cell, CursorStatus, DataType, Field, MySqlResponse, ResultCursor, ResultSet};

/// Failure talking to the server.
#[derive(Debug, Error)]
pub enum MySqlError {
    #[error("invalid mysql url: {0}")]
    InvalidUrl(String),

    #[error("failed to resolve {host}")]
    Resolve { host: String },

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("server rejected login ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("unsupported authentication plugin: {0}")]
    UnsupportedAuth(String),

    #[error("server requires a secure connection")]
    SslRequired,

    #[error("malformed packet: {0}")]
    Protocol(&'static str),

    #[error("query is empty")]
    EmptyQuery,
}

impl MySqlError {
    /// The `(TaskState, code)` pair a failed query reports.
    pub fn task_state(&self) -> (TaskState, i32) {
        match self {
            MySqlError::InvalidUrl(_) => (TaskState::TaskError, task_error::URI_PARSE_FAILED),
            MySqlError::Resolve { .. } => (TaskState::DnsError, eai::EAI_NONAME),
            MySqlError::ConnectTimeout => (TaskState::SysError, errno::ETIMEDOUT),
            MySqlError::Io(e) => (TaskState::SysError, io_errno(e)),
            MySqlError::Rejected { code, .. } => match code {
                1130 => (TaskState::TaskError, task_error::MYSQL_HOST_NOT_ALLOWED),
                1115 => (TaskState::TaskError, task_error::MYSQL_INVALID_CHARACTER_SET),
                _ => (TaskState::TaskError, task_error::MYSQL_ACCESS_DENIED),
            },
            MySqlError::UnsupportedAuth(_) => (TaskState::TaskError, task_error::MYSQL_AUTH_UNSUPPORTED),
            MySqlError::SslRequired => (TaskState::TaskError, task_error::MYSQL_SSL_NOT_SUPPORTED),
            MySqlError::Protocol(_) => (TaskState::TaskError, task_error::MYSQL_BAD_PACKET),
            MySqlError::EmptyQuery => (TaskState::TaskError, task_error::MYSQL_QUERY_NOT_SET),
        }
    }
}
