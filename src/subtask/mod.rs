//! Sub-task composition subsystem.
//!
//! # Data Flow
//! ```text
//! Handler runs on the parent task
//!     → HttpResp::http / HttpResp::mysql* attach a child operation
//!     → child future runs (outbound fetch, database query, file I/O)
//!     → single-shot completion applies the outcome to the parent response
//!     → parent writes its reply
//!     → finish hooks run (diagnostics, proxy context release)
//! ```
//!
//! # Design Decisions
//! - Every child reports a `(TaskState, error code)` pair, never a Rust error
//! - Failures become response content; the handler is not re-entered
//! - Error strings are a pure function of the pair
//! - Child operations run in attachment order on the request's own task

pub mod proxy;
pub mod query;

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::http::HttpResp;
use crate::mysql::client::{MySqlExecutor, TcpMySqlExecutor};
use self::proxy::{HttpFetcher, HyperFetcher};

/// Applies a child's outcome to the parent response. Runs exactly once.
pub type Completion = Box<dyn FnOnce(&mut HttpResp) + Send>;

/// A child operation attached to a parent request.
pub type SubTask = Pin<Box<dyn Future<Output = Completion> + Send>>;

/// Terminal state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Success,
    /// Operating-system level failure; the code is an errno value.
    SysError,
    /// Name resolution failure; the code is an `EAI_*` value.
    DnsError,
    SslError,
    /// Failure detected by the task itself; the code is a [`task_error`] value.
    TaskError,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Success => "success",
            TaskState::SysError => "sys_error",
            TaskState::DnsError => "dns_error",
            TaskState::SslError => "ssl_error",
            TaskState::TaskError => "task_error",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// errno values reported with [`TaskState::SysError`].
pub mod errno {
    pub const EIO: i32 = 5;
    pub const EPIPE: i32 = 32;
    pub const EMSGSIZE: i32 = 90;
    pub const ECONNRESET: i32 = 104;
    pub const ETIMEDOUT: i32 = 110;
    pub const ECONNREFUSED: i32 = 111;
}

/// Resolver codes reported with [`TaskState::DnsError`].
pub mod eai {
    pub const EAI_NONAME: i32 = -2;
    pub const EAI_AGAIN: i32 = -3;
    pub const EAI_FAIL: i32 = -4;
}

/// Codes reported with [`TaskState::TaskError`].
pub mod task_error {
    pub const URI_PARSE_FAILED: i32 = 1001;
    pub const URI_SCHEME_INVALID: i32 = 1002;
    pub const URI_PORT_INVALID: i32 = 1003;
    pub const UPSTREAM_UNAVAILABLE: i32 = 1004;

    pub const MYSQL_HOST_NOT_ALLOWED: i32 = 4000;
    pub const MYSQL_ACCESS_DENIED: i32 = 4001;
    pub const MYSQL_INVALID_CHARACTER_SET: i32 = 4002;
    pub const MYSQL_COMMAND_DISALLOWED: i32 = 4003;
    pub const MYSQL_QUERY_NOT_SET: i32 = 4004;
    pub const MYSQL_SSL_NOT_SUPPORTED: i32 = 4005;
    pub const MYSQL_AUTH_UNSUPPORTED: i32 = 4006;
    pub const MYSQL_BAD_PACKET: i32 = 4007;
}

/// Human-readable message for a failed task.
pub fn error_string(state: TaskState, error: i32) -> String {
    match state {
        TaskState::Success => "Success".to_string(),
        TaskState::SysError => {
            let text = io::Error::from_raw_os_error(error).to_string();
            match text.rfind(" (os error") {
                Some(idx) => text[..idx].to_string(),
                None => text,
            }
        }
        TaskState::DnsError => match error {
            eai::EAI_NONAME => "Name or service not known".to_string(),
            eai::EAI_AGAIN => "Temporary failure in name resolution".to_string(),
            eai::EAI_FAIL => "Non-recoverable failure in name resolution".to_string(),
            _ => format!("DNS error {}", error),
        },
        TaskState::SslError => "SSL error".to_string(),
        TaskState::TaskError => match error {
            task_error::URI_PARSE_FAILED => "URI parse failed",
            task_error::URI_SCHEME_INVALID => "URI scheme invalid (cannot be a HTTPS proxy)",
            task_error::URI_PORT_INVALID => "URI port invalid",
            task_error::UPSTREAM_UNAVAILABLE => "Upstream unavailable",
            task_error::MYSQL_HOST_NOT_ALLOWED => "MySQL host not allowed",
            task_error::MYSQL_ACCESS_DENIED => "MySQL access denied",
            task_error::MYSQL_INVALID_CHARACTER_SET => "MySQL invalid character set",
            task_error::MYSQL_COMMAND_DISALLOWED => "MySQL command disallowed",
            task_error::MYSQL_QUERY_NOT_SET => "MySQL query not set",
            task_error::MYSQL_SSL_NOT_SUPPORTED => "MySQL SSL not supported",
            task_error::MYSQL_AUTH_UNSUPPORTED => "MySQL authentication method not supported",
            task_error::MYSQL_BAD_PACKET => "MySQL malformed packet",
            _ => "Unknown task error",
        }
        .to_string(),
    }
}

/// True when the pair reports the peer resetting the connection.
pub fn is_connection_reset(state: TaskState, error: i32) -> bool {
    state == TaskState::SysError
        && (error == errno::ECONNRESET
            || io::Error::from_raw_os_error(error).kind() == io::ErrorKind::ConnectionReset)
}

/// Map a transport error chain onto a `(TaskState, code)` pair.
pub fn classify_error(err: &(dyn StdError + 'static)) -> (TaskState, i32) {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if e.to_string().contains("dns error") {
            return (TaskState::DnsError, eai::EAI_NONAME);
        }
        current = e.source();
    }

    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return (TaskState::SysError, io_errno(io_err));
        }
        current = e.source();
    }

    (TaskState::TaskError, task_error::UPSTREAM_UNAVAILABLE)
}

/// errno for an I/O error, synthesized from its kind when the OS gave none.
pub fn io_errno(err: &io::Error) -> i32 {
    if let Some(code) = err.raw_os_error() {
        return code;
    }
    match err.kind() {
        io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof => errno::ECONNRESET,
        io::ErrorKind::ConnectionRefused => errno::ECONNREFUSED,
        io::ErrorKind::TimedOut => errno::ETIMEDOUT,
        io::ErrorKind::BrokenPipe => errno::EPIPE,
        _ => errno::EIO,
    }
}

/// Backends that child operations are dispatched to.
#[derive(Clone)]
pub struct Services {
    pub fetcher: Arc<dyn HttpFetcher>,
    pub mysql: Arc<dyn MySqlExecutor>,
}

impl Services {
    pub fn new(fetcher: Arc<dyn HttpFetcher>, mysql: Arc<dyn MySqlExecutor>) -> Self {
        Self { fetcher, mysql }
    }

    /// Real network backends configured from `config`.
    pub fn from_config(config: &ServerConfig) -> Self {
        let connect_timeout = Duration::from_secs(config.timeouts.connect_secs);
        Self {
            fetcher: Arc::new(HyperFetcher::new(connect_timeout)),
            mysql: Arc::new(TcpMySqlExecutor::new(connect_timeout)),
        }
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}
