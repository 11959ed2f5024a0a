//! HTTP request/response core with child operations: file I/O, outbound
//! HTTP proxying and MySQL queries attached to a response and run before it
//! is sent.

pub mod codec;
pub mod config;
pub mod http;
pub mod mysql;
pub mod observability;
pub mod subtask;

pub use config::ServerConfig;
pub use http::{HttpReq, HttpResp, HttpServer, ServerTask};
pub use subtask::{Services, TaskState};
