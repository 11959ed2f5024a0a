//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, body collection, route parameters)
//!     → request.rs (lazy body decode: dechunk, decompress, form/json views)
//!     → handler fills response.rs (body pipeline, child operations)
//!     → task.rs (run children in order, produce Reply)
//!     → Send to client, fire finish hooks
//! ```

pub mod content_type;
pub mod file;
pub mod form;
pub mod request;
pub mod response;
pub mod server;
pub mod task;

pub use request::{HttpReq, RawBody};
pub use response::HttpResp;
pub use server::{AppState, HttpServer};
pub use task::{Reply, ServerTask, TaskReport, X_REQUEST_ID};
