//! Database query child operation.
//!
//! Three ways to consume a query:
//! - reply with the result document
//! - hand the result document to a callback
//! - hand a cursor over the raw result to a callback, or reply with the
//!   error message when the query never reached the server

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::http::HttpResp;
use crate::mysql::json::result_to_json;
use crate::mysql::result::ResultCursor;
use crate::mysql::QueryOutcome;
use crate::observability::metrics;
use crate::subtask::{error_string, TaskState};

fn start(resp: &mut HttpResp, url: &str, sql: &str) -> BoxFuture<'static, QueryOutcome> {
    tracing::debug!(sql_len = sql.len(), "Attaching database query");
    resp.services().mysql.query(url, sql)
}

fn outcome_document(outcome: &QueryOutcome) -> Value {
    metrics::record_subtask("mysql", outcome.state);
    result_to_json(outcome.state, outcome.error, &outcome.response)
}

/// Reply with the result document.
pub(crate) fn attach_json(resp: &mut HttpResp, url: &str, sql: &str) {
    let query = start(resp, url, sql);
    resp.run(query, |resp, outcome| {
        let doc = outcome_document(&outcome);
        resp.json(&doc);
    });
}

/// Hand the result document to `func`.
pub(crate) fn attach_json_callback<F>(resp: &mut HttpResp, url: &str, sql: &str, func: F)
where
    F: FnOnce(&mut HttpResp, Value) + Send + 'static,
{
    let query = start(resp, url, sql);
    resp.run(query, move |resp, outcome| {
        let doc = outcome_document(&outcome);
        func(resp, doc);
    });
}

/// Hand a cursor to `func`, or reply with the failure message.
pub(crate) fn attach_cursor<F>(resp: &mut HttpResp, url: &str, sql: &str, func: F)
where
    F: FnOnce(&mut HttpResp, &mut ResultCursor<'_>) + Send + 'static,
{
    let query = start(resp, url, sql);
    resp.run(query, move |resp, outcome: QueryOutcome| {
        metrics::record_subtask("mysql", outcome.state);
        if outcome.state != TaskState::Success {
            resp.string(error_string(outcome.state, outcome.error));
            return;
        }
        let mut cursor = ResultCursor::new(&outcome.response);
        func(resp, &mut cursor);
    });
}
