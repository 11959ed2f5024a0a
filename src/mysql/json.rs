//! JSON rendering of query results.
//!
//! # Document Shape
//! ```text
//! { "error": "<message>" }                      task failed before a reply
//!
//! { "result_set": [                             one entry per result, in order
//!     { "field_count", "rows_count", ["database"], "table",
//!       "fields_name", "fields_type", "rows" }  result with rows
//!     { "status": "OK", "affected_rows", "warnings",
//!       "insert_id", "info" }                   statement status
//!   ],
//!   "errcode", "errmsg"                         response ended in an error
//!   | "status", "affected_rows", ...            response ended in an OK
//! }
//! ```

use serde_json::{json, Map, Value};

use crate::mysql::result::{Cell, MySqlResponse, OkPacket, PacketType, ResultCursor, CursorStatus};
use crate::subtask::{error_string, TaskState};

/// Render the outcome of a query as a JSON document.
pub fn result_to_json(state: TaskState, error: i32, response: &MySqlResponse) -> Value {
    if state != TaskState::Success {
        return json!({ "error": error_string(state, error) });
    }

    let mut doc = Map::new();
    let mut entries = Vec::new();
    let mut cursor = ResultCursor::new(response);
    loop {
        match cursor.status() {
            CursorStatus::GetResult => entries.push(rows_entry(&mut cursor)),
            CursorStatus::Ok => {
                let mut entry = Map::new();
                entry.insert("status".into(), Value::from("OK"));
                entry.insert("affected_rows".into(), Value::from(cursor.affected_rows()));
                entry.insert("warnings".into(), Value::from(cursor.warnings()));
                entry.insert("insert_id".into(), Value::from(cursor.insert_id()));
                entry.insert("info".into(), Value::from(cursor.info()));
                entries.push(Value::Object(entry));
            }
            CursorStatus::Error | CursorStatus::End => break,
        }
        if !cursor.next_result_set() {
            break;
        }
    }
    if !entries.is_empty() {
        doc.insert("result_set".into(), Value::Array(entries));
    }

    match response.packet_type() {
        PacketType::Error => {
            if let Some(err) = &response.error {
                doc.insert("errcode".into(), Value::from(err.code));
                doc.insert("errmsg".into(), Value::from(err.message.as_str()));
            }
        }
        PacketType::Ok => {
            let fallback = OkPacket::default();
            let ok = response.last_ok().unwrap_or(&fallback);
            doc.insert("status".into(), Value::from("OK"));
            doc.insert("affected_rows".into(), Value::from(ok.affected_rows));
            doc.insert("warnings".into(), Value::from(ok.warnings));
            doc.insert("insert_id".into(), Value::from(ok.insert_id));
            doc.insert("info".into(), Value::from(ok.info.as_str()));
        }
        PacketType::Eof => {}
    }

    Value::Object(doc)
}

fn rows_entry(cursor: &mut ResultCursor<'_>) -> Value {
    let mut entry = Map::new();
    entry.insert("field_count".into(), Value::from(cursor.field_count()));
    entry.insert("rows_count".into(), Value::from(cursor.rows_count()));

    let fields = cursor.fetch_fields();
    if let Some(first) = fields.first() {
        if !first.db.is_empty() {
            entry.insert("database".into(), Value::from(first.db.as_str()));
        }
        entry.insert("table".into(), Value::from(first.table.as_str()));
    }
    let names: Vec<Value> = fields.iter().map(|f| Value::from(f.name.as_str())).collect();
    let types: Vec<Value> = fields.iter().map(|f| Value::from(f.data_type.as_str())).collect();
    entry.insert("fields_name".into(), Value::Array(names));
    entry.insert("fields_type".into(), Value::Array(types));

    let rows: Vec<Value> = cursor
        .fetch_all()
        .into_iter()
        .map(|row| Value::Array(row.iter().map(cell_to_json).collect()))
        .collect();
    entry.insert("rows".into(), Value::Array(rows));

    Value::Object(entry)
}

/// JSON value of one cell.
///
/// Null renders as the text `"NULL"`; dates render as their text form.
pub fn cell_to_json(cell: &Cell) -> Value {
    match cell {
        Cell::Null => Value::from("NULL"),
        Cell::Int(v) => Value::from(*v),
        Cell::ULongLong(v) => Value::from(*v),
        // Through the shortest decimal form so 0.1f32 stays 0.1.
        Cell::Float(v) => v.to_string().parse::<f64>().map_or(Value::Null, Value::from),
        Cell::Double(v) => Value::from(*v),
        Cell::Date(s) | Cell::Time(s) | Cell::DateTime(s) | Cell::String(s) => {
            Value::from(s.as_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mysql::result::{DataType, ErrPacket, Field, ResultSet};
    use crate::subtask::{errno, task_error};

    fn rows(db: &str) -> ResultSet {
        ResultSet::Rows {
            fields: vec![
                Field::new(db, "users", "id", DataType::Long),
                Field::new(db, "users", "score", DataType::Float),
                Field::new(db, "users", "seen", DataType::DateTime),
                Field::new(db, "users", "nick", DataType::VarString),
            ],
            rows: vec![vec![
                Cell::Int(7),
                Cell::Float(0.1),
                Cell::DateTime("2024-05-06 07:08:09".into()),
                Cell::Null,
            ]],
        }
    }

    #[test]
    fn test_select_document() {
        let response = MySqlResponse {
            results: vec![rows("app")],
            error: None,
        };
        let doc = result_to_json(TaskState::Success, 0, &response);
        assert_eq!(
            doc,
            json!({
                "result_set": [{
                    "field_count": 4,
                    "rows_count": 1,
                    "database": "app",
                    "table": "users",
                    "fields_name": ["id", "score", "seen", "nick"],
                    "fields_type": ["MYSQL_TYPE_LONG", "MYSQL_TYPE_FLOAT", "MYSQL_TYPE_DATETIME", "MYSQL_TYPE_VAR_STRING"],
                    "rows": [[7, 0.1, "2024-05-06 07:08:09", "NULL"]]
                }]
            })
        );
        assert!(doc.get("status").is_none());
    }

    #[test]
    fn test_empty_database_is_omitted() {
        let response = MySqlResponse {
            results: vec![rows("")],
            error: None,
        };
        let doc = result_to_json(TaskState::Success, 0, &response);
        let entry = &doc["result_set"][0];
        assert!(entry.get("database").is_none());
        assert_eq!(entry["table"], "users");
    }

    #[test]
    fn test_empty_rows_are_an_empty_list() {
        let response = MySqlResponse {
            results: vec![ResultSet::Rows {
                fields: vec![Field::new("app", "t", "c", DataType::Long)],
                rows: vec![],
            }],
            error: None,
        };
        let doc = result_to_json(TaskState::Success, 0, &response);
        assert_eq!(doc["result_set"][0]["rows"], json!([]));
    }

    #[test]
    fn test_ok_document() {
        let ok = OkPacket {
            affected_rows: 2,
            insert_id: 41,
            warnings: 0,
            info: String::new(),
            status_flags: 2,
        };
        let response = MySqlResponse {
            results: vec![ResultSet::Ok(ok)],
            error: None,
        };
        let doc = result_to_json(TaskState::Success, 0, &response);
        assert_eq!(doc["result_set"][0]["status"], "OK");
        assert_eq!(doc["result_set"][0]["affected_rows"], 2);
        assert_eq!(doc["status"], "OK");
        assert_eq!(doc["insert_id"], 41);
        assert_eq!(doc["info"], "");
    }

    #[test]
    fn test_rows_then_ok_in_server_order() {
        let response = MySqlResponse {
            results: vec![
                ResultSet::Rows {
                    fields: vec![Field::new("app", "users", "id", DataType::Long)],
                    rows: vec![vec![Cell::Int(1)], vec![Cell::Int(2)]],
                },
                ResultSet::Ok(OkPacket {
                    affected_rows: 2,
                    insert_id: 0,
                    warnings: 0,
                    info: String::new(),
                    status_flags: 2,
                }),
            ],
            error: None,
        };
        let doc = result_to_json(TaskState::Success, 0, &response);
        let entries = doc["result_set"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["table"], "users");
        assert_eq!(entries[0]["fields_name"], json!(["id"]));
        assert_eq!(entries[0]["rows_count"], 2);
        assert_eq!(entries[0]["rows"], json!([[1], [2]]));
        assert_eq!(entries[1]["status"], "OK");
        assert_eq!(entries[1]["affected_rows"], 2);
        assert!(doc.get("errcode").is_none());
        assert!(doc.get("errmsg").is_none());
        assert_eq!(doc["affected_rows"], 2);
    }

    #[test]
    fn test_error_after_results() {
        let response = MySqlResponse {
            results: vec![rows("app")],
            error: Some(ErrPacket {
                code: 1064,
                sql_state: "42000".into(),
                message: "You have an error in your SQL syntax".into(),
            }),
        };
        let doc = result_to_json(TaskState::Success, 0, &response);
        assert_eq!(doc["result_set"].as_array().unwrap().len(), 1);
        assert_eq!(doc["errcode"], 1064);
        assert_eq!(doc["errmsg"], "You have an error in your SQL syntax");
    }

    #[test]
    fn test_error_only_has_no_result_set() {
        let response = MySqlResponse {
            results: vec![],
            error: Some(ErrPacket {
                code: 1146,
                sql_state: "42S02".into(),
                message: "no such table".into(),
            }),
        };
        let doc = result_to_json(TaskState::Success, 0, &response);
        assert!(doc.get("result_set").is_none());
        assert_eq!(doc["errcode"], 1146);
    }

    #[test]
    fn test_failed_task_document() {
        let doc = result_to_json(TaskState::SysError, errno::ECONNREFUSED, &MySqlResponse::default());
        assert_eq!(doc, json!({"error": "Connection refused"}));
        let doc = result_to_json(
            TaskState::TaskError,
            task_error::MYSQL_ACCESS_DENIED,
            &MySqlResponse::default(),
        );
        assert_eq!(doc, json!({"error": "MySQL access denied"}));
    }

    #[test]
    fn test_cells() {
        assert_eq!(cell_to_json(&Cell::ULongLong(u64::MAX)), json!(u64::MAX));
        assert_eq!(cell_to_json(&Cell::Double(1.5)), json!(1.5));
        assert_eq!(cell_to_json(&Cell::Date("2020-02-29".into())), json!("2020-02-29"));
        assert_eq!(cell_to_json(&Cell::Time("-01:00:00".into())), json!("-01:00:00"));
        assert_eq!(cell_to_json(&Cell::Double(f64::NAN)), Value::Null);
    }
}
