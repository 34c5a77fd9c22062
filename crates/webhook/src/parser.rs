//! Parse webhook bodies into [`ChangeEvent`]s.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::debug;

use changeflow_core::{Actor, ChangeEvent, Operation, Record, TableIdentity};

use crate::error::PayloadParseError;
use crate::wire::{WebhookPayload, WireData};

/// Timestamp layouts accepted when `created_at` carries no offset.
const NAIVE_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
];

/// Parse a raw JSON body.
pub fn parse_payload(body: &str) -> Result<ChangeEvent, PayloadParseError> {
    let value: Value = serde_json::from_str(body)?;
    parse_value(&value)
}

/// Parse an already-decoded JSON body.
///
/// Required: `event.op`, `event.data`, `table.schema`, `table.name`, `id`,
/// `created_at`. The `old`/`new` images must match the operation:
/// - `INSERT` carries `new` only
/// - `DELETE` carries `old` only
/// - `UPDATE` carries both
/// - `MANUAL` carries whatever the host sent
pub fn parse_value(value: &Value) -> Result<ChangeEvent, PayloadParseError> {
    if !value.is_object() {
        return Err(PayloadParseError::NotAnObject);
    }

    let payload: WebhookPayload =
        serde_json::from_value(value.clone()).map_err(|e| PayloadParseError::InvalidField {
            field: "payload",
            reason: e.to_string(),
        })?;

    let event = payload.event.ok_or(PayloadParseError::MissingField("event"))?;
    let op = event.op.ok_or(PayloadParseError::MissingField("event.op"))?;
    let operation: Operation = op
        .parse()
        .map_err(|reason| PayloadParseError::InvalidField { field: "event.op", reason })?;

    let data = event.data.ok_or(PayloadParseError::MissingField("event.data"))?;
    let (before, after) = split_images(operation, data)?;

    let table = payload.table.ok_or(PayloadParseError::MissingField("table"))?;
    let schema = non_empty(table.schema, "table.schema")?;
    let name = non_empty(table.name, "table.name")?;

    let source_id = non_empty(payload.id, "id")?;
    let created_at = parse_timestamp(&non_empty(payload.created_at, "created_at")?)?;

    let actor = Actor::new(session_variables(event.session_variables));
    let trigger_name = payload.trigger.and_then(|t| t.name);

    debug!(
        source_id = %source_id,
        op = %operation,
        table = %format!("{schema}.{name}"),
        "parsed change event"
    );

    Ok(ChangeEvent {
        operation,
        table: TableIdentity::new(schema, name),
        before,
        after,
        actor,
        source_id,
        created_at,
        trigger_name,
    })
}

fn non_empty(value: Option<String>, field: &'static str) -> Result<String, PayloadParseError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        Some(_) => Err(PayloadParseError::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        }),
        None => Err(PayloadParseError::MissingField(field)),
    }
}

fn to_record(value: Option<Value>, field: &'static str) -> Result<Option<Record>, PayloadParseError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(PayloadParseError::InvalidField {
            field,
            reason: format!("expected an object, got {other}"),
        }),
    }
}

fn split_images(
    operation: Operation,
    data: WireData,
) -> Result<(Option<Record>, Option<Record>), PayloadParseError> {
    let before = to_record(data.old, "event.data.old")?;
    let after = to_record(data.new, "event.data.new")?;

    let inconsistent = |reason: &str| PayloadParseError::InconsistentData {
        op: operation.to_string(),
        reason: reason.to_string(),
    };

    match operation {
        Operation::Insert if after.is_none() => Err(inconsistent("missing new row")),
        Operation::Insert if before.is_some() => Err(inconsistent("unexpected old row")),
        Operation::Delete if before.is_none() => Err(inconsistent("missing old row")),
        Operation::Delete if after.is_some() => Err(inconsistent("unexpected new row")),
        Operation::Update if before.is_none() || after.is_none() => {
            Err(inconsistent("update requires both old and new rows"))
        }
        _ => Ok((before, after)),
    }
}

fn session_variables(raw: Option<BTreeMap<String, Value>>) -> BTreeMap<String, String> {
    raw.unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| match v {
            Value::Null => None,
            Value::String(s) => Some((k, s)),
            other => Some((k, other.to_string())),
        })
        .collect()
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, PayloadParseError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| PayloadParseError::InvalidField {
            field: "created_at",
            reason: format!("unrecognized timestamp '{raw}'"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use serde_json::json;

    fn payload(op: &str, old: Value, new: Value) -> Value {
        json!({
            "event": {
                "op": op,
                "data": { "old": old, "new": new },
                "session_variables": {
                    "x-hasura-role": "user",
                    "x-hasura-user-id": "42"
                }
            },
            "table": { "schema": "public", "name": "orders" },
            "id": "85558393-c75d-4d2f-9c15-e80591b83894",
            "created_at": "2024-03-01T12:30:00.123456Z",
            "trigger": { "name": "orders_all" }
        })
    }

    #[test]
    fn parses_update_payload() {
        let ev = parse_value(&payload(
            "UPDATE",
            json!({"id": 1, "status": "pending"}),
            json!({"id": 1, "status": "cancelled"}),
        ))
        .unwrap();

        assert_eq!(ev.operation, Operation::Update);
        assert_eq!(ev.table, TableIdentity::new("public", "orders"));
        assert_eq!(ev.old_value("status"), Some(&json!("pending")));
        assert_eq!(ev.new_value("status"), Some(&json!("cancelled")));
        assert_eq!(ev.actor.role(), Some("user"));
        assert_eq!(ev.actor.user_id(), Some("42"));
        assert_eq!(ev.source_id, "85558393-c75d-4d2f-9c15-e80591b83894");
        assert_eq!(ev.trigger_name.as_deref(), Some("orders_all"));
        assert_eq!(ev.created_at.year(), 2024);
    }

    #[test]
    fn parses_insert_and_delete() {
        let insert = parse_value(&payload("INSERT", Value::Null, json!({"id": 7}))).unwrap();
        assert!(insert.before.is_none());
        assert!(insert.after.is_some());

        let delete = parse_value(&payload("DELETE", json!({"id": 7}), Value::Null)).unwrap();
        assert!(delete.before.is_some());
        assert!(delete.after.is_none());
    }

    #[test]
    fn manual_accepts_any_images() {
        let ev = parse_value(&payload("MANUAL", Value::Null, json!({"id": 1}))).unwrap();
        assert_eq!(ev.operation, Operation::Manual);
    }

    #[test]
    fn rejects_inconsistent_images() {
        let err = parse_value(&payload("INSERT", json!({"id": 1}), json!({"id": 1}))).unwrap_err();
        assert!(matches!(err, PayloadParseError::InconsistentData { .. }));

        let err = parse_value(&payload("UPDATE", Value::Null, json!({"id": 1}))).unwrap_err();
        assert!(err.to_string().contains("UPDATE"));

        let err = parse_value(&payload("DELETE", Value::Null, Value::Null)).unwrap_err();
        assert!(matches!(err, PayloadParseError::InconsistentData { .. }));
    }

    #[test]
    fn rejects_missing_required_fields() {
        let mut body = payload("INSERT", Value::Null, json!({"id": 1}));
        body.as_object_mut().unwrap().remove("created_at");
        assert!(matches!(
            parse_value(&body).unwrap_err(),
            PayloadParseError::MissingField("created_at")
        ));

        let mut body = payload("INSERT", Value::Null, json!({"id": 1}));
        body["table"].as_object_mut().unwrap().remove("name");
        assert!(matches!(
            parse_value(&body).unwrap_err(),
            PayloadParseError::MissingField("table.name")
        ));

        let mut body = payload("INSERT", Value::Null, json!({"id": 1}));
        body["event"].as_object_mut().unwrap().remove("op");
        assert!(matches!(
            parse_value(&body).unwrap_err(),
            PayloadParseError::MissingField("event.op")
        ));
    }

    #[test]
    fn rejects_unknown_operation_and_non_object_rows() {
        let err = parse_value(&payload("TRUNCATE", Value::Null, json!({}))).unwrap_err();
        assert!(matches!(err, PayloadParseError::InvalidField { field: "event.op", .. }));

        let err = parse_value(&payload("INSERT", Value::Null, json!([1, 2]))).unwrap_err();
        assert!(matches!(err, PayloadParseError::InvalidField { field: "event.data.new", .. }));
    }

    #[test]
    fn rejects_invalid_json_and_non_objects() {
        assert!(matches!(
            parse_payload("not json").unwrap_err(),
            PayloadParseError::InvalidJson(_)
        ));
        assert!(matches!(
            parse_payload("[1,2,3]").unwrap_err(),
            PayloadParseError::NotAnObject
        ));
    }

    #[test]
    fn accepts_timestamp_without_offset() {
        let mut body = payload("INSERT", Value::Null, json!({"id": 1}));
        body["created_at"] = json!("2024-03-01T08:15:00.5");
        let ev = parse_value(&body).unwrap();
        assert_eq!(ev.created_at.hour(), 8);

        body["created_at"] = json!("yesterday");
        assert!(matches!(
            parse_value(&body).unwrap_err(),
            PayloadParseError::InvalidField { field: "created_at", .. }
        ));
    }

    #[test]
    fn non_string_session_variables_are_stringified() {
        let mut body = payload("INSERT", Value::Null, json!({"id": 1}));
        body["event"]["session_variables"] = json!({"x-hasura-user-id": 42, "x-skip": null});
        let ev = parse_value(&body).unwrap();
        assert_eq!(ev.actor.user_id(), Some("42"));
        assert_eq!(ev.actor.get("x-skip"), None);
    }
}
