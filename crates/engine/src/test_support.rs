//! Shared fixtures for unit tests.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use changeflow_core::{Actor, ChangeEvent, CorrelationId, Operation, TableIdentity};

use crate::definition::DetectionContext;

pub(crate) fn order_update(from: &str, to: &str) -> ChangeEvent {
    ChangeEvent {
        operation: Operation::Update,
        table: TableIdentity::new("public", "orders"),
        before: json!({"id": 42, "status": from}).as_object().cloned(),
        after: json!({"id": 42, "status": to}).as_object().cloned(),
        actor: Actor::default(),
        source_id: "evt-1".to_string(),
        created_at: Utc::now(),
        trigger_name: Some("orders_changed".to_string()),
    }
}

pub(crate) fn detection_context() -> DetectionContext {
    DetectionContext {
        correlation_id: CorrelationId::generate(),
        context: Arc::new(Value::Null),
    }
}
