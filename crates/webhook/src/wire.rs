//! Wire shape of the event trigger webhook body.
//!
//! Every field is optional here so that the parser can report exactly which
//! required field is missing instead of a generic deserialization error.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: Option<WireEvent>,
    pub table: Option<WireTable>,
    pub id: Option<String>,
    pub created_at: Option<String>,
    pub trigger: Option<WireTrigger>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireEvent {
    pub op: Option<String>,
    pub data: Option<WireData>,
    #[serde(default)]
    pub session_variables: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireData {
    #[serde(default)]
    pub old: Option<Value>,
    #[serde(default)]
    pub new: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireTable {
    pub schema: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireTrigger {
    pub name: Option<String>,
}
