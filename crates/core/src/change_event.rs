use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A database row as delivered by the webhook host: column name → JSON value.
pub type Record = serde_json::Map<String, Value>;

/// Kind of mutation that produced a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    /// Triggered by hand from the host console rather than by a row mutation.
    Manual,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(Operation::Insert),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            "MANUAL" => Ok(Operation::Manual),
            other => Err(format!("unknown operation '{other}'")),
        }
    }
}

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableIdentity {
    pub schema: String,
    pub name: String,
}

impl TableIdentity {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Session attributes of whoever caused the mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Raw session variables, keys lower-cased.
    pub session_variables: BTreeMap<String, String>,
}

impl Actor {
    pub const ROLE_KEY: &'static str = "x-hasura-role";
    pub const USER_ID_KEY: &'static str = "x-hasura-user-id";

    pub fn new(session_variables: BTreeMap<String, String>) -> Self {
        let session_variables = session_variables
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self { session_variables }
    }

    pub fn role(&self) -> Option<&str> {
        self.get(Self::ROLE_KEY)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.get(Self::USER_ID_KEY)
    }

    /// Case-insensitive lookup of a session variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.session_variables
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Normalized representation of one database mutation.
///
/// Built once by the payload parser and never mutated afterwards; the engine
/// shares it behind an `Arc` with every detector, handler and job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation: Operation,
    pub table: TableIdentity,
    pub before: Option<Record>,
    pub after: Option<Record>,
    pub actor: Actor,
    /// Opaque delivery id assigned by the upstream trigger.
    pub source_id: String,
    pub created_at: DateTime<Utc>,
    pub trigger_name: Option<String>,
}

impl ChangeEvent {
    /// Whether this change happened on `schema.name`.
    pub fn is_table(&self, schema: &str, name: &str) -> bool {
        self.table.schema == schema && self.table.name == name
    }

    /// Value of `column` before the mutation.
    pub fn old_value(&self, column: &str) -> Option<&Value> {
        self.before.as_ref().and_then(|r| r.get(column))
    }

    /// Value of `column` after the mutation.
    pub fn new_value(&self, column: &str) -> Option<&Value> {
        self.after.as_ref().and_then(|r| r.get(column))
    }

    /// The row as it exists now: `after` when present, otherwise `before`.
    pub fn current_record(&self) -> Option<&Record> {
        self.after.as_ref().or(self.before.as_ref())
    }

    /// True only for updates where the column's value differs between the two images.
    pub fn column_changed(&self, column: &str) -> bool {
        if self.operation != Operation::Update {
            return false;
        }
        self.old_value(column) != self.new_value(column)
    }

    /// Columns whose value differs between `before` and `after`, sorted by name.
    ///
    /// For inserts every column of `after` counts as changed, for deletes every
    /// column of `before`.
    pub fn changed_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = match (&self.before, &self.after) {
            (Some(old), Some(new)) => {
                let mut keys: Vec<&String> = old.keys().chain(new.keys()).collect();
                keys.sort();
                keys.dedup();
                keys.into_iter()
                    .filter(|k| old.get(*k) != new.get(*k))
                    .cloned()
                    .collect()
            }
            (None, Some(row)) | (Some(row), None) => row.keys().cloned().collect(),
            (None, None) => Vec::new(),
        };
        columns.sort();
        columns
    }
}
