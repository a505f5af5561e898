// party_sync/server/src/cache/snapshot.rs
use crate::core::error::{PartyError, PartyResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Semi-structured record used both as the stored form of an entity and as
/// the payload fetched after a notification. Field order is insertion order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    fields: Map<String, Value>,
}

impl Snapshot {
    pub fn new() -> Self {
        Snapshot { fields: Map::new() }
    }

    pub fn append(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn append_snapshot(self, key: &str, nested: Snapshot) -> Self {
        self.append(key, Value::Object(nested.fields))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get_str(&self, key: &str) -> PartyResult<&str> {
        match self.fields.get(key) {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(mistyped(key, "string", other)),
            None => Err(missing(key)),
        }
    }

    /// Like `get_str`, but absent and `null` both read as `None`.
    pub fn get_optional_str(&self, key: &str) -> PartyResult<Option<&str>> {
        match self.fields.get(key) {
            Some(Value::String(s)) => Ok(Some(s)),
            Some(Value::Null) | None => Ok(None),
            Some(other) => Err(mistyped(key, "string", other)),
        }
    }

    pub fn get_snapshot(&self, key: &str) -> PartyResult<Snapshot> {
        match self.fields.get(key) {
            Some(Value::Object(map)) => Ok(Snapshot { fields: map.clone() }),
            Some(other) => Err(mistyped(key, "document", other)),
            None => Err(missing(key)),
        }
    }

    pub fn get_str_list(&self, key: &str) -> PartyResult<Vec<String>> {
        match self.fields.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    other => Err(mistyped(key, "list of strings", other)),
                })
                .collect(),
            Some(other) => Err(mistyped(key, "list", other)),
            None => Err(missing(key)),
        }
    }

    pub fn to_json(&self) -> PartyResult<String> {
        Ok(serde_json::to_string(&self.fields)?)
    }

    pub fn parse(json: &str) -> PartyResult<Self> {
        match serde_json::from_str::<Value>(json)? {
            Value::Object(fields) => Ok(Snapshot { fields }),
            other => Err(PartyError::MalformedSnapshot(format!(
                "expected a document at top level, found {}",
                type_name(&other)
            ))),
        }
    }
}

fn missing(key: &str) -> PartyError {
    PartyError::MalformedSnapshot(format!("missing field '{}'", key))
}

fn mistyped(key: &str, expected: &str, found: &Value) -> PartyError {
    PartyError::MalformedSnapshot(format!(
        "field '{}' should be a {}, found {}",
        key,
        expected,
        type_name(found)
    ))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "document",
    }
}
