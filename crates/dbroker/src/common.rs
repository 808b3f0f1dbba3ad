//! 📦 The common tongue: what a record is, and which backend it came from.
//!
//! 🎯 A [`Record`] is one row, one document, one event. Four backends, four shapes,
//! zero schema. It is an open string-keyed map of JSON values, and the only promise
//! it makes is that it remembers the order fields were inserted in (so an ODBC row
//! reads in column-declaration order). Adapters validate only the fields they need.
//!
//! 🦆 The duck is schema-less too. It just is.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BrokerError;

/// 🏷️ Which of the four supported stores a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Mongo,
    Elasticsearch,
    Splunk,
    Odbc,
}

impl BackendKind {
    /// 📋 The whole menu, in the order the broker learned them.
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Mongo,
        BackendKind::Elasticsearch,
        BackendKind::Splunk,
        BackendKind::Odbc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Mongo => "mongo",
            BackendKind::Elasticsearch => "elasticsearch",
            BackendKind::Splunk => "splunk",
            BackendKind::Odbc => "odbc",
        }
    }

    /// ✍️ Splunk is read/search-only here. Everyone else takes writes.
    pub fn supports_bulk_insert(&self) -> bool {
        !matches!(self, BackendKind::Splunk)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BrokerError;

    /// 🚪 The bouncer. Case-insensitive, whitespace-forgiving, otherwise strict.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| BrokerError::UnsupportedBackend(s.to_string()))
    }
}

/// 🎯 One row / document / event, stripped down to field names and JSON values.
///
/// Derefs to the inner `serde_json::Map`, so `record.get("name")` and friends just work.
/// Serializes transparently: a Record on the wire is just a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// 🔧 Builder-style insert, for tests and fixtures that like one-liners.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// 📋 Field names in insertion order.
    pub fn field_names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }
}

impl Deref for Record {
    type Target = Map<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Record {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Record {
    type Error = BrokerError;

    /// 🧩 Only JSON objects can become records. Arrays and scalars get turned away at the door.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(BrokerError::InvalidParameter {
                parameter: "record",
                reason: format!("expected a JSON object, got {}", json_kind(&other)),
            }),
        }
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// 📊 What a bulk insert did, backend-agnostic.
///
/// `submitted` is how many records the caller handed over, `written` is how many the
/// backend confirmed. The gap between them is explained (hopefully) by `failures`, or
/// by an ordered write that stopped early and never sent the rest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteSummary {
    pub backend: BackendKind,
    pub submitted: usize,
    pub written: usize,
    pub failures: Vec<WriteFailure>,
}

/// 💀 One record the backend refused, and its reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteFailure {
    /// 📍 Position of the record in the caller's input, when the backend tells us.
    pub position: Option<usize>,
    /// 🏷️ Document identity, when there was one.
    pub id: Option<String>,
    pub reason: String,
}

impl WriteSummary {
    /// 🫙 Nothing in, nothing out, no native call made.
    pub fn empty(backend: BackendKind) -> Self {
        Self {
            backend,
            submitted: 0,
            written: 0,
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.written == self.submitted
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
