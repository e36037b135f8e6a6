use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::id::RecordId;
use super::message::UNKNOWN_KEY;
use crate::{Error, Result};

/// A document appended to a bounded store.
///
/// The identifier is assigned by the store on insert and never changes
/// afterwards; every other field is domain payload carried as-is. On the
/// wire the record is flat: `{"id": "p1", "name": "Ada", "job": "Engineer"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    #[must_use]
    pub fn with_id(mut self, id: impl Into<RecordId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Build a record from a JSON object
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::InvalidMessage(format!(
                "record must be a JSON object, got {value}"
            )));
        }
        Ok(serde_json::from_value(value)?)
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Partition key: the record id, or the sentinel when it has none
    #[must_use]
    pub fn key(&self) -> &str {
        self.id.as_ref().map_or(UNKNOWN_KEY, RecordId::as_str)
    }

    /// Size of the JSON encoding, which is what counts against a store's
    /// byte capacity.
    pub fn size_bytes(&self) -> Result<usize> {
        Ok(serde_json::to_vec(self)?.len())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
