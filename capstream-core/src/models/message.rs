use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::Record;
use crate::{Error, Result};

/// Schema version written by this build
pub const TOPIC_MESSAGE_VERSION: u16 = 1;

/// Partition key used for records that carry no identifier
pub const UNKNOWN_KEY: &str = "unknown";

/// Envelope published on the broker topic for every record read from the store
///
/// The schema is explicit and versioned: consumers reject versions they do
/// not know instead of guessing at the payload shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMessage {
    pub version: u16,
    pub key: String,
    pub record: Record,
    pub published_at: DateTime<Utc>,
}

impl TopicMessage {
    /// Wrap a record, keying it by its identifier
    #[must_use]
    pub fn new(record: Record) -> Self {
        Self {
            version: TOPIC_MESSAGE_VERSION,
            key: record.key().to_string(),
            record,
            published_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != TOPIC_MESSAGE_VERSION {
            return Err(Error::InvalidMessage(format!(
                "unsupported topic message version {} (expected {TOPIC_MESSAGE_VERSION})",
                self.version
            )));
        }
        if self.key.is_empty() {
            return Err(Error::InvalidMessage("empty partition key".to_string()));
        }
        if self.key != self.record.key() {
            return Err(Error::InvalidMessage(format!(
                "partition key '{}' does not match record key '{}'",
                self.key,
                self.record.key()
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let message: Self = serde_json::from_slice(payload)?;
        message.validate()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ada() -> Record {
        Record::from_value(json!({"id": "p1", "name": "Ada", "job": "Engineer"})).unwrap()
    }

    #[test]
    fn test_keyed_by_record_id() {
        let message = TopicMessage::new(ada());
        assert_eq!(message.key, "p1");
        assert_eq!(message.version, TOPIC_MESSAGE_VERSION);

        let decoded = TopicMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded.record, ada());
    }

    #[test]
    fn test_sentinel_key_without_id() {
        let record = Record::from_value(json!({"name": "Nobody"})).unwrap();
        assert_eq!(TopicMessage::new(record).key, UNKNOWN_KEY);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut message = TopicMessage::new(ada());
        message.version = 7;
        assert!(matches!(message.validate(), Err(Error::InvalidMessage(_))));

        let raw = serde_json::to_vec(&message).unwrap();
        assert!(TopicMessage::decode(&raw).is_err());
    }

    #[test]
    fn test_rejects_mismatched_key() {
        let mut message = TopicMessage::new(ada());
        message.key = "p2".to_string();
        assert!(message.encode().is_err());
    }

    #[test]
    fn test_rejects_untyped_payload() {
        let raw = br#"{"name": "Ada", "job": "Engineer"}"#;
        assert!(TopicMessage::decode(raw).is_err());
    }
}
