use serde::{Deserialize, Serialize};

use super::id::RecordId;
use super::record::Record;
use crate::Result;

/// The payload the reference deployment streams through the `persons` store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    pub name: String,
    pub job: String,
}

impl Person {
    #[must_use]
    pub fn new(name: impl Into<String>, job: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            job: job.into(),
        }
    }

    pub fn into_record(self) -> Result<Record> {
        Record::from_value(serde_json::to_value(self)?)
    }

    pub fn from_record(record: &Record) -> Result<Self> {
        Ok(serde_json::from_value(serde_json::to_value(record)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_person_record_conversion() {
        let mut person = Person::new("Ada", "Engineer");
        person.id = Some(RecordId::from("p1"));

        let record = person.clone().into_record().unwrap();
        assert_eq!(record.key(), "p1");
        assert_eq!(record.field("job").and_then(|v| v.as_str()), Some("Engineer"));

        assert_eq!(Person::from_record(&record).unwrap(), person);
    }

    #[test]
    fn test_person_without_id() {
        let record = Person::new("John Doe", "Software Engineer").into_record().unwrap();
        assert!(record.id.is_none());
        assert_eq!(record.fields.len(), 2);
    }
}
