pub mod id;
pub mod message;
pub mod person;
pub mod record;

pub use id::{generate_id, RecordId};
pub use message::{TopicMessage, TOPIC_MESSAGE_VERSION, UNKNOWN_KEY};
pub use person::Person;
pub use record::Record;
