pub mod bounded;
pub mod hub;
pub mod pipeline;
pub mod publisher;
pub mod reader;
pub mod router;
pub mod sink;

pub use bounded::BoundedStoreManager;
pub use hub::{ConnectionId, SubscriberRegistry};
pub use pipeline::{Pipeline, PipelineHandle, PipelineSettings};
pub use publisher::{PublisherHandle, TopicPublisher};
pub use reader::{ChangeCursorReader, ReaderState, ReaderStatus};
pub use router::BroadcastRouter;
pub use sink::{BroadcastReport, BroadcastSink};
