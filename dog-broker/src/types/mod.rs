pub mod ids;
pub mod record;
pub mod completion;
pub mod capabilities;
pub mod events;

pub use ids::JobRef;
pub use record::{JobRecord, JobStatus, JobFilter, JobTransition, PLACEHOLDER_NAMESPACE};
pub use completion::{CompletionRecord, CompletionFilter, Completion, PLACEHOLDER_REF};
pub use capabilities::LogCapabilities;
pub use events::BrokerEvent;
