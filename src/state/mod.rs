pub mod job;
pub mod queue;
pub mod resource;

pub use job::{Job, JobState, ResourceRequest};
pub use queue::{Queue, QueueFlags};
pub use resource::Resource;
