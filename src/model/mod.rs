pub mod job;
pub mod queue_entry;

pub use job::{Job, ProgressOutcome};
pub use queue_entry::{DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY, QueueEntry, STALE_TIMEOUT};
