// Embedded job queue: leased, at-least-once dispatch over the jobs table

pub mod executor;
pub mod job;
pub mod message;
pub mod notify;
pub mod polling;
pub mod queue;
pub mod retry;

pub use executor::{executor_fn, Executor, FnExecutor};
pub use job::JobRow;
pub use message::{
    parse_queue_name, MessageData, ParsedQueueName, QueueKind, STEP_QUEUE_PREFIX,
    WORKFLOW_QUEUE_PREFIX,
};
pub use notify::NotifyQueue;
pub use polling::PollingQueue;
pub use queue::{EnqueueOptions, EnqueueReceipt, JobQueue, QueueConfig};
pub use retry::RetryPolicy;
