//! Task lifecycle on the control plane: the job queue, its token-gated
//! facade, the dispatcher and status reporting.

mod authorized;
mod dispatch;
pub mod queue;
pub mod status;

pub use authorized::AuthorizedQueue;
pub use dispatch::{Batch, BatchOutcome, DispatchError, Dispatcher, DispatcherContext, MonitorOutcome};
pub use queue::{
    ClaimedTask, DeadLetter, DeliveryReceipt, InMemoryQueue, JobQueue, NackOutcome, QueueError,
    QueueStats,
};
pub use status::{
    LogStatusSink, MemoryStatusSink, StatusError, StatusIntake, StatusSink, WebhookStatusSink,
};
