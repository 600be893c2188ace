pub mod entities;
pub mod handlers;
pub mod messaging;
pub mod retry;
pub mod stores;
pub mod tracker;

pub use entities::*;
pub use handlers::{HandlerRegistry, ProgressEmitter, RetryingHandler, TaskContext, TaskHandler};
pub use messaging::QueueTransport;
pub use retry::{ErrorClass, RetryPolicy, TaskError};
pub use stores::{NotificationHook, StatusStore, WorkerRegistry};
pub use taskflow_errors::{SchedulerError, SchedulerResult};
pub use tracker::{NullNotificationHook, RetentionConfig, StatusTracker, TransitionDetail};
