pub mod cancel_bus;
pub mod in_memory_queue;
pub mod memory_store;
pub mod notify_hook;

pub use cancel_bus::{CancelBus, CancelSignal};
pub use in_memory_queue::{InMemoryQueueConfig, InMemoryQueueTransport};
pub use memory_store::{InMemoryStatusStore, InMemoryWorkerRegistry};
pub use notify_hook::LoggingNotificationHook;
