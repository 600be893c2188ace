//! 分布式任务调度与弹性执行核心。
//!
//! 以库的形式嵌入宿主进程：注册处理器、构建 [`Engine`]、
//! 提交任务或登记周期调度，引擎负责投递、执行、重试、
//! 超时与撤销的完整生命周期，语义为至少一次交付。
//!
//! ```no_run
//! use std::sync::Arc;
//! use taskflow::{AppConfig, Engine, TaskEnvelope};
//!
//! # async fn demo(handler: Arc<dyn taskflow::TaskHandler>) -> anyhow::Result<()> {
//! let engine = Engine::builder(AppConfig::default())
//!     .register_handler(handler)
//!     .build()
//!     .await?;
//! engine.start().await?;
//!
//! let task_id = engine.submit(TaskEnvelope::new("report.generate", "default")).await?;
//! let record = engine.task(&task_id).await?;
//! println!("{:?}", record.state);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod logging;

pub use config::{AppConfig, QueueConfig, RetryConfig, SchedulerConfig, WorkerConfig};
pub use engine::{Engine, EngineBuilder};
pub use logging::{init_logging, LogFormat};

pub use taskflow_dispatcher::{CancelOutcome, WorkerStats};
pub use taskflow_domain::{
    ErrorClass, NotificationHook, QueueDescriptor, RetryPolicy, ScheduleEntry, TaskContext,
    TaskEnvelope, TaskError, TaskHandler, TaskRecord, TaskState, Trigger,
};
pub use taskflow_errors::{SchedulerError, SchedulerResult};
