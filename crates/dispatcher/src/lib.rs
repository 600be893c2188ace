//! 调度侧组件：任务分发、周期调度与运维控制面。
//!
//! - [`Dispatcher`] 校验并提交任务，PENDING记录先于入队落盘
//! - [`Scheduler`] 按tick扫描调度表，触发时刻编码进任务id实现跨重启去重
//! - [`TaskController`] 撤销、查询与集群负载快照

pub mod controller;
pub mod cron_utils;
pub mod dispatcher;
pub mod scheduler;

pub use controller::{CancelOutcome, TaskController, WorkerStats};
pub use cron_utils::CronScheduler;
pub use dispatcher::{Dispatcher, QueueRouter};
pub use scheduler::{ScheduleRegistry, Scheduler};
