//! 存储端口抽象
//!
//! 定义状态追踪与Worker注册的数据访问接口，遵循依赖倒置原则。
//! 业务数据库可以作为底层实现，但只以不透明的键值方式访问。

use async_trait::async_trait;

use crate::entities::{TaskRecord, TaskState, WorkerDescriptor};
use taskflow_errors::SchedulerResult;

/// 任务记录存储抽象
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// 写入新记录，键已存在时返回 false 且不覆盖
    async fn insert(&self, record: &TaskRecord) -> SchedulerResult<bool>;

    async fn get(&self, task_id: &str) -> SchedulerResult<Option<TaskRecord>>;

    /// 比较并交换：仅当当前状态等于 expected 时写入整条记录。
    /// 这是并发终结者收敛到唯一终态写入的仲裁点。
    async fn compare_and_swap(
        &self,
        task_id: &str,
        expected: TaskState,
        record: &TaskRecord,
    ) -> SchedulerResult<bool>;

    /// 仅在记录处于 RUNNING 状态时覆盖进度字段，不触碰状态机
    async fn update_progress(
        &self,
        task_id: &str,
        payload: serde_json::Value,
    ) -> SchedulerResult<bool>;

    async fn scan(&self) -> SchedulerResult<Vec<TaskRecord>>;

    async fn remove(&self, task_id: &str) -> SchedulerResult<bool>;
}

/// Worker注册表抽象，由心跳维护
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn register(&self, descriptor: &WorkerDescriptor) -> SchedulerResult<()>;

    /// 心跳即整条描述符的upsert
    async fn heartbeat(&self, descriptor: &WorkerDescriptor) -> SchedulerResult<()>;

    async fn unregister(&self, worker_id: &str) -> SchedulerResult<bool>;

    async fn list(&self) -> SchedulerResult<Vec<WorkerDescriptor>>;
}

/// 终态转换的旁路通知钩子。尽力而为：失败只记录日志，
/// 绝不阻塞或回滚任务已落盘的终态。
#[async_trait]
pub trait NotificationHook: Send + Sync {
    async fn notify(&self, record: &TaskRecord) -> SchedulerResult<()>;
}
