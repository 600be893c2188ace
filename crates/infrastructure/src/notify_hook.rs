use async_trait::async_trait;
use tracing::{info, warn};

use taskflow_domain::{NotificationHook, TaskRecord, TaskState};
use taskflow_errors::SchedulerResult;

/// 默认的终态通知钩子：结构化日志输出。
/// 生产部署可以替换为webhook、站内信等实现。
pub struct LoggingNotificationHook;

#[async_trait]
impl NotificationHook for LoggingNotificationHook {
    async fn notify(&self, record: &TaskRecord) -> SchedulerResult<()> {
        match record.state {
            TaskState::Succeeded => info!(
                task_id = record.task_id(),
                task_type = %record.envelope.task_type,
                attempt = record.attempt,
                "任务执行成功"
            ),
            TaskState::Failed => warn!(
                task_id = record.task_id(),
                task_type = %record.envelope.task_type,
                attempt = record.attempt,
                last_error = record.last_error.as_deref().unwrap_or(""),
                "任务最终失败"
            ),
            TaskState::Revoked => info!(
                task_id = record.task_id(),
                task_type = %record.envelope.task_type,
                "任务已被撤销"
            ),
            _ => {}
        }
        Ok(())
    }
}
