use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::entities::{TaskEnvelope, TaskRecord, TaskState};
use crate::stores::{NotificationHook, StatusStore};
use taskflow_errors::{SchedulerError, SchedulerResult};

/// 终态记录保留配置
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// 终态记录保留时长（秒），超过后被清理
    pub terminal_ttl_seconds: u64,
    /// 清理扫描间隔（秒）
    pub sweep_interval_seconds: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            terminal_ttl_seconds: 3600,
            sweep_interval_seconds: 60,
        }
    }
}

/// 状态转换附带的写入内容
#[derive(Debug, Clone, Default)]
pub struct TransitionDetail {
    pub attempt: Option<u32>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl TransitionDetail {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_attempt(attempt: u32) -> Self {
        Self {
            attempt: Some(attempt),
            ..Self::default()
        }
    }

    pub fn with_error<S: Into<String>>(error: S) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_result(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }
}

/// 状态追踪器：任务记录的唯一写入门。
///
/// 所有状态变更通过当前状态上的比较并交换完成，并发终结者对同一
/// 任务的竞争收敛到恰好一次终态写入；迟到的转换是静默的no-op。
pub struct StatusTracker {
    store: Arc<dyn StatusStore>,
    hook: Arc<dyn NotificationHook>,
    retention: RetentionConfig,
}

impl StatusTracker {
    pub fn new(
        store: Arc<dyn StatusStore>,
        hook: Arc<dyn NotificationHook>,
        retention: RetentionConfig,
    ) -> Self {
        Self {
            store,
            hook,
            retention,
        }
    }

    /// 为新提交的信封写入PENDING记录。id已存在时返回false且不覆盖，
    /// 这是Scheduler去重键跨重启幂等的基础。
    pub async fn create_pending(&self, envelope: TaskEnvelope) -> SchedulerResult<bool> {
        let record = TaskRecord::new(envelope);
        self.store.insert(&record).await
    }

    pub async fn get(&self, task_id: &str) -> SchedulerResult<TaskRecord> {
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| SchedulerError::task_not_found(task_id))
    }

    pub async fn try_get(&self, task_id: &str) -> SchedulerResult<Option<TaskRecord>> {
        self.store.get(task_id).await
    }

    /// 删除任务记录，供入队失败后的补偿回滚使用
    pub async fn remove(&self, task_id: &str) -> SchedulerResult<bool> {
        self.store.remove(task_id).await
    }

    /// 覆盖进度字段。任务不处于RUNNING时静默忽略。
    pub async fn update_progress(
        &self,
        task_id: &str,
        payload: serde_json::Value,
    ) -> SchedulerResult<()> {
        let updated = self.store.update_progress(task_id, payload).await?;
        if !updated {
            debug!("任务 {} 不在运行中，进度更新被忽略", task_id);
        }
        Ok(())
    }

    /// 状态转换写入门。返回Ok(true)表示本次调用赢得了写入；
    /// 非法或迟到的转换作为良性竞争记录日志后返回Ok(false)。
    pub async fn transition(
        &self,
        task_id: &str,
        new_state: TaskState,
        detail: TransitionDetail,
    ) -> SchedulerResult<bool> {
        let current = self.get(task_id).await?;

        if !current.state.can_transition_to(new_state) {
            // IllegalTransition按良性竞争吞掉：并发终结者中只有一个会赢
            debug!(
                "忽略非法状态转换: 任务 {} {} -> {}",
                task_id,
                current.state.as_str(),
                new_state.as_str()
            );
            return Ok(false);
        }

        let mut updated = current.clone();
        updated.state = new_state;
        updated.updated_at = Utc::now();
        if let Some(attempt) = detail.attempt {
            updated.attempt = attempt;
        }
        if detail.error.is_some() {
            updated.last_error = detail.error;
        }
        if detail.result.is_some() {
            updated.result = detail.result;
        }

        let won = self
            .store
            .compare_and_swap(task_id, current.state, &updated)
            .await?;

        if !won {
            debug!(
                "任务 {} 的状态转换竞争失败（目标 {}），按no-op处理",
                task_id,
                new_state.as_str()
            );
            return Ok(false);
        }

        debug!(
            "任务 {} 状态转换: {} -> {}",
            task_id,
            current.state.as_str(),
            new_state.as_str()
        );

        if new_state.is_terminal() {
            self.fire_notification(updated);
        }

        Ok(true)
    }

    /// 终态通知，fire-and-forget。钩子失败只记录日志。
    fn fire_notification(&self, record: TaskRecord) {
        let hook = Arc::clone(&self.hook);
        tokio::spawn(async move {
            if let Err(e) = hook.notify(&record).await {
                warn!(
                    "任务 {} 的终态通知钩子失败，已忽略: {}",
                    record.task_id(),
                    e
                );
            }
        });
    }

    /// 扫描所有非终态记录
    pub async fn list_active(&self) -> SchedulerResult<Vec<TaskRecord>> {
        let records = self.store.scan().await?;
        Ok(records.into_iter().filter(|r| !r.is_terminal()).collect())
    }

    /// 清理一轮超过保留期的终态记录，返回清理数量
    pub async fn sweep_once(&self) -> SchedulerResult<usize> {
        let now = Utc::now();
        let ttl = self.retention.terminal_ttl_seconds as i64;
        let records = self.store.scan().await?;
        let mut purged = 0;

        for record in records {
            if record.is_expired(ttl, now) && self.store.remove(record.task_id()).await? {
                purged += 1;
            }
        }

        if purged > 0 {
            info!("保留期清理完成，移除 {} 条终态记录", purged);
        }
        Ok(purged)
    }

    /// 启动后台保留期清理循环
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        let interval = Duration::from_secs(self.retention.sweep_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = tracker.sweep_once().await {
                            warn!("保留期清理失败: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("保留期清理循环收到停止信号");
                        break;
                    }
                }
            }
        })
    }
}

/// 空实现的通知钩子，用于测试或不需要旁路通知的部署
pub struct NullNotificationHook;

#[async_trait]
impl NotificationHook for NullNotificationHook {
    async fn notify(&self, _record: &TaskRecord) -> SchedulerResult<()> {
        Ok(())
    }
}
