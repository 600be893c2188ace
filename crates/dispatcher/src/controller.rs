use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use taskflow_domain::{
    QueueTransport, StatusTracker, TaskRecord, TaskState, TransitionDetail, WorkerDescriptor,
    WorkerRegistry,
};
use taskflow_errors::SchedulerResult;
use taskflow_infrastructure::CancelBus;

/// 撤销请求的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CancelOutcome {
    /// 任务尚未开跑，已直接置为REVOKED
    Revoked,
    /// 任务正在执行，已发出协作式停止信号，等待执行方响应
    SignalSent,
    /// 任务已处于终态，撤销无效果
    AlreadyFinished,
}

/// 工作节点集群快照
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub total_workers: usize,
    pub alive_workers: usize,
    pub stale_workers: usize,
    pub total_active_tasks: usize,
    pub total_capacity: usize,
    pub workers: Vec<WorkerDescriptor>,
}

/// 运维控制面：撤销任务、查询在途任务与集群负载。
pub struct TaskController {
    tracker: Arc<StatusTracker>,
    workers: Arc<dyn WorkerRegistry>,
    transport: Arc<dyn QueueTransport>,
    cancel_bus: Arc<CancelBus>,
    heartbeat_timeout_seconds: i64,
}

impl TaskController {
    pub fn new(
        tracker: Arc<StatusTracker>,
        workers: Arc<dyn WorkerRegistry>,
        transport: Arc<dyn QueueTransport>,
        cancel_bus: Arc<CancelBus>,
        heartbeat_timeout_seconds: i64,
    ) -> Self {
        Self {
            tracker,
            workers,
            transport,
            cancel_bus,
            heartbeat_timeout_seconds,
        }
    }

    /// 撤销任务。
    ///
    /// PENDING/RETRYING 直接走状态机置REVOKED，队列里的副本由
    /// 执行方在认领时复核状态后丢弃。RUNNING 只能发协作信号，
    /// 不强杀。与执行方终态写入的竞争由CAS裁决，先写者赢。
    pub async fn cancel(&self, task_id: &str) -> SchedulerResult<CancelOutcome> {
        let record = self.tracker.get(task_id).await?;

        match record.state {
            TaskState::Pending | TaskState::Retrying => {
                let won = self
                    .tracker
                    .transition(task_id, TaskState::Revoked, TransitionDetail::none())
                    .await?;
                if won {
                    info!("任务已撤销: {}", task_id);
                    Ok(CancelOutcome::Revoked)
                } else {
                    // 撤销落盘前任务被认领或已终结，降级为发信号
                    warn!("任务 {} 撤销竞争失败，改发停止信号", task_id);
                    self.cancel_bus.cancel(task_id).await;
                    Ok(CancelOutcome::SignalSent)
                }
            }
            TaskState::Running => {
                let delivered = self.cancel_bus.cancel(task_id).await;
                if delivered {
                    info!("已向运行中任务 {} 发出停止信号", task_id);
                } else {
                    // 任务登记在RUNNING但本进程没有对应执行槽，
                    // 多半是其他节点在跑或节点已失联
                    warn!("任务 {} 在本进程无执行槽，停止信号未送达", task_id);
                }
                Ok(CancelOutcome::SignalSent)
            }
            TaskState::Succeeded | TaskState::Failed | TaskState::Revoked => {
                Ok(CancelOutcome::AlreadyFinished)
            }
        }
    }

    pub async fn get_task(&self, task_id: &str) -> SchedulerResult<TaskRecord> {
        self.tracker.get(task_id).await
    }

    /// 所有非终态任务的快照
    pub async fn list_active(&self) -> SchedulerResult<Vec<TaskRecord>> {
        self.tracker.list_active().await
    }

    pub async fn queue_size(&self, queue: &str) -> SchedulerResult<u32> {
        self.transport.queue_size(queue).await
    }

    /// 清空队列积压。已认领在途的消息不受影响。
    pub async fn purge_queue(&self, queue: &str) -> SchedulerResult<()> {
        warn!("清空队列: {}", queue);
        self.transport.purge(queue).await
    }

    pub async fn worker_stats(&self) -> SchedulerResult<WorkerStats> {
        let workers = self.workers.list().await?;
        let now = Utc::now();
        let stale = workers
            .iter()
            .filter(|w| w.is_stale(self.heartbeat_timeout_seconds, now))
            .count();
        Ok(WorkerStats {
            total_workers: workers.len(),
            alive_workers: workers.len() - stale,
            stale_workers: stale,
            total_active_tasks: workers.iter().map(|w| w.active_task_ids.len()).sum(),
            total_capacity: workers.iter().map(|w| w.max_concurrent_tasks).sum(),
            workers,
        })
    }

    /// 剔除心跳超时的节点登记。其在途任务靠可见性超时重投，
    /// 这里只清理注册表。
    pub async fn evict_stale_workers(&self) -> SchedulerResult<usize> {
        let now = Utc::now();
        let mut evicted = 0;
        for worker in self.workers.list().await? {
            if worker.is_stale(self.heartbeat_timeout_seconds, now)
                && self.workers.unregister(&worker.worker_id).await?
            {
                warn!(
                    "剔除失联节点: {} (最后心跳 {})",
                    worker.worker_id, worker.last_heartbeat
                );
                evicted += 1;
            }
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskflow_domain::{NullNotificationHook, RetentionConfig, TaskEnvelope};
    use taskflow_errors::SchedulerError;
    use taskflow_infrastructure::{
        InMemoryQueueTransport, InMemoryStatusStore, InMemoryWorkerRegistry,
    };

    async fn make_controller() -> (TaskController, Arc<StatusTracker>, Arc<CancelBus>) {
        let tracker = Arc::new(StatusTracker::new(
            Arc::new(InMemoryStatusStore::new()),
            Arc::new(NullNotificationHook),
            RetentionConfig::default(),
        ));
        let cancel_bus = Arc::new(CancelBus::new());
        let controller = TaskController::new(
            Arc::clone(&tracker),
            Arc::new(InMemoryWorkerRegistry::new()),
            Arc::new(InMemoryQueueTransport::new()),
            Arc::clone(&cancel_bus),
            30,
        );
        (controller, tracker, cancel_bus)
    }

    async fn seed_task(tracker: &StatusTracker, id: &str) {
        let mut envelope = TaskEnvelope::new("noop", "default");
        envelope.id = id.to_string();
        tracker.create_pending(envelope).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_pending_revokes() {
        let (controller, tracker, _) = make_controller().await;
        seed_task(&tracker, "t1").await;

        let outcome = controller.cancel("t1").await.unwrap();
        assert_eq!(outcome, CancelOutcome::Revoked);
        assert_eq!(tracker.get("t1").await.unwrap().state, TaskState::Revoked);
    }

    #[tokio::test]
    async fn test_cancel_running_signals_executor() {
        let (controller, tracker, cancel_bus) = make_controller().await;
        seed_task(&tracker, "t1").await;
        tracker
            .transition("t1", TaskState::Running, TransitionDetail::none())
            .await
            .unwrap();
        let signal = cancel_bus.register("t1").await;

        let outcome = controller.cancel("t1").await.unwrap();
        assert_eq!(outcome, CancelOutcome::SignalSent);
        assert!(signal.is_cancelled());
        // 状态仍是RUNNING，终态由执行方写
        assert_eq!(tracker.get("t1").await.unwrap().state, TaskState::Running);
    }

    #[tokio::test]
    async fn test_cancel_terminal_is_noop() {
        let (controller, tracker, _) = make_controller().await;
        seed_task(&tracker, "t1").await;
        tracker
            .transition("t1", TaskState::Running, TransitionDetail::none())
            .await
            .unwrap();
        tracker
            .transition("t1", TaskState::Succeeded, TransitionDetail::none())
            .await
            .unwrap();

        let outcome = controller.cancel("t1").await.unwrap();
        assert_eq!(outcome, CancelOutcome::AlreadyFinished);
        assert_eq!(tracker.get("t1").await.unwrap().state, TaskState::Succeeded);
    }

    #[tokio::test]
    async fn test_cancel_unknown_task_errors() {
        let (controller, _, _) = make_controller().await;
        assert!(matches!(
            controller.cancel("missing").await,
            Err(SchedulerError::TaskNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_worker_stats_counts_stale() {
        let (controller, _, _) = make_controller().await;
        let alive = WorkerDescriptor {
            worker_id: "w1".to_string(),
            active_task_ids: vec!["a".to_string()],
            registered_types: vec!["noop".to_string()],
            max_concurrent_tasks: 4,
            last_heartbeat: Utc::now(),
        };
        let stale = WorkerDescriptor {
            worker_id: "w2".to_string(),
            active_task_ids: vec![],
            registered_types: vec!["noop".to_string()],
            max_concurrent_tasks: 4,
            last_heartbeat: Utc::now() - chrono::Duration::seconds(120),
        };
        controller.workers.register(&alive).await.unwrap();
        controller.workers.register(&stale).await.unwrap();

        let stats = controller.worker_stats().await.unwrap();
        assert_eq!(stats.total_workers, 2);
        assert_eq!(stats.alive_workers, 1);
        assert_eq!(stats.stale_workers, 1);
        assert_eq!(stats.total_active_tasks, 1);
        assert_eq!(stats.total_capacity, 8);

        let evicted = controller.evict_stale_workers().await.unwrap();
        assert_eq!(evicted, 1);
        assert_eq!(controller.worker_stats().await.unwrap().total_workers, 1);
    }
}
