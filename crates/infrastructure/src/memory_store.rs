use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use taskflow_domain::{
    StatusStore, TaskRecord, TaskState, WorkerDescriptor, WorkerRegistry,
};
use taskflow_errors::SchedulerResult;

/// 内存任务记录存储。所有写入持有写锁，CAS在锁内完成状态比较与替换，
/// 对并发终结者提供与外部键值存储等价的原子性。
#[derive(Default)]
pub struct InMemoryStatusStore {
    records: RwLock<HashMap<String, TaskRecord>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn insert(&self, record: &TaskRecord) -> SchedulerResult<bool> {
        let mut records = self.records.write().await;
        if records.contains_key(record.task_id()) {
            debug!("任务记录 {} 已存在，insert被忽略", record.task_id());
            return Ok(false);
        }
        records.insert(record.task_id().to_string(), record.clone());
        Ok(true)
    }

    async fn get(&self, task_id: &str) -> SchedulerResult<Option<TaskRecord>> {
        let records = self.records.read().await;
        Ok(records.get(task_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        task_id: &str,
        expected: TaskState,
        record: &TaskRecord,
    ) -> SchedulerResult<bool> {
        let mut records = self.records.write().await;
        match records.get(task_id) {
            Some(current) if current.state == expected => {
                records.insert(task_id.to_string(), record.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_progress(
        &self,
        task_id: &str,
        payload: serde_json::Value,
    ) -> SchedulerResult<bool> {
        let mut records = self.records.write().await;
        match records.get_mut(task_id) {
            Some(record) if record.state == TaskState::Running => {
                record.progress = Some(payload);
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scan(&self) -> SchedulerResult<Vec<TaskRecord>> {
        let records = self.records.read().await;
        Ok(records.values().cloned().collect())
    }

    async fn remove(&self, task_id: &str) -> SchedulerResult<bool> {
        let mut records = self.records.write().await;
        Ok(records.remove(task_id).is_some())
    }
}

/// 内存Worker注册表，心跳即整条描述符的覆盖写
#[derive(Default)]
pub struct InMemoryWorkerRegistry {
    workers: RwLock<HashMap<String, WorkerDescriptor>>,
}

impl InMemoryWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryWorkerRegistry {
    async fn register(&self, descriptor: &WorkerDescriptor) -> SchedulerResult<()> {
        let mut workers = self.workers.write().await;
        workers.insert(descriptor.worker_id.clone(), descriptor.clone());
        Ok(())
    }

    async fn heartbeat(&self, descriptor: &WorkerDescriptor) -> SchedulerResult<()> {
        let mut workers = self.workers.write().await;
        workers.insert(descriptor.worker_id.clone(), descriptor.clone());
        Ok(())
    }

    async fn unregister(&self, worker_id: &str) -> SchedulerResult<bool> {
        let mut workers = self.workers.write().await;
        Ok(workers.remove(worker_id).is_some())
    }

    async fn list(&self) -> SchedulerResult<Vec<WorkerDescriptor>> {
        let workers = self.workers.read().await;
        Ok(workers.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use taskflow_domain::{
        NullNotificationHook, RetentionConfig, StatusTracker, TaskEnvelope, TransitionDetail,
    };

    fn make_record(id: &str) -> TaskRecord {
        let mut envelope = TaskEnvelope::new("noop", "default");
        envelope.id = id.to_string();
        TaskRecord::new(envelope)
    }

    fn make_tracker(store: Arc<InMemoryStatusStore>) -> Arc<StatusTracker> {
        Arc::new(StatusTracker::new(
            store,
            Arc::new(NullNotificationHook),
            RetentionConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_insert_is_create_if_absent() {
        let store = InMemoryStatusStore::new();
        let record = make_record("t1");
        assert!(store.insert(&record).await.unwrap());
        assert!(!store.insert(&record).await.unwrap());
        assert!(store.get("t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cas_state_mismatch_fails() {
        let store = InMemoryStatusStore::new();
        let record = make_record("t1");
        store.insert(&record).await.unwrap();

        let mut updated = record.clone();
        updated.state = TaskState::Running;
        // 期待状态不符
        assert!(!store
            .compare_and_swap("t1", TaskState::Running, &updated)
            .await
            .unwrap());
        // 期待状态相符
        assert!(store
            .compare_and_swap("t1", TaskState::Pending, &updated)
            .await
            .unwrap());
        assert_eq!(
            store.get("t1").await.unwrap().unwrap().state,
            TaskState::Running
        );
    }

    #[tokio::test]
    async fn test_update_progress_only_when_running() {
        let store = InMemoryStatusStore::new();
        let record = make_record("t1");
        store.insert(&record).await.unwrap();

        assert!(!store
            .update_progress("t1", serde_json::json!({"pct": 10}))
            .await
            .unwrap());

        let mut running = record.clone();
        running.state = TaskState::Running;
        store
            .compare_and_swap("t1", TaskState::Pending, &running)
            .await
            .unwrap();

        assert!(store
            .update_progress("t1", serde_json::json!({"pct": 50}))
            .await
            .unwrap());
        let stored = store.get("t1").await.unwrap().unwrap();
        assert_eq!(stored.progress, Some(serde_json::json!({"pct": 50})));
    }

    #[tokio::test]
    async fn test_tracker_submit_then_get_is_pending() {
        let store = Arc::new(InMemoryStatusStore::new());
        let tracker = make_tracker(store);

        let mut envelope = TaskEnvelope::new("noop", "default");
        envelope.id = "t1".to_string();
        assert!(tracker.create_pending(envelope).await.unwrap());

        let record = tracker.get("t1").await.unwrap();
        assert_eq!(record.state, TaskState::Pending);
        assert_eq!(record.attempt, 0);
    }

    #[tokio::test]
    async fn test_tracker_terminal_is_immutable() {
        let store = Arc::new(InMemoryStatusStore::new());
        let tracker = make_tracker(store);
        let mut envelope = TaskEnvelope::new("noop", "default");
        envelope.id = "t1".to_string();
        tracker.create_pending(envelope).await.unwrap();

        assert!(tracker
            .transition("t1", TaskState::Running, TransitionDetail::none())
            .await
            .unwrap());
        assert!(tracker
            .transition(
                "t1",
                TaskState::Succeeded,
                TransitionDetail::with_result(serde_json::json!({})),
            )
            .await
            .unwrap());

        // 终态之后的任何转换都是静默no-op
        for state in [TaskState::Running, TaskState::Failed, TaskState::Revoked] {
            assert!(!tracker
                .transition("t1", state, TransitionDetail::none())
                .await
                .unwrap());
        }
        assert_eq!(
            tracker.get("t1").await.unwrap().state,
            TaskState::Succeeded
        );
    }

    #[tokio::test]
    async fn test_concurrent_finalizers_converge_to_one_winner() {
        let store = Arc::new(InMemoryStatusStore::new());
        let tracker = make_tracker(store);
        let mut envelope = TaskEnvelope::new("noop", "default");
        envelope.id = "t1".to_string();
        tracker.create_pending(envelope).await.unwrap();
        tracker
            .transition("t1", TaskState::Running, TransitionDetail::none())
            .await
            .unwrap();

        // 重试路径与取消路径在同一任务上竞争，恰好一个赢得写入
        let a = tracker.transition(
            "t1",
            TaskState::Succeeded,
            TransitionDetail::with_result(serde_json::json!(null)),
        );
        let b = tracker.transition(
            "t1",
            TaskState::Revoked,
            TransitionDetail::with_error("cancelled"),
        );
        let (ra, rb) = tokio::join!(a, b);
        let winners = [ra.unwrap(), rb.unwrap()];
        assert_eq!(winners.iter().filter(|w| **w).count(), 1);

        let state = tracker.get("t1").await.unwrap().state;
        assert!(state.is_terminal());
    }

    #[tokio::test]
    async fn test_cancel_vs_claim_race_single_outcome() {
        let store = Arc::new(InMemoryStatusStore::new());
        let tracker = make_tracker(store);
        let mut envelope = TaskEnvelope::new("noop", "default");
        envelope.id = "t1".to_string();
        tracker.create_pending(envelope).await.unwrap();

        // PENDING任务上认领与取消并发。RUNNING→REVOKED本身合法，
        // 所以两个写入可能都成功，收敛性体现在最终恰好一个一致状态：
        // 撤销一旦落地即终态，迟到的认领必被CAS拒绝
        let claim = tracker.transition("t1", TaskState::Running, TransitionDetail::none());
        let cancel = tracker.transition("t1", TaskState::Revoked, TransitionDetail::none());
        let (claimed, cancelled) = tokio::join!(claim, cancel);
        let (claimed, cancelled) = (claimed.unwrap(), cancelled.unwrap());
        assert!(claimed || cancelled);

        match tracker.get("t1").await.unwrap().state {
            TaskState::Revoked => {
                let late_claim = tracker
                    .transition("t1", TaskState::Running, TransitionDetail::none())
                    .await
                    .unwrap();
                assert!(!late_claim);
            }
            // 认领抢先且撤销的CAS落空，任务照常开跑
            TaskState::Running => {
                assert!(claimed);
                assert!(!cancelled);
            }
            other => panic!("意外状态: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sweep_purges_only_expired_terminal_records() {
        let store = Arc::new(InMemoryStatusStore::new());
        let tracker = Arc::new(StatusTracker::new(
            store.clone(),
            Arc::new(NullNotificationHook),
            RetentionConfig {
                terminal_ttl_seconds: 60,
                sweep_interval_seconds: 1,
            },
        ));

        // 过期的终态记录
        let mut old_done = make_record("old_done");
        old_done.state = TaskState::Succeeded;
        old_done.updated_at = Utc::now() - chrono::Duration::seconds(120);
        store.insert(&old_done).await.unwrap();

        // 未过期的终态记录
        let mut fresh_done = make_record("fresh_done");
        fresh_done.state = TaskState::Failed;
        store.insert(&fresh_done).await.unwrap();

        // 老旧但非终态的记录不清理
        let mut old_running = make_record("old_running");
        old_running.state = TaskState::Running;
        old_running.updated_at = Utc::now() - chrono::Duration::seconds(120);
        store.insert(&old_running).await.unwrap();

        let purged = tracker.sweep_once().await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.get("old_done").await.unwrap().is_none());
        assert!(store.get("fresh_done").await.unwrap().is_some());
        assert!(store.get("old_running").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_worker_registry_roundtrip() {
        let registry = InMemoryWorkerRegistry::new();
        let descriptor = WorkerDescriptor {
            worker_id: "w1".to_string(),
            active_task_ids: vec![],
            registered_types: vec!["noop".to_string()],
            max_concurrent_tasks: 4,
            last_heartbeat: Utc::now(),
        };
        registry.register(&descriptor).await.unwrap();
        assert_eq!(registry.list().await.unwrap().len(), 1);

        let mut beat = descriptor.clone();
        beat.active_task_ids = vec!["t1".to_string()];
        registry.heartbeat(&beat).await.unwrap();
        assert_eq!(
            registry.list().await.unwrap()[0].active_task_ids,
            vec!["t1".to_string()]
        );

        assert!(registry.unregister("w1").await.unwrap());
        assert!(registry.list().await.unwrap().is_empty());
    }
}
