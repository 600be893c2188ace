use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use taskflow_domain::{ScheduleEntry, TaskEnvelope, Trigger};
use taskflow_errors::{SchedulerError, SchedulerResult};

use crate::cron_utils::CronScheduler;
use crate::dispatcher::Dispatcher;

/// 运行时可变的调度表。新增、修改、删除即时生效，
/// 无需重启调度循环。
#[derive(Default)]
pub struct ScheduleRegistry {
    entries: RwLock<HashMap<String, ScheduleEntry>>,
}

impl ScheduleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新增或覆盖一条调度。CRON表达式在写入前校验。
    pub async fn upsert(&self, entry: ScheduleEntry) -> SchedulerResult<()> {
        if entry.name.is_empty() {
            return Err(SchedulerError::validation_error("调度名称不能为空"));
        }
        match &entry.trigger {
            Trigger::Cron { expr } => CronScheduler::validate_cron_expression(expr)?,
            Trigger::Interval { seconds } => {
                if *seconds == 0 {
                    return Err(SchedulerError::validation_error("调度间隔必须大于0秒"));
                }
            }
        }
        let mut entries = self.entries.write().await;
        if entries.insert(entry.name.clone(), entry.clone()).is_some() {
            info!("调度已更新: {}", entry.name);
        } else {
            info!("调度已注册: {}", entry.name);
        }
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> bool {
        self.entries.write().await.remove(name).is_some()
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> SchedulerResult<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| SchedulerError::validation_error(format!("调度 '{name}' 不存在")))?;
        entry.enabled = enabled;
        Ok(())
    }

    pub async fn list(&self) -> Vec<ScheduleEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    async fn enabled_entries(&self) -> Vec<ScheduleEntry> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.enabled)
            .cloned()
            .collect()
    }
}

/// 周期调度器：按固定心跳扫描调度表，把到期的调度项
/// 转换为任务提交给分发器。
///
/// 去重不依赖本地状态：任务id由调度名与触发时刻拼成
/// `"{name}@{unix秒}"`，提交走幂等路径，同一触发窗口
/// 无论扫描多少次（包括进程重启后补扫）只产生一个任务。
pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ScheduleRegistry>,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        registry: Arc<ScheduleRegistry>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            dispatcher,
            registry,
            tick_interval,
        }
    }

    /// 调度循环，收到关闭信号后退出
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("调度器启动, tick间隔 {:?}", self.tick_interval);
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_tick = Utc::now();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("调度器收到关闭信号，退出");
                    break;
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    if let Err(e) = self.tick_once(last_tick, now).await {
                        error!("调度tick失败: {}", e);
                    }
                    last_tick = now;
                }
            }
        }
    }

    /// 扫描一次调度表，触发窗口 (window_start, window_end] 内到期的项。
    /// 返回本次实际提交的任务id。
    pub async fn tick_once(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> SchedulerResult<Vec<String>> {
        let mut fired = Vec::new();
        for entry in self.registry.enabled_entries().await {
            let occurrence = match Self::due_occurrence(&entry.trigger, window_start, window_end) {
                Ok(Some(at)) => at,
                Ok(None) => continue,
                Err(e) => {
                    // 表项损坏不应拖垮整个tick
                    warn!("调度 '{}' 触发计算失败: {}", entry.name, e);
                    continue;
                }
            };

            let task_id = format!("{}@{}", entry.name, occurrence.timestamp());
            let mut envelope = TaskEnvelope::new(&entry.task_type, &entry.queue)
                .with_args(entry.args_template.clone());
            envelope.id = task_id.clone();

            match self.dispatcher.submit(envelope).await {
                Ok(id) => {
                    debug!("调度触发: {} -> {}", entry.name, id);
                    fired.push(id);
                }
                Err(e) => {
                    warn!("调度 '{}' 提交失败: {}", entry.name, e);
                }
            }
        }
        Ok(fired)
    }

    /// 窗口内最后一次到期时刻。一个tick内同一调度至多触发一次，
    /// 错过的中间时刻合并为最近的一次。
    fn due_occurrence(
        trigger: &Trigger,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        match trigger {
            Trigger::Cron { expr } => {
                let cron = CronScheduler::new(expr)?;
                Ok(cron.last_occurrence_between(window_start, window_end))
            }
            Trigger::Interval { seconds } => {
                let step = *seconds as i64;
                let end_ts = window_end.timestamp();
                let aligned = end_ts - end_ts.rem_euclid(step);
                if aligned > window_start.timestamp() {
                    Ok(Utc.timestamp_opt(aligned, 0).single())
                } else {
                    Ok(None)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use taskflow_domain::{
        HandlerRegistry, NullNotificationHook, QueueDescriptor, QueueTransport, RetentionConfig,
        StatusTracker, TaskContext, TaskError, TaskHandler,
    };
    use taskflow_infrastructure::{InMemoryQueueTransport, InMemoryStatusStore};

    use crate::dispatcher::QueueRouter;

    struct NoopHandler;

    #[async_trait]
    impl TaskHandler for NoopHandler {
        fn name(&self) -> &str {
            "report.generate"
        }
        async fn execute(
            &self,
            _args: &serde_json::Value,
            _ctx: &TaskContext,
        ) -> Result<serde_json::Value, TaskError> {
            Ok(serde_json::Value::Null)
        }
    }

    async fn make_scheduler() -> (Scheduler, Arc<ScheduleRegistry>, Arc<InMemoryQueueTransport>) {
        let tracker = Arc::new(StatusTracker::new(
            Arc::new(InMemoryStatusStore::new()),
            Arc::new(NullNotificationHook),
            RetentionConfig::default(),
        ));
        let transport = Arc::new(InMemoryQueueTransport::new());
        let router = Arc::new(
            QueueRouter::new(vec![QueueDescriptor::new("default")], "default").unwrap(),
        );
        for descriptor in router.descriptors() {
            transport.declare_queue(&descriptor).await.unwrap();
        }
        let handlers = HandlerRegistry::new();
        handlers.register(Arc::new(NoopHandler));
        let dispatcher = Arc::new(Dispatcher::new(
            tracker,
            transport.clone(),
            Arc::new(handlers),
            router,
        ));
        let registry = Arc::new(ScheduleRegistry::new());
        let scheduler = Scheduler::new(dispatcher, Arc::clone(&registry), Duration::from_secs(1));
        (scheduler, registry, transport)
    }

    fn at(ts: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(ts, 0).single().unwrap()
    }

    #[tokio::test]
    async fn test_upsert_rejects_invalid_cron() {
        let registry = ScheduleRegistry::new();
        let entry = ScheduleEntry::cron("bad", "report.generate", "default", "not a cron");
        assert!(matches!(
            registry.upsert(entry).await,
            Err(SchedulerError::InvalidCron { .. })
        ));
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_interval_fires_once_per_window() {
        let (scheduler, registry, _) = make_scheduler().await;
        registry
            .upsert(ScheduleEntry::interval(
                "report",
                "report.generate",
                "default",
                60,
            ))
            .await
            .unwrap();

        // 模拟5分钟，每秒一个tick：恰好5次触发（每分钟边界一次）
        let base = 1_700_000_040; // 恰在整分边界，窗口左开不含该时刻
        let mut fired = Vec::new();
        for offset in 0..300 {
            let ids = scheduler
                .tick_once(at(base + offset), at(base + offset + 1))
                .await
                .unwrap();
            fired.extend(ids);
        }
        assert_eq!(fired.len(), 5);
        // 任务id编码触发时刻，逐个相差60秒
        for pair in fired.windows(2) {
            let ts0: i64 = pair[0].split('@').nth(1).unwrap().parse().unwrap();
            let ts1: i64 = pair[1].split('@').nth(1).unwrap().parse().unwrap();
            assert_eq!(ts1 - ts0, 60);
        }
    }

    #[tokio::test]
    async fn test_same_window_rescan_is_deduplicated() {
        let (scheduler, registry, transport) = make_scheduler().await;
        registry
            .upsert(ScheduleEntry::interval(
                "report",
                "report.generate",
                "default",
                60,
            ))
            .await
            .unwrap();

        // 同一窗口重复扫描（等价于调度进程重启后的补扫）
        let first = scheduler.tick_once(at(1_700_000_040), at(1_700_000_100)).await.unwrap();
        let second = scheduler.tick_once(at(1_700_000_040), at(1_700_000_100)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0], second[0]);
        assert_eq!(transport.queue_size("default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cron_trigger_fires_in_window() {
        let (scheduler, registry, _) = make_scheduler().await;
        // 每分钟第0秒
        registry
            .upsert(ScheduleEntry::cron(
                "minutely",
                "report.generate",
                "default",
                "0 * * * * *",
            ))
            .await
            .unwrap();

        let fired = scheduler
            .tick_once(at(1_700_000_095), at(1_700_000_101))
            .await
            .unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0], format!("minutely@{}", 1_700_000_100));

        // 不含分钟边界的窗口不触发
        let none = scheduler
            .tick_once(at(1_700_000_101), at(1_700_000_130))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_entry_is_skipped() {
        let (scheduler, registry, _) = make_scheduler().await;
        registry
            .upsert(ScheduleEntry::interval(
                "report",
                "report.generate",
                "default",
                60,
            ))
            .await
            .unwrap();
        registry.set_enabled("report", false).await.unwrap();

        let fired = scheduler
            .tick_once(at(1_700_000_040), at(1_700_000_100))
            .await
            .unwrap();
        assert!(fired.is_empty());

        registry.set_enabled("report", true).await.unwrap();
        let fired = scheduler
            .tick_once(at(1_700_000_040), at(1_700_000_100))
            .await
            .unwrap();
        assert_eq!(fired.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_stops_future_triggers() {
        let (scheduler, registry, _) = make_scheduler().await;
        registry
            .upsert(ScheduleEntry::interval(
                "report",
                "report.generate",
                "default",
                60,
            ))
            .await
            .unwrap();
        assert!(registry.remove("report").await);
        assert!(!registry.remove("report").await);

        let fired = scheduler
            .tick_once(at(1_700_000_040), at(1_700_000_100))
            .await
            .unwrap();
        assert!(fired.is_empty());
    }
}
