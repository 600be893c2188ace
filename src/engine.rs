use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use taskflow_dispatcher::{
    CancelOutcome, Dispatcher, QueueRouter, ScheduleRegistry, Scheduler, TaskController,
    WorkerStats,
};
use taskflow_domain::{
    HandlerRegistry, NotificationHook, QueueTransport, RetentionConfig, ScheduleEntry, StatusStore,
    StatusTracker, TaskEnvelope, TaskHandler, TaskRecord, WorkerRegistry,
};
use taskflow_errors::{SchedulerError, SchedulerResult};
use taskflow_infrastructure::{
    CancelBus, InMemoryQueueConfig, InMemoryQueueTransport, InMemoryStatusStore,
    InMemoryWorkerRegistry, LoggingNotificationHook,
};
use taskflow_worker::WorkerService;

use crate::config::AppConfig;

/// 引擎构建器：装配处理器与可替换的基础设施。
/// 不显式注入时使用内存实现，零配置即可运行。
pub struct EngineBuilder {
    config: AppConfig,
    handlers: HandlerRegistry,
    transport: Option<Arc<dyn QueueTransport>>,
    status_store: Option<Arc<dyn StatusStore>>,
    worker_registry: Option<Arc<dyn WorkerRegistry>>,
    notification_hook: Option<Arc<dyn NotificationHook>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            handlers: HandlerRegistry::new(),
            transport: None,
            status_store: None,
            worker_registry: None,
            notification_hook: None,
        }
    }

    pub fn from_config_file(path: &Path) -> SchedulerResult<Self> {
        Ok(Self::new(AppConfig::load(Some(path))?))
    }

    pub fn register_handler(self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.register(handler);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn QueueTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn status_store(mut self, store: Arc<dyn StatusStore>) -> Self {
        self.status_store = Some(store);
        self
    }

    pub fn worker_registry(mut self, registry: Arc<dyn WorkerRegistry>) -> Self {
        self.worker_registry = Some(registry);
        self
    }

    pub fn notification_hook(mut self, hook: Arc<dyn NotificationHook>) -> Self {
        self.notification_hook = Some(hook);
        self
    }

    /// 装配全部组件。声明队列需要异步IO，所以build是async的。
    pub async fn build(self) -> SchedulerResult<Engine> {
        self.config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(InMemoryQueueTransport::with_config(InMemoryQueueConfig {
                visibility_timeout_seconds: self.config.transport.visibility_timeout_seconds,
                wait_slice_ms: self.config.transport.wait_slice_ms,
            })) as Arc<dyn QueueTransport>,
        };

        let descriptors = self.config.queue_descriptors();
        for descriptor in &descriptors {
            transport.declare_queue(descriptor).await?;
        }

        let store = self
            .status_store
            .unwrap_or_else(|| Arc::new(InMemoryStatusStore::new()));
        let workers = self
            .worker_registry
            .unwrap_or_else(|| Arc::new(InMemoryWorkerRegistry::new()));
        let hook = self
            .notification_hook
            .unwrap_or_else(|| Arc::new(LoggingNotificationHook));

        let tracker = Arc::new(StatusTracker::new(
            store,
            hook,
            RetentionConfig {
                terminal_ttl_seconds: self.config.retention.terminal_ttl_seconds,
                sweep_interval_seconds: self.config.retention.sweep_interval_seconds,
            },
        ));

        let handlers = Arc::new(self.handlers);
        let router = Arc::new(QueueRouter::new(descriptors, &self.config.default_queue)?);
        let cancel_bus = Arc::new(CancelBus::new());

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&tracker),
            Arc::clone(&transport),
            Arc::clone(&handlers),
            Arc::clone(&router),
        ));

        let schedules = Arc::new(ScheduleRegistry::new());
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&dispatcher),
            Arc::clone(&schedules),
            Duration::from_secs(self.config.scheduler.tick_interval_seconds),
        ));

        let controller = TaskController::new(
            Arc::clone(&tracker),
            Arc::clone(&workers),
            Arc::clone(&transport),
            Arc::clone(&cancel_bus),
            self.config.worker.heartbeat_timeout_seconds,
        );

        let mut worker_builder = WorkerService::builder(
            Arc::clone(&transport),
            Arc::clone(&tracker),
            Arc::clone(&handlers),
            Arc::clone(&workers),
        )
        .queues(self.config.worker_queues())
        .max_concurrent_tasks(self.config.worker.max_concurrent_tasks)
        .poll_wait(Duration::from_millis(self.config.worker.poll_wait_ms.max(1)))
        .retry_policy(self.config.retry.to_policy())
        .heartbeat_interval(Duration::from_secs(
            self.config.worker.heartbeat_interval_seconds.max(1),
        ))
        .cancel_bus(Arc::clone(&cancel_bus));
        if !self.config.worker.worker_id.is_empty() {
            worker_builder = worker_builder.worker_id(self.config.worker.worker_id.clone());
        }

        let (shutdown_tx, _) = broadcast::channel(4);

        Ok(Engine {
            config: self.config,
            dispatcher,
            scheduler,
            schedules,
            controller,
            tracker,
            worker: Arc::new(worker_builder.build()),
            shutdown_tx,
            background: Mutex::new(Vec::new()),
        })
    }
}

/// 调度引擎门面：一个进程内装配好的分发器、调度器、执行服务
/// 与控制面。嵌入方通过它提交任务、管理调度表、撤销与观测。
pub struct Engine {
    config: AppConfig,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Scheduler>,
    schedules: Arc<ScheduleRegistry>,
    controller: TaskController,
    tracker: Arc<StatusTracker>,
    worker: Arc<WorkerService>,
    shutdown_tx: broadcast::Sender<()>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(config: AppConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 启动后台组件：执行服务、周期调度器、保留期清理。
    /// 重复调用会叠加Worker，调用方自己保证只启动一次。
    pub async fn start(&self) -> SchedulerResult<()> {
        info!("启动调度引擎");
        let mut background = self.background.lock().await;

        let worker = Arc::clone(&self.worker);
        let worker_shutdown = self.shutdown_tx.subscribe();
        background.push(tokio::spawn(async move {
            if let Err(e) = worker.run(worker_shutdown).await {
                error!("执行服务异常退出: {}", e);
            }
        }));

        if self.config.scheduler.enabled {
            let scheduler = Arc::clone(&self.scheduler);
            let scheduler_shutdown = self.shutdown_tx.subscribe();
            background.push(tokio::spawn(async move {
                scheduler.run(scheduler_shutdown).await;
            }));
        }

        background.push(self.tracker.spawn_sweeper(self.shutdown_tx.subscribe()));

        info!("调度引擎已启动");
        Ok(())
    }

    /// 优雅停机：停止认领与调度，等在途任务排空，超时则放弃等待。
    /// 未确认的消息由传输层可见性超时兜底重投。
    pub async fn shutdown(&self, timeout: Duration) -> SchedulerResult<()> {
        info!("调度引擎开始优雅停机");
        if self.shutdown_tx.send(()).is_err() {
            warn!("没有在运行的后台组件");
        }

        let mut background = self.background.lock().await;
        let drain = async {
            for handle in background.drain(..) {
                if let Err(e) = handle.await {
                    error!("后台组件join失败: {}", e);
                }
            }
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => {
                info!("调度引擎已停机");
                Ok(())
            }
            Err(_) => {
                warn!("停机排空超时 ({:?})，放弃等待在途任务", timeout);
                Err(SchedulerError::Timeout(format!(
                    "停机排空超时: {timeout:?}"
                )))
            }
        }
    }

    // --- 任务提交 ---

    pub async fn submit(&self, envelope: TaskEnvelope) -> SchedulerResult<String> {
        self.dispatcher.submit(envelope).await
    }

    pub async fn submit_batch(
        &self,
        envelopes: Vec<TaskEnvelope>,
    ) -> Vec<SchedulerResult<String>> {
        self.dispatcher.submit_batch(envelopes).await
    }

    // --- 调度表 ---

    pub async fn upsert_schedule(&self, entry: ScheduleEntry) -> SchedulerResult<()> {
        self.schedules.upsert(entry).await
    }

    pub async fn remove_schedule(&self, name: &str) -> bool {
        self.schedules.remove(name).await
    }

    pub async fn list_schedules(&self) -> Vec<ScheduleEntry> {
        self.schedules.list().await
    }

    // --- 控制面 ---

    pub async fn cancel(&self, task_id: &str) -> SchedulerResult<CancelOutcome> {
        self.controller.cancel(task_id).await
    }

    pub async fn task(&self, task_id: &str) -> SchedulerResult<TaskRecord> {
        self.controller.get_task(task_id).await
    }

    pub async fn list_active(&self) -> SchedulerResult<Vec<TaskRecord>> {
        self.controller.list_active().await
    }

    pub async fn queue_size(&self, queue: &str) -> SchedulerResult<u32> {
        self.controller.queue_size(queue).await
    }

    pub async fn purge_queue(&self, queue: &str) -> SchedulerResult<()> {
        self.controller.purge_queue(queue).await
    }

    pub async fn worker_stats(&self) -> SchedulerResult<WorkerStats> {
        self.controller.worker_stats().await
    }

    pub async fn evict_stale_workers(&self) -> SchedulerResult<usize> {
        self.controller.evict_stale_workers().await
    }
}
