use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

use taskflow_domain::{
    HandlerRegistry, ProgressEmitter, QueueMessage, QueueTransport, RetryPolicy, StatusTracker,
    TaskContext, TaskError, TaskState, TransitionDetail, WorkerRegistry,
};
use taskflow_errors::{SchedulerError, SchedulerResult};
use taskflow_infrastructure::CancelBus;

use crate::heartbeat::HeartbeatReporter;

/// Worker服务构建器
pub struct WorkerServiceBuilder {
    worker_id: String,
    transport: Arc<dyn QueueTransport>,
    tracker: Arc<StatusTracker>,
    handlers: Arc<HandlerRegistry>,
    workers: Arc<dyn WorkerRegistry>,
    cancel_bus: Arc<CancelBus>,
    queues: Vec<String>,
    max_concurrent_tasks: usize,
    poll_wait: Duration,
    retry_policy: RetryPolicy,
    heartbeat_interval: Duration,
}

impl WorkerServiceBuilder {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        tracker: Arc<StatusTracker>,
        handlers: Arc<HandlerRegistry>,
        workers: Arc<dyn WorkerRegistry>,
    ) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            worker_id: format!("{}-{}", host, uuid::Uuid::new_v4()),
            transport,
            tracker,
            handlers,
            workers,
            cancel_bus: Arc::new(CancelBus::new()),
            queues: vec!["default".to_string()],
            max_concurrent_tasks: 5,
            poll_wait: Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
            heartbeat_interval: Duration::from_secs(10),
        }
    }

    pub fn worker_id<S: Into<String>>(mut self, worker_id: S) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    pub fn max_concurrent_tasks(mut self, max_concurrent_tasks: usize) -> Self {
        self.max_concurrent_tasks = max_concurrent_tasks.max(1);
        self
    }

    pub fn poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn cancel_bus(mut self, cancel_bus: Arc<CancelBus>) -> Self {
        self.cancel_bus = cancel_bus;
        self
    }

    pub fn build(self) -> WorkerService {
        WorkerService {
            worker_id: self.worker_id,
            transport: self.transport,
            tracker: self.tracker,
            handlers: self.handlers,
            workers: self.workers,
            cancel_bus: self.cancel_bus,
            queues: self.queues,
            max_concurrent_tasks: self.max_concurrent_tasks,
            poll_wait: self.poll_wait,
            retry_policy: self.retry_policy,
            heartbeat_interval: self.heartbeat_interval,
            permits: Arc::new(Semaphore::new(self.max_concurrent_tasks)),
            running: Arc::new(RwLock::new(HashSet::new())),
        }
    }
}

/// 任务执行服务：从队列认领消息、执行处理器、按重试策略
/// 决定下一步，并只在状态落盘之后确认消息（晚ACK）。
///
/// 至少一次语义下重复投递是常态。认领前先复核状态机，重复
/// 消息与已撤销消息在这里被丢弃，不会进入处理器。
pub struct WorkerService {
    worker_id: String,
    transport: Arc<dyn QueueTransport>,
    tracker: Arc<StatusTracker>,
    handlers: Arc<HandlerRegistry>,
    workers: Arc<dyn WorkerRegistry>,
    cancel_bus: Arc<CancelBus>,
    queues: Vec<String>,
    max_concurrent_tasks: usize,
    poll_wait: Duration,
    retry_policy: RetryPolicy,
    heartbeat_interval: Duration,
    permits: Arc<Semaphore>,
    running: Arc<RwLock<HashSet<String>>>,
}

/// 一次执行的裁决结果，决定finalize走哪条路
enum ExecOutcome {
    Completed(serde_json::Value),
    Failed(TaskError),
    /// 处理器响应取消信号退出
    Revoked(String),
}

impl WorkerService {
    pub fn builder(
        transport: Arc<dyn QueueTransport>,
        tracker: Arc<StatusTracker>,
        handlers: Arc<HandlerRegistry>,
        workers: Arc<dyn WorkerRegistry>,
    ) -> WorkerServiceBuilder {
        WorkerServiceBuilder::new(transport, tracker, handlers, workers)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn running_task_ids(&self) -> Vec<String> {
        self.running.read().await.iter().cloned().collect()
    }

    /// 主循环：轮询所有订阅队列，并发受信号量约束。
    /// 收到关闭信号后停止认领，等在途任务全部结束再返回。
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> SchedulerResult<()> {
        if self.queues.is_empty() {
            return Err(SchedulerError::config_error("Worker未订阅任何队列"));
        }
        info!(
            "Worker {} 启动: queues={:?}, 并发上限={}",
            self.worker_id, self.queues, self.max_concurrent_tasks
        );

        let heartbeat = HeartbeatReporter::new(
            self.worker_id.clone(),
            Arc::clone(&self.workers),
            Arc::clone(&self.running),
            self.handlers.names(),
            self.max_concurrent_tasks,
            self.heartbeat_interval,
        );
        let heartbeat_handle = tokio::spawn({
            let shutdown = shutdown.resubscribe();
            async move { heartbeat.run(shutdown).await }
        });

        let mut queue_cursor = 0usize;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Worker {} 收到关闭信号，停止认领", self.worker_id);
                    break;
                }
                permit = Arc::clone(&self.permits).acquire_owned() => {
                    let permit = match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    // 队列轮转，避免饿死低序号之外的队列
                    let queue = self.queues[queue_cursor % self.queues.len()].clone();
                    queue_cursor = queue_cursor.wrapping_add(1);

                    match self.transport.dequeue(&queue, self.poll_wait).await {
                        Ok(Some(message)) => {
                            let service = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = service.process_message(&queue, message).await {
                                    error!("消息处理失败: {}", e);
                                }
                                drop(permit);
                            });
                        }
                        Ok(None) => drop(permit),
                        Err(e) => {
                            warn!("队列 {} 拉取失败: {}", queue, e);
                            drop(permit);
                            tokio::time::sleep(self.poll_wait).await;
                        }
                    }
                }
            }
        }

        // 排空：拿回全部许可即所有在途任务已结束
        let _ = self
            .permits
            .acquire_many(self.max_concurrent_tasks as u32)
            .await;
        let _ = heartbeat_handle.await;
        info!("Worker {} 已排空并退出", self.worker_id);
        Ok(())
    }

    /// 处理一条队列消息，完整生命周期：认领复核、置RUNNING、
    /// 执行、按结果终结或重试、最后确认消息。
    pub async fn process_message(&self, queue: &str, message: QueueMessage) -> SchedulerResult<()> {
        let task_id = message.envelope.id.clone();

        // 认领前复核状态机：找不到记录或已入终态的消息直接丢弃。
        // 撤销竞争在这里收口，REVOKED的任务不会被执行。
        let record = match self.tracker.try_get(&task_id).await? {
            Some(record) => record,
            None => {
                warn!("消息指向不存在的任务 {}，丢弃", task_id);
                return self.transport.ack(queue, &message.id).await;
            }
        };
        if record.state.is_terminal() {
            debug!(
                "任务 {} 已处于终态 {}，丢弃重复投递",
                task_id,
                record.state.as_str()
            );
            return self.transport.ack(queue, &message.id).await;
        }

        // 置RUNNING。竞争失败说明另一次投递已经抢先认领或
        // 撤销赢了，按重复消息丢弃。
        let claimed = self
            .tracker
            .transition(
                &task_id,
                TaskState::Running,
                TransitionDetail::with_attempt(message.attempt),
            )
            .await?;
        if !claimed {
            debug!("任务 {} 认领竞争失败，丢弃本次投递", task_id);
            return self.transport.ack(queue, &message.id).await;
        }

        self.running.write().await.insert(task_id.clone());
        let outcome = self.execute(&message).await;
        self.running.write().await.remove(&task_id);

        self.finalize(queue, &message, outcome).await
    }

    /// 执行处理器，带软硬两级超时与协作取消
    async fn execute(&self, message: &QueueMessage) -> ExecOutcome {
        let envelope = &message.envelope;
        let task_id = &envelope.id;

        let handler = match self.handlers.get(&envelope.task_type) {
            Some(handler) => handler,
            None => {
                // 提交时校验过的类型在这里缺失，说明Worker注册表不一致
                let err = SchedulerError::WorkerUnavailable {
                    task_type: envelope.task_type.clone(),
                };
                return ExecOutcome::Failed(TaskError::permanent(err.to_string()));
            }
        };

        let signal = self.cancel_bus.register(task_id).await;
        let (emitter, mut progress_rx) = ProgressEmitter::channel();
        let ctx = TaskContext::new(
            task_id.clone(),
            message.attempt,
            Duration::from_secs(envelope.soft_time_limit_seconds),
            signal.flag(),
            emitter,
        );

        // 进度转发到Status Tracker，通道随上下文一起关闭
        let progress_task = tokio::spawn({
            let tracker = Arc::clone(&self.tracker);
            let task_id = task_id.clone();
            async move {
                while let Some(payload) = progress_rx.recv().await {
                    if let Err(e) = tracker.update_progress(&task_id, payload).await {
                        warn!("任务 {} 进度上报失败: {}", task_id, e);
                    }
                }
            }
        });

        let hard_limit = Duration::from_secs(envelope.hard_time_limit_seconds);
        let result = match tokio::time::timeout(hard_limit, handler.execute(&envelope.args, &ctx))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                // 硬超时：future被丢弃即强制中断
                error!(
                    "任务 {} 超过硬超时 {}s，已强制中断",
                    task_id, envelope.hard_time_limit_seconds
                );
                Err(TaskError::timeout(format!(
                    "超过硬超时 {}s",
                    envelope.hard_time_limit_seconds
                )))
            }
        };

        self.cancel_bus.deregister(task_id).await;
        drop(ctx);
        let _ = progress_task.await;

        match result {
            Ok(value) => ExecOutcome::Completed(value),
            // 取消信号生效且处理器没有正常产出结果，按撤销处理
            Err(err) if signal.is_cancelled() => {
                ExecOutcome::Revoked(format!("响应撤销信号退出: {err}"))
            }
            Err(err) => ExecOutcome::Failed(err),
        }
    }

    /// 按执行结果写终态或安排重试，成功落盘后才ACK。
    /// 状态写入失败时NACK重投，宁可重复执行不可丢任务。
    async fn finalize(
        &self,
        queue: &str,
        message: &QueueMessage,
        outcome: ExecOutcome,
    ) -> SchedulerResult<()> {
        let task_id = &message.envelope.id;

        let settled = match outcome {
            ExecOutcome::Completed(result) => {
                let won = self
                    .tracker
                    .transition(
                        task_id,
                        TaskState::Succeeded,
                        TransitionDetail::with_result(result),
                    )
                    .await;
                if won.is_ok() {
                    info!("任务执行成功: id={}, attempt={}", task_id, message.attempt);
                }
                won
            }
            ExecOutcome::Revoked(reason) => {
                warn!("任务 {} 响应撤销信号退出", task_id);
                self.tracker
                    .transition(
                        task_id,
                        TaskState::Revoked,
                        TransitionDetail::with_error(reason),
                    )
                    .await
            }
            ExecOutcome::Failed(err) => self.settle_failure(message, &err).await,
        };

        match settled {
            Ok(_) => self.transport.ack(queue, &message.id).await,
            Err(e) => {
                error!("任务 {} 状态落盘失败，消息重投: {}", task_id, e);
                self.transport.nack(queue, &message.id, true).await
            }
        }
    }

    /// 失败路径：可重试错误且还有预算时置RETRYING并延迟重入队，
    /// 否则置FAILED。
    async fn settle_failure(&self, message: &QueueMessage, err: &TaskError) -> SchedulerResult<bool> {
        let envelope = &message.envelope;
        let task_id = &envelope.id;

        let has_budget = message.attempt < envelope.max_retries;
        let delay = if has_budget {
            self.retry_policy.next_delay(message.attempt, err.class)
        } else {
            None
        };

        match delay {
            Some(delay) => {
                warn!(
                    "任务执行失败，将重试: id={}, attempt={}/{}, 延迟={:?}, error={}",
                    task_id, message.attempt, envelope.max_retries, delay, err
                );
                let won = self
                    .tracker
                    .transition(
                        task_id,
                        TaskState::Retrying,
                        TransitionDetail::with_error(err.message.clone()),
                    )
                    .await?;
                if won {
                    let next = QueueMessage::new(envelope.clone(), message.attempt + 1);
                    self.transport
                        .enqueue(&envelope.queue, &next, Some(delay))
                        .await?;
                }
                Ok(won)
            }
            None => {
                error!(
                    "任务执行失败，不再重试: id={}, attempt={}, class={:?}, error={}",
                    task_id, message.attempt, err.class, err
                );
                self.tracker
                    .transition(
                        task_id,
                        TaskState::Failed,
                        TransitionDetail::with_error(err.message.clone()),
                    )
                    .await
            }
        }
    }
}
