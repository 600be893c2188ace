use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use taskflow_domain::{
    HandlerRegistry, QueueDescriptor, QueueMessage, QueueTransport, StatusTracker, TaskEnvelope,
};
use taskflow_errors::{SchedulerError, SchedulerResult};

/// 静态队列路由表
pub struct QueueRouter {
    queues: HashMap<String, QueueDescriptor>,
    /// 信封未指定队列且无规则命中时的兜底队列
    default: QueueDescriptor,
}

impl QueueRouter {
    pub fn new(descriptors: Vec<QueueDescriptor>, default_queue: &str) -> SchedulerResult<Self> {
        if descriptors.is_empty() {
            return Err(SchedulerError::config_error("至少需要声明一个队列"));
        }
        let queues: HashMap<String, QueueDescriptor> = descriptors
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        let default = queues.get(default_queue).cloned().ok_or_else(|| {
            SchedulerError::config_error(format!("默认队列 '{default_queue}' 不在路由表中"))
        })?;
        Ok(Self { queues, default })
    }

    pub fn get(&self, name: &str) -> Option<&QueueDescriptor> {
        self.queues.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    pub fn descriptors(&self) -> Vec<QueueDescriptor> {
        self.queues.values().cloned().collect()
    }

    /// 按路由规则为任务类型选择队列；无规则命中时回落到默认队列
    pub fn route(&self, task_type: &str) -> &QueueDescriptor {
        self.queues
            .values()
            .find(|q| q.matches_task_type(task_type))
            .unwrap_or(&self.default)
    }
}

/// 任务分发器：校验信封、落PENDING记录、推入队列传输。
/// 对并发调用方无共享可变状态，天然并发安全。
pub struct Dispatcher {
    tracker: Arc<StatusTracker>,
    transport: Arc<dyn QueueTransport>,
    handlers: Arc<HandlerRegistry>,
    router: Arc<QueueRouter>,
}

impl Dispatcher {
    pub fn new(
        tracker: Arc<StatusTracker>,
        transport: Arc<dyn QueueTransport>,
        handlers: Arc<HandlerRegistry>,
        router: Arc<QueueRouter>,
    ) -> Self {
        Self {
            tracker,
            transport,
            handlers,
            router,
        }
    }

    /// 提交单个任务，返回可供轮询的任务id。
    ///
    /// 校验类错误（UnknownQueue / UnknownTaskType / ValidationError）
    /// 同步返回且不入队。id已存在的重复提交是幂等no-op。
    pub async fn submit(&self, mut envelope: TaskEnvelope) -> SchedulerResult<String> {
        envelope.validate()?;

        if !self.handlers.contains(&envelope.task_type) {
            return Err(SchedulerError::unknown_task_type(&envelope.task_type));
        }

        // 路由：显式队列必须存在，未指定时按规则路由
        let queue = if envelope.queue.is_empty() {
            let descriptor = self.router.route(&envelope.task_type);
            envelope.queue = descriptor.name.clone();
            descriptor
        } else {
            self.router
                .get(&envelope.queue)
                .ok_or_else(|| SchedulerError::unknown_queue(&envelope.queue))?
        };

        if envelope.priority > queue.max_priority {
            return Err(SchedulerError::validation_error(format!(
                "优先级 {} 超出队列 '{}' 的上限 {}",
                envelope.priority, queue.name, queue.max_priority
            )));
        }

        envelope.ensure_id();
        let task_id = envelope.id.clone();
        let queue_name = envelope.queue.clone();

        // PENDING记录先落盘：在任何Worker认领之前即对查询可见
        let created = self.tracker.create_pending(envelope.clone()).await?;
        if !created {
            // 调度去重依赖这里的幂等：同id重复提交不产生第二条消息
            debug!("任务 {} 已存在，幂等返回", task_id);
            return Ok(task_id);
        }

        let delay = envelope.eta.and_then(|eta| {
            let until = eta - Utc::now();
            until.to_std().ok().filter(|d| !d.is_zero())
        });

        let message = QueueMessage::new(envelope, 0);
        if let Err(err) = self.transport.enqueue(&queue_name, &message, delay).await {
            // 入队失败时回滚刚落盘的PENDING记录，否则该记录永远不会被执行，
            // 且同id重新提交会命中幂等分支、误以为任务已在队列中
            if let Err(cleanup_err) = self.tracker.remove(&task_id).await {
                warn!("任务 {} 入队失败后回滚记录也失败: {}", task_id, cleanup_err);
            }
            return Err(err);
        }

        info!(
            "任务已提交: id={}, type={}, queue={}, delay={:?}",
            task_id,
            message.envelope.task_type,
            queue_name,
            delay.unwrap_or(Duration::ZERO)
        );
        Ok(task_id)
    }

    /// 批量提交：逐项处理，单项失败不中断整批，结果按输入顺序返回
    pub async fn submit_batch(
        &self,
        envelopes: Vec<TaskEnvelope>,
    ) -> Vec<SchedulerResult<String>> {
        let mut results = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            let result = self.submit(envelope).await;
            if let Err(e) = &result {
                warn!("批量提交中的单项失败: {}", e);
            }
            results.push(result);
        }
        results
    }
}
