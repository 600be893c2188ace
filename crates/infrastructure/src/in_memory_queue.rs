use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use taskflow_domain::{QueueDescriptor, QueueMessage, QueueTransport};
use taskflow_errors::{SchedulerError, SchedulerResult};

/// 内存队列传输实现
///
/// 基于 Tokio 同步原语实现的优先级队列，支持延迟可见投递、
/// 可见性超时重投与 ack/nack，适用于嵌入式部署与测试场景。
/// 语义为至少一次：未确认的消息在可见性超时后重新可被认领。
pub struct InMemoryQueueTransport {
    queues: Arc<RwLock<HashMap<String, Arc<QueueState>>>>,
    config: InMemoryQueueConfig,
}

#[derive(Debug, Clone)]
pub struct InMemoryQueueConfig {
    /// 可见性超时（秒）：出队未确认的消息经过该时长后重新可见
    pub visibility_timeout_seconds: u64,
    /// 出队等待的时间切片（毫秒），用于发现到期的延迟消息与超时的in-flight消息
    pub wait_slice_ms: u64,
}

impl Default for InMemoryQueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_seconds: 30,
            wait_slice_ms: 100,
        }
    }
}

struct QueueState {
    descriptor: QueueDescriptor,
    inner: Mutex<QueueInner>,
    /// 入队唤醒信号，空闲消费者在此阻塞
    notify: Notify,
}

#[derive(Default)]
struct QueueInner {
    ready: BinaryHeap<ReadyItem>,
    delayed: BinaryHeap<DelayedItem>,
    in_flight: HashMap<String, InFlightItem>,
    seq: u64,
}

/// 就绪消息：优先级高者先出，同优先级按入队顺序
struct ReadyItem {
    priority: u8,
    seq: u64,
    message: QueueMessage,
}

impl PartialEq for ReadyItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for ReadyItem {}
impl PartialOrd for ReadyItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ReadyItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// 延迟消息：按到期时间先后出堆
struct DelayedItem {
    due: Instant,
    seq: u64,
    message: QueueMessage,
}

impl PartialEq for DelayedItem {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for DelayedItem {}
impl PartialOrd for DelayedItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayedItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct InFlightItem {
    message: QueueMessage,
    redeliver_at: Instant,
}

impl InMemoryQueueTransport {
    pub fn new() -> Self {
        Self::with_config(InMemoryQueueConfig::default())
    }

    pub fn with_config(config: InMemoryQueueConfig) -> Self {
        info!("创建内存队列传输: {:?}", config);
        Self {
            queues: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    async fn queue_state(&self, queue: &str) -> SchedulerResult<Arc<QueueState>> {
        let queues = self.queues.read().await;
        queues
            .get(queue)
            .cloned()
            .ok_or_else(|| SchedulerError::queue_error(format!("队列 '{queue}' 未声明")))
    }

    /// 把到期的延迟消息和可见性超时的in-flight消息搬回就绪堆
    fn promote_due(inner: &mut QueueInner, queue: &str, now: Instant) {
        while let Some(item) = inner.delayed.peek() {
            if item.due > now {
                break;
            }
            let item = inner.delayed.pop().expect("peek保证非空");
            inner.seq += 1;
            inner.ready.push(ReadyItem {
                priority: item.message.envelope.priority,
                seq: inner.seq,
                message: item.message,
            });
        }

        let expired: Vec<String> = inner
            .in_flight
            .iter()
            .filter(|(_, item)| item.redeliver_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(item) = inner.in_flight.remove(&id) {
                warn!(
                    "消息 {} 在队列 '{}' 上可见性超时，重新投递 (task_id={})",
                    id,
                    queue,
                    item.message.task_id()
                );
                inner.seq += 1;
                inner.ready.push(ReadyItem {
                    priority: item.message.envelope.priority,
                    seq: inner.seq,
                    message: item.message,
                });
            }
        }
    }
}

impl Default for InMemoryQueueTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueueTransport {
    async fn declare_queue(&self, descriptor: &QueueDescriptor) -> SchedulerResult<()> {
        let mut queues = self.queues.write().await;
        if !queues.contains_key(&descriptor.name) {
            info!(
                "声明队列 '{}' (max_priority: {})",
                descriptor.name, descriptor.max_priority
            );
            queues.insert(
                descriptor.name.clone(),
                Arc::new(QueueState {
                    descriptor: descriptor.clone(),
                    inner: Mutex::new(QueueInner::default()),
                    notify: Notify::new(),
                }),
            );
        }
        Ok(())
    }

    async fn enqueue(
        &self,
        queue: &str,
        message: &QueueMessage,
        delay: Option<Duration>,
    ) -> SchedulerResult<()> {
        let state = self.queue_state(queue).await?;

        if message.envelope.priority > state.descriptor.max_priority {
            return Err(SchedulerError::queue_error(format!(
                "消息优先级 {} 超出队列 '{}' 的上限 {}",
                message.envelope.priority, queue, state.descriptor.max_priority
            )));
        }

        {
            let mut inner = state.inner.lock().await;
            inner.seq += 1;
            let seq = inner.seq;
            match delay {
                Some(delay) if !delay.is_zero() => {
                    debug!(
                        "消息 {} 延迟 {:?} 后在队列 '{}' 可见",
                        message.id, delay, queue
                    );
                    inner.delayed.push(DelayedItem {
                        due: Instant::now() + delay,
                        seq,
                        message: message.clone(),
                    });
                }
                _ => {
                    inner.ready.push(ReadyItem {
                        priority: message.envelope.priority,
                        seq,
                        message: message.clone(),
                    });
                }
            }
        }

        state.notify.notify_one();
        debug!("消息 {} 已入队 '{}'", message.id, queue);
        Ok(())
    }

    async fn dequeue(&self, queue: &str, wait: Duration) -> SchedulerResult<Option<QueueMessage>> {
        let state = self.queue_state(queue).await?;
        let visibility = Duration::from_secs(self.config.visibility_timeout_seconds.max(1));
        let deadline = Instant::now() + wait;

        loop {
            {
                let mut inner = state.inner.lock().await;
                Self::promote_due(&mut inner, queue, Instant::now());

                if let Some(item) = inner.ready.pop() {
                    inner.in_flight.insert(
                        item.message.id.clone(),
                        InFlightItem {
                            message: item.message.clone(),
                            redeliver_at: Instant::now() + visibility,
                        },
                    );
                    debug!("消息 {} 从队列 '{}' 取出", item.message.id, queue);
                    return Ok(Some(item.message));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            // 分片等待：被入队信号唤醒，或到片检查延迟/重投是否到期
            let slice_end = (now + Duration::from_millis(self.config.wait_slice_ms.max(1)))
                .min(deadline);
            tokio::select! {
                _ = state.notify.notified() => {}
                _ = tokio::time::sleep_until(slice_end) => {}
            }
        }
    }

    async fn ack(&self, queue: &str, message_id: &str) -> SchedulerResult<()> {
        let state = self.queue_state(queue).await?;
        let mut inner = state.inner.lock().await;
        if inner.in_flight.remove(message_id).is_some() {
            debug!("消息 {} 已确认", message_id);
        } else {
            // 可见性超时后被重投的消息会出现重复确认，属于正常竞争
            debug!("确认的消息 {} 不在in-flight中，忽略", message_id);
        }
        Ok(())
    }

    async fn nack(&self, queue: &str, message_id: &str, requeue: bool) -> SchedulerResult<()> {
        let state = self.queue_state(queue).await?;
        let mut inner = state.inner.lock().await;
        match inner.in_flight.remove(message_id) {
            Some(item) if requeue => {
                inner.seq += 1;
                let seq = inner.seq;
                inner.ready.push(ReadyItem {
                    priority: item.message.envelope.priority,
                    seq,
                    message: item.message,
                });
                drop(inner);
                state.notify.notify_one();
                debug!("消息 {} 被否定确认并重新入队", message_id);
            }
            Some(_) => {
                debug!("消息 {} 被否定确认并丢弃", message_id);
            }
            None => {
                debug!("否定确认的消息 {} 不在in-flight中，忽略", message_id);
            }
        }
        Ok(())
    }

    async fn queue_size(&self, queue: &str) -> SchedulerResult<u32> {
        let state = self.queue_state(queue).await?;
        let inner = state.inner.lock().await;
        Ok((inner.ready.len() + inner.delayed.len()) as u32)
    }

    async fn purge(&self, queue: &str) -> SchedulerResult<()> {
        let state = self.queue_state(queue).await?;
        let mut inner = state.inner.lock().await;
        let purged = inner.ready.len() + inner.delayed.len();
        inner.ready.clear();
        inner.delayed.clear();
        info!("清空队列 '{}'，移除 {} 条消息", queue, purged);
        Ok(())
    }
}
