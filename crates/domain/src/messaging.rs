use std::time::Duration;

use async_trait::async_trait;

use crate::entities::{QueueDescriptor, QueueMessage};
use taskflow_errors::SchedulerResult;

/// 队列传输层抽象：任何支持优先级、延迟可见与可见性超时重投的
/// 至少一次FIFO传输都可以实现此接口。
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// 声明队列，幂等
    async fn declare_queue(&self, descriptor: &QueueDescriptor) -> SchedulerResult<()>;

    /// 入队。delay 非空时消息在延迟结束前对消费者不可见。
    async fn enqueue(
        &self,
        queue: &str,
        message: &QueueMessage,
        delay: Option<Duration>,
    ) -> SchedulerResult<()>;

    /// 阻塞出队，直到有消息可取或等待超时。
    /// 取出的消息进入in-flight状态，在可见性超时内对其他消费者不可见。
    async fn dequeue(&self, queue: &str, wait: Duration) -> SchedulerResult<Option<QueueMessage>>;

    /// 确认消息，彻底移除。终态落盘之后才调用（late-ack）。
    async fn ack(&self, queue: &str, message_id: &str) -> SchedulerResult<()>;

    /// 否定确认。requeue 为真时消息立即重新可见。
    async fn nack(&self, queue: &str, message_id: &str, requeue: bool) -> SchedulerResult<()>;

    /// 当前积压（就绪+延迟）消息数
    async fn queue_size(&self, queue: &str) -> SchedulerResult<u32>;

    /// 清空队列中未投递的消息
    async fn purge(&self, queue: &str) -> SchedulerResult<()>;
}
