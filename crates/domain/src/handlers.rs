use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::retry::{RetryPolicy, TaskError};

/// 进度发射器：处理器通过它上报进度，由Worker侧转发到Status Tracker。
/// 发送永不阻塞，接收端关闭后静默丢弃。
#[derive(Debug, Clone)]
pub struct ProgressEmitter {
    tx: mpsc::UnboundedSender<serde_json::Value>,
}

impl ProgressEmitter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<serde_json::Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// 测试和非执行场景下的空发射器
    pub fn discard() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn emit(&self, payload: serde_json::Value) {
        let _ = self.tx.send(payload);
    }
}

/// 任务执行上下文：软超时与取消都是建议性信号，由处理器自行轮询。
/// 硬超时由外层运行时强制执行，不经过此上下文。
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub attempt: u32,
    pub progress: ProgressEmitter,
    soft_deadline: Instant,
    cancelled: Arc<AtomicBool>,
}

impl TaskContext {
    pub fn new(
        task_id: String,
        attempt: u32,
        soft_time_limit: Duration,
        cancelled: Arc<AtomicBool>,
        progress: ProgressEmitter,
    ) -> Self {
        Self {
            task_id,
            attempt,
            progress,
            soft_deadline: Instant::now() + soft_time_limit,
            cancelled,
        }
    }

    /// 软超时是否已过。处理器应当在检查点轮询并主动退出。
    pub fn soft_limit_exceeded(&self) -> bool {
        Instant::now() >= self.soft_deadline
    }

    /// 控制面是否请求了取消
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// 软超时或取消，处理器退出检查点的统一判断
    pub fn should_stop(&self) -> bool {
        self.soft_limit_exceeded() || self.is_cancelled()
    }
}

/// 任务处理器接口。核心对处理器内部做什么完全无感知；
/// 处理器必须容忍同一信封的重复调用（至少一次语义）。
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// 处理器名称，即其负责的任务类型
    fn name(&self) -> &str;

    async fn execute(
        &self,
        args: &serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, TaskError>;
}

/// 处理器注册表：任务类型到处理器的显式映射，启动时填充。
/// 按字符串名称动态分发，不做任何运行时反射。
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn TaskHandler>) {
        let name = handler.name().to_string();
        info!("注册任务处理器: {}", name);
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.insert(name.clone(), handler).is_some() {
            warn!("任务处理器 {} 被重复注册，旧处理器已被覆盖", name);
        }
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.contains_key(task_type)
    }

    pub fn names(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// 在注册时组合出的内联重试适配器：对瞬态错误在同一次队列投递内
/// 做有界的快速重试，避免为抖动级故障付出整轮重新入队的代价。
/// 队列级的跨投递重试仍由Worker按 RetryPolicy 处理。
pub struct RetryingHandler {
    inner: Arc<dyn TaskHandler>,
    policy: RetryPolicy,
    max_inline_attempts: u32,
}

impl RetryingHandler {
    pub fn wrap(inner: Arc<dyn TaskHandler>, policy: RetryPolicy, max_inline_attempts: u32) -> Self {
        Self {
            inner,
            policy,
            max_inline_attempts,
        }
    }
}

#[async_trait]
impl TaskHandler for RetryingHandler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, TaskError> {
        let mut last_error = None;

        for inline_attempt in 0..self.max_inline_attempts.max(1) {
            if ctx.should_stop() {
                break;
            }

            match self.inner.execute(args, ctx).await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    let delay = self.policy.next_delay(inline_attempt, err.class);
                    last_error = Some(err);
                    match delay {
                        Some(delay) if inline_attempt + 1 < self.max_inline_attempts => {
                            debug!(
                                "任务 {} 内联重试 {}/{}，延迟 {:?}",
                                ctx.task_id,
                                inline_attempt + 1,
                                self.max_inline_attempts,
                                delay
                            );
                            tokio::time::sleep(delay).await;
                        }
                        _ => break,
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| TaskError::permanent("处理器在执行前被取消或软超时")))
    }
}
