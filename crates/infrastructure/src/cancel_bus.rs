use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, RwLock};
use tracing::debug;

/// 单个运行中任务的取消信号。flag是处理器轮询的建议性视图，
/// notify用于唤醒在取消点select的Worker。
#[derive(Clone)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelSignal {
    fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// 处理器上下文共享的建议性标志
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    /// 等待取消请求到来。已取消则立即返回。
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    fn fire(&self) {
        self.flag.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }
}

/// RUNNING任务的尽力取消信号总线。Worker在认领任务时注册，
/// 控制面通过它向正在执行的任务发送终止请求。
#[derive(Default)]
pub struct CancelBus {
    signals: RwLock<HashMap<String, CancelSignal>>,
}

impl CancelBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Worker认领任务时注册信号
    pub async fn register(&self, task_id: &str) -> CancelSignal {
        let signal = CancelSignal::new();
        let mut signals = self.signals.write().await;
        signals.insert(task_id.to_string(), signal.clone());
        signal
    }

    /// 执行结束后注销
    pub async fn deregister(&self, task_id: &str) {
        let mut signals = self.signals.write().await;
        signals.remove(task_id);
    }

    /// 向正在运行的任务发送取消请求。任务未注册时返回false，
    /// 调用方据此知道信号未被任何Worker收到。
    pub async fn cancel(&self, task_id: &str) -> bool {
        let signals = self.signals.read().await;
        match signals.get(task_id) {
            Some(signal) => {
                debug!("向任务 {} 发送取消信号", task_id);
                signal.fire();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let bus = Arc::new(CancelBus::new());
        let signal = bus.register("t1").await;

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move {
                signal.cancelled().await;
                true
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(bus.cancel("t1").await);

        let woke = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("等待方应被唤醒")
            .unwrap();
        assert!(woke);
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_unregistered_returns_false() {
        let bus = CancelBus::new();
        assert!(!bus.cancel("missing").await);
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_fired() {
        let bus = CancelBus::new();
        let signal = bus.register("t1").await;
        bus.cancel("t1").await;
        // 已取消时不等待
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("已取消的信号应立即返回");
    }

    #[tokio::test]
    async fn test_deregister_removes_signal() {
        let bus = CancelBus::new();
        bus.register("t1").await;
        bus.deregister("t1").await;
        assert!(!bus.cancel("t1").await);
    }
}
