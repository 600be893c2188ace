use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use taskflow_domain::{WorkerDescriptor, WorkerRegistry};

/// 心跳上报器：按固定间隔把本节点的负载快照写入注册表。
/// 每次心跳是整条描述符的upsert，注册表侧据此判断节点存活。
pub struct HeartbeatReporter {
    worker_id: String,
    registry: Arc<dyn WorkerRegistry>,
    running: Arc<RwLock<HashSet<String>>>,
    registered_types: Vec<String>,
    max_concurrent_tasks: usize,
    interval: Duration,
}

impl HeartbeatReporter {
    pub fn new(
        worker_id: String,
        registry: Arc<dyn WorkerRegistry>,
        running: Arc<RwLock<HashSet<String>>>,
        registered_types: Vec<String>,
        max_concurrent_tasks: usize,
        interval: Duration,
    ) -> Self {
        Self {
            worker_id,
            registry,
            running,
            registered_types,
            max_concurrent_tasks,
            interval,
        }
    }

    async fn snapshot(&self) -> WorkerDescriptor {
        let active_task_ids: Vec<String> = self.running.read().await.iter().cloned().collect();
        WorkerDescriptor {
            worker_id: self.worker_id.clone(),
            active_task_ids,
            registered_types: self.registered_types.clone(),
            max_concurrent_tasks: self.max_concurrent_tasks,
            last_heartbeat: Utc::now(),
        }
    }

    /// 先注册再进心跳循环，退出时注销登记
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if let Err(e) = self.registry.register(&self.snapshot().await).await {
            warn!("Worker {} 注册失败: {}", self.worker_id, e);
        } else {
            info!("Worker {} 已注册, 心跳间隔 {:?}", self.worker_id, self.interval);
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // 首个tick立即返回，注册已覆盖

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let descriptor = self.snapshot().await;
                    match self.registry.heartbeat(&descriptor).await {
                        Ok(()) => debug!(
                            "心跳: worker={}, active={}/{}",
                            self.worker_id,
                            descriptor.active_task_ids.len(),
                            self.max_concurrent_tasks
                        ),
                        Err(e) => warn!("Worker {} 心跳失败: {}", self.worker_id, e),
                    }
                }
            }
        }

        if let Err(e) = self.registry.unregister(&self.worker_id).await {
            warn!("Worker {} 注销失败: {}", self.worker_id, e);
        } else {
            info!("Worker {} 已注销", self.worker_id);
        }
    }
}
