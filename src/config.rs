use std::path::Path;

use serde::{Deserialize, Serialize};

use taskflow_domain::{QueueDescriptor, RetryPolicy};
use taskflow_errors::{SchedulerError, SchedulerResult};

/// 引擎配置。所有字段都有可用的默认值，零配置即可启动。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 队列路由表
    pub queues: Vec<QueueConfig>,
    /// 信封未指定队列时的兜底队列
    pub default_queue: String,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub retention: RetentionSettings,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    /// 任务类型匹配规则，支持后缀通配（如 "crawl.*"）
    pub routing_rule: Option<String>,
    pub max_priority: u8,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            routing_rule: None,
            max_priority: taskflow_domain::MAX_PRIORITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 空则自动生成 "{hostname}-{uuid}"
    pub worker_id: String,
    /// 订阅的队列，空则订阅路由表全部队列
    pub queues: Vec<String>,
    pub max_concurrent_tasks: usize,
    pub poll_wait_ms: u64,
    pub heartbeat_interval_seconds: u64,
    /// 超过该时长无心跳判定节点失联
    pub heartbeat_timeout_seconds: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            queues: Vec::new(),
            max_concurrent_tasks: 5,
            poll_wait_ms: 1000,
            heartbeat_interval_seconds: 10,
            heartbeat_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_seconds: u64,
    pub max_delay_seconds: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            base_delay_seconds: policy.base_delay_seconds,
            max_delay_seconds: policy.max_delay_seconds,
            multiplier: policy.multiplier,
            jitter: policy.jitter,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay_seconds: self.base_delay_seconds,
            max_delay_seconds: self.max_delay_seconds,
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_seconds: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub terminal_ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            terminal_ttl_seconds: 3600,
            sweep_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub visibility_timeout_seconds: u64,
    pub wait_slice_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_seconds: 30,
            wait_slice_ms: 100,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            queues: vec![QueueConfig::default()],
            default_queue: "default".to_string(),
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            scheduler: SchedulerConfig::default(),
            retention: RetentionSettings::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从TOML文件加载，path为None时使用默认配置
    pub fn load(path: Option<&Path>) -> SchedulerResult<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    SchedulerError::config_error(format!(
                        "读取配置文件 {} 失败: {e}",
                        path.display()
                    ))
                })?;
                toml::from_str(&text).map_err(|e| {
                    SchedulerError::config_error(format!(
                        "解析配置文件 {} 失败: {e}",
                        path.display()
                    ))
                })?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.queues.is_empty() {
            return Err(SchedulerError::config_error("至少需要配置一个队列"));
        }
        if !self.queues.iter().any(|q| q.name == self.default_queue) {
            return Err(SchedulerError::config_error(format!(
                "默认队列 '{}' 不在队列配置中",
                self.default_queue
            )));
        }
        if self.worker.max_concurrent_tasks == 0 {
            return Err(SchedulerError::config_error("并发上限必须大于0"));
        }
        if self.scheduler.tick_interval_seconds == 0 {
            return Err(SchedulerError::config_error("调度tick间隔必须大于0"));
        }
        for queue in &self.worker.queues {
            if !self.queues.iter().any(|q| &q.name == queue) {
                return Err(SchedulerError::config_error(format!(
                    "Worker订阅的队列 '{queue}' 不在队列配置中"
                )));
            }
        }
        Ok(())
    }

    pub fn queue_descriptors(&self) -> Vec<QueueDescriptor> {
        self.queues
            .iter()
            .map(|q| {
                let mut descriptor =
                    QueueDescriptor::new(&q.name).with_max_priority(q.max_priority);
                if let Some(rule) = &q.routing_rule {
                    descriptor = descriptor.with_routing_rule(rule.clone());
                }
                descriptor
            })
            .collect()
    }

    /// Worker实际订阅的队列名
    pub fn worker_queues(&self) -> Vec<String> {
        if self.worker.queues.is_empty() {
            self.queues.iter().map(|q| q.name.clone()).collect()
        } else {
            self.worker.queues.clone()
        }
    }
}
