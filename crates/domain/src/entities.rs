use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskflow_errors::{SchedulerError, SchedulerResult};
use uuid::Uuid;

/// 队列允许的最大优先级上限
pub const MAX_PRIORITY: u8 = 10;

/// 任务信封：提交到队列的一个工作单元的完整描述。
/// 除了重试时递增的 attempt 计数（记录在 QueueMessage 与 TaskRecord 上）之外不可变。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: String,
    pub task_type: String,
    /// 不透明的任务参数，由领域协作方解释
    pub args: serde_json::Value,
    pub queue: String,
    /// 0-10，数值越大越先出队
    pub priority: u8,
    /// 延迟可见时间，为空表示立即可见
    pub eta: Option<DateTime<Utc>>,
    pub max_retries: u32,
    /// 软超时（秒）：建议性，由处理器自行轮询
    pub soft_time_limit_seconds: u64,
    /// 硬超时（秒）：强制性，超时后执行上下文被强行中断
    pub hard_time_limit_seconds: u64,
}

impl TaskEnvelope {
    pub fn new<S1: Into<String>, S2: Into<String>>(task_type: S1, queue: S2) -> Self {
        Self {
            id: String::new(),
            task_type: task_type.into(),
            args: serde_json::Value::Null,
            queue: queue.into(),
            priority: 0,
            eta: None,
            max_retries: 0,
            soft_time_limit_seconds: 240,
            hard_time_limit_seconds: 300,
        }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_time_limits(mut self, soft_seconds: u64, hard_seconds: u64) -> Self {
        self.soft_time_limit_seconds = soft_seconds;
        self.hard_time_limit_seconds = hard_seconds;
        self
    }

    /// 确保信封有id，没有则生成
    pub fn ensure_id(&mut self) -> &str {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        &self.id
    }

    /// 结构性校验。队列存在性与任务类型注册检查由 Dispatcher 完成。
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.task_type.is_empty() {
            return Err(SchedulerError::validation_error("任务类型不能为空"));
        }
        if self.priority > MAX_PRIORITY {
            return Err(SchedulerError::validation_error(format!(
                "优先级 {} 超出上限 {}",
                self.priority, MAX_PRIORITY
            )));
        }
        // 硬超时必须有界，避免任务无限期占用执行槽位
        if self.hard_time_limit_seconds == 0 {
            return Err(SchedulerError::validation_error("硬超时必须大于0"));
        }
        if self.soft_time_limit_seconds > self.hard_time_limit_seconds {
            return Err(SchedulerError::validation_error(format!(
                "软超时 {}s 不能大于硬超时 {}s",
                self.soft_time_limit_seconds, self.hard_time_limit_seconds
            )));
        }
        Ok(())
    }
}

/// 任务生命周期状态。转换只能向前，终态不可再变。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskState {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "RETRYING")]
    Retrying,
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "REVOKED")]
    Revoked,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Revoked
        )
    }

    /// 合法转换表。RETRYING→RUNNING 可循环；RUNNING→RUNNING 仅用于
    /// 可见性超时后对疑似崩溃Worker持有的任务重新认领。
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Pending, Running) | (Pending, Revoked) => true,
            (Running, Succeeded) | (Running, Failed) | (Running, Retrying) => true,
            (Running, Revoked) | (Running, Running) => true,
            (Retrying, Running) | (Retrying, Revoked) | (Retrying, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Retrying => "RETRYING",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
            TaskState::Revoked => "REVOKED",
        }
    }
}

/// 任务记录：Status Tracker 持有的任务生命周期视图。
/// 所有状态变更必须经过 StatusTracker::transition 的CAS写入门。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub envelope: TaskEnvelope,
    pub state: TaskState,
    /// 当前执行的尝试序号，从0开始
    pub attempt: u32,
    pub last_error: Option<String>,
    pub progress: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(envelope: TaskEnvelope) -> Self {
        let now = Utc::now();
        Self {
            envelope,
            state: TaskState::Pending,
            attempt: 0,
            last_error: None,
            progress: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.envelope.id
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// 终态记录的保留期是否已过
    pub fn is_expired(&self, ttl_seconds: i64, now: DateTime<Utc>) -> bool {
        self.is_terminal() && (now - self.updated_at).num_seconds() > ttl_seconds
    }
}

/// 定时调度条目，由调度表维护，Worker只读
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    pub task_type: String,
    pub args_template: serde_json::Value,
    pub trigger: Trigger,
    pub queue: String,
    pub enabled: bool,
}

/// 调度触发方式
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Trigger {
    /// CRON表达式（秒级，cron crate 语法）
    Cron { expr: String },
    /// 固定间隔（秒）
    Interval { seconds: u64 },
}

impl ScheduleEntry {
    pub fn interval<S1: Into<String>, S2: Into<String>>(
        name: S1,
        task_type: S2,
        queue: &str,
        seconds: u64,
    ) -> Self {
        Self {
            name: name.into(),
            task_type: task_type.into(),
            args_template: serde_json::Value::Null,
            trigger: Trigger::Interval { seconds },
            queue: queue.to_string(),
            enabled: true,
        }
    }

    pub fn cron<S1: Into<String>, S2: Into<String>>(
        name: S1,
        task_type: S2,
        queue: &str,
        expr: &str,
    ) -> Self {
        Self {
            name: name.into(),
            task_type: task_type.into(),
            args_template: serde_json::Value::Null,
            trigger: Trigger::Cron {
                expr: expr.to_string(),
            },
            queue: queue.to_string(),
            enabled: true,
        }
    }
}

/// Worker描述符：由心跳维护的瞬态信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub worker_id: String,
    pub active_task_ids: Vec<String>,
    pub registered_types: Vec<String>,
    pub max_concurrent_tasks: usize,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerDescriptor {
    pub fn is_stale(&self, timeout_seconds: i64, now: DateTime<Utc>) -> bool {
        (now - self.last_heartbeat).num_seconds() > timeout_seconds
    }

    pub fn load_percentage(&self) -> f64 {
        if self.max_concurrent_tasks == 0 {
            0.0
        } else {
            (self.active_task_ids.len() as f64 / self.max_concurrent_tasks as f64) * 100.0
        }
    }
}

/// 队列描述符：静态路由表的一行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub name: String,
    /// 可选的任务类型匹配规则，支持 "prefix.*" 形式的后缀通配
    pub routing_rule: Option<String>,
    pub max_priority: u8,
}

impl QueueDescriptor {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            routing_rule: None,
            max_priority: MAX_PRIORITY,
        }
    }

    pub fn with_routing_rule<S: Into<String>>(mut self, rule: S) -> Self {
        self.routing_rule = Some(rule.into());
        self
    }

    pub fn with_max_priority(mut self, max_priority: u8) -> Self {
        self.max_priority = max_priority;
        self
    }

    /// 路由规则是否匹配给定任务类型
    pub fn matches_task_type(&self, task_type: &str) -> bool {
        match &self.routing_rule {
            None => false,
            Some(rule) => {
                if let Some(prefix) = rule.strip_suffix('*') {
                    task_type.starts_with(prefix)
                } else {
                    rule == task_type
                }
            }
        }
    }
}

/// 队列传输层的线上消息：信封加上投递元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub envelope: TaskEnvelope,
    /// 本次投递对应的尝试序号
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn new(envelope: TaskEnvelope, attempt: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            envelope,
            attempt,
            enqueued_at: Utc::now(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.envelope.id
    }

    pub fn serialize(&self) -> SchedulerResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn deserialize(json: &str) -> SchedulerResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_validate() {
        let mut envelope = TaskEnvelope::new("crawl_page", "crawl");
        assert!(envelope.validate().is_ok());

        envelope.priority = 11;
        assert!(envelope.validate().is_err());
        envelope.priority = 10;
        assert!(envelope.validate().is_ok());

        envelope.hard_time_limit_seconds = 0;
        assert!(envelope.validate().is_err());

        envelope.hard_time_limit_seconds = 60;
        envelope.soft_time_limit_seconds = 120;
        assert!(envelope.validate().is_err());
    }

    #[test]
    fn test_envelope_ensure_id() {
        let mut envelope = TaskEnvelope::new("noop", "default");
        assert!(envelope.id.is_empty());
        let id = envelope.ensure_id().to_string();
        assert!(!id.is_empty());
        // 已有id时保持不变
        assert_eq!(envelope.ensure_id(), id);
    }

    #[test]
    fn test_state_transitions_forward_only() {
        use TaskState::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Revoked));
        assert!(!Pending.can_transition_to(Succeeded));

        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Retrying));
        assert!(Running.can_transition_to(Revoked));
        assert!(Running.can_transition_to(Running));

        assert!(Retrying.can_transition_to(Running));
        assert!(Retrying.can_transition_to(Failed));

        // 终态不可再转换
        for terminal in [Succeeded, Failed, Revoked] {
            for next in [Pending, Running, Retrying, Succeeded, Failed, Revoked] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_record_expiry() {
        let mut record = TaskRecord::new(TaskEnvelope::new("noop", "default"));
        let now = Utc::now();
        record.updated_at = now - chrono::Duration::seconds(120);
        // 非终态永不过期
        assert!(!record.is_expired(60, now));
        record.state = TaskState::Succeeded;
        assert!(record.is_expired(60, now));
        assert!(!record.is_expired(600, now));
    }

    #[test]
    fn test_queue_routing_rule() {
        let queue = QueueDescriptor::new("crawl").with_routing_rule("crawl.*");
        assert!(queue.matches_task_type("crawl.page"));
        assert!(queue.matches_task_type("crawl.sitemap"));
        assert!(!queue.matches_task_type("generate.post"));

        let exact = QueueDescriptor::new("maintenance").with_routing_rule("purge_expired");
        assert!(exact.matches_task_type("purge_expired"));
        assert!(!exact.matches_task_type("purge"));
    }

    #[test]
    fn test_message_round_trip() {
        let envelope = TaskEnvelope::new("crawl_page", "crawl")
            .with_args(serde_json::json!({"url": "https://example.com"}));
        let message = QueueMessage::new(envelope, 2);
        let json = message.serialize().unwrap();
        let parsed = QueueMessage::deserialize(&json).unwrap();
        assert_eq!(parsed.id, message.id);
        assert_eq!(parsed.attempt, 2);
        assert_eq!(parsed.envelope.task_type, "crawl_page");
    }
}
