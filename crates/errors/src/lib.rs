use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("未知队列: {name}")]
    UnknownQueue { name: String },
    #[error("未知任务类型: {task_type}")]
    UnknownTaskType { task_type: String },
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("非法状态转换: 任务 {id} 无法从 {from} 转换到 {to}")]
    IllegalTransition {
        id: String,
        from: String,
        to: String,
    },
    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("Worker无可用执行器: 任务类型 {task_type}")]
    WorkerUnavailable { task_type: String },
    #[error("消息队列错误: {0}")]
    MessageQueue(String),
    #[error("状态存储错误: {0}")]
    Store(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn unknown_queue<S: Into<String>>(name: S) -> Self {
        Self::UnknownQueue { name: name.into() }
    }
    pub fn unknown_task_type<S: Into<String>>(task_type: S) -> Self {
        Self::UnknownTaskType {
            task_type: task_type.into(),
        }
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn illegal_transition<S: Into<String>>(id: S, from: &str, to: &str) -> Self {
        Self::IllegalTransition {
            id: id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
    pub fn queue_error<S: Into<String>>(msg: S) -> Self {
        Self::MessageQueue(msg.into())
    }
    pub fn store_error<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 基础设施层的瞬态故障，调用方可以安全重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::MessageQueue(_)
                | SchedulerError::Store(_)
                | SchedulerError::Timeout(_)
        )
    }

    /// 提交时同步返回的校验类错误，不会进入队列
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SchedulerError::UnknownQueue { .. }
                | SchedulerError::UnknownTaskType { .. }
                | SchedulerError::ValidationError(_)
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
