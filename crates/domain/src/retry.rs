use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 执行错误分类，驱动重试决策
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorClass {
    /// 瞬态故障（网络抖动、上游限流等），可重试
    Transient,
    /// 软/硬超时，可重试
    Timeout,
    /// 永久性失败（参数错误、业务拒绝），不重试
    Permanent,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::Permanent)
    }
}

/// 任务处理器返回的执行错误，永远不会传播回提交方
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TaskError {
    pub class: ErrorClass,
    pub message: String,
}

impl TaskError {
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self {
            class: ErrorClass::Timeout,
            message: message.into(),
        }
    }
}

/// 重试退避策略：(尝试序号, 错误分类) 到重试决策的纯函数映射
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 基础重试间隔（秒）
    pub base_delay_seconds: u64,
    /// 重试间隔上限（秒）
    pub max_delay_seconds: u64,
    /// 指数退避倍数
    pub multiplier: f64,
    /// 是否叠加随机抖动，避免重试风暴相互踩踏
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_seconds: 60,
            max_delay_seconds: 600,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// 计算下一次重试的延迟。不可重试的错误分类返回 None。
    /// delay = min(base * multiplier^attempt + jitter, cap)，jitter 均匀分布于 [0, 计算值)。
    pub fn next_delay(&self, attempt: u32, class: ErrorClass) -> Option<Duration> {
        if !class.is_retryable() {
            return None;
        }

        let base = self.base_delay_seconds as f64;
        let cap = self.max_delay_seconds as f64;
        let exponential = base * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);

        let jitter = if self.jitter && exponential > 0.0 {
            rand::random::<f64>() * exponential
        } else {
            0.0
        };

        let delay = (exponential + jitter).min(cap);
        Some(Duration::from_secs_f64(delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay_seconds: 60,
            max_delay_seconds: 600,
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_permanent_never_retries() {
        let policy = RetryPolicy::default();
        assert!(policy.next_delay(0, ErrorClass::Permanent).is_none());
        assert!(policy.next_delay(5, ErrorClass::Permanent).is_none());
    }

    #[test]
    fn test_exponential_growth_until_cap() {
        let policy = no_jitter_policy();
        let mut previous = Duration::ZERO;
        // 无抖动时延迟单调不减，直至到达上限
        for attempt in 0..8 {
            let delay = policy.next_delay(attempt, ErrorClass::Transient).unwrap();
            assert!(delay >= previous, "attempt {attempt} 的延迟出现回退");
            assert!(delay <= Duration::from_secs(600));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(600));
    }

    #[test]
    fn test_exact_curve_without_jitter() {
        let policy = no_jitter_policy();
        assert_eq!(
            policy.next_delay(0, ErrorClass::Transient).unwrap(),
            Duration::from_secs(60)
        );
        assert_eq!(
            policy.next_delay(1, ErrorClass::Timeout).unwrap(),
            Duration::from_secs(120)
        );
        assert_eq!(
            policy.next_delay(2, ErrorClass::Transient).unwrap(),
            Duration::from_secs(240)
        );
        // 60 * 2^4 = 960，封顶到600
        assert_eq!(
            policy.next_delay(4, ErrorClass::Transient).unwrap(),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.next_delay(1, ErrorClass::Transient).unwrap();
            // 指数值120s，抖动上限1倍，再封顶600s
            assert!(delay >= Duration::from_secs(120));
            assert!(delay <= Duration::from_secs(600));
        }
    }

    #[test]
    fn test_zero_base_gives_immediate_retry() {
        let policy = RetryPolicy {
            base_delay_seconds: 0,
            max_delay_seconds: 600,
            multiplier: 2.0,
            jitter: true,
        };
        let delay = policy.next_delay(3, ErrorClass::Transient).unwrap();
        assert_eq!(delay, Duration::ZERO);
    }
}
