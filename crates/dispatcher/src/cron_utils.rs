use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

use taskflow_errors::{SchedulerError, SchedulerResult};

/// CRON表达式解析和触发时间计算工具
pub struct CronScheduler {
    schedule: Schedule,
}

impl CronScheduler {
    pub fn new(cron_expr: &str) -> SchedulerResult<Self> {
        let schedule = Schedule::from_str(cron_expr).map_err(|e| SchedulerError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { schedule })
    }

    /// 验证CRON表达式是否有效
    pub fn validate_cron_expression(cron_expr: &str) -> SchedulerResult<()> {
        Schedule::from_str(cron_expr).map_err(|e| SchedulerError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    /// 获取下一次触发时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    /// 查找 (from, to] 区间内最后一个触发时间点。
    /// Scheduler用它判断当前tick窗口内是否有到期的CRON触发。
    pub fn last_occurrence_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let mut last = None;
        for occurrence in self.schedule.after(&from) {
            if occurrence > to {
                break;
            }
            last = Some(occurrence);
        }
        last
    }

    /// 下次触发距now的时长
    pub fn time_until_next_execution(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.schedule.after(&now).next().map(|next| next - now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_validate_expression() {
        assert!(CronScheduler::validate_cron_expression("0 * * * * *").is_ok());
        assert!(CronScheduler::validate_cron_expression("not a cron").is_err());
    }

    #[test]
    fn test_next_execution_time() {
        // 每分钟的第0秒
        let scheduler = CronScheduler::new("0 * * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 30).unwrap();
        let next = scheduler.next_execution_time(from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 10, 1, 0).unwrap());
    }

    #[test]
    fn test_last_occurrence_between() {
        let scheduler = CronScheduler::new("0 * * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 30).unwrap();
        let to = Utc.with_ymd_and_hms(2026, 1, 1, 10, 3, 30).unwrap();
        let last = scheduler.last_occurrence_between(from, to).unwrap();
        assert_eq!(last, Utc.with_ymd_and_hms(2026, 1, 1, 10, 3, 0).unwrap());

        // 区间内没有触发点
        let narrow_from = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 10).unwrap();
        let narrow_to = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 50).unwrap();
        assert!(scheduler
            .last_occurrence_between(narrow_from, narrow_to)
            .is_none());
    }
}
