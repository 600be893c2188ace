//! 执行侧组件：队列消费、处理器执行与心跳上报。
//!
//! [`WorkerService`] 实现至少一次语义下的安全执行：认领前复核
//! 状态机丢弃重复与已撤销的消息，状态落盘之后才确认队列消息，
//! 崩溃留下的未确认消息靠传输层可见性超时重投。

pub mod heartbeat;
pub mod service;

pub use heartbeat::HeartbeatReporter;
pub use service::{WorkerService, WorkerServiceBuilder};
