//! 对账引擎模块
//!
//! 把本地乐观变更与异步到达的服务端权威事件合并为同一条有序、
//! 去重的状态时间线。对通知、消息、连接请求三类实体通用。

mod engine;

pub use engine::{EngineState, Reconcilable, ReconciliationEngine, RemoteEvent, RemoteOutcome};
