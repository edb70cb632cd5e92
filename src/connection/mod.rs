//! 连接请求模块
//!
//! 对等连接请求的小状态机：pending -> accepted | declined | cancelled。
//! 终态不可变，accept/decline/cancel 幂等；接受请求时恰好触发一次
//! "连接建立"副作用，供消息与通知子系统订阅。

mod lifecycle;
mod model;

pub use lifecycle::ConnectionLifecycle;
pub use model::{Connection, ConnectionRequest, ConnectionStatus};
