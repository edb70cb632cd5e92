//! 通知中心模块
//!
//! 在通用对账引擎上特化通知语义：未读角标推导、已读/未读迁移、
//! 过滤投影与容量淘汰。

mod center;
mod model;

pub use center::{NotificationCenter, NotificationDraft};
pub use model::{Notification, NotificationAction, NotificationCategory, NotificationPriority};
