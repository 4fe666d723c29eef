//! 订阅管理
//!
//! 维护 事件名 → 处理器列表 以及 事件名 → 事件类型 两张表，
//! 供总线在收到消息时查找处理器并解码载荷。
//!
mod manager;
mod subscription;

pub use manager::{SubscriptionChange, SubscriptionManager};
pub use subscription::{EventTypeInfo, Subscription};

pub(crate) use subscription::DispatchInput;
