//! 集成事件总线（eventbus）
//!
//! 服务之间通过消息代理交换集成事件：
//! - 集成事件契约与线上信封（`integration_event`）
//! - 订阅管理：事件名 → 处理器列表、事件名 → 事件类型（`subscription`）
//! - 处理器契约与按消息作用域的解析（`handler`）
//! - 可自愈的代理连接（`connection`）与传输层抽象（`transport`）
//! - 发布/订阅/消费编排（`bus`）
//!
//! 投递语义为至少一次，处理器应当幂等。
//!
//! 典型用法：
//! 1. 用 `#[integration_event(name = "...")]` 定义事件；
//! 2. 为事件实现 `IntegrationEventHandler` 并注册到 `ServiceRegistry`；
//! 3. 以 `BrokerEventBus::builder()` 构建总线，`start_consuming` 后 `subscribe`；
//! 4. 关停时 `stop_consuming` 等待在途消息处理完毕。
//!
pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod integration_event;
pub mod subscription;
pub mod transport;

pub use bus::{BrokerEventBus, ConsumerState, DispatchOutcome, EventBus};
pub use config::{EventBusConfig, RetryPolicy};
pub use error::{EventBusError, EventBusResult};
pub use handler::{
    DynamicIntegrationEventHandler, HandlerDescriptor, HandlerResolver, IntegrationEventHandler,
    ServiceRegistry,
};
pub use integration_event::{IntegrationEvent, IntegrationEventEnvelope};
pub use subscription::SubscriptionManager;

#[doc(hidden)]
pub mod __private {
    pub use chrono::{DateTime, Utc};
    pub use uuid::Uuid;
}

// 允许在本 crate 内部通过 ::eventbus 自引用，
// 以便过程宏生成的代码在单元测试中也能解析。
extern crate self as eventbus;
