//! 事件处理器（handler）
//!
//! - `IntegrationEventHandler<E>`：处理已知具体类型的事件；
//! - `DynamicIntegrationEventHandler`：仅按名称订阅、直接处理原始信封；
//! - `HandlerDescriptor`：登记在订阅表中的处理器描述（封闭的 Typed/Dynamic 两类）；
//! - `HandlerResolver`/`HandlerScope`：按单条消息的作用域解析处理器实例。
//!
mod descriptor;
mod resolver;

pub use descriptor::{HandlerDescriptor, HandlerType};
pub use resolver::{HandlerResolver, HandlerScope, ServiceRegistry};

use crate::integration_event::{IntegrationEvent, IntegrationEventEnvelope};
use async_trait::async_trait;

/// 强类型事件处理器
#[async_trait]
pub trait IntegrationEventHandler<E>: Send + Sync + 'static
where
    E: IntegrationEvent,
{
    async fn handle(&self, event: &E) -> anyhow::Result<()>;
}

/// 动态事件处理器：载荷类型在编译期未知，只拿到信封
#[async_trait]
pub trait DynamicIntegrationEventHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: &IntegrationEventEnvelope) -> anyhow::Result<()>;
}
