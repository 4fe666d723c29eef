//! 事件总线
//!
//! - `EventBus`：发布/订阅/消费控制的统一接口；
//! - `BrokerEventBus`：基于消息代理（topic 交换机 + 单一持久化队列）的实现；
//! - `ConsumerState`/`DispatchOutcome`：消费循环的状态与逐条处理结果，可被观测。
//!
mod broker_bus;
mod consumer;
mod outcome;

pub use broker_bus::BrokerEventBus;
pub use outcome::{DispatchOutcome, Disposition, HandlerOutcome};

use crate::error::EventBusResult;
use crate::handler::{DynamicIntegrationEventHandler, IntegrationEventHandler};
use crate::integration_event::IntegrationEvent;
use async_trait::async_trait;

/// 消费循环状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerState {
    /// 尚未开始消费
    Idle,
    Consuming,
    /// 已停止接收新消息，等待在途处理结束
    Draining,
    /// 消费信道丢失，正在重建
    Reconnecting,
    Stopped,
}

/// 集成事件总线
#[async_trait]
pub trait EventBus: Send + Sync {
    /// 发布事件；瞬时连接故障按发布重试策略退避重试
    async fn publish<E>(&self, event: &E) -> EventBusResult<()>
    where
        E: IntegrationEvent;

    /// 订阅强类型事件；该事件名的首个订阅会在代理侧建立绑定
    async fn subscribe<E, H>(&self) -> EventBusResult<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>;

    /// 按名称订阅，处理器接收原始信封
    async fn subscribe_dynamic<H>(&self, event_name: &str) -> EventBusResult<()>
    where
        H: DynamicIntegrationEventHandler;

    /// 取消订阅；最后一个订阅移除后解除代理侧绑定
    async fn unsubscribe<E, H>(&self) -> EventBusResult<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>;

    async fn unsubscribe_dynamic<H>(&self, event_name: &str) -> EventBusResult<()>
    where
        H: DynamicIntegrationEventHandler;

    /// 开始消费；重复调用无副作用
    async fn start_consuming(&self) -> EventBusResult<()>;

    /// 停止消费，在宽限期内等待在途消息处理完成
    async fn stop_consuming(&self) -> EventBusResult<()>;
}
