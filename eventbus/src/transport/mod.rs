//! 消息代理传输层抽象
//!
//! 总线只依赖这里的 `Transport`/`Connection`/`Channel` 三个 trait：
//! - 交换机/队列声明与绑定；
//! - 发布、带预取窗口的消费、ack/nack；
//! - 连接关闭通知。
//!
//! 具体代理客户端通过实现这些 trait 接入；内置 `InMemoryBroker`（feature `inmemory`）。
//!
#[cfg(feature = "inmemory")]
mod inmemory;

#[cfg(feature = "inmemory")]
pub use inmemory::{DeadLetter, InMemoryBroker, PublishedMessage};

use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;

/// 传输层错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("channel closed")]
    ChannelClosed,
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("{0}")]
    Other(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// 交换机类型
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeKind {
    /// 按路由键精确匹配
    Direct,
    /// 按 `*`/`#` 通配匹配
    Topic,
    /// 忽略路由键，投递到全部绑定队列
    Fanout,
}

/// 队列声明参数
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    /// 被拒绝（不重入队）的消息转投的交换机
    pub dead_letter_exchange: Option<String>,
}

/// 待发布消息
#[derive(Builder, Clone, Debug)]
pub struct OutgoingMessage {
    #[builder(into)]
    pub body: Vec<u8>,
    #[builder(into)]
    pub message_id: Option<String>,
    #[builder(into)]
    pub content_type: Option<String>,
    /// 代理重启后仍保留
    #[builder(default)]
    pub persistent: bool,
    pub timestamp: Option<DateTime<Utc>>,
}

/// 投递给消费者的消息
#[derive(Clone, Debug)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub message_id: Option<String>,
    /// 之前投递过但未被确认
    pub redelivered: bool,
}

/// 连接关闭原因
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 本端主动关闭
    ClosedByApplication,
    /// 代理侧关闭或网络中断
    ConnectionLost(String),
}

/// 到代理的连接工厂
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> TransportResult<Arc<dyn Connection>>;
}

/// 一条物理连接
#[async_trait]
pub trait Connection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> TransportResult<Arc<dyn Channel>>;

    /// 连接关闭时完成
    async fn closed(&self) -> ShutdownReason;

    async fn close(&self);
}

/// 连接上的逻辑信道
#[async_trait]
pub trait Channel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool)
    -> TransportResult<()>;

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> TransportResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
    -> TransportResult<()>;

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
    -> TransportResult<()>;

    /// 未确认消息的上限，0 表示不限
    async fn set_prefetch(&self, count: u16) -> TransportResult<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> TransportResult<()>;

    /// 开始消费；信道或连接关闭时流结束
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> TransportResult<BoxStream<'static, TransportResult<Delivery>>>;

    async fn ack(&self, delivery_tag: u64) -> TransportResult<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> TransportResult<()>;

    async fn close(&self);
}

/// 主题路由匹配：`*` 匹配一个单词，`#` 匹配零个或多个单词
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.split_first(), key.split_first()) {
            (None, None) => true,
            (Some((&"#", rest)), _) => {
                matches(rest, key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some((&"*", rest)), Some((_, key_rest))) => matches(rest, key_rest),
            (Some((word, rest)), Some((k, key_rest))) => word == k && matches(rest, key_rest),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_topic_matches() {
        assert!(topic_matches("OrderCreated", "OrderCreated"));
        assert!(!topic_matches("OrderCreated", "OrderShipped"));
    }

    #[test]
    fn wildcards_match_words() {
        assert!(topic_matches("order.*", "order.created"));
        assert!(!topic_matches("order.*", "order.created.v2"));
        assert!(topic_matches("order.#", "order.created.v2"));
        assert!(topic_matches("order.#", "order"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.created", "order.created"));
    }

    #[test]
    fn outgoing_message_defaults() {
        let msg = OutgoingMessage::builder().body(b"{}".to_vec()).build();
        assert!(!msg.persistent);
        assert!(msg.message_id.is_none());

        let msg = OutgoingMessage::builder()
            .body(Vec::new())
            .message_id("m-1")
            .persistent(true)
            .build();
        assert_eq!(msg.message_id.as_deref(), Some("m-1"));
        assert!(msg.persistent);
    }
}
