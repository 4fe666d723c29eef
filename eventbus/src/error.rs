//! 事件总线统一错误定义
//!
//! 覆盖连接、发布、订阅登记、消息分发与配置等最小必要集合，
//! 便于调用方按类别决定重试、补偿或直接暴露为编程错误。
//!
use crate::transport::TransportError;
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EventBusError {
    // --- 连接/发布 ---
    #[error("connection unavailable after {attempts} attempt(s): {reason}")]
    ConnectionUnavailable { attempts: u32, reason: String },
    #[error("publish failed: event={event_name}, attempts={attempts}: {source}")]
    PublishFailed {
        event_name: String,
        attempts: u32,
        #[source]
        source: Box<EventBusError>,
    },

    // --- 订阅登记 ---
    #[error("already subscribed: event={event_name}, handler={handler}")]
    AlreadySubscribed { event_name: String, handler: String },
    #[error("subscription not found: event={event_name}, handler={handler}")]
    SubscriptionNotFound { event_name: String, handler: String },
    #[error("unknown event type: {event_name}")]
    UnknownEventType { event_name: String },
    #[error("type mismatch: event={event_name}, expected={expected}, found={found}")]
    TypeMismatch {
        event_name: String,
        expected: String,
        found: String,
    },

    // --- 分发处理 ---
    #[error("handler not registered: {handler}")]
    HandlerNotRegistered { handler: String },
    #[error("handler invocation failed: event={event_name}, handler={handler}, reason={reason}")]
    HandlerInvocationFailed {
        event_name: String,
        handler: String,
        reason: String,
    },

    // --- 序列化/传输/配置 ---
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("invalid config: {reason}")]
    Config { reason: String },
}

impl EventBusError {
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// 连接类错误在操作层面可重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionUnavailable { .. } | Self::Transport(_)
        )
    }
}

/// 统一 Result 类型别名
pub type EventBusResult<T> = Result<T, EventBusError>;

impl From<std::num::ParseIntError> for EventBusError {
    fn from(err: std::num::ParseIntError) -> Self {
        EventBusError::Config {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_retryable() {
        let err = EventBusError::ConnectionUnavailable {
            attempts: 3,
            reason: "refused".into(),
        };
        assert!(err.is_retryable());
        assert!(EventBusError::from(TransportError::ConnectionClosed).is_retryable());
    }

    #[test]
    fn registry_misuse_is_not_retryable() {
        let err = EventBusError::AlreadySubscribed {
            event_name: "OrderCreated".into(),
            handler: "H1".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "already subscribed: event=OrderCreated, handler=H1"
        );
    }

    #[test]
    fn publish_failed_keeps_source() {
        let err = EventBusError::PublishFailed {
            event_name: "OrderCreated".into(),
            attempts: 2,
            source: Box::new(EventBusError::ConnectionUnavailable {
                attempts: 5,
                reason: "down".into(),
            }),
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("connection unavailable after 5 attempt(s): down")
        );
    }
}
