//! 事件总线配置
//!
//! 所有参数在构造时给定，运行期不提供重新配置接口。
//!
use crate::error::{EventBusError, EventBusResult};
use bon::Builder;
use serde::Deserialize;
use std::time::Duration;

/// 指数退避重试策略
#[derive(Builder, Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 最大尝试次数（含首次）
    #[builder(default = 5)]
    pub max_attempts: u32,
    /// 首次重试前的等待
    #[builder(default = Duration::from_millis(200))]
    pub initial_delay: Duration,
    /// 单次等待上限
    #[builder(default = Duration::from_secs(5))]
    pub max_delay: Duration,
    /// 每次失败后的增长倍数
    #[builder(default = 2.0)]
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// 发布侧默认策略：次数少、间隔短，吸收瞬时抖动
    pub fn publish_default() -> Self {
        Self::builder()
            .max_attempts(3)
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .build()
    }

    /// 计算下一次等待时长，结果不超过 `max_delay`
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms).min(self.max_delay)
    }

    /// 依次产出每次失败后的等待时长（共 `max_attempts - 1` 个）
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let first = self.initial_delay.min(self.max_delay);
        std::iter::successors(Some(first), move |d| Some(self.next_delay(*d)))
            .take(self.max_attempts.saturating_sub(1) as usize)
    }
}

/// 事件总线配置
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// broker 地址
    pub broker_url: String,
    /// topic 交换机名称
    pub exchange_name: String,
    /// 本服务的队列名（每个逻辑服务一个持久队列）
    pub queue_name: String,
    /// 交换机与队列是否持久化
    pub durable: bool,
    /// 消费端未确认消息的窗口上限
    pub prefetch_count: u16,
    /// 毒消息的死信交换机；为空时由 broker 直接丢弃
    pub dead_letter_exchange: Option<String>,
    /// 建立连接的重试策略
    pub connect_retry: RetryPolicy,
    /// 发布的本地重试策略
    pub publish_retry: RetryPolicy,
    /// 停止消费时等待在途处理完成的宽限期
    pub drain_timeout: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            broker_url: "memory://localhost".to_string(),
            exchange_name: "event_bus".to_string(),
            queue_name: "event_bus_queue".to_string(),
            durable: true,
            prefetch_count: 16,
            dead_letter_exchange: Some("event_bus.dlx".to_string()),
            connect_retry: RetryPolicy::default(),
            publish_retry: RetryPolicy::publish_default(),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl EventBusConfig {
    /// 从环境变量加载配置，缺省项使用默认值
    ///
    /// | 环境变量                          | 默认值               |
    /// |-----------------------------------|----------------------|
    /// | `EVENTBUS_BROKER_URL`             | `memory://localhost` |
    /// | `EVENTBUS_EXCHANGE`               | `event_bus`          |
    /// | `EVENTBUS_QUEUE`                  | `event_bus_queue`    |
    /// | `EVENTBUS_PREFETCH`               | `16`                 |
    /// | `EVENTBUS_RETRY_ATTEMPTS`         | `5`                  |
    /// | `EVENTBUS_DEAD_LETTER_EXCHANGE`   | `event_bus.dlx`      |
    pub fn from_env() -> EventBusResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EventBusResult<Self> {
        let mut cfg = Self::default();

        if let Some(url) = lookup("EVENTBUS_BROKER_URL") {
            cfg.broker_url = url;
        }
        if let Some(exchange) = lookup("EVENTBUS_EXCHANGE") {
            cfg.exchange_name = exchange;
        }
        if let Some(queue) = lookup("EVENTBUS_QUEUE") {
            cfg.queue_name = queue;
        }
        if let Some(prefetch) = lookup("EVENTBUS_PREFETCH") {
            cfg.prefetch_count = prefetch.trim().parse()?;
        }
        if let Some(attempts) = lookup("EVENTBUS_RETRY_ATTEMPTS") {
            cfg.connect_retry.max_attempts = attempts.trim().parse()?;
        }
        if let Some(dlx) = lookup("EVENTBUS_DEAD_LETTER_EXCHANGE") {
            let dlx = dlx.trim().to_string();
            cfg.dead_letter_exchange = (!dlx.is_empty()).then_some(dlx);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> EventBusResult<()> {
        if self.exchange_name.trim().is_empty() {
            return Err(EventBusError::config("exchange_name must not be empty"));
        }
        if self.queue_name.trim().is_empty() {
            return Err(EventBusError::config("queue_name must not be empty"));
        }
        if self.prefetch_count == 0 {
            return Err(EventBusError::config("prefetch_count must be > 0"));
        }
        if self.connect_retry.max_attempts == 0 || self.publish_retry.max_attempts == 0 {
            return Err(EventBusError::config("retry max_attempts must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn next_delay_doubles_and_clamps() {
        let policy = RetryPolicy::builder()
            .max_delay(Duration::from_secs(10))
            .build();
        assert_eq!(
            policy.next_delay(Duration::from_secs(1)),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.next_delay(Duration::from_secs(8)),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn delays_follow_backoff_sequence() {
        let policy = RetryPolicy::builder()
            .max_attempts(6)
            .initial_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(8))
            .build();
        let secs: Vec<u64> = policy.delays().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 8]);
    }

    #[test]
    fn single_attempt_has_no_delays() {
        let policy = RetryPolicy::builder().max_attempts(1).build();
        assert_eq!(policy.delays().count(), 0);
    }

    #[test]
    fn lookup_overrides_defaults() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("EVENTBUS_EXCHANGE", "shop"),
            ("EVENTBUS_QUEUE", "Order"),
            ("EVENTBUS_PREFETCH", "4"),
            ("EVENTBUS_DEAD_LETTER_EXCHANGE", ""),
        ]);
        let cfg = EventBusConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.exchange_name, "shop");
        assert_eq!(cfg.queue_name, "Order");
        assert_eq!(cfg.prefetch_count, 4);
        assert!(cfg.dead_letter_exchange.is_none());
        assert_eq!(cfg.broker_url, "memory://localhost");
    }

    #[test]
    fn lookup_rejects_invalid_numbers() {
        let err = EventBusConfig::from_lookup(|k| {
            (k == "EVENTBUS_PREFETCH").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, EventBusError::Config { .. }));
    }

    #[test]
    fn zero_prefetch_is_invalid() {
        let cfg = EventBusConfig {
            prefetch_count: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
