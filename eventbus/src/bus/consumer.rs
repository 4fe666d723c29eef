//! 消费循环
//!
//! 单一长驻任务：从服务队列逐条取消息 → 按事件名找订阅 → 解码 →
//! 每个处理器在独立作用域内并发执行 → 全部结束后确认。
//! 未知事件名与无法解码的消息直接拒绝（不重新入队）。
//! 消费信道丢失时重建信道并重新绑定全部已订阅事件名。
//!
use super::broker_bus::BusInner;
use super::{ConsumerState, DispatchOutcome, Disposition, HandlerOutcome};
use crate::error::{EventBusError, EventBusResult};
use crate::integration_event::IntegrationEventEnvelope;
use crate::subscription::DispatchInput;
use crate::transport::{Channel, Delivery, TransportResult};
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// 一次消费会话：信道 + 其上的投递流
pub(super) struct ConsumerSession {
    channel: Arc<dyn Channel>,
    deliveries: BoxStream<'static, TransportResult<Delivery>>,
}

/// 消费任务句柄，丢弃时通知任务退出
pub(super) struct ConsumerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub(super) fn spawn(inner: Arc<BusInner>, session: ConsumerSession) -> Self {
        let token = CancellationToken::new();
        let task = tokio::spawn(run(inner, token.clone(), session));
        Self { token, task }
    }

    pub(super) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// 请求停止并等待；超过宽限期则中止任务，返回是否按时结束
    pub(super) async fn shutdown(mut self, grace: Duration) -> bool {
        self.token.cancel();
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(_) => true,
            Err(_) => {
                self.task.abort();
                let _ = (&mut self.task).await;
                false
            }
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl BusInner {
    /// 打开消费信道：声明拓扑、设置预取、重新绑定已订阅事件名并开始消费
    pub(super) async fn open_consumer(&self) -> EventBusResult<ConsumerSession> {
        let channel = self.connection.create_channel().await?;
        match self.prepare_consumer(channel.as_ref()).await {
            Ok(deliveries) => Ok(ConsumerSession {
                channel,
                deliveries,
            }),
            Err(err) => {
                channel.close().await;
                Err(err)
            }
        }
    }

    async fn prepare_consumer(
        &self,
        channel: &dyn Channel,
    ) -> EventBusResult<BoxStream<'static, TransportResult<Delivery>>> {
        let config = &self.config;
        self.declare_topology(channel).await?;
        channel.set_prefetch(config.prefetch_count).await?;
        let _topology = self.topology.lock().await;
        for event_name in self.subscriptions.event_names() {
            channel
                .bind_queue(&config.queue_name, &config.exchange_name, &event_name)
                .await?;
        }
        let consumer_tag = format!("{}.{}", config.queue_name, Uuid::new_v4());
        Ok(channel.consume(&config.queue_name, &consumer_tag).await?)
    }

    async fn handle_delivery(&self, channel: &dyn Channel, delivery: Delivery) {
        let event_name = delivery.routing_key.clone();
        let outcome = match self.dispatch(&delivery).await {
            Ok((event_id, handlers)) => {
                let disposition = match channel.ack(delivery.delivery_tag).await {
                    Ok(()) => Disposition::Acknowledged,
                    Err(err) => {
                        warn!(event_name, error = %err, "failed to acknowledge message, it will be redelivered");
                        Disposition::Unconfirmed {
                            reason: err.to_string(),
                        }
                    }
                };
                DispatchOutcome {
                    event_name,
                    event_id: Some(event_id),
                    disposition,
                    handlers,
                }
            }
            Err(err) => {
                warn!(event_name, error = %err, "rejecting undeliverable message");
                if let Err(nack_err) = channel.nack(delivery.delivery_tag, false).await {
                    warn!(event_name, error = %nack_err, "failed to reject message");
                }
                DispatchOutcome {
                    event_name,
                    event_id: None,
                    disposition: Disposition::Rejected {
                        reason: err.to_string(),
                    },
                    handlers: Vec::new(),
                }
            }
        };
        let _ = self.outcomes.send(outcome);
    }

    /// 路由与解码失败返回错误（消息应被拒绝）；处理器失败只记录在结果中
    async fn dispatch(&self, delivery: &Delivery) -> EventBusResult<(Uuid, Vec<HandlerOutcome>)> {
        let event_name = delivery.routing_key.as_str();
        let route = self.subscriptions.route(event_name)?;
        let envelope = IntegrationEventEnvelope::from_bytes(&delivery.body)?;
        if envelope.event_name() != event_name {
            return Err(EventBusError::TypeMismatch {
                event_name: event_name.to_string(),
                expected: event_name.to_string(),
                found: envelope.event_name().to_string(),
            });
        }
        let event = route
            .event_type
            .map(|info| info.decode(envelope.payload()))
            .transpose()?;

        let event_id = envelope.event_id();
        let input = DispatchInput {
            envelope: Arc::new(envelope),
            event,
        };

        // 每个处理器独立任务执行：单个处理器 panic 不会拖垮消费循环
        let tasks: Vec<_> = route
            .subscriptions
            .iter()
            .map(|subscription| {
                let scope = self.resolver.begin_scope();
                let task = tokio::spawn(subscription.invoke(scope, input.clone()));
                (*subscription.descriptor(), task)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (handler, task) in tasks {
            let error = match task.await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(join_err) => Some(format!("handler task failed: {join_err}")),
            };
            if let Some(reason) = &error {
                warn!(event_name, %event_id, handler = %handler, error = %reason, "integration event handler failed");
            }
            outcomes.push(HandlerOutcome { handler, error });
        }
        debug!(event_name, %event_id, handlers = outcomes.len(), "integration event dispatched");
        Ok((event_id, outcomes))
    }
}

async fn run(inner: Arc<BusInner>, token: CancellationToken, mut session: ConsumerSession) {
    loop {
        inner.set_consumer_state(ConsumerState::Consuming);
        let lost = consume(&inner, &token, &mut session).await;
        session.channel.close().await;
        if !lost {
            break;
        }

        inner.set_consumer_state(ConsumerState::Reconnecting);
        warn!(queue = %inner.config.queue_name, "consumer channel lost, re-establishing");
        let reopened = tokio::select! {
            _ = token.cancelled() => break,
            reopened = inner.open_consumer() => reopened,
        };
        match reopened {
            Ok(next) => session = next,
            Err(err) => {
                error!(queue = %inner.config.queue_name, error = %err, "consumer could not recover, stopping");
                break;
            }
        }
    }
    inner.set_consumer_state(ConsumerState::Stopped);
}

/// 持续消费直到被取消（返回 false）或投递流结束（返回 true）
async fn consume(inner: &BusInner, token: &CancellationToken, session: &mut ConsumerSession) -> bool {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return false,
            next = session.deliveries.next() => match next {
                Some(Ok(delivery)) => {
                    inner.handle_delivery(session.channel.as_ref(), delivery).await;
                }
                Some(Err(err)) => {
                    warn!(error = %err, "delivery stream failed");
                    return true;
                }
                None => return true,
            },
        }
    }
}
