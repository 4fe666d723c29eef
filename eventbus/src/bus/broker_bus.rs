use super::consumer::ConsumerHandle;
use super::{ConsumerState, DispatchOutcome, EventBus};
use crate::config::EventBusConfig;
use crate::connection::ResilientConnection;
use crate::error::{EventBusError, EventBusResult};
use crate::handler::{DynamicIntegrationEventHandler, HandlerResolver, IntegrationEventHandler};
use crate::integration_event::{IntegrationEvent, IntegrationEventEnvelope};
use crate::subscription::SubscriptionManager;
use crate::transport::{Channel, ExchangeKind, OutgoingMessage, QueueOptions, Transport};
use async_trait::async_trait;
use bon::bon;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use std::any::type_name;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

const OUTCOME_CAPACITY: usize = 256;

/// 基于消息代理的事件总线
///
/// 拓扑：
/// - 一个 topic 交换机，路由键即事件名；
/// - 一个以服务名命名的持久化队列，按已订阅事件名逐一绑定；
/// - 可选的死信交换机，接收被拒绝的消息。
///
/// 投递语义为至少一次：处理器需自行保证幂等。
#[derive(Clone)]
pub struct BrokerEventBus {
    inner: Arc<BusInner>,
}

pub(super) struct BusInner {
    pub(super) config: EventBusConfig,
    pub(super) connection: Arc<ResilientConnection>,
    pub(super) subscriptions: Arc<SubscriptionManager>,
    pub(super) resolver: Arc<dyn HandlerResolver>,
    /// 串行化 订阅表变更 + 绑定/解绑，以及消费端的重新绑定
    pub(super) topology: Mutex<()>,
    /// 启动与停止（含排空）互斥
    consumer: Mutex<Option<ConsumerHandle>>,
    consumer_state: watch::Sender<ConsumerState>,
    pub(super) outcomes: broadcast::Sender<DispatchOutcome>,
}

#[bon]
impl BrokerEventBus {
    #[builder]
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn HandlerResolver>,
        subscriptions: Option<Arc<SubscriptionManager>>,
        #[builder(default)] config: EventBusConfig,
    ) -> EventBusResult<Self> {
        config.validate()?;
        let connection = ResilientConnection::new(transport, config.connect_retry);
        let (consumer_state, _) = watch::channel(ConsumerState::Idle);
        let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);
        Ok(Self {
            inner: Arc::new(BusInner {
                config,
                connection,
                subscriptions: subscriptions.unwrap_or_default(),
                resolver,
                topology: Mutex::new(()),
                consumer: Mutex::new(None),
                consumer_state,
                outcomes,
            }),
        })
    }
}

impl BrokerEventBus {
    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.inner.subscriptions
    }

    pub fn connection(&self) -> &Arc<ResilientConnection> {
        &self.inner.connection
    }

    pub fn consumer_state(&self) -> ConsumerState {
        *self.inner.consumer_state.borrow()
    }

    pub fn consumer_states(&self) -> watch::Receiver<ConsumerState> {
        self.inner.consumer_state.subscribe()
    }

    /// 每条已处理消息的结果广播
    pub fn dispatch_outcomes(&self) -> broadcast::Receiver<DispatchOutcome> {
        self.inner.outcomes.subscribe()
    }

    /// 结果广播的流形式；接收端落后时跳过丢失的部分
    pub fn dispatch_outcome_stream(&self) -> BoxStream<'static, DispatchOutcome> {
        BroadcastStream::new(self.inner.outcomes.subscribe())
            .filter_map(|outcome| async move { outcome.ok() })
            .boxed()
    }

    /// 发布已构造好的信封
    pub async fn publish_envelope(&self, envelope: &IntegrationEventEnvelope) -> EventBusResult<()> {
        let event_name = envelope.event_name();
        let failed = |attempts: u32, source: EventBusError| EventBusError::PublishFailed {
            event_name: event_name.to_string(),
            attempts,
            source: Box::new(source),
        };
        let body = envelope.to_bytes().map_err(|e| failed(0, e))?;

        let policy = self.inner.config.publish_retry;
        let mut delays = policy.delays();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.inner.try_publish(envelope, &body).await {
                Ok(()) => {
                    debug!(event_name, event_id = %envelope.event_id(), attempt, "integration event published");
                    return Ok(());
                }
                Err(err) => err,
            };
            match delays.next() {
                Some(delay) if err.is_retryable() => {
                    warn!(event_name, attempt, ?delay, error = %err, "publish failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                _ => {
                    error!(event_name, attempt, error = %err, "could not publish integration event");
                    return Err(failed(attempt, err));
                }
            }
        }
    }

    /// 停止消费、关闭连接并清空订阅
    pub async fn dispose(&self) -> EventBusResult<()> {
        self.stop_consuming().await?;
        self.inner.connection.dispose().await;
        self.inner.subscriptions.clear();
        Ok(())
    }
}

impl BusInner {
    pub(super) fn set_consumer_state(&self, next: ConsumerState) {
        let changed = self.consumer_state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            info!(state = ?next, queue = %self.config.queue_name, "consumer state changed");
        }
    }

    /// 声明交换机、死信交换机与服务队列（幂等）
    pub(super) async fn declare_topology(&self, channel: &dyn Channel) -> EventBusResult<()> {
        let config = &self.config;
        channel
            .declare_exchange(&config.exchange_name, ExchangeKind::Topic, config.durable)
            .await?;
        if let Some(dlx) = &config.dead_letter_exchange {
            channel
                .declare_exchange(dlx, ExchangeKind::Fanout, config.durable)
                .await?;
        }
        let options = QueueOptions {
            durable: config.durable,
            dead_letter_exchange: config.dead_letter_exchange.clone(),
        };
        channel.declare_queue(&config.queue_name, &options).await?;
        Ok(())
    }

    async fn try_publish(&self, envelope: &IntegrationEventEnvelope, body: &[u8]) -> EventBusResult<()> {
        let channel = self.connection.create_channel().await?;
        let result = self.publish_on(channel.as_ref(), envelope, body).await;
        channel.close().await;
        result
    }

    async fn publish_on(
        &self,
        channel: &dyn Channel,
        envelope: &IntegrationEventEnvelope,
        body: &[u8],
    ) -> EventBusResult<()> {
        let config = &self.config;
        channel
            .declare_exchange(&config.exchange_name, ExchangeKind::Topic, config.durable)
            .await?;
        let message = OutgoingMessage::builder()
            .body(body.to_vec())
            .message_id(envelope.event_id().to_string())
            .content_type("application/json")
            .persistent(true)
            .timestamp(envelope.creation_date())
            .build();
        channel
            .publish(&config.exchange_name, envelope.event_name(), message)
            .await?;
        Ok(())
    }

    async fn bind(&self, event_name: &str) -> EventBusResult<()> {
        let channel = self.connection.create_channel().await?;
        let result = async {
            self.declare_topology(channel.as_ref()).await?;
            channel
                .bind_queue(&self.config.queue_name, &self.config.exchange_name, event_name)
                .await?;
            Ok::<(), EventBusError>(())
        }
        .await;
        channel.close().await;
        result
    }

    async fn unbind(&self, event_name: &str) -> EventBusResult<()> {
        let channel = self.connection.create_channel().await?;
        let result = channel
            .unbind_queue(&self.config.queue_name, &self.config.exchange_name, event_name)
            .await;
        channel.close().await;
        Ok(result?)
    }

    /// 新增的首个订阅需要绑定；绑定失败时撤销登记
    async fn bind_or_rollback(
        &self,
        event_name: &str,
        first: bool,
        rollback: impl FnOnce(),
    ) -> EventBusResult<()> {
        if !first {
            return Ok(());
        }
        if let Err(err) = self.bind(event_name).await {
            warn!(event_name, error = %err, "binding failed, subscription rolled back");
            rollback();
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl EventBus for BrokerEventBus {
    async fn publish<E>(&self, event: &E) -> EventBusResult<()>
    where
        E: IntegrationEvent,
    {
        let envelope = IntegrationEventEnvelope::from_event(event).map_err(|source| {
            EventBusError::PublishFailed {
                event_name: E::NAME.to_string(),
                attempts: 0,
                source: Box::new(source),
            }
        })?;
        self.publish_envelope(&envelope).await
    }

    async fn subscribe<E, H>(&self) -> EventBusResult<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let _topology = self.inner.topology.lock().await;
        let subscriptions = &self.inner.subscriptions;
        let first = subscriptions.add_subscription::<E, H>()?;
        info!(event_name = E::NAME, handler = type_name::<H>(), "subscribed to integration event");
        self.inner
            .bind_or_rollback(E::NAME, first, || {
                let _ = subscriptions.remove_typed_subscription::<E, H>();
            })
            .await
    }

    async fn subscribe_dynamic<H>(&self, event_name: &str) -> EventBusResult<()>
    where
        H: DynamicIntegrationEventHandler,
    {
        let _topology = self.inner.topology.lock().await;
        let subscriptions = &self.inner.subscriptions;
        let first = subscriptions.add_dynamic_subscription::<H>(event_name)?;
        info!(event_name, handler = type_name::<H>(), "subscribed to dynamic integration event");
        self.inner
            .bind_or_rollback(event_name, first, || {
                let _ = subscriptions.remove_dynamic_subscription::<H>(event_name);
            })
            .await
    }

    async fn unsubscribe<E, H>(&self) -> EventBusResult<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let _topology = self.inner.topology.lock().await;
        let emptied = self
            .inner
            .subscriptions
            .remove_typed_subscription::<E, H>()?;
        info!(event_name = E::NAME, handler = type_name::<H>(), "unsubscribed from integration event");
        if emptied {
            self.inner.unbind(E::NAME).await?;
        }
        Ok(())
    }

    async fn unsubscribe_dynamic<H>(&self, event_name: &str) -> EventBusResult<()>
    where
        H: DynamicIntegrationEventHandler,
    {
        let _topology = self.inner.topology.lock().await;
        let emptied = self
            .inner
            .subscriptions
            .remove_dynamic_subscription::<H>(event_name)?;
        info!(event_name, handler = type_name::<H>(), "unsubscribed from dynamic integration event");
        if emptied {
            self.inner.unbind(event_name).await?;
        }
        Ok(())
    }

    async fn start_consuming(&self) -> EventBusResult<()> {
        let mut consumer = self.inner.consumer.lock().await;
        // 已进入 Stopped 的任务即将退出，可以直接替换
        let running = consumer.as_ref().is_some_and(|h| !h.is_finished())
            && self.consumer_state() != ConsumerState::Stopped;
        if running {
            debug!("consumer already running");
            return Ok(());
        }

        let session = self.inner.open_consumer().await?;
        *consumer = Some(ConsumerHandle::spawn(self.inner.clone(), session));
        info!(queue = %self.inner.config.queue_name, "started consuming");
        Ok(())
    }

    async fn stop_consuming(&self) -> EventBusResult<()> {
        // 排空期间持有锁，并发的 start_consuming 等待旧任务完全退出
        let mut consumer = self.inner.consumer.lock().await;
        let Some(handle) = consumer.take() else {
            return Ok(());
        };

        self.inner.set_consumer_state(ConsumerState::Draining);
        if !handle.shutdown(self.inner.config.drain_timeout).await {
            warn!(
                grace = ?self.inner.config.drain_timeout,
                "in-flight message handling did not finish in time, aborted"
            );
        }
        self.inner.set_consumer_state(ConsumerState::Stopped);
        info!(queue = %self.inner.config.queue_name, "stopped consuming");
        Ok(())
    }
}
