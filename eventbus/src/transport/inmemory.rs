//! 进程内消息代理
//!
//! 行为对齐 AMQP 的常见语义：topic/direct/fanout 交换机、持久化队列、
//! 预取窗口、连接断开时未确认消息重新入队、拒绝消息进入死信交换机。
//! 另外暴露若干控制与观测接口（断线、不可用、队列深度等），用于演练故障场景。
//!
use super::{
    Channel, Connection, Delivery, ExchangeKind, OutgoingMessage, QueueOptions, ShutdownReason,
    Transport, TransportError, TransportResult, topic_matches,
};
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, watch};
use tracing::debug;

/// 已发布消息的记录
#[derive(Clone, Debug)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message_id: Option<String>,
    /// 实际投递到的队列；为空表示无匹配绑定被丢弃
    pub routed_to: Vec<String>,
}

/// 被拒绝且不重新入队的消息
#[derive(Clone, Debug)]
pub struct DeadLetter {
    pub queue: String,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub body: Vec<u8>,
}

/// 进程内代理，克隆后共享同一份状态
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
    unavailable: AtomicBool,
    connect_attempts: AtomicU32,
    next_id: AtomicU64,
}

impl BrokerInner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, watch::Sender<Option<ShutdownReason>>>,
    channels: HashMap<u64, ChannelState>,
    published: Vec<PublishedMessage>,
    dead_letters: Vec<DeadLetter>,
}

struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<Binding>,
}

#[derive(PartialEq, Eq)]
struct Binding {
    queue: String,
    routing_key: String,
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    message_id: Option<String>,
    persistent: bool,
    redelivered: bool,
}

struct ChannelState {
    connection_id: u64,
    prefetch: u16,
    next_tag: u64,
    consumers: HashSet<String>,
    unacked: BTreeMap<u64, Unacked>,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

enum Take {
    Delivery(Delivery),
    Wait,
    Closed,
}

impl BrokerState {
    /// 按交换机类型路由到匹配队列，返回命中的队列名
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: StoredMessage,
    ) -> TransportResult<Vec<String>> {
        let targets = if exchange.is_empty() {
            // 默认交换机：路由键即队列名
            self.queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default()
        } else {
            let ex = self
                .exchanges
                .get(exchange)
                .ok_or_else(|| TransportError::NotFound {
                    kind: "exchange",
                    name: exchange.to_string(),
                })?;
            let mut targets: Vec<String> = Vec::new();
            for binding in &ex.bindings {
                let hit = match ex.kind {
                    ExchangeKind::Direct => binding.routing_key == routing_key,
                    ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                    ExchangeKind::Fanout => true,
                };
                if hit && !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
            }
        }
        Ok(targets)
    }

    fn dead_letter(&mut self, queue: &str, message: StoredMessage) {
        self.dead_letters.push(DeadLetter {
            queue: queue.to_string(),
            routing_key: message.routing_key.clone(),
            message_id: message.message_id.clone(),
            body: message.body.clone(),
        });
        let dlx = self
            .queues
            .get(queue)
            .and_then(|q| q.options.dead_letter_exchange.clone());
        if let Some(dlx) = dlx {
            let routing_key = message.routing_key.clone();
            let message = StoredMessage {
                exchange: dlx.clone(),
                redelivered: false,
                ..message
            };
            if let Err(err) = self.route(&dlx, &routing_key, message) {
                debug!(queue, error = %err, "dead letter exchange missing, message dropped");
            }
        }
    }

    /// 关闭信道，未确认消息按原顺序回到队首
    fn close_channel(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return;
        };
        for (_, unacked) in channel.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.ready.push_front(StoredMessage {
                    redelivered: true,
                    ..unacked.message
                });
            }
        }
    }

    fn close_connection(&mut self, connection_id: u64, reason: ShutdownReason) {
        let Some(closed) = self.connections.remove(&connection_id) else {
            return;
        };
        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for id in channel_ids {
            self.close_channel(id);
        }
        closed.send_replace(Some(reason));
    }

    fn take_next(&mut self, channel_id: u64, queue_name: &str, consumer_tag: &str) -> Take {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return Take::Closed;
        };
        if !channel.consumers.contains(consumer_tag) {
            return Take::Closed;
        }
        if channel.prefetch > 0 && channel.unacked.len() >= channel.prefetch as usize {
            return Take::Wait;
        }
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return Take::Closed;
        };
        let Some(message) = queue.ready.pop_front() else {
            return Take::Wait;
        };

        channel.next_tag += 1;
        let delivery = Delivery {
            delivery_tag: channel.next_tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            body: message.body.clone(),
            message_id: message.message_id.clone(),
            redelivered: message.redelivered,
        };
        channel.unacked.insert(
            channel.next_tag,
            Unacked {
                queue: queue_name.to_string(),
                message,
            },
        );
        Take::Delivery(delivery)
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 不可用时所有新连接被拒绝，已有连接不受影响
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// 模拟网络中断：关闭全部连接
    pub fn disconnect_all(&self) {
        let mut state = self.inner.state();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(
                id,
                ShutdownReason::ConnectionLost("connection reset by broker".to_string()),
            );
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// 模拟代理重启：断开全部连接，丢弃非持久化的交换机、队列与消息
    pub fn restart(&self) {
        self.disconnect_all();
        let mut state = self.inner.state();
        state.exchanges.retain(|_, ex| ex.durable);
        state.queues.retain(|_, q| q.options.durable);
        for queue in state.queues.values_mut() {
            queue.ready.retain(|m| m.persistent);
        }
        let BrokerState {
            exchanges, queues, ..
        } = &mut *state;
        for ex in exchanges.values_mut() {
            ex.bindings.retain(|b| queues.contains_key(&b.queue));
        }
    }

    pub fn connection_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.inner.state().connections.len()
    }

    /// 队列中等待投递的消息数；队列不存在时为 `None`
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.inner.state().queues.get(queue).map(|q| q.ready.len())
    }

    /// 已投递但尚未确认的消息数
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .state()
            .channels
            .values()
            .flat_map(|ch| ch.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    /// 队列上的绑定：(交换机, 路由键)
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        let state = self.inner.state();
        let mut bindings: Vec<(String, String)> = state
            .exchanges
            .iter()
            .flat_map(|(name, ex)| {
                ex.bindings
                    .iter()
                    .filter(|b| b.queue == queue)
                    .map(move |b| (name.clone(), b.routing_key.clone()))
            })
            .collect();
        bindings.sort();
        bindings
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.state().published.clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.state().dead_letters.clone()
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn connect(&self) -> TransportResult<Arc<dyn Connection>> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionRefused(
                "broker unavailable".to_string(),
            ));
        }

        let id = self.inner.next_id();
        let (closed_tx, closed_rx) = watch::channel(None);
        self.inner.state().connections.insert(id, closed_tx);
        debug!(connection_id = id, "in-memory connection opened");
        Ok(Arc::new(InMemoryConnection {
            id,
            broker: self.inner.clone(),
            closed: closed_rx,
        }))
    }
}

struct InMemoryConnection {
    id: u64,
    broker: Arc<BrokerInner>,
    closed: watch::Receiver<Option<ShutdownReason>>,
}

#[async_trait]
impl Connection for InMemoryConnection {
    fn is_open(&self) -> bool {
        self.broker.state().connections.contains_key(&self.id)
    }

    async fn create_channel(&self) -> TransportResult<Arc<dyn Channel>> {
        let mut state = self.broker.state();
        if !state.connections.contains_key(&self.id) {
            return Err(TransportError::ConnectionClosed);
        }
        let id = self.broker.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                prefetch: 0,
                next_tag: 0,
                consumers: HashSet::new(),
                unacked: BTreeMap::new(),
            },
        );
        Ok(Arc::new(InMemoryChannel {
            id,
            broker: self.broker.clone(),
        }))
    }

    async fn closed(&self) -> ShutdownReason {
        let mut closed = self.closed.clone();
        let result = closed
            .wait_for(Option::is_some)
            .await
            .map(|reason| (*reason).clone());
        match result {
            Ok(Some(reason)) => reason,
            _ => ShutdownReason::ConnectionLost("broker dropped".to_string()),
        }
    }

    async fn close(&self) {
        self.broker
            .state()
            .close_connection(self.id, ShutdownReason::ClosedByApplication);
        self.broker.notify.notify_waiters();
    }
}

struct InMemoryChannel {
    id: u64,
    broker: Arc<BrokerInner>,
}

impl InMemoryChannel {
    /// 在信道仍打开的前提下修改代理状态，完成后唤醒等待中的消费者
    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut BrokerState) -> TransportResult<T>,
    ) -> TransportResult<T> {
        let mut state = self.broker.state();
        if !state.channels.contains_key(&self.id) {
            return Err(TransportError::ChannelClosed);
        }
        let result = f(&mut state);
        drop(state);
        self.broker.notify.notify_waiters();
        result
    }

    fn channel_mut(state: &mut BrokerState, id: u64) -> TransportResult<&mut ChannelState> {
        state
            .channels
            .get_mut(&id)
            .ok_or(TransportError::ChannelClosed)
    }
}

fn unknown_tag(tag: u64) -> TransportError {
    TransportError::PreconditionFailed(format!("unknown delivery tag {tag}"))
}

#[async_trait]
impl Channel for InMemoryChannel {
    fn is_open(&self) -> bool {
        self.broker.state().channels.contains_key(&self.id)
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> TransportResult<()> {
        self.with_state(|state| match state.exchanges.get(name) {
            Some(ex) if ex.kind != kind || ex.durable != durable => {
                Err(TransportError::PreconditionFailed(format!(
                    "exchange {name} already declared with different arguments"
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        })
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> TransportResult<()> {
        self.with_state(|state| match state.queues.get(name) {
            Some(queue) if &queue.options != options => {
                Err(TransportError::PreconditionFailed(format!(
                    "queue {name} already declared with different arguments"
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        options: options.clone(),
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> TransportResult<()> {
        self.with_state(|state| {
            if !state.queues.contains_key(queue) {
                return Err(TransportError::NotFound {
                    kind: "queue",
                    name: queue.to_string(),
                });
            }
            let ex = state
                .exchanges
                .get_mut(exchange)
                .ok_or_else(|| TransportError::NotFound {
                    kind: "exchange",
                    name: exchange.to_string(),
                })?;
            let binding = Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            };
            if !ex.bindings.contains(&binding) {
                ex.bindings.push(binding);
            }
            Ok(())
        })
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()> {
        self.with_state(|state| {
            let ex = state
                .exchanges
                .get_mut(exchange)
                .ok_or_else(|| TransportError::NotFound {
                    kind: "exchange",
                    name: exchange.to_string(),
                })?;
            ex.bindings
                .retain(|b| !(b.queue == queue && b.routing_key == routing_key));
            Ok(())
        })
    }

    async fn set_prefetch(&self, count: u16) -> TransportResult<()> {
        let id = self.id;
        self.with_state(|state| {
            Self::channel_mut(state, id)?.prefetch = count;
            Ok(())
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> TransportResult<()> {
        self.with_state(|state| {
            let stored = StoredMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: message.body,
                message_id: message.message_id,
                persistent: message.persistent,
                redelivered: false,
            };
            let message_id = stored.message_id.clone();
            let routed_to = state.route(exchange, routing_key, stored)?;
            state.published.push(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                message_id,
                routed_to,
            });
            Ok(())
        })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> TransportResult<BoxStream<'static, TransportResult<Delivery>>> {
        let id = self.id;
        self.with_state(|state| {
            if !state.queues.contains_key(queue) {
                return Err(TransportError::NotFound {
                    kind: "queue",
                    name: queue.to_string(),
                });
            }
            Self::channel_mut(state, id)?
                .consumers
                .insert(consumer_tag.to_string());
            Ok(())
        })?;

        let consumer = ConsumerCursor {
            broker: self.broker.clone(),
            channel_id: self.id,
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
        };
        let deliveries = futures_util::stream::unfold(consumer, |consumer| async move {
            let broker = consumer.broker.clone();
            loop {
                let notified = broker.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let next = broker.state().take_next(
                    consumer.channel_id,
                    &consumer.queue,
                    &consumer.consumer_tag,
                );
                match next {
                    Take::Delivery(delivery) => return Some((Ok(delivery), consumer)),
                    Take::Closed => return None,
                    Take::Wait => notified.await,
                }
            }
        });
        Ok(Box::pin(deliveries))
    }

    async fn ack(&self, delivery_tag: u64) -> TransportResult<()> {
        let id = self.id;
        self.with_state(|state| {
            Self::channel_mut(state, id)?
                .unacked
                .remove(&delivery_tag)
                .map(|_| ())
                .ok_or_else(|| unknown_tag(delivery_tag))
        })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> TransportResult<()> {
        let id = self.id;
        self.with_state(|state| {
            let unacked = Self::channel_mut(state, id)?
                .unacked
                .remove(&delivery_tag)
                .ok_or_else(|| unknown_tag(delivery_tag))?;
            if requeue {
                if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                    queue.ready.push_front(StoredMessage {
                        redelivered: true,
                        ..unacked.message
                    });
                }
            } else {
                state.dead_letter(&unacked.queue, unacked.message);
            }
            Ok(())
        })
    }

    async fn close(&self) {
        self.broker.state().close_channel(self.id);
        self.broker.notify.notify_waiters();
    }
}

struct ConsumerCursor {
    broker: Arc<BrokerInner>,
    channel_id: u64,
    queue: String,
    consumer_tag: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn open_channel(broker: &InMemoryBroker) -> Arc<dyn Channel> {
        let conn = broker.connect().await.unwrap();
        conn.create_channel().await.unwrap()
    }

    async fn declare_bound_queue(channel: &Arc<dyn Channel>, routing_key: &str) {
        channel
            .declare_exchange("bus", ExchangeKind::Topic, true)
            .await
            .unwrap();
        channel
            .declare_exchange("bus.dlx", ExchangeKind::Fanout, true)
            .await
            .unwrap();
        let options = QueueOptions {
            durable: true,
            dead_letter_exchange: Some("bus.dlx".to_string()),
        };
        channel.declare_queue("q", &options).await.unwrap();
        channel.bind_queue("q", "bus", routing_key).await.unwrap();
    }

    fn message(body: &str) -> OutgoingMessage {
        OutgoingMessage::builder()
            .body(body.as_bytes().to_vec())
            .persistent(true)
            .build()
    }

    #[tokio::test]
    async fn publish_routes_by_binding() {
        let broker = InMemoryBroker::new();
        let channel = open_channel(&broker).await;
        declare_bound_queue(&channel, "OrderCreated").await;

        channel.publish("bus", "OrderCreated", message("a")).await.unwrap();
        channel.publish("bus", "OrderShipped", message("b")).await.unwrap();

        assert_eq!(broker.queue_depth("q"), Some(1));
        let published = broker.published();
        assert_eq!(published[0].routed_to, vec!["q".to_string()]);
        assert!(published[1].routed_to.is_empty());
    }

    #[tokio::test]
    async fn publish_to_missing_exchange_fails() {
        let broker = InMemoryBroker::new();
        let channel = open_channel(&broker).await;
        let err = channel.publish("nope", "x", message("a")).await.unwrap_err();
        assert!(matches!(err, TransportError::NotFound { kind: "exchange", .. }));
    }

    #[tokio::test]
    async fn redeclare_with_other_arguments_fails() {
        let broker = InMemoryBroker::new();
        let channel = open_channel(&broker).await;
        channel
            .declare_exchange("bus", ExchangeKind::Topic, true)
            .await
            .unwrap();
        let err = channel
            .declare_exchange("bus", ExchangeKind::Fanout, true)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn consumer_respects_prefetch_window() {
        let broker = InMemoryBroker::new();
        let channel = open_channel(&broker).await;
        declare_bound_queue(&channel, "#").await;
        channel.set_prefetch(1).await.unwrap();
        for body in ["1", "2"] {
            channel.publish("bus", "e", message(body)).await.unwrap();
        }

        let mut deliveries = channel.consume("q", "c1").await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.body, b"1");
        assert!(
            timeout(Duration::from_millis(50), deliveries.next())
                .await
                .is_err()
        );

        channel.ack(first.delivery_tag).await.unwrap();
        let second = timeout(Duration::from_secs(1), deliveries.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.body, b"2");
    }

    #[tokio::test]
    async fn requeued_message_is_redelivered() {
        let broker = InMemoryBroker::new();
        let channel = open_channel(&broker).await;
        declare_bound_queue(&channel, "#").await;
        channel.publish("bus", "e", message("x")).await.unwrap();

        let mut deliveries = channel.consume("q", "c1").await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        channel.nack(first.delivery_tag, true).await.unwrap();

        let again = deliveries.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.body, b"x");
    }

    #[tokio::test]
    async fn rejected_message_is_dead_lettered() {
        let broker = InMemoryBroker::new();
        let channel = open_channel(&broker).await;
        declare_bound_queue(&channel, "#").await;
        channel.declare_queue("dlq", &QueueOptions::default()).await.unwrap();
        channel.bind_queue("dlq", "bus.dlx", "").await.unwrap();
        channel.publish("bus", "e", message("bad")).await.unwrap();

        let mut deliveries = channel.consume("q", "c1").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        channel.nack(delivery.delivery_tag, false).await.unwrap();

        assert_eq!(broker.queue_depth("q"), Some(0));
        assert_eq!(broker.queue_depth("dlq"), Some(1));
        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, b"bad");
    }

    #[tokio::test]
    async fn disconnect_requeues_unacked_and_ends_streams() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        declare_bound_queue(&channel, "#").await;
        channel.publish("bus", "e", message("x")).await.unwrap();

        let mut deliveries = channel.consume("q", "c1").await.unwrap();
        deliveries.next().await.unwrap().unwrap();
        assert_eq!(broker.unacked_count("q"), 1);

        broker.disconnect_all();

        assert!(deliveries.next().await.is_none());
        assert!(!conn.is_open());
        assert!(!channel.is_open());
        assert_eq!(broker.queue_depth("q"), Some(1));
        assert!(matches!(
            conn.closed().await,
            ShutdownReason::ConnectionLost(_)
        ));
        assert!(matches!(
            channel.ack(1).await,
            Err(TransportError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn unavailable_broker_refuses_connections() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        assert!(matches!(
            broker.connect().await,
            Err(TransportError::ConnectionRefused(_))
        ));
        broker.set_available(true);
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connection_attempts(), 2);
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn restart_keeps_only_durable_state() {
        let broker = InMemoryBroker::new();
        let channel = open_channel(&broker).await;
        declare_bound_queue(&channel, "#").await;
        channel.declare_queue("temp", &QueueOptions::default()).await.unwrap();
        channel.bind_queue("temp", "bus", "#").await.unwrap();
        channel.publish("bus", "e", message("kept")).await.unwrap();
        channel
            .publish("bus", "e", OutgoingMessage::builder().body(b"lost".to_vec()).build())
            .await
            .unwrap();

        broker.restart();

        assert_eq!(broker.queue_depth("q"), Some(1));
        assert_eq!(broker.queue_depth("temp"), None);
        assert_eq!(broker.bindings("q"), vec![("bus".to_string(), "#".to_string())]);
        assert!(broker.bindings("temp").is_empty());
    }
}
