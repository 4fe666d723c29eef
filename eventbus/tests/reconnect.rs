use anyhow::Result as AnyResult;
use async_trait::async_trait;
use eventbus::bus::Disposition;
use eventbus::transport::InMemoryBroker;
use eventbus::{
    BrokerEventBus, ConsumerState, EventBus, EventBusConfig, IntegrationEventHandler,
    RetryPolicy, ServiceRegistry,
};
use eventbus_macros::integration_event;
use futures_util::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, watch};

#[integration_event(name = "UserCheckoutAccepted")]
struct UserCheckoutAccepted {
    user_id: String,
}

/// 记录调用次数；首次调用阻塞直到测试放行
#[derive(Default)]
struct Gate {
    calls: AtomicUsize,
    release: Notify,
    block_first: bool,
}

#[async_trait]
impl IntegrationEventHandler<UserCheckoutAccepted> for Gate {
    async fn handle(&self, _event: &UserCheckoutAccepted) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.block_first && call == 0 {
            self.release.notified().await;
        }
        Ok(())
    }
}

fn bus(broker: &InMemoryBroker, gate: Arc<Gate>, connect_attempts: u32) -> BrokerEventBus {
    let registry = ServiceRegistry::new();
    registry.register_singleton(gate);
    let retry = RetryPolicy::builder()
        .max_attempts(connect_attempts)
        .initial_delay(Duration::from_millis(5))
        .max_delay(Duration::from_millis(20))
        .build();
    BrokerEventBus::builder()
        .transport(Arc::new(broker.clone()))
        .resolver(Arc::new(registry))
        .config(EventBusConfig {
            queue_name: "Order".to_string(),
            connect_retry: retry,
            publish_retry: retry,
            drain_timeout: Duration::from_millis(200),
            ..Default::default()
        })
        .build()
        .unwrap()
}

async fn wait_for_state(states: &mut watch::Receiver<ConsumerState>, expected: ConsumerState) {
    tokio::time::timeout(Duration::from_secs(3), states.wait_for(|s| *s == expected))
        .await
        .unwrap_or_else(|_| panic!("consumer never reached {expected:?}"))
        .unwrap();
}

async fn wait_for_calls(gate: &Gate, expected: usize) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while gate.calls.load(Ordering::SeqCst) < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("handler not invoked in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn consumer_resumes_after_connection_loss() -> AnyResult<()> {
    let broker = InMemoryBroker::new();
    let gate = Arc::new(Gate::default());
    let bus = bus(&broker, gate.clone(), 100);
    let mut states = bus.consumer_states();

    bus.start_consuming().await?;
    bus.subscribe::<UserCheckoutAccepted, Gate>().await?;
    wait_for_state(&mut states, ConsumerState::Consuming).await;

    broker.set_available(false);
    broker.disconnect_all();
    wait_for_state(&mut states, ConsumerState::Reconnecting).await;

    broker.set_available(true);
    wait_for_state(&mut states, ConsumerState::Consuming).await;
    assert_eq!(
        broker.bindings("Order"),
        vec![("event_bus".to_string(), "UserCheckoutAccepted".to_string())]
    );

    bus.publish(&UserCheckoutAccepted::new("u-1".into())).await?;
    wait_for_calls(&gate, 1).await;

    bus.stop_consuming().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn in_flight_message_is_redelivered_after_connection_loss() -> AnyResult<()> {
    let broker = InMemoryBroker::new();
    let gate = Arc::new(Gate {
        block_first: true,
        ..Default::default()
    });
    let bus = bus(&broker, gate.clone(), 100);
    let mut outcomes = bus.dispatch_outcome_stream();

    bus.start_consuming().await?;
    bus.subscribe::<UserCheckoutAccepted, Gate>().await?;
    bus.publish(&UserCheckoutAccepted::new("u-2".into())).await?;
    wait_for_calls(&gate, 1).await;

    // 处理中断线：确认失败，消息回到队列
    broker.disconnect_all();
    gate.release.notify_one();

    wait_for_calls(&gate, 2).await;
    let first = tokio::time::timeout(Duration::from_secs(3), outcomes.next())
        .await?
        .expect("outcome stream closed");
    assert!(matches!(first.disposition, Disposition::Unconfirmed { .. }));
    let redelivered = tokio::time::timeout(Duration::from_secs(3), outcomes.next())
        .await?
        .expect("outcome stream closed");
    assert!(redelivered.is_acknowledged());
    assert_eq!(redelivered.event_id, first.event_id);
    assert_eq!(broker.queue_depth("Order"), Some(0));
    assert_eq!(broker.unacked_count("Order"), 0);

    bus.stop_consuming().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn consumer_stops_when_broker_stays_down() -> AnyResult<()> {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker, Arc::new(Gate::default()), 2);
    let mut states = bus.consumer_states();

    bus.start_consuming().await?;
    broker.set_available(false);
    broker.disconnect_all();

    wait_for_state(&mut states, ConsumerState::Stopped).await;

    // 代理恢复后可以重新开始
    broker.set_available(true);
    bus.start_consuming().await?;
    wait_for_state(&mut states, ConsumerState::Consuming).await;
    bus.stop_consuming().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_consuming_bounds_the_drain() -> AnyResult<()> {
    let broker = InMemoryBroker::new();
    let gate = Arc::new(Gate {
        block_first: true,
        ..Default::default()
    });
    let bus = bus(&broker, gate.clone(), 3);

    bus.start_consuming().await?;
    bus.subscribe::<UserCheckoutAccepted, Gate>().await?;
    bus.publish(&UserCheckoutAccepted::new("u-3".into())).await?;
    wait_for_calls(&gate, 1).await;

    // 处理器一直不返回：停止操作在宽限期后结束
    tokio::time::timeout(Duration::from_secs(2), bus.stop_consuming()).await??;
    assert_eq!(bus.consumer_state(), ConsumerState::Stopped);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_during_drain_waits_for_the_old_consumer() -> AnyResult<()> {
    let broker = InMemoryBroker::new();
    let gate = Arc::new(Gate {
        block_first: true,
        ..Default::default()
    });
    let bus = bus(&broker, gate.clone(), 3);
    let mut states = bus.consumer_states();

    bus.start_consuming().await?;
    bus.subscribe::<UserCheckoutAccepted, Gate>().await?;
    bus.publish(&UserCheckoutAccepted::new("u-4".into())).await?;
    wait_for_calls(&gate, 1).await;

    let stopping = bus.clone();
    let stop = tokio::spawn(async move { stopping.stop_consuming().await });
    wait_for_state(&mut states, ConsumerState::Draining).await;

    // 排空结束前不会启动新的消费任务，旧任务也不会再覆盖状态
    bus.start_consuming().await?;
    stop.await??;
    wait_for_state(&mut states, ConsumerState::Consuming).await;

    bus.publish(&UserCheckoutAccepted::new("u-5".into())).await?;
    wait_for_calls(&gate, 2).await;
    assert_eq!(bus.consumer_state(), ConsumerState::Consuming);

    bus.stop_consuming().await?;
    Ok(())
}
