//! 订单服务启动入口
//!
//! 构建以服务名为队列名的事件总线，开始消费并订阅结算事件，
//! 收到 Ctrl-C 后停止消费并在宽限期内等待在途消息处理完毕。
//!
mod checkout;

use anyhow::{Context, bail};
use checkout::{CheckoutLedger, UserCheckoutAccepted, UserCheckoutAcceptedHandler};
use eventbus::transport::{InMemoryBroker, Transport};
use eventbus::{BrokerEventBus, EventBus, EventBusConfig, ServiceRegistry};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 服务名，同时作为队列名
const SERVICE_NAME: &str = "Order";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "order_api=info,eventbus=info".into()),
        )
        .with(fmt::layer())
        .init();

    let mut config = EventBusConfig::from_env().context("loading event bus config")?;
    config.queue_name = SERVICE_NAME.to_string();
    let (transport, in_memory) = transport_for(&config.broker_url)?;

    let ledger = Arc::new(CheckoutLedger::default());
    let registry = ServiceRegistry::new();
    {
        let ledger = ledger.clone();
        registry.register_scoped(move || UserCheckoutAcceptedHandler::new(ledger.clone()));
    }

    let bus = BrokerEventBus::builder()
        .transport(transport)
        .resolver(Arc::new(registry))
        .config(config)
        .build()?;

    bus.start_consuming().await?;
    bus.subscribe::<UserCheckoutAccepted, UserCheckoutAcceptedHandler>()
        .await?;
    info!(service = SERVICE_NAME, "order service started");

    // 内存代理没有外部发布方，发一条样例事件走通整条链路
    if in_memory {
        bus.publish(&UserCheckoutAccepted::new(
            "demo".into(),
            "Redmond".into(),
            "15703 NE 61st Ct".into(),
            4200,
        ))
        .await?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    bus.dispose().await?;
    info!(accepted = ledger.accepted(), "order service stopped");
    Ok(())
}

/// 按代理地址选择传输实现，返回值第二项表示是否为进程内代理
fn transport_for(broker_url: &str) -> anyhow::Result<(Arc<dyn Transport>, bool)> {
    match broker_url.split_once("://") {
        Some(("memory", _)) => Ok((Arc::new(InMemoryBroker::new()), true)),
        _ => bail!("unsupported broker url: {broker_url}"),
    }
}
